//! # Trial-aligned design construction
//!
//! For every subject, the functional run is cut into analysis windows: each
//! trial onset in the marker vector, shifted by `lag` and by each selected
//! offset, names one timepoint whose masked voxels become one design entry.
//!
//! Voxel time series are z-scored within each subject by default, so
//! penalty strengths are comparable across scanners and sessions.
//!
//! Malformed subjects are skipped with a warning; the run only fails when no
//! subject survives.

use crate::error::{GraphnetError, Result};
use crate::io::{Volume, VolumeSource};
use crate::mask::VolumeMask;
use ndarray::Array1;
use std::path::{Path, PathBuf};

/// One (trial, offset) sample of a subject's recording.
#[derive(Clone, Debug)]
pub struct DesignEntry {
    /// Position of the owning subject in [`DesignTable::subjects`].
    pub subject: usize,
    /// Index of the trial among the subject's onsets, counting dropped trials.
    pub trial: usize,
    /// Onset timepoint of the trial.
    pub onset: usize,
    /// Position of the offset in the selected offset list.
    pub offset_index: usize,
    pub voxels: Array1<f64>,
    pub raw_label: f64,
}

#[derive(Clone, Debug)]
pub struct SubjectDesign {
    pub id: String,
    pub entries: Vec<DesignEntry>,
    /// Trials whose shifted window fell outside the recording.
    pub dropped_trials: usize,
}

impl SubjectDesign {
    pub fn num_trials(&self, num_offsets: usize) -> usize {
        self.entries.len() / num_offsets
    }
}

/// Per-subject design entries, ordered by subject then trial then offset.
#[derive(Clone, Debug)]
pub struct DesignTable {
    pub subjects: Vec<SubjectDesign>,
    /// Subjects that were skipped, with the reason.
    pub skipped: Vec<(String, String)>,
    pub selected_offsets: Vec<i64>,
    pub num_voxels: usize,
}

impl DesignTable {
    pub fn num_offsets(&self) -> usize {
        self.selected_offsets.len()
    }

    pub fn num_entries(&self) -> usize {
        self.subjects.iter().map(|s| s.entries.len()).sum()
    }

    pub fn subject(&self, id: &str) -> Option<&SubjectDesign> {
        self.subjects.iter().find(|s| s.id == id)
    }
}

/// Builds and owns the raw design table until it is explicitly discarded.
pub struct DesignBuilder<'a, S: VolumeSource> {
    source: &'a S,
    mask: &'a VolumeMask,
    normalize: bool,
    table: Option<DesignTable>,
}

impl<'a, S: VolumeSource> DesignBuilder<'a, S> {
    pub fn new(source: &'a S, mask: &'a VolumeMask) -> Self {
        Self {
            source,
            mask,
            normalize: true,
            table: None,
        }
    }

    /// Toggles per-subject z-scoring of each masked voxel's time series.
    pub fn with_normalization(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    /// Loads each subject's functional run and marker vector and cuts out the
    /// masked voxel vector at `onset + lag + offset` for every trial and offset.
    pub fn create(
        &mut self,
        subject_dirs: &[PathBuf],
        functional_filename: &str,
        marker_filename: &str,
        selected_offsets: &[i64],
        lag: i64,
    ) -> Result<&DesignTable> {
        if selected_offsets.len() != self.mask.num_offsets() {
            return Err(GraphnetError::InvalidConfig(format!(
                "{} offsets selected but the mask was built for {}",
                selected_offsets.len(),
                self.mask.num_offsets()
            )));
        }

        let mut subjects = Vec::with_capacity(subject_dirs.len());
        let mut skipped = Vec::new();
        for dir in subject_dirs {
            let id = subject_id(dir);
            let built = self.build_subject(
                subjects.len(),
                &id,
                dir,
                functional_filename,
                marker_filename,
                selected_offsets,
                lag,
            );
            match built {
                Ok(subject) => {
                    log::info!(
                        "Subject {}: {} trials x {} offsets",
                        id,
                        subject.num_trials(selected_offsets.len()),
                        selected_offsets.len()
                    );
                    subjects.push(subject);
                }
                Err(e) => {
                    log::warn!("Skipping subject {id}: {e}");
                    skipped.push((id, e.to_string()));
                }
            }
        }

        if subjects.is_empty() {
            return Err(GraphnetError::insufficient(format!(
                "no usable subjects among {} directories",
                subject_dirs.len()
            )));
        }

        Ok(self.table.insert(DesignTable {
            subjects,
            skipped,
            selected_offsets: selected_offsets.to_vec(),
            num_voxels: self.mask.num_voxels(),
        }))
    }

    pub fn table(&self) -> Option<&DesignTable> {
        self.table.as_ref()
    }

    /// Releases the raw design table. Returns the number of entries freed.
    pub fn discard(&mut self) -> usize {
        match self.table.take() {
            Some(table) => {
                let released = table.num_entries();
                log::info!("Released subject design table ({released} entries)");
                released
            }
            None => 0,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_subject(
        &self,
        subject_index: usize,
        id: &str,
        dir: &Path,
        functional_filename: &str,
        marker_filename: &str,
        selected_offsets: &[i64],
        lag: i64,
    ) -> Result<SubjectDesign> {
        let volume = self.source.load_volume(&dir.join(functional_filename))?;
        if volume.spatial_shape() != self.mask.spatial_shape() {
            return Err(GraphnetError::alignment(
                Some(id),
                format!(
                    "functional volume is {:?} but the mask is {:?}",
                    volume.spatial_shape(),
                    self.mask.spatial_shape()
                ),
            ));
        }
        let markers = self.source.load_markers(&dir.join(marker_filename))?;
        if markers.len() != volume.num_timepoints() {
            return Err(GraphnetError::alignment(
                Some(id),
                format!(
                    "{} marker values for {} recorded volumes",
                    markers.len(),
                    volume.num_timepoints()
                ),
            ));
        }

        let onsets: Vec<(usize, f64)> = markers
            .iter()
            .enumerate()
            .filter(|(_, label)| label.is_finite() && **label != 0.0)
            .map(|(tr, label)| (tr, *label))
            .collect();

        let moments = self.normalize.then(|| voxel_moments(self.mask, &volume));
        let mut entries = Vec::with_capacity(onsets.len() * selected_offsets.len());
        let mut dropped_trials = 0;
        for (trial, &(onset, raw_label)) in onsets.iter().enumerate() {
            let Some(times) = window(onset, lag, selected_offsets, volume.num_timepoints()) else {
                log::warn!(
                    "Subject {id}: trial {trial} (onset {onset}) falls outside the {} \
                     recorded volumes; dropped",
                    volume.num_timepoints()
                );
                dropped_trials += 1;
                continue;
            };
            entries.extend(times.into_iter().enumerate().map(|(offset_index, t)| {
                let mut voxels = self.mask.extract(&volume, t);
                if let Some((mean, scale)) = &moments {
                    voxels = (voxels - mean) * scale;
                }
                DesignEntry {
                    subject: subject_index,
                    trial,
                    onset,
                    offset_index,
                    voxels,
                    raw_label,
                }
            }));
        }

        if entries.is_empty() {
            return Err(GraphnetError::insufficient(format!(
                "subject {id} has no complete trials ({} onsets, {dropped_trials} dropped)",
                onsets.len()
            )));
        }
        if dropped_trials > 0 {
            log::warn!("Subject {id}: lost {dropped_trials} of {} trials", onsets.len());
        }

        Ok(SubjectDesign {
            id: id.to_string(),
            entries,
            dropped_trials,
        })
    }
}

/// Per-voxel mean and inverse standard deviation over the whole run.
/// Constant voxels get a zero scale so they contribute nothing.
fn voxel_moments(mask: &VolumeMask, volume: &Volume) -> (Array1<f64>, Array1<f64>) {
    let timepoints = volume.num_timepoints();
    let mut mean = Array1::<f64>::zeros(mask.num_voxels());
    for t in 0..timepoints {
        mean += &mask.extract(volume, t);
    }
    mean /= timepoints as f64;

    let mut sum_sq = Array1::<f64>::zeros(mask.num_voxels());
    for t in 0..timepoints {
        let centered = mask.extract(volume, t) - &mean;
        sum_sq += &(&centered * &centered);
    }
    let scale = sum_sq.mapv(|ss| {
        let sd = (ss / timepoints as f64).sqrt();
        if sd > f64::EPSILON { 1.0 / sd } else { 0.0 }
    });
    (mean, scale)
}

/// Timepoints `onset + lag + offset`, or `None` if any falls outside `0..len`.
fn window(onset: usize, lag: i64, offsets: &[i64], len: usize) -> Option<Vec<usize>> {
    offsets
        .iter()
        .map(|&offset| {
            let t = onset as i64 + lag + offset;
            (0..len as i64).contains(&t).then_some(t as usize)
        })
        .collect()
}

fn subject_id(dir: &Path) -> String {
    dir.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}
