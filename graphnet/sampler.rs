//! # Feature/label matrix construction
//!
//! Design entries are first folded into one row per trial (offset-major
//! concatenation of the masked voxel vectors), giving the base
//! [`TrialMatrix`]. Training matrices are then drawn from the base rows with
//! per-class resampling, so both classes contribute the same number of rows
//! when sampling with replacement.

use crate::design::DesignTable;
use crate::error::{GraphnetError, Result};
use crate::mask::VolumeMask;
use crate::types::LabelEncoding;
use ndarray::{Array1, Array2, Array4, ArrayView1, ArrayView4, Axis, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SAMPLING_SEED: u64 = 0x5EED_6A7E;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingOptions {
    pub with_replacement: bool,
    /// Rows drawn per class. Without replacement this is an upper bound.
    pub replacement_ceiling: usize,
    /// Codes for the larger and the smaller observed raw label, in that order.
    pub label_encoding: [f64; 2],
    pub seed: u64,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            with_replacement: true,
            replacement_ceiling: 36,
            label_encoding: [1.0, -1.0],
            seed: DEFAULT_SAMPLING_SEED,
        }
    }
}

/// Every usable trial of every subject, one row per trial.
#[derive(Clone, Debug)]
pub struct TrialMatrix {
    /// Shape: [n_trials, num_offsets * num_voxels].
    pub x: Array2<f64>,
    pub raw_labels: Array1<f64>,
    /// Subject index of each row.
    pub subjects: Vec<usize>,
    /// Trial index of each row within its subject.
    pub trials: Vec<usize>,
    pub subject_ids: Vec<String>,
    pub encoding: LabelEncoding,
    pub num_offsets: usize,
    pub num_voxels: usize,
}

impl TrialMatrix {
    pub fn from_design(design: &DesignTable, label_encoding: [f64; 2]) -> Result<Self> {
        if label_encoding[0] == label_encoding[1] {
            return Err(GraphnetError::InvalidConfig(format!(
                "label encoding {label_encoding:?} uses the same code twice"
            )));
        }
        let num_offsets = design.num_offsets();
        let num_voxels = design.num_voxels;
        let width = num_offsets * num_voxels;

        let mut values = Vec::new();
        let mut raw_labels = Vec::new();
        let mut subjects = Vec::new();
        let mut trials = Vec::new();
        for subject in &design.subjects {
            for window in subject.entries.chunks(num_offsets) {
                let first = &window[0];
                if window.len() != num_offsets
                    || window.iter().any(|e| e.trial != first.trial)
                {
                    return Err(GraphnetError::alignment(
                        Some(&subject.id),
                        format!("trial {} does not have all {num_offsets} offsets", first.trial),
                    ));
                }
                for entry in window {
                    values.extend(entry.voxels.iter().copied());
                }
                raw_labels.push(first.raw_label);
                subjects.push(first.subject);
                trials.push(first.trial);
            }
        }

        let x = Array2::from_shape_vec((raw_labels.len(), width), values).map_err(|e| {
            GraphnetError::alignment(None, format!("voxel vectors do not match the mask: {e}"))
        })?;
        let encoding = infer_encoding(&raw_labels, label_encoding)?;
        log::info!(
            "Base matrix: {} trials x {} features ({} offsets x {} voxels)",
            x.nrows(),
            width,
            num_offsets,
            num_voxels
        );

        Ok(Self {
            x,
            raw_labels: Array1::from_vec(raw_labels),
            subjects,
            trials,
            subject_ids: design.subjects.iter().map(|s| s.id.clone()).collect(),
            encoding,
            num_offsets,
            num_voxels,
        })
    }

    pub fn num_rows(&self) -> usize {
        self.x.nrows()
    }

    pub fn num_subjects(&self) -> usize {
        self.subject_ids.len()
    }

    /// Base rows belonging to any subject for which `keep` holds.
    pub fn rows_where(&self, keep: impl Fn(usize) -> bool) -> Vec<usize> {
        (0..self.num_rows()).filter(|&row| keep(self.subjects[row])).collect()
    }

    pub fn encoded_labels(&self, rows: &[usize]) -> Array1<f64> {
        rows.iter()
            .map(|&row| {
                let class = self.class_of_row(row);
                self.encoding.codes[class]
            })
            .collect()
    }

    fn class_of_row(&self, row: usize) -> usize {
        // Every raw label was checked against the encoding at construction.
        self.encoding.class_of(self.raw_labels[row]).unwrap_or(1)
    }
}

fn infer_encoding(raw_labels: &[f64], codes: [f64; 2]) -> Result<LabelEncoding> {
    let mut distinct: Vec<f64> = Vec::new();
    for &label in raw_labels {
        if !distinct.contains(&label) {
            distinct.push(label);
        }
    }
    distinct.sort_by(|a, b| b.total_cmp(a));
    match distinct.len() {
        2 => Ok(LabelEncoding {
            raw: [distinct[0], distinct[1]],
            codes,
        }),
        0 | 1 => Err(GraphnetError::insufficient(format!(
            "need two behavioral classes, observed labels {distinct:?}"
        ))),
        n => Err(GraphnetError::alignment(
            None,
            format!("expected a binary outcome but found {n} distinct labels {distinct:?}"),
        )),
    }
}

/// Row weights and grouping that define the trial-adjacency graph.
///
/// Consecutive rows of the same subject are neighbours, with edge weight
/// `w[i] * w[i + 1]`. The mask describes one specific matrix: it goes stale
/// once rows are resampled.
#[derive(Clone, Debug, PartialEq)]
pub struct TrialMask {
    pub weights: Array1<f64>,
    pub groups: Vec<usize>,
}

impl TrialMask {
    pub fn uniform(groups: Vec<usize>) -> Self {
        Self {
            weights: Array1::ones(groups.len()),
            groups,
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn edges(&self) -> Vec<(usize, usize, f64)> {
        (1..self.len())
            .filter(|&i| self.groups[i] == self.groups[i - 1])
            .map(|i| (i - 1, i, self.weights[i - 1] * self.weights[i]))
            .filter(|&(_, _, w)| w > 0.0)
            .collect()
    }
}

/// A resampled training problem drawn from a [`TrialMatrix`].
#[derive(Clone, Debug)]
pub struct SampledMatrices {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    pub trial_mask: TrialMask,
    /// Base row behind each sampled row.
    pub rows: Vec<usize>,
}

pub struct MatrixSampler<'a> {
    mask: &'a VolumeMask,
}

impl<'a> MatrixSampler<'a> {
    pub fn new(mask: &'a VolumeMask) -> Self {
        Self { mask }
    }

    /// Builds the base trial matrix from `design` and draws the training matrices.
    pub fn sample(
        &self,
        design: &DesignTable,
        options: &SamplingOptions,
    ) -> Result<(TrialMatrix, SampledMatrices)> {
        if design.num_voxels != self.mask.num_voxels() {
            return Err(GraphnetError::alignment(
                None,
                format!(
                    "design has {} voxels per offset, mask has {}",
                    design.num_voxels,
                    self.mask.num_voxels()
                ),
            ));
        }
        let base = TrialMatrix::from_design(design, options.label_encoding)?;
        let all_rows: Vec<usize> = (0..base.num_rows()).collect();
        let sampled = Self::resample(&base, &all_rows, options)?;
        Ok((base, sampled))
    }

    /// Draws `replacement_ceiling` rows per class from `rows` of `base`.
    ///
    /// The output keeps base order (subject, then trial), so repeated draws of
    /// a trial sit next to each other.
    pub fn resample(
        base: &TrialMatrix,
        rows: &[usize],
        options: &SamplingOptions,
    ) -> Result<SampledMatrices> {
        if options.replacement_ceiling == 0 {
            return Err(GraphnetError::InvalidConfig(
                "replacement_ceiling must be positive".to_string(),
            ));
        }
        let mut rng = StdRng::seed_from_u64(options.seed);
        let mut chosen = Vec::new();
        for class in 0..2 {
            let members: Vec<usize> = rows
                .iter()
                .copied()
                .filter(|&row| base.class_of_row(row) == class)
                .collect();
            if members.is_empty() {
                return Err(GraphnetError::insufficient(format!(
                    "no trials with raw label {} to sample",
                    base.encoding.raw[class]
                )));
            }
            if options.with_replacement {
                chosen.extend(
                    (0..options.replacement_ceiling)
                        .map(|_| members[rng.gen_range(0..members.len())]),
                );
            } else {
                let take = options.replacement_ceiling.min(members.len());
                chosen.extend(
                    rand::seq::index::sample(&mut rng, members.len(), take)
                        .into_iter()
                        .map(|i| members[i]),
                );
            }
        }
        chosen.sort_unstable();

        let x = base.x.select(Axis(0), &chosen);
        let y = base.encoded_labels(&chosen);
        let trial_mask = TrialMask::uniform(chosen.iter().map(|&row| base.subjects[row]).collect());
        log::debug!(
            "Resampled {} rows from {} candidates (with_replacement={})",
            chosen.len(),
            rows.len(),
            options.with_replacement
        );
        Ok(SampledMatrices {
            x,
            y,
            trial_mask,
            rows: chosen,
        })
    }

    /// Inverse of feature concatenation: splits `coefs` into `num_offsets`
    /// spatial maps, zero outside the mask. The last `trailing_rows_to_drop`
    /// entries (intercept or auxiliary terms) are ignored.
    pub fn unmask(
        &self,
        coefs: ArrayView1<f64>,
        num_offsets: usize,
        trailing_rows_to_drop: usize,
    ) -> Result<Array4<f32>> {
        let n_vox = self.mask.num_voxels();
        let kept = coefs.len().checked_sub(trailing_rows_to_drop).ok_or_else(|| {
            GraphnetError::alignment(
                None,
                format!(
                    "cannot drop {trailing_rows_to_drop} trailing entries from {} coefficients",
                    coefs.len()
                ),
            )
        })?;
        if kept != num_offsets * n_vox {
            return Err(GraphnetError::alignment(
                None,
                format!(
                    "{kept} coefficients do not split into {num_offsets} maps of {n_vox} voxels"
                ),
            ));
        }

        let [nx, ny, nz] = self.mask.spatial_shape();
        let mut maps = Array4::zeros((nx, ny, nz, num_offsets));
        for k in 0..num_offsets {
            let chunk = coefs.slice(s![k * n_vox..(k + 1) * n_vox]);
            maps.index_axis_mut(Axis(3), k).assign(&self.mask.scatter(chunk));
        }
        Ok(maps)
    }

    /// Concatenates the masked voxels of each map, offset-major.
    pub fn mask_maps(&self, maps: ArrayView4<f32>) -> Array1<f64> {
        let mut flat = Vec::with_capacity(maps.shape()[3] * self.mask.num_voxels());
        for k in 0..maps.shape()[3] {
            flat.extend(self.mask.gather(maps, k));
        }
        Array1::from_vec(flat)
    }
}
