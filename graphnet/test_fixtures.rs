//! Synthetic studies for tests and benchmarks.
//!
//! A study is a set of in-memory subjects whose functional runs carry a
//! class-dependent bump on a few "informative" voxels inside every trial
//! window, on top of Gaussian noise. Everything is seeded so repeated builds
//! are identical.

use crate::design::{DesignBuilder, DesignTable};
use crate::error::Result;
use crate::io::{InMemoryVolumeSource, Volume};
use crate::mask::VolumeMask;
use crate::sampler::{MatrixSampler, SampledMatrices, SamplingOptions, TrialMatrix};
use ndarray::{Array3, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::path::PathBuf;

pub const FUNCTIONAL_NAME: &str = "trial_series.nii";
pub const MARKER_NAME: &str = "trial_markers.1D";
pub const MASK_PATH: &str = "/synthetic/mask.nii";

/// Raw marker values of the two classes. The larger one is the positive class.
pub const CLASS_LABELS: [f64; 2] = [2.0, 1.0];

/// Everything needed to drive [`DesignBuilder::create`] against a fake study.
pub struct SyntheticStudy {
    pub source: InMemoryVolumeSource,
    pub mask_path: PathBuf,
    pub subject_dirs: Vec<PathBuf>,
    pub lag: i64,
    pub selected_offsets: Vec<i64>,
    /// Mask-order indices of voxels that carry the class signal.
    pub informative_voxels: Vec<usize>,
}

/// A study pushed through masking, design construction and sampling.
pub struct PreparedStudy {
    pub mask: VolumeMask,
    pub design: DesignTable,
    pub base: TrialMatrix,
    pub sampled: SampledMatrices,
}

pub struct SyntheticStudyBuilder {
    num_subjects: usize,
    trials_per_subject: usize,
    spatial_shape: [usize; 3],
    excluded_voxels: Vec<[usize; 3]>,
    informative: usize,
    signal: f64,
    noise: f64,
    seed: u64,
    lag: i64,
    selected_offsets: Vec<i64>,
    trial_spacing: usize,
}

impl SyntheticStudyBuilder {
    /// Four trials per subject (two per class) on a 10-voxel mask, lag 2 and
    /// offsets 1..=4.
    pub fn new(num_subjects: usize) -> Self {
        Self {
            num_subjects,
            trials_per_subject: 4,
            spatial_shape: [4, 3, 1],
            excluded_voxels: vec![[0, 0, 0], [3, 2, 0]],
            informative: 3,
            signal: 2.5,
            noise: 0.5,
            seed: 42,
            lag: 2,
            selected_offsets: vec![1, 2, 3, 4],
            trial_spacing: 8,
        }
    }

    /// Trials alternate between the two classes, so an even count is balanced.
    pub fn trials_per_subject(mut self, trials: usize) -> Self {
        self.trials_per_subject = trials;
        self
    }

    pub fn signal(mut self, signal: f64) -> Self {
        self.signal = signal;
        self
    }

    pub fn noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn mask_selection(&self) -> Array3<bool> {
        let [nx, ny, nz] = self.spatial_shape;
        let mut selection = Array3::from_elem((nx, ny, nz), true);
        for &[x, y, z] in &self.excluded_voxels {
            selection[[x, y, z]] = false;
        }
        selection
    }

    pub fn build(&self) -> SyntheticStudy {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut source = InMemoryVolumeSource::new();
        let [nx, ny, nz] = self.spatial_shape;

        let selection = self.mask_selection();
        let mask_volume = Array4::from_shape_fn((nx, ny, nz, 1), |(x, y, z, _)| {
            if selection[[x, y, z]] { 1.0f32 } else { 0.0 }
        });
        source.insert_volume(MASK_PATH, Volume::new(mask_volume));

        let voxels: Vec<[usize; 3]> = ndarray::indices((nx, ny, nz))
            .into_iter()
            .filter(|&(x, y, z)| selection[[x, y, z]])
            .map(|(x, y, z)| [x, y, z])
            .collect();
        let informative = &voxels[..self.informative.min(voxels.len())];

        let first_onset = 2usize;
        let window_start = self.lag + self.selected_offsets.iter().copied().min().unwrap_or(0);
        let window_end = self.lag + self.selected_offsets.iter().copied().max().unwrap_or(0);
        let timepoints =
            first_onset + self.trials_per_subject * self.trial_spacing + self.trial_spacing;

        let mut subject_dirs = Vec::with_capacity(self.num_subjects);
        for s in 0..self.num_subjects {
            let dir = PathBuf::from(format!("/synthetic/subject_{s:02}"));
            let mut markers = vec![0.0; timepoints];
            let mut data = Array4::<f32>::zeros((nx, ny, nz, timepoints));
            data.mapv_inplace(|_| {
                let draw: f64 = rng.sample(StandardNormal);
                (100.0 + self.noise * draw) as f32
            });

            for trial in 0..self.trials_per_subject {
                let onset = first_onset + trial * self.trial_spacing;
                let class = trial % 2;
                markers[onset] = CLASS_LABELS[class];
                let sign = if class == 0 { 1.0 } else { -1.0 };
                for t in window_start..=window_end {
                    let t = (onset as i64 + t) as usize;
                    for &[x, y, z] in informative {
                        data[[x, y, z, t]] += (sign * self.signal) as f32;
                    }
                }
            }

            source.insert_volume(dir.join(FUNCTIONAL_NAME), Volume::new(data));
            source.insert_markers(dir.join(MARKER_NAME), markers);
            subject_dirs.push(dir);
        }

        SyntheticStudy {
            source,
            mask_path: PathBuf::from(MASK_PATH),
            subject_dirs,
            lag: self.lag,
            selected_offsets: self.selected_offsets.clone(),
            informative_voxels: (0..informative.len()).collect(),
        }
    }

    /// Builds the study and runs it through mask, design and sampling with
    /// `replacement_ceiling` set to the trials per class.
    pub fn build_prepared(&self) -> Result<PreparedStudy> {
        let study = self.build();
        let mask =
            VolumeMask::build(&study.source, &study.mask_path, study.selected_offsets.len())?;
        let design = DesignBuilder::new(&study.source, &mask)
            .create(
                &study.subject_dirs,
                FUNCTIONAL_NAME,
                MARKER_NAME,
                &study.selected_offsets,
                study.lag,
            )?
            .clone();
        let options = SamplingOptions {
            replacement_ceiling: (self.num_subjects * self.trials_per_subject / 2).max(1),
            ..SamplingOptions::default()
        };
        let (base, sampled) = MatrixSampler::new(&mask).sample(&design, &options)?;
        Ok(PreparedStudy {
            mask,
            design,
            base,
            sampled,
        })
    }
}
