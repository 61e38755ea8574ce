//! End-to-end glue: from a configuration and a volume source to sampled
//! training matrices, and from those to a coefficient map on disk.

use crate::config::PipelineConfig;
use crate::crossval::CrossValidator;
use crate::design::DesignBuilder;
use crate::error::{GraphnetError, Result};
use crate::io::{VolumeSource, discover_subject_dirs, save_volume};
use crate::mask::VolumeMask;
use crate::sampler::{MatrixSampler, SampledMatrices, TrialMatrix};
use crate::solver::{GraphnetFit, PenalizedSolver, PenaltyParams};
use ndarray::Array4;
use std::path::{Path, PathBuf};

/// Everything downstream stages need once the raw design has been released.
pub struct PreparedData {
    pub mask: VolumeMask,
    pub base: TrialMatrix,
    pub sampled: SampledMatrices,
    /// Subjects dropped while building the design, with the reason.
    pub skipped_subjects: Vec<(String, String)>,
}

impl PreparedData {
    /// A cross-validator over the base matrix, with folds configured from `config`.
    pub fn cross_validator(&self, config: &PipelineConfig) -> Result<CrossValidator<'_>> {
        let mut cv = CrossValidator::new(
            &self.base,
            config.sampling.clone(),
            PenalizedSolver::new(config.solver.clone()),
        );
        cv.configure_with(&config.crossvalidation)?;
        Ok(cv)
    }
}

/// Resolves subject directories from `[data]`: every matching sub-directory of
/// `subject_top_dir`.
pub fn subject_dirs(config: &PipelineConfig) -> Result<Vec<PathBuf>> {
    let dirs = discover_subject_dirs(&config.data.subject_top_dir, &config.data.subject_prefixes)?;
    if dirs.is_empty() {
        return Err(GraphnetError::insufficient(format!(
            "no subject directories under {} match {:?}",
            config.data.subject_top_dir.display(),
            config.data.subject_prefixes
        )));
    }
    Ok(dirs)
}

/// Mask, design, sampling and design release for the given subjects.
pub fn prepare_subjects<S: VolumeSource>(
    config: &PipelineConfig,
    source: &S,
    subject_dirs: &[PathBuf],
) -> Result<PreparedData> {
    let data = &config.data;
    let mask = VolumeMask::build(source, &data.mask, data.selected_offsets.len())?;

    let mut builder = DesignBuilder::new(source, &mask).with_normalization(data.normalize);
    let design = builder.create(
        subject_dirs,
        &data.functional_name,
        &data.marker_name,
        &data.selected_offsets,
        data.lag,
    )?;
    let skipped_subjects = design.skipped.clone();
    let (base, sampled) = MatrixSampler::new(&mask).sample(design, &config.sampling)?;
    builder.discard();

    Ok(PreparedData {
        mask,
        base,
        sampled,
        skipped_subjects,
    })
}

/// [`prepare_subjects`] over the directories discovered from `config`.
pub fn prepare<S: VolumeSource>(config: &PipelineConfig, source: &S) -> Result<PreparedData> {
    let dirs = subject_dirs(config)?;
    prepare_subjects(config, source, &dirs)
}

pub struct TrainedMap {
    pub fit: GraphnetFit,
    /// One spatial map per offset, stacked along the fourth axis.
    pub maps: Array4<f32>,
}

/// Trains on the sampled matrices and unmasks the primary solution.
pub fn train_map(
    config: &PipelineConfig,
    prepared: &PreparedData,
    params: &PenaltyParams,
) -> Result<TrainedMap> {
    let solver = PenalizedSolver::new(config.solver.clone());
    let sampled = &prepared.sampled;
    let fit = solver.train(sampled.x.view(), sampled.y.view(), &sampled.trial_mask, params)?;

    let coefficients = fit.primary().clone();
    log::info!(
        "Primary solution: {} of {} coefficients non-zero, intercept {:.4}",
        coefficients.count_nonzero(),
        coefficients.len(),
        coefficients.intercept()
    );
    let flat = coefficients.with_intercept();
    let maps =
        MatrixSampler::new(&prepared.mask).unmask(flat.view(), prepared.base.num_offsets, 1)?;
    Ok(TrainedMap { fit, maps })
}

/// Trains with the configured penalty and writes the coefficient map to
/// `output_name`. Returns the fit and the path written.
pub fn train_and_export(
    config: &PipelineConfig,
    prepared: &PreparedData,
    params: &PenaltyParams,
    output_name: &Path,
) -> Result<(GraphnetFit, PathBuf)> {
    let TrainedMap { fit, maps } = train_map(config, prepared, params)?;
    let path = save_volume(maps.view(), prepared.mask.pixdim(), output_name)?;
    Ok((fit, path))
}
