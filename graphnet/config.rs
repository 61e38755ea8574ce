//! Run configuration loaded from TOML.
//!
//! Every section is optional and falls back to the defaults of the workflow
//! this crate was built for: lag 2, offsets 1 to 4, 36 draws per class with
//! replacement, `l1 = 43, l2 = l3 = 100, delta = 0.3`, three folds and a
//! three-pass l1 zoom from `[10, 60]`.

use crate::crossval::CrossValidationConfig;
use crate::error::{GraphnetError, Result};
use crate::gridsearch::GridSearchConfig;
use crate::sampler::SamplingOptions;
use crate::solver::{PenaltyParams, SolverConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory holding one sub-directory per subject.
    pub subject_top_dir: PathBuf,
    /// Sub-directories whose name starts with any of these are subjects. Empty
    /// accepts every directory.
    pub subject_prefixes: Vec<String>,
    pub mask: PathBuf,
    pub functional_name: String,
    pub marker_name: String,
    /// TRs between a marker onset and the start of the response window.
    pub lag: i64,
    pub selected_offsets: Vec<i64>,
    /// Coefficient map path, `.nii` appended when no extension is given.
    pub output_name: PathBuf,
    /// Z-score each voxel's time series within a subject.
    pub normalize: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            subject_top_dir: PathBuf::from("."),
            subject_prefixes: Vec::new(),
            mask: PathBuf::from("mask.nii"),
            functional_name: "functional.nii".to_string(),
            marker_name: "markers.1D".to_string(),
            lag: 2,
            selected_offsets: vec![1, 2, 3, 4],
            output_name: PathBuf::from("graphnet_coef_map"),
            normalize: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data: DataConfig,
    pub sampling: SamplingOptions,
    pub penalty: PenaltyParams,
    pub solver: SolverConfig,
    pub crossvalidation: CrossValidationConfig,
    pub gridsearch: GridSearchConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| GraphnetError::resource(path.display().to_string(), e.to_string()))?;
        let config = Self::from_toml_str(&text)?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let data = &self.data;
        if data.selected_offsets.is_empty() {
            return Err(GraphnetError::InvalidConfig(
                "selected_offsets must name at least one offset".to_string(),
            ));
        }
        if data.functional_name.is_empty() || data.marker_name.is_empty() {
            return Err(GraphnetError::InvalidConfig(
                "functional_name and marker_name must be set".to_string(),
            ));
        }

        let sampling = &self.sampling;
        if sampling.replacement_ceiling == 0 {
            return Err(GraphnetError::InvalidConfig(
                "replacement_ceiling must be positive".to_string(),
            ));
        }
        if sampling.label_encoding[0] == sampling.label_encoding[1]
            || sampling.label_encoding.iter().any(|c| !c.is_finite())
        {
            return Err(GraphnetError::InvalidConfig(format!(
                "label_encoding needs two distinct finite codes, got {:?}",
                sampling.label_encoding
            )));
        }

        self.penalty.validate()?;

        let solver = &self.solver;
        if solver.max_iterations == 0 {
            return Err(GraphnetError::InvalidConfig("max_iterations must be positive".to_string()));
        }
        if !(solver.tolerance.is_finite() && solver.tolerance > 0.0) {
            return Err(GraphnetError::InvalidConfig(format!(
                "tolerance must be positive, got {}",
                solver.tolerance
            )));
        }
        if !(solver.weight_floor > 0.0 && solver.weight_floor <= 1.0) {
            return Err(GraphnetError::InvalidConfig(format!(
                "weight_floor must lie in (0, 1], got {}",
                solver.weight_floor
            )));
        }

        if self.crossvalidation.folds < 2 {
            return Err(GraphnetError::InvalidConfig(format!(
                "cross-validation needs at least 2 folds, got {}",
                self.crossvalidation.folds
            )));
        }

        self.gridsearch.validate()
    }
}
