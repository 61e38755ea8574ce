#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod config;
pub mod crossval;
pub mod design;
pub mod error;
pub mod gridsearch;
pub mod io;
pub mod mask;
pub mod pipeline;
pub mod progress;
pub mod sampler;
pub mod solver;
pub mod test_fixtures;
pub mod types;

pub use config::PipelineConfig;
pub use crossval::{CancellationToken, CrossValidationReport, CrossValidator};
pub use error::{GraphnetError, Result};
pub use gridsearch::{GridSearchReport, GridSearcher};
pub use solver::{GraphnetFit, PenalizedSolver, PenaltyParams};
