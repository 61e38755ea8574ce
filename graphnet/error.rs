//! Error taxonomy shared by every stage of the pipeline.
//!
//! Each variant carries enough context (subject, fold, grid point) to reproduce
//! the failure. Only solver convergence failures are treated as recoverable by
//! the cross-validation and grid search layers; everything else aborts the run.

use crate::solver::PenaltyParams;
use thiserror::Error;

/// A comprehensive error type for mask loading, design construction, sampling,
/// fitting and model selection.
#[derive(Error, Debug)]
pub enum GraphnetError {
    #[error("Could not read resource '{path}': {reason}")]
    Resource { path: String, reason: String },

    #[error("Data alignment failure{}: {reason}", subject_context(.subject))]
    DataAlignment {
        subject: Option<String>,
        reason: String,
    },

    #[error("Insufficient data{}: {reason}", fold_context(.fold))]
    InsufficientData { fold: Option<usize>, reason: String },

    #[error(
        "The solver did not converge within {max_iterations} iterations \
         (last relative change {last_change:.6e}, l1={l1}, delta={delta})."
    )]
    Convergence {
        max_iterations: usize,
        last_change: f64,
        l1: f64,
        delta: f64,
    },

    #[error("Fold {fold} failed: {source}")]
    InFold {
        fold: usize,
        #[source]
        source: Box<GraphnetError>,
    },

    #[error("Grid point (l1={l1}, l2={l2}, l3={l3}, delta={delta}) failed: {source}")]
    AtGridPoint {
        l1: f64,
        l2: f64,
        l3: f64,
        delta: f64,
        #[source]
        source: Box<GraphnetError>,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to write tabular report: {0}")]
    Report(#[from] csv::Error),
}

fn subject_context(subject: &Option<String>) -> String {
    match subject {
        Some(id) => format!(" for subject '{id}'"),
        None => String::new(),
    }
}

fn fold_context(fold: &Option<usize>) -> String {
    match fold {
        Some(index) => format!(" in fold {index}"),
        None => String::new(),
    }
}

impl GraphnetError {
    pub fn resource(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resource {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn alignment(subject: Option<&str>, reason: impl Into<String>) -> Self {
        Self::DataAlignment {
            subject: subject.map(str::to_string),
            reason: reason.into(),
        }
    }

    pub fn insufficient(reason: impl Into<String>) -> Self {
        Self::InsufficientData {
            fold: None,
            reason: reason.into(),
        }
    }

    /// Attaches a fold index to a fatal error raised while evaluating that fold.
    /// Convergence failures and errors that already name a fold pass through.
    pub fn in_fold(self, index: usize) -> Self {
        match self {
            Self::InsufficientData { fold: None, reason } => Self::InsufficientData {
                fold: Some(index),
                reason,
            },
            err @ (Self::InsufficientData { fold: Some(_), .. }
            | Self::InFold { .. }
            | Self::Convergence { .. }) => err,
            other => Self::InFold {
                fold: index,
                source: Box::new(other),
            },
        }
    }

    /// Names the penalty combination whose evaluation aborted a grid search.
    pub fn at_grid_point(self, params: &PenaltyParams) -> Self {
        match self {
            err @ Self::AtGridPoint { .. } => err,
            other => Self::AtGridPoint {
                l1: params.l1,
                l2: params.l2,
                l3: params.l3,
                delta: params.delta,
                source: Box::new(other),
            },
        }
    }

    /// The fold index this error was raised in, if any.
    pub fn fold(&self) -> Option<usize> {
        match self {
            Self::InsufficientData { fold, .. } => *fold,
            Self::InFold { fold, .. } => Some(*fold),
            Self::AtGridPoint { source, .. } => source.fold(),
            _ => None,
        }
    }

    /// Convergence failures may be retried with a relaxed `delta`; callers that
    /// sweep many fits record them instead of aborting.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Convergence { .. })
    }
}

pub type Result<T> = std::result::Result<T, GraphnetError>;
