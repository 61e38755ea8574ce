//! # Subject-level k-fold cross-validation
//!
//! Folds partition subjects, never trials, so no subject contributes to both
//! sides of a split. Each fold resamples its own balanced training matrix from
//! the remaining subjects' base rows and is scored on every trial of its held
//! out subjects. Folds share nothing mutable and run on the rayon pool;
//! results are merged by fold index.

use crate::error::{GraphnetError, Result};
use crate::sampler::{MatrixSampler, SamplingOptions, TrialMatrix};
use crate::solver::{PenalizedSolver, PenaltyParams};
use ndarray::Axis;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossValidationConfig {
    pub folds: usize,
    /// Spread the `n mod folds` leftover subjects over the folds instead of
    /// leaving them out.
    pub leave_mod_in: bool,
    /// Shuffle subjects before assignment. `None` keeps directory order.
    pub seed: Option<u64>,
}

impl Default for CrossValidationConfig {
    fn default() -> Self {
        Self {
            folds: 3,
            leave_mod_in: true,
            seed: None,
        }
    }
}

/// Cooperative stop signal shared by cross-validation and grid search.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    deadline: Option<Instant>,
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            flag: Arc::default(),
        }
    }

    pub fn after(budget: Duration) -> Self {
        Self::with_deadline(Instant::now() + budget)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Assignment of subject indices to folds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoldPlan {
    folds: Vec<Vec<usize>>,
    left_out: Vec<usize>,
}

impl FoldPlan {
    /// Contiguous blocks of `n / folds` subjects per fold; leftovers are dealt
    /// round-robin from fold 0 when `leave_mod_in` is set, otherwise left out.
    pub fn new(
        num_subjects: usize,
        folds: usize,
        leave_mod_in: bool,
        seed: Option<u64>,
    ) -> Result<Self> {
        if folds < 2 {
            return Err(GraphnetError::InvalidConfig(format!(
                "cross-validation needs at least 2 folds, got {folds}"
            )));
        }
        let per_fold = num_subjects / folds;
        if per_fold == 0 {
            return Err(GraphnetError::insufficient(format!(
                "{num_subjects} subjects cannot fill {folds} folds"
            )));
        }

        let mut order: Vec<usize> = (0..num_subjects).collect();
        if let Some(seed) = seed {
            order.shuffle(&mut StdRng::seed_from_u64(seed));
        }

        let mut assignment: Vec<Vec<usize>> = order
            .chunks(per_fold)
            .take(folds)
            .map(|chunk| chunk.to_vec())
            .collect();
        let leftovers = &order[folds * per_fold..];
        let mut left_out = Vec::new();
        if leave_mod_in {
            for (j, &subject) in leftovers.iter().enumerate() {
                assignment[j % folds].push(subject);
            }
        } else {
            left_out.extend_from_slice(leftovers);
            if !left_out.is_empty() {
                log::warn!(
                    "{} subjects left out of cross-validation ({} mod {})",
                    left_out.len(),
                    num_subjects,
                    folds
                );
            }
        }
        Ok(Self {
            folds: assignment,
            left_out,
        })
    }

    pub fn num_folds(&self) -> usize {
        self.folds.len()
    }

    pub fn folds(&self) -> &[Vec<usize>] {
        &self.folds
    }

    pub fn left_out(&self) -> &[usize] {
        &self.left_out
    }

    pub fn fold_of(&self, subject: usize) -> Option<usize> {
        self.folds.iter().position(|fold| fold.contains(&subject))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FoldOutcome {
    Evaluated { accuracy: f64, nonzero: usize },
    /// The solver gave up on this fold; excluded from aggregates.
    Failed { reason: String },
    /// Not run because the caller cancelled.
    Skipped,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CrossValidationReport {
    pub outcomes: Vec<FoldOutcome>,
    /// Some folds were skipped after cancellation.
    pub partial: bool,
}

impl CrossValidationReport {
    pub fn from_outcomes(outcomes: Vec<FoldOutcome>) -> Self {
        let partial = outcomes.iter().any(|o| matches!(o, FoldOutcome::Skipped));
        Self { outcomes, partial }
    }

    pub fn accuracies(&self) -> Vec<Option<f64>> {
        self.outcomes
            .iter()
            .map(|o| match o {
                FoldOutcome::Evaluated { accuracy, .. } => Some(*accuracy),
                _ => None,
            })
            .collect()
    }

    pub fn nonzero_counts(&self) -> Vec<Option<usize>> {
        self.outcomes
            .iter()
            .map(|o| match o {
                FoldOutcome::Evaluated { nonzero, .. } => Some(*nonzero),
                _ => None,
            })
            .collect()
    }

    /// Mean over evaluated folds, summed in fold order.
    pub fn mean_accuracy(&self) -> Option<f64> {
        mean(self.accuracies().into_iter().flatten())
    }

    pub fn mean_nonzero(&self) -> Option<f64> {
        mean(self.nonzero_counts().into_iter().flatten().map(|n| n as f64))
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Anything that can score a penalty setting by cross-validation.
pub trait CrossValidatedTrainer: Sync {
    fn evaluate(
        &self,
        params: &PenaltyParams,
        cancel: &CancellationToken,
    ) -> Result<CrossValidationReport>;
}

pub struct CrossValidator<'a> {
    base: &'a TrialMatrix,
    sampling: SamplingOptions,
    solver: PenalizedSolver,
    plan: Option<FoldPlan>,
}

impl<'a> CrossValidator<'a> {
    pub fn new(base: &'a TrialMatrix, sampling: SamplingOptions, solver: PenalizedSolver) -> Self {
        Self {
            base,
            sampling,
            solver,
            plan: None,
        }
    }

    pub fn configure(&mut self, folds: usize, leave_mod_in: bool) -> Result<&FoldPlan> {
        self.configure_with(&CrossValidationConfig {
            folds,
            leave_mod_in,
            seed: None,
        })
    }

    pub fn configure_with(&mut self, config: &CrossValidationConfig) -> Result<&FoldPlan> {
        let plan = FoldPlan::new(
            self.base.num_subjects(),
            config.folds,
            config.leave_mod_in,
            config.seed,
        )?;
        for (index, fold) in plan.folds().iter().enumerate() {
            let ids: Vec<&str> = fold
                .iter()
                .map(|&s| self.base.subject_ids[s].as_str())
                .collect();
            log::info!("Fold {index}: {ids:?}");
        }
        Ok(self.plan.insert(plan))
    }

    pub fn plan(&self) -> Option<&FoldPlan> {
        self.plan.as_ref()
    }

    pub fn crossvalidate(&self, params: &PenaltyParams) -> Result<CrossValidationReport> {
        self.crossvalidate_until(params, &CancellationToken::new())
    }

    /// Evaluates every fold in parallel. Folds that have not started when
    /// `cancel` fires are reported as skipped.
    pub fn crossvalidate_until(
        &self,
        params: &PenaltyParams,
        cancel: &CancellationToken,
    ) -> Result<CrossValidationReport> {
        let plan = self.plan.as_ref().ok_or_else(|| {
            GraphnetError::InvalidConfig(
                "cross-validation folds have not been configured".to_string(),
            )
        })?;
        let outcomes = (0..plan.num_folds())
            .into_par_iter()
            .map(|fold| {
                if cancel.is_cancelled() {
                    Ok(FoldOutcome::Skipped)
                } else {
                    self.evaluate_fold(plan, fold, params)
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let report = CrossValidationReport::from_outcomes(outcomes);
        log::info!(
            "Cross-validated l1={} l2={} l3={} delta={}: mean accuracy {:?}{}",
            params.l1,
            params.l2,
            params.l3,
            params.delta,
            report.mean_accuracy(),
            if report.partial { " (partial)" } else { "" }
        );
        Ok(report)
    }

    fn evaluate_fold(
        &self,
        plan: &FoldPlan,
        fold: usize,
        params: &PenaltyParams,
    ) -> Result<FoldOutcome> {
        let held_out = &plan.folds()[fold];
        let train_rows = self
            .base
            .rows_where(|s| !held_out.contains(&s) && !plan.left_out().contains(&s));
        let test_rows = self.base.rows_where(|s| held_out.contains(&s));
        if test_rows.is_empty() {
            return Err(
                GraphnetError::insufficient("held-out subjects have no trials").in_fold(fold),
            );
        }

        let options = SamplingOptions {
            seed: self.sampling.seed.wrapping_add(fold as u64),
            ..self.sampling.clone()
        };
        let train = MatrixSampler::resample(self.base, &train_rows, &options)
            .map_err(|e| e.in_fold(fold))?;

        let fit = match self
            .solver
            .train(train.x.view(), train.y.view(), &train.trial_mask, params)
        {
            Ok(fit) => fit,
            Err(e) if e.is_recoverable() => {
                log::warn!("Fold {fold} failed: {e}");
                return Ok(FoldOutcome::Failed {
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                log::error!("Fold {fold} aborted: {e}");
                return Err(e.in_fold(fold));
            }
        };

        let x_test = self.base.x.select(Axis(0), &test_rows);
        let y_test = self.base.encoded_labels(&test_rows);
        let accuracy = fit.accuracy(x_test.view(), y_test.view());
        let nonzero = fit.primary().count_nonzero();
        log::debug!(
            "Fold {fold}: accuracy {accuracy:.4} on {} held-out trials, \
             {nonzero} non-zero coefficients",
            test_rows.len()
        );
        Ok(FoldOutcome::Evaluated { accuracy, nonzero })
    }
}

impl CrossValidatedTrainer for CrossValidator<'_> {
    fn evaluate(
        &self,
        params: &PenaltyParams,
        cancel: &CancellationToken,
    ) -> Result<CrossValidationReport> {
        self.crossvalidate_until(params, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::SolverConfig;
    use crate::test_fixtures::SyntheticStudyBuilder;
    use approx::assert_abs_diff_eq;

    #[test]
    fn seven_subjects_three_folds_cover_everyone_once() {
        let plan = FoldPlan::new(7, 3, true, None).unwrap();
        assert_eq!(plan.folds(), &[vec![0, 1, 6], vec![2, 3], vec![4, 5]]);
        let mut seen: Vec<usize> = plan.folds().iter().flatten().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
        assert!(plan.folds().iter().all(|f| !f.is_empty()));
        assert!(plan.left_out().is_empty());
    }

    #[test]
    fn leftovers_are_dropped_without_leave_mod_in() {
        let plan = FoldPlan::new(8, 3, false, None).unwrap();
        assert_eq!(plan.folds(), &[vec![0, 1], vec![2, 3], vec![4, 5]]);
        assert_eq!(plan.left_out(), &[6, 7]);
        assert_eq!(plan.fold_of(7), None);
    }

    #[test]
    fn seeded_plans_are_reproducible_partitions() {
        let a = FoldPlan::new(10, 4, true, Some(99)).unwrap();
        let b = FoldPlan::new(10, 4, true, Some(99)).unwrap();
        assert_eq!(a, b);
        let mut seen: Vec<usize> = a.folds().iter().flatten().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn too_few_subjects_or_folds_are_rejected() {
        assert!(matches!(
            FoldPlan::new(2, 3, true, None),
            Err(GraphnetError::InsufficientData { .. })
        ));
        assert!(matches!(
            FoldPlan::new(5, 1, true, None),
            Err(GraphnetError::InvalidConfig(_))
        ));
    }

    #[test]
    fn unconfigured_validator_refuses_to_run() {
        let study = SyntheticStudyBuilder::new(3).build_prepared().unwrap();
        let cv = CrossValidator::new(
            &study.base,
            SamplingOptions::default(),
            PenalizedSolver::default(),
        );
        assert!(cv.crossvalidate(&PenaltyParams::default()).is_err());
    }

    #[test]
    fn folds_report_bounded_accuracies() {
        let study = SyntheticStudyBuilder::new(4)
            .trials_per_subject(8)
            .build_prepared()
            .unwrap();
        let mut cv = CrossValidator::new(
            &study.base,
            SamplingOptions {
                replacement_ceiling: 12,
                ..SamplingOptions::default()
            },
            PenalizedSolver::default(),
        );
        cv.configure(4, true).unwrap();
        let params = PenaltyParams {
            l1: 1.0,
            l2: 1.0,
            l3: 1.0,
            delta: 0.3,
            adaptive: false,
        };
        let report = cv.crossvalidate(&params).unwrap();
        assert_eq!(report.outcomes.len(), 4);
        assert!(!report.partial);
        for accuracy in report.accuracies() {
            let accuracy = accuracy.unwrap();
            assert!((0.0..=1.0).contains(&accuracy));
        }
        let mean = report.mean_accuracy().unwrap();
        let manual: f64 = report.accuracies().iter().rev().map(|a| a.unwrap()).sum::<f64>() / 4.0;
        assert_abs_diff_eq!(mean, manual, epsilon = 1e-12);
        assert!(mean > 0.6, "signal should be detectable, got {mean}");
    }

    #[test]
    fn convergence_failures_are_recorded_per_fold() {
        let study = SyntheticStudyBuilder::new(3).build_prepared().unwrap();
        let solver = PenalizedSolver::new(SolverConfig {
            max_iterations: 1,
            tolerance: 1e-15,
            ..SolverConfig::default()
        });
        let mut cv = CrossValidator::new(&study.base, SamplingOptions::default(), solver);
        cv.configure(3, true).unwrap();
        let params = PenaltyParams {
            l1: 0.01,
            ..PenaltyParams::default()
        };
        let report = cv.crossvalidate(&params).unwrap();
        assert!(report
            .outcomes
            .iter()
            .all(|o| matches!(o, FoldOutcome::Failed { .. })));
        assert_eq!(report.mean_accuracy(), None);
        assert!(!report.partial);
    }

    #[test]
    fn cancelled_runs_are_partial() {
        let study = SyntheticStudyBuilder::new(3).build_prepared().unwrap();
        let mut cv = CrossValidator::new(
            &study.base,
            SamplingOptions::default(),
            PenalizedSolver::default(),
        );
        cv.configure(3, true).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = cv.crossvalidate_until(&PenaltyParams::default(), &cancel).unwrap();
        assert!(report.partial);
        assert_eq!(report.accuracies(), vec![None, None, None]);
    }

    #[test]
    fn expired_deadline_cancels() {
        let token = CancellationToken::with_deadline(Instant::now());
        assert!(token.is_cancelled());
        assert!(!CancellationToken::after(Duration::from_secs(3600)).is_cancelled());
    }
}
