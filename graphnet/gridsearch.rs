//! # Zoom grid search
//!
//! Each pass evaluates a grid over one or more penalty axes crossed with a
//! fixed set of `delta` values, scoring every point by cross-validation.
//! After the first pass each axis window is re-centred on the best value so
//! far and shrunk to the previous step, and the grid is rebuilt with the next
//! (smaller) step. Points already evaluated are served from a cache keyed on
//! the rounded parameter values, so the incumbent is never re-fitted.
//!
//! Selection prefers higher mean accuracy, then fewer mean non-zero
//! coefficients, then the point that appears first in grid order.

use crate::crossval::{CancellationToken, CrossValidatedTrainer, CrossValidationReport};
use crate::error::{GraphnetError, Result};
use crate::progress::{GridProgressObserver, GridProgressStage, NoopGridProgress};
use crate::solver::PenaltyParams;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Grid values are rounded to this many decimal places.
const GRID_PRECISION: f64 = 1e9;
const ACCURACY_TIE: f64 = 1e-12;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PenaltyAxis {
    L1,
    L2,
    L3,
}

impl PenaltyAxis {
    pub fn get(self, params: &PenaltyParams) -> f64 {
        match self {
            Self::L1 => params.l1,
            Self::L2 => params.l2,
            Self::L3 => params.l3,
        }
    }

    pub fn set(self, params: &mut PenaltyParams, value: f64) {
        match self {
            Self::L1 => params.l1 = value,
            Self::L2 => params.l2 = value,
            Self::L3 => params.l3 = value,
        }
    }
}

impl fmt::Display for PenaltyAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::L1 => "l1",
            Self::L2 => "l2",
            Self::L3 => "l3",
        })
    }
}

/// A penalty axis to zoom over. `stepsizes` gives one step per pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZoomAxis {
    pub axis: PenaltyAxis,
    pub initial_min: f64,
    pub initial_max: f64,
    pub stepsizes: Vec<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSearchConfig {
    pub name: String,
    pub initial_l1_min: f64,
    pub initial_l1_max: f64,
    pub l1_stepsizes: Vec<f64>,
    /// Crossed with every pass. Empty means "use the base delta".
    pub deltas: Vec<f64>,
    /// Additional axes zoomed jointly with l1.
    pub extra_axes: Vec<ZoomAxis>,
}

impl Default for GridSearchConfig {
    fn default() -> Self {
        Self {
            name: "graphnet_gridsearch".to_string(),
            initial_l1_min: 10.0,
            initial_l1_max: 60.0,
            l1_stepsizes: vec![5.0, 3.0, 1.0],
            deltas: vec![0.3, 0.5, 0.7],
            extra_axes: Vec::new(),
        }
    }
}

impl GridSearchConfig {
    pub fn axes(&self) -> Vec<ZoomAxis> {
        let mut axes = vec![ZoomAxis {
            axis: PenaltyAxis::L1,
            initial_min: self.initial_l1_min,
            initial_max: self.initial_l1_max,
            stepsizes: self.l1_stepsizes.clone(),
        }];
        axes.extend(self.extra_axes.iter().cloned());
        axes
    }

    pub fn num_passes(&self) -> usize {
        self.l1_stepsizes.len()
    }

    pub fn validate(&self) -> Result<()> {
        let axes = self.axes();
        let passes = self.num_passes();
        if passes == 0 {
            return Err(GraphnetError::InvalidConfig("l1_stepsizes must not be empty".to_string()));
        }
        for (i, axis) in axes.iter().enumerate() {
            if axes[..i].iter().any(|other| other.axis == axis.axis) {
                return Err(GraphnetError::InvalidConfig(format!(
                    "axis {} listed twice",
                    axis.axis
                )));
            }
            if !(axis.initial_min.is_finite() && axis.initial_max.is_finite())
                || axis.initial_min < 0.0
                || axis.initial_min > axis.initial_max
            {
                return Err(GraphnetError::InvalidConfig(format!(
                    "{} range [{}, {}] must be finite, non-negative and ordered",
                    axis.axis, axis.initial_min, axis.initial_max
                )));
            }
            if axis.stepsizes.len() != passes {
                return Err(GraphnetError::InvalidConfig(format!(
                    "{} has {} step sizes but l1 has {passes}",
                    axis.axis,
                    axis.stepsizes.len()
                )));
            }
            if axis.stepsizes.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
                return Err(GraphnetError::InvalidConfig(format!(
                    "{} step sizes must be positive",
                    axis.axis
                )));
            }
            if axis.stepsizes.windows(2).any(|w| w[1] >= w[0]) {
                return Err(GraphnetError::InvalidConfig(format!(
                    "{} step sizes must strictly decrease, got {:?}",
                    axis.axis, axis.stepsizes
                )));
            }
        }
        if self.deltas.iter().any(|d| !(d.is_finite() && *d > 0.0)) {
            return Err(GraphnetError::InvalidConfig(format!(
                "deltas must be positive, got {:?}",
                self.deltas
            )));
        }
        Ok(())
    }
}

/// The interval searched on one axis during one pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AxisWindow {
    pub axis: PenaltyAxis,
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl AxisWindow {
    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    /// `min, min + step, ...` up to `max`.
    fn ladder(&self) -> Vec<f64> {
        let n = ((self.max - self.min) / self.step + 1e-9).floor() as i64;
        (0..=n.max(0))
            .map(|k| round_to_grid(self.min + k as f64 * self.step))
            .collect()
    }

    /// `center + k * step` for every integer `k` that stays inside the window.
    fn ladder_around(&self, center: f64) -> Vec<f64> {
        let below = ((center - self.min) / self.step + 1e-9).floor().max(0.0) as i64;
        let above = ((self.max - center) / self.step + 1e-9).floor().max(0.0) as i64;
        (-below..=above)
            .map(|k| round_to_grid(center + k as f64 * self.step))
            .collect()
    }
}

fn round_to_grid(value: f64) -> f64 {
    (value * GRID_PRECISION).round() / GRID_PRECISION
}

fn grid_key(params: &PenaltyParams) -> [i64; 4] {
    [params.l1, params.l2, params.l3, params.delta].map(|v| (v * GRID_PRECISION).round() as i64)
}

/// One evaluated penalty setting.
#[derive(Clone, Debug, PartialEq)]
pub struct GridPoint {
    pub params: PenaltyParams,
    /// Pass in which the point was first evaluated.
    pub pass: usize,
    pub accuracy: Option<f64>,
    pub mean_nonzero: Option<f64>,
    pub fold_accuracies: Vec<Option<f64>>,
    pub partial: bool,
}

impl GridPoint {
    fn from_report(params: PenaltyParams, pass: usize, report: &CrossValidationReport) -> Self {
        Self {
            params,
            pass,
            accuracy: report.mean_accuracy(),
            mean_nonzero: report.mean_nonzero(),
            fold_accuracies: report.accuracies(),
            partial: report.partial,
        }
    }

    /// True when `self` should replace `incumbent` as the best point. Points
    /// scored on every fold outrank partial ones regardless of accuracy. Callers
    /// present candidates in grid order, so a full tie keeps the incumbent.
    pub fn beats(&self, incumbent: &GridPoint) -> bool {
        let Some(accuracy) = self.accuracy else {
            return false;
        };
        let Some(best) = incumbent.accuracy else {
            return true;
        };
        if self.partial != incumbent.partial {
            return incumbent.partial;
        }
        if (accuracy - best).abs() > ACCURACY_TIE {
            return accuracy > best;
        }
        let ours = self.mean_nonzero.unwrap_or(f64::INFINITY);
        let theirs = incumbent.mean_nonzero.unwrap_or(f64::INFINITY);
        ours < theirs
    }
}

fn select_best<'p>(points: impl IntoIterator<Item = &'p GridPoint>) -> Option<&'p GridPoint> {
    points
        .into_iter()
        .filter(|p| p.accuracy.is_some())
        .fold(None, |best, candidate| match best {
            Some(incumbent) if !candidate.beats(incumbent) => Some(incumbent),
            _ => Some(candidate),
        })
}

#[derive(Clone, Debug, PartialEq)]
pub struct PassSummary {
    pub pass: usize,
    pub windows: Vec<AxisWindow>,
    pub points: usize,
    /// Points actually fitted in this pass, excluding cache hits and skips.
    pub evaluated: usize,
    pub best: Option<GridPoint>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GridSearchReport {
    pub name: String,
    pub passes: Vec<PassSummary>,
    /// Every fitted point in evaluation order.
    pub evaluations: Vec<GridPoint>,
    pub best: Option<GridPoint>,
    /// Cancellation cut the search short.
    pub partial: bool,
}

impl GridSearchReport {
    /// Writes one tab-separated row per evaluated point.
    pub fn write_tsv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
        writer.write_record([
            "name",
            "pass",
            "l1",
            "l2",
            "l3",
            "delta",
            "adaptive",
            "mean_accuracy",
            "mean_nonzero",
            "fold_accuracies",
            "partial",
            "best",
        ])?;
        let best_key = self.best.as_ref().map(|b| grid_key(&b.params));
        for point in &self.evaluations {
            let folds: Vec<String> = point
                .fold_accuracies
                .iter()
                .map(|a| a.map_or_else(|| "NA".to_string(), |a| a.to_string()))
                .collect();
            writer.write_record([
                self.name.clone(),
                (point.pass + 1).to_string(),
                point.params.l1.to_string(),
                point.params.l2.to_string(),
                point.params.l3.to_string(),
                point.params.delta.to_string(),
                point.params.adaptive.to_string(),
                optional(point.accuracy),
                optional(point.mean_nonzero),
                folds.join(";"),
                point.partial.to_string(),
                (Some(grid_key(&point.params)) == best_key).to_string(),
            ])?;
        }
        writer.flush()?;
        log::info!("Wrote {} grid points to {}", self.evaluations.len(), path.display());
        Ok(())
    }
}

fn optional(value: Option<f64>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| v.to_string())
}

/// Windows, incumbent and cache carried from one pass to the next.
struct GridState {
    windows: Vec<AxisWindow>,
    best: Option<GridPoint>,
    cache: HashMap<[i64; 4], GridPoint>,
}

impl GridState {
    fn new(axes: &[ZoomAxis]) -> Self {
        Self {
            windows: axes
                .iter()
                .map(|a| AxisWindow {
                    axis: a.axis,
                    min: a.initial_min,
                    max: a.initial_max,
                    step: a.stepsizes[0],
                })
                .collect(),
            best: None,
            cache: HashMap::new(),
        }
    }

    /// Re-centres every window on the incumbent with half-width `previous step`,
    /// clipped to the previous window. When that half-width would span the whole
    /// previous window it drops to a quarter of it, so widths strictly shrink.
    fn zoom(&mut self, axes: &[ZoomAxis], pass: usize, best: &PenaltyParams) {
        for (window, axis) in self.windows.iter_mut().zip(axes) {
            let previous = window.width();
            let mut reach = axis.stepsizes[pass - 1];
            if 2.0 * reach >= previous {
                reach = previous / 4.0;
            }
            let center = axis.axis.get(best).clamp(window.min, window.max);
            window.min = round_to_grid((center - reach).max(window.min).max(0.0));
            window.max = round_to_grid((center + reach).min(window.max));
            window.step = axis.stepsizes[pass];
        }
    }

    fn candidates(
        &self,
        base: &PenaltyParams,
        deltas: &[f64],
        centered: bool,
    ) -> Vec<PenaltyParams> {
        let ladders: Vec<Vec<f64>> = self
            .windows
            .iter()
            .map(|w| match (&self.best, centered) {
                (Some(best), true) => w.ladder_around(w.axis.get(&best.params)),
                _ => w.ladder(),
            })
            .collect();

        let mut points = vec![*base];
        for (window, values) in self.windows.iter().zip(&ladders) {
            points = points
                .iter()
                .flat_map(|p| {
                    values.iter().map(move |&v| {
                        let mut next = *p;
                        window.axis.set(&mut next, v);
                        next
                    })
                })
                .collect();
        }
        points
            .iter()
            .flat_map(|p| deltas.iter().map(move |&delta| PenaltyParams { delta, ..*p }))
            .collect()
    }
}

pub struct GridSearcher {
    pub config: GridSearchConfig,
    /// Values for everything the grid does not vary.
    pub base: PenaltyParams,
}

impl GridSearcher {
    pub fn new(config: GridSearchConfig, base: PenaltyParams) -> Self {
        Self { config, base }
    }

    pub fn zoom_gridsearch(
        &self,
        trainer: &dyn CrossValidatedTrainer,
        name: &str,
        adaptive: bool,
    ) -> Result<GridSearchReport> {
        self.zoom_gridsearch_with(
            trainer,
            name,
            adaptive,
            &CancellationToken::new(),
            &NoopGridProgress,
        )
    }

    pub fn zoom_gridsearch_with(
        &self,
        trainer: &dyn CrossValidatedTrainer,
        name: &str,
        adaptive: bool,
        cancel: &CancellationToken,
        observer: &dyn GridProgressObserver,
    ) -> Result<GridSearchReport> {
        self.config.validate()?;
        let axes = self.config.axes();
        let base = PenaltyParams {
            adaptive,
            ..self.base
        };
        let deltas = if self.config.deltas.is_empty() {
            vec![base.delta]
        } else {
            self.config.deltas.clone()
        };

        let mut state = GridState::new(&axes);
        let mut passes = Vec::new();
        let mut evaluations = Vec::new();
        let mut partial = false;

        for pass in 0..self.config.num_passes() {
            if pass > 0 {
                let Some(best) = state.best.clone() else {
                    log::warn!("No grid point evaluated successfully; stopping after pass {pass}");
                    break;
                };
                state.zoom(&axes, pass, &best.params);
            }
            if cancel.is_cancelled() {
                partial = true;
                break;
            }

            let candidates = state.candidates(&base, &deltas, pass > 0);
            let stage = GridProgressStage::for_pass(pass);
            log::info!(
                "Grid pass {} ({stage}): {} points over {:?}",
                pass + 1,
                candidates.len(),
                state.windows
            );
            observer.on_pass_start(pass, stage, candidates.len());

            let fresh: Vec<Option<GridPoint>> = candidates
                .par_iter()
                .map(|params| {
                    if let Some(cached) = state.cache.get(&grid_key(params)) {
                        observer.on_point_finished(pass, cached);
                        return Ok(None);
                    }
                    if cancel.is_cancelled() {
                        return Ok(None);
                    }
                    let report = trainer.evaluate(params, cancel).map_err(|e| {
                        let e = e.at_grid_point(params);
                        log::error!("Aborting grid search: {e}");
                        e
                    })?;
                    let point = GridPoint::from_report(*params, pass, &report);
                    observer.on_point_finished(pass, &point);
                    Ok(Some(point))
                })
                .collect::<Result<_>>()?;

            let mut pass_points = Vec::with_capacity(candidates.len());
            let mut evaluated = 0;
            for (params, point) in candidates.iter().zip(fresh) {
                let key = grid_key(params);
                match point {
                    Some(point) => {
                        evaluated += 1;
                        partial |= point.partial;
                        evaluations.push(point.clone());
                        state.cache.insert(key, point.clone());
                        pass_points.push(point);
                    }
                    None => match state.cache.get(&key) {
                        Some(cached) => pass_points.push(cached.clone()),
                        None => partial = true,
                    },
                }
            }

            let pass_best = select_best(&pass_points).cloned();
            observer.on_pass_finish(pass, pass_best.as_ref());
            if let Some(point) = &pass_best {
                log::info!(
                    "Pass {} best: l1={} l2={} l3={} delta={} accuracy={:?} nonzero={:?}",
                    pass + 1,
                    point.params.l1,
                    point.params.l2,
                    point.params.l3,
                    point.params.delta,
                    point.accuracy,
                    point.mean_nonzero
                );
                let improves = match &state.best {
                    Some(incumbent) => point.beats(incumbent),
                    None => true,
                };
                if improves {
                    state.best = Some(point.clone());
                }
            }
            passes.push(PassSummary {
                pass,
                windows: state.windows.clone(),
                points: candidates.len(),
                evaluated,
                best: pass_best,
            });
        }

        Ok(GridSearchReport {
            name: name.to_string(),
            passes,
            evaluations,
            best: state.best,
            partial,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crossval::FoldOutcome;
    use std::sync::Mutex;

    /// Accuracy peaks at `l1 = peak` and decays linearly; mean non-zero count
    /// shrinks as l1 grows.
    struct Surface {
        peak: f64,
        calls: Mutex<Vec<PenaltyParams>>,
        fail_above: Option<f64>,
    }

    impl Surface {
        fn peaked_at(peak: f64) -> Self {
            Self {
                peak,
                calls: Mutex::new(Vec::new()),
                fail_above: None,
            }
        }

        fn calls(&self) -> Vec<PenaltyParams> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CrossValidatedTrainer for Surface {
        fn evaluate(
            &self,
            params: &PenaltyParams,
            cancel: &CancellationToken,
        ) -> Result<CrossValidationReport> {
            let _ = cancel;
            self.calls.lock().unwrap().push(*params);
            let outcome = if self.fail_above.is_some_and(|limit| params.l1 > limit) {
                FoldOutcome::Failed {
                    reason: "did not converge".to_string(),
                }
            } else {
                FoldOutcome::Evaluated {
                    accuracy: (1.0 - (params.l1 - self.peak).abs() / 100.0 - params.delta / 100.0)
                        .max(0.0),
                    nonzero: (1000.0 / (1.0 + params.l1)) as usize,
                }
            };
            Ok(CrossValidationReport::from_outcomes(vec![outcome.clone(), outcome]))
        }
    }

    fn searcher() -> GridSearcher {
        GridSearcher::new(GridSearchConfig::default(), PenaltyParams::default())
    }

    #[test]
    fn first_pass_covers_the_initial_range() {
        let surface = Surface::peaked_at(33.0);
        let report = searcher().zoom_gridsearch(&surface, "coarse", true).unwrap();
        let first = &report.passes[0];
        assert_eq!(first.points, 11 * 3);
        let l1s: Vec<f64> = report
            .evaluations
            .iter()
            .filter(|p| p.pass == 0 && p.params.delta == 0.3)
            .map(|p| p.params.l1)
            .collect();
        assert_eq!(l1s, vec![10.0, 15.0, 20.0, 25.0, 30.0, 35.0, 40.0, 45.0, 50.0, 55.0, 60.0]);
        assert!(report.evaluations.iter().all(|p| p.params.adaptive));
    }

    #[test]
    fn zooming_narrows_and_never_regresses() {
        let surface = Surface::peaked_at(33.0);
        let report = searcher().zoom_gridsearch(&surface, "zoom", false).unwrap();
        assert_eq!(report.passes.len(), 3);

        let widths: Vec<f64> = report.passes.iter().map(|p| p.windows[0].width()).collect();
        assert!(widths.windows(2).all(|w| w[1] < w[0]), "widths {widths:?}");

        let accuracies: Vec<f64> = report
            .passes
            .iter()
            .map(|p| p.best.as_ref().and_then(|b| b.accuracy).unwrap())
            .collect();
        assert!(accuracies.windows(2).all(|w| w[1] >= w[0] - 1e-12));

        let best = report.best.unwrap();
        assert_eq!(best.params.l1, 33.0);
        assert_eq!(best.params.delta, 0.3);
        assert!(!report.partial);
    }

    #[test]
    fn cached_points_are_not_refitted() {
        let surface = Surface::peaked_at(33.0);
        let report = searcher().zoom_gridsearch(&surface, "cache", false).unwrap();
        let calls = surface.calls();
        let mut keys: Vec<[i64; 4]> = calls.iter().map(grid_key).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), calls.len());
        assert_eq!(calls.len(), report.evaluations.len());
        assert!(report.passes[1].evaluated < report.passes[1].points);
    }

    #[test]
    fn accuracy_ties_prefer_sparser_then_earlier_points() {
        let point = |l1: f64, accuracy: f64, nonzero: f64| GridPoint {
            params: PenaltyParams {
                l1,
                ..PenaltyParams::default()
            },
            pass: 0,
            accuracy: Some(accuracy),
            mean_nonzero: Some(nonzero),
            fold_accuracies: vec![Some(accuracy)],
            partial: false,
        };
        let points = [
            point(10.0, 0.8, 50.0),
            point(20.0, 0.9, 40.0),
            point(30.0, 0.9, 20.0),
            point(40.0, 0.9, 20.0),
        ];
        assert_eq!(select_best(&points).unwrap().params.l1, 30.0);
        let failed = GridPoint {
            accuracy: None,
            ..point(50.0, 0.0, 0.0)
        };
        assert!(!failed.beats(&points[0]));
        assert!(points[0].beats(&failed));
    }

    #[test]
    fn failed_points_are_excluded_from_selection() {
        let surface = Surface {
            fail_above: Some(25.0),
            ..Surface::peaked_at(40.0)
        };
        let report = searcher().zoom_gridsearch(&surface, "failures", false).unwrap();
        let best = report.best.unwrap();
        assert!(best.params.l1 <= 25.0);
        assert!(report
            .evaluations
            .iter()
            .any(|p| p.accuracy.is_none() && p.params.l1 > 25.0));
    }

    #[test]
    fn extra_axes_are_zoomed_jointly() {
        let config = GridSearchConfig {
            initial_l1_min: 10.0,
            initial_l1_max: 20.0,
            l1_stepsizes: vec![5.0, 2.0],
            deltas: vec![],
            extra_axes: vec![ZoomAxis {
                axis: PenaltyAxis::L3,
                initial_min: 0.0,
                initial_max: 10.0,
                stepsizes: vec![10.0, 4.0],
            }],
            ..GridSearchConfig::default()
        };
        let surface = Surface::peaked_at(14.0);
        let report = GridSearcher::new(config, PenaltyParams::default())
            .zoom_gridsearch(&surface, "joint", false)
            .unwrap();
        assert_eq!(report.passes[0].points, 3 * 2);
        assert_eq!(report.passes[1].windows.len(), 2);
        assert_eq!(report.passes[1].windows[1].axis, PenaltyAxis::L3);
        assert!(report.passes[1].windows[1].min >= 0.0);
        for axis in 0..2 {
            let first = report.passes[0].windows[axis];
            let second = report.passes[1].windows[axis];
            assert!(second.width() < first.width(), "{first:?} -> {second:?}");
            assert!(second.min >= first.min && second.max <= first.max);
        }
        assert_eq!(report.best.unwrap().params.delta, PenaltyParams::default().delta);
    }

    #[test]
    fn zoom_windows_stay_inside_a_narrow_initial_range() {
        let config = GridSearchConfig {
            initial_l1_min: 10.0,
            initial_l1_max: 15.0,
            l1_stepsizes: vec![5.0, 3.0, 1.0],
            deltas: vec![0.5],
            ..GridSearchConfig::default()
        };
        // Accuracy falls with l1, so the incumbent sits on the lower edge.
        let surface = Surface::peaked_at(0.0);
        let report = GridSearcher::new(config, PenaltyParams::default())
            .zoom_gridsearch(&surface, "narrow", false)
            .unwrap();
        assert_eq!(report.passes.len(), 3);

        let windows: Vec<AxisWindow> = report.passes.iter().map(|p| p.windows[0]).collect();
        for pair in windows.windows(2) {
            assert!(pair[1].width() < pair[0].width(), "{windows:?}");
            assert!(pair[1].min >= pair[0].min && pair[1].max <= pair[0].max, "{windows:?}");
        }
        assert!(surface.calls().iter().all(|p| (10.0..=15.0).contains(&p.l1)));
        assert_eq!(report.best.unwrap().params.l1, 10.0);
    }

    #[test]
    fn invalid_step_sequences_are_rejected() {
        let increasing = GridSearchConfig {
            l1_stepsizes: vec![1.0, 3.0],
            ..GridSearchConfig::default()
        };
        assert!(increasing.validate().is_err());
        let mismatched = GridSearchConfig {
            extra_axes: vec![ZoomAxis {
                axis: PenaltyAxis::L2,
                initial_min: 0.0,
                initial_max: 1.0,
                stepsizes: vec![0.5],
            }],
            ..GridSearchConfig::default()
        };
        assert!(mismatched.validate().is_err());
        let inverted = GridSearchConfig {
            initial_l1_min: 60.0,
            initial_l1_max: 10.0,
            ..GridSearchConfig::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn cancellation_returns_a_partial_report() {
        let surface = Surface::peaked_at(33.0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = searcher()
            .zoom_gridsearch_with(&surface, "cancelled", false, &cancel, &NoopGridProgress)
            .unwrap();
        assert!(report.partial);
        assert!(report.evaluations.is_empty());
        assert!(report.best.is_none());
        assert!(surface.calls().is_empty());
    }

    struct MissingTrials;

    impl CrossValidatedTrainer for MissingTrials {
        fn evaluate(
            &self,
            params: &PenaltyParams,
            cancel: &CancellationToken,
        ) -> Result<CrossValidationReport> {
            if params.l1 > 50.0 {
                return Err(GraphnetError::insufficient("no positive training trials").in_fold(1));
            }
            Surface::peaked_at(30.0).evaluate(params, cancel)
        }
    }

    #[test]
    fn fatal_errors_name_the_grid_point_and_fold() {
        let err = searcher()
            .zoom_gridsearch(&MissingTrials, "fatal", false)
            .unwrap_err();
        assert_eq!(err.fold(), Some(1));
        match &err {
            GraphnetError::AtGridPoint { l1, l2, l3, delta, .. } => {
                assert!(*l1 > 50.0);
                assert_eq!((*l2, *l3), (100.0, 100.0));
                assert!([0.3, 0.5, 0.7].contains(delta));
            }
            other => panic!("expected grid point context, got {other:?}"),
        }
        assert!(err.to_string().contains("in fold 1"), "{err}");
    }

    /// Cancels the search once a given pass has been summarised.
    struct CancelAfterPass {
        pass: usize,
        token: CancellationToken,
    }

    impl GridProgressObserver for CancelAfterPass {
        fn on_pass_finish(&self, pass: usize, best: Option<&GridPoint>) {
            let _ = best;
            if pass == self.pass {
                self.token.cancel();
            }
        }
    }

    #[test]
    fn cancelling_between_passes_keeps_completed_work() {
        let surface = Surface::peaked_at(33.0);
        let cancel = CancellationToken::new();
        let observer = CancelAfterPass {
            pass: 0,
            token: cancel.clone(),
        };
        let report = searcher()
            .zoom_gridsearch_with(&surface, "interrupted", false, &cancel, &observer)
            .unwrap();

        assert!(report.partial);
        assert_eq!(report.passes.len(), 1);
        assert_eq!(report.evaluations.len(), 11 * 3);
        assert!(report.evaluations.iter().all(|p| p.pass == 0 && !p.partial));
        let best = report.best.unwrap();
        assert_eq!(best.params.l1, 35.0);
        assert_eq!(Some(&best), report.passes[0].best.as_ref());
        assert_eq!(surface.calls().len(), 11 * 3);
    }

    #[test]
    fn partially_scored_points_rank_below_complete_ones() {
        let point = |l1: f64, accuracy: f64, partial: bool| GridPoint {
            params: PenaltyParams {
                l1,
                ..PenaltyParams::default()
            },
            pass: 0,
            accuracy: Some(accuracy),
            mean_nonzero: Some(10.0),
            fold_accuracies: vec![Some(accuracy)],
            partial,
        };
        let lucky = point(10.0, 1.0, true);
        let complete = point(20.0, 0.7, false);
        assert!(complete.beats(&lucky));
        assert!(!lucky.beats(&complete));
        assert_eq!(select_best(&[lucky.clone(), complete]).unwrap().params.l1, 20.0);

        let weaker_partial = point(30.0, 0.5, true);
        assert_eq!(select_best(&[weaker_partial, lucky]).unwrap().params.l1, 10.0);
    }

    #[test]
    fn tsv_has_one_row_per_evaluation() {
        let surface = Surface::peaked_at(20.0);
        let config = GridSearchConfig {
            l1_stepsizes: vec![25.0],
            deltas: vec![0.5],
            ..GridSearchConfig::default()
        };
        let report = GridSearcher::new(config, PenaltyParams::default())
            .zoom_gridsearch(&surface, "tsv", false)
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.tsv");
        report.write_tsv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1 + report.evaluations.len());
        assert!(lines[0].starts_with("name\tpass\tl1"));
        assert_eq!(lines.iter().filter(|l| l.ends_with("\ttrue")).count(), 1);
    }
}
