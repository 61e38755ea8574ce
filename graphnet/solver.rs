//! # GraphNet classifier fitting
//!
//! Minimizes, over weights `β` and an unpenalized intercept `b`,
//!
//! ```text
//!   Σ_i h_δ(t_i (x_i·β + b))
//!     + l1 Σ_j w_j |β_j|
//!     + (l2 / 2) ‖β‖²
//!     + (l3 / 2) Σ_(i,k)∈E a_ik ((x_i − x_k)·β)²
//! ```
//!
//! where `t_i ∈ {+1, −1}`, `h_δ` is the hinge loss with its kink replaced by a
//! quadratic of width `δ`, and `E` is the trial-adjacency graph of the
//! [`TrialMask`]. The smooth part has a `1/δ`-scaled Lipschitz gradient, so the
//! problem is solved with accelerated proximal gradient steps (soft
//! thresholding for the `l1` term) and gradient-based momentum restarts.
//!
//! With `adaptive` set, an outer loop re-solves with weights
//! `w_j = max|β| / max(|β_j|, floor · max|β|)` until the support stops
//! changing, approximating a non-convex sparsity penalty by convex reweighting.

use crate::error::{GraphnetError, Result};
use crate::sampler::TrialMask;
use crate::types::{Coefficients, Margins};
use ndarray::{Array1, ArrayView1, ArrayView2, Zip, s};
use serde::{Deserialize, Serialize};

const POWER_ITERATIONS: usize = 100;
const LIPSCHITZ_SAFETY: f64 = 1.1;

/// Penalty strengths for a single fit.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyParams {
    /// Sparsity.
    pub l1: f64,
    /// Ridge.
    pub l2: f64,
    /// Trial-graph smoothness.
    pub l3: f64,
    /// Width of the quadratic region replacing the hinge kink.
    pub delta: f64,
    pub adaptive: bool,
}

impl Default for PenaltyParams {
    fn default() -> Self {
        Self {
            l1: 43.0,
            l2: 100.0,
            l3: 100.0,
            delta: 0.3,
            adaptive: false,
        }
    }
}

impl PenaltyParams {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("l1", self.l1), ("l2", self.l2), ("l3", self.l3)] {
            if !value.is_finite() || value < 0.0 {
                return Err(GraphnetError::InvalidConfig(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        if !self.delta.is_finite() || self.delta <= 0.0 {
            return Err(GraphnetError::InvalidConfig(format!(
                "delta must be positive, got {}",
                self.delta
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Proximal-gradient iterations allowed per convex solve.
    pub max_iterations: usize,
    /// Stop once the relative change in the iterate falls below this.
    pub tolerance: f64,
    /// Reweighting rounds after the first solve when `adaptive` is set.
    pub adaptive_max_iterations: usize,
    /// Relative floor on |β_j| when forming adaptive weights.
    pub weight_floor: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20_000,
            tolerance: 1e-6,
            adaptive_max_iterations: 5,
            weight_floor: 1e-3,
        }
    }
}

/// Solutions along a sequence of `l1` values. Entry 0 is the primary fit.
#[derive(Clone, Debug)]
pub struct GraphnetFit {
    pub coefficients: Vec<Coefficients>,
    pub l1_path: Vec<f64>,
    /// Proximal-gradient iterations spent on each path point, all rounds included.
    pub iterations: Vec<usize>,
    /// Adaptive reweighting rounds run for each path point.
    pub reweighting_rounds: Vec<usize>,
    /// Label codes for positive and negative margins.
    pub codes: [f64; 2],
}

impl GraphnetFit {
    pub fn primary(&self) -> &Coefficients {
        &self.coefficients[0]
    }

    pub fn margins(&self, x: ArrayView2<f64>) -> Margins {
        let coefs = self.primary();
        Margins::new(x.dot(&coefs.as_view()) + coefs.intercept())
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Array1<f64> {
        self.margins(x)
            .mapv(|m| if m >= 0.0 { self.codes[0] } else { self.codes[1] })
    }

    /// Fraction of rows whose predicted code equals `y`.
    pub fn accuracy(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> f64 {
        if y.is_empty() {
            return f64::NAN;
        }
        let predicted = self.predict(x);
        let correct = Zip::from(&predicted)
            .and(&y)
            .fold(0usize, |acc, p, t| acc + usize::from(p == t));
        correct as f64 / y.len() as f64
    }
}

#[derive(Clone, Debug, Default)]
pub struct PenalizedSolver {
    pub config: SolverConfig,
}

impl PenalizedSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    pub fn train(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        trial_mask: &TrialMask,
        params: &PenaltyParams,
    ) -> Result<GraphnetFit> {
        self.train_path(x, y, trial_mask, &[params.l1], params)
    }

    /// Fits each `l1` in turn, warm-starting from the previous solution. The
    /// `l1` field of `params` is ignored.
    ///
    /// When `l1` does not decrease from one path point to the next, columns
    /// outside the previous support stay at zero, so supports are nested along
    /// increasing stretches of the path. Separate [`train`](Self::train) calls
    /// carry no such guarantee.
    pub fn train_path(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        trial_mask: &TrialMask,
        l1_values: &[f64],
        params: &PenaltyParams,
    ) -> Result<GraphnetFit> {
        params.validate()?;
        if l1_values.is_empty() {
            return Err(GraphnetError::InvalidConfig("empty l1 path".to_string()));
        }
        for &l1 in l1_values {
            PenaltyParams { l1, ..*params }.validate()?;
        }
        if x.nrows() != y.len() {
            return Err(GraphnetError::alignment(
                None,
                format!("X has {} rows but Y has {} labels", x.nrows(), y.len()),
            ));
        }
        if trial_mask.len() != x.nrows() {
            return Err(GraphnetError::alignment(
                None,
                format!(
                    "trial mask covers {} rows but X has {}; rebuild it after resampling",
                    trial_mask.len(),
                    x.nrows()
                ),
            ));
        }

        let (targets, codes) = binary_targets(y)?;
        let problem = Problem::new(x, targets, trial_mask, params);
        log::info!(
            "Training graphnet on {} x {} (l2={}, l3={}, delta={}, adaptive={}, {} path points)",
            x.nrows(),
            x.ncols(),
            params.l2,
            params.l3,
            params.delta,
            params.adaptive,
            l1_values.len()
        );

        let mut fit = GraphnetFit {
            coefficients: Vec::with_capacity(l1_values.len()),
            l1_path: l1_values.to_vec(),
            iterations: Vec::with_capacity(l1_values.len()),
            reweighting_rounds: Vec::with_capacity(l1_values.len()),
            codes,
        };
        let mut warm = Coefficients::zeros(x.ncols());
        let mut screen: Option<(f64, Vec<bool>)> = None;
        for &l1 in l1_values {
            let active = match &screen {
                Some((previous, support)) if l1 >= *previous => Some(support.as_slice()),
                _ => None,
            };
            let (coefs, iterations, rounds) = self.fit_point(&problem, l1, params, warm, active)?;
            log::debug!(
                "l1={l1}: {} non-zero coefficients after {iterations} iterations, \
                 {rounds} reweighting rounds",
                coefs.count_nonzero()
            );
            screen = Some((l1, coefs.support()));
            warm = coefs.clone();
            fit.coefficients.push(coefs);
            fit.iterations.push(iterations);
            fit.reweighting_rounds.push(rounds);
        }
        Ok(fit)
    }

    fn fit_point(
        &self,
        problem: &Problem,
        l1: f64,
        params: &PenaltyParams,
        warm: Coefficients,
        active: Option<&[bool]>,
    ) -> Result<(Coefficients, usize, usize)> {
        let p = problem.x.ncols();
        let mut weights = Array1::ones(p);
        let (mut coefs, mut iterations) = self.solve(problem, l1, &weights, warm, active)?;
        let mut rounds = 0;
        if !params.adaptive {
            return Ok((coefs, iterations, rounds));
        }

        let mut support = coefs.support();
        for round in 1..=self.config.adaptive_max_iterations {
            let scale = coefs.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
            if scale <= crate::types::NONZERO_TOLERANCE {
                break;
            }
            let floor = self.config.weight_floor * scale;
            weights = coefs.mapv(|v| scale / v.abs().max(floor));

            let (next, spent) = self.solve(problem, l1, &weights, coefs, active)?;
            iterations += spent;
            rounds = round;
            let next_support = next.support();
            coefs = next;
            if next_support == support {
                break;
            }
            support = next_support;
        }
        Ok((coefs, iterations, rounds))
    }

    /// Accelerated proximal gradient with gradient-based restarts. Columns
    /// marked inactive are held at zero.
    fn solve(
        &self,
        problem: &Problem,
        l1: f64,
        weights: &Array1<f64>,
        start: Coefficients,
        active: Option<&[bool]>,
    ) -> Result<(Coefficients, usize)> {
        let step = 1.0 / problem.lipschitz;
        let mut thresholds = weights.mapv(|w| step * l1 * w);
        let mut b = start.intercept();
        let mut beta = start.into_inner();
        if let Some(active) = active {
            for ((thr, value), &keep) in thresholds.iter_mut().zip(beta.iter_mut()).zip(active) {
                if !keep {
                    *thr = f64::INFINITY;
                    *value = 0.0;
                }
            }
        }
        let mut y_beta = beta.clone();
        let mut y_b = b;
        let mut t = 1.0_f64;
        let mut last_change = f64::INFINITY;

        for iter in 1..=self.config.max_iterations {
            let (grad, grad_b) = problem.gradient(y_beta.view(), y_b);

            let mut next = &y_beta - &(step * &grad);
            Zip::from(&mut next)
                .and(&thresholds)
                .for_each(|v, &thr| *v = soft_threshold(*v, thr));
            let next_b = y_b - step * grad_b;

            let diff = &next - &beta;
            let scale = next
                .iter()
                .fold(next_b.abs().max(1.0), |acc, v| acc.max(v.abs()));
            let max_diff = diff
                .iter()
                .fold((next_b - b).abs(), |acc, v| acc.max(v.abs()));
            last_change = max_diff / scale;

            let restart = (&y_beta - &next).dot(&diff) + (y_b - next_b) * (next_b - b) > 0.0;
            if restart {
                t = 1.0;
                y_beta = next.clone();
                y_b = next_b;
            } else {
                let t_next = 0.5 * (1.0 + (1.0 + 4.0 * t * t).sqrt());
                let momentum = (t - 1.0) / t_next;
                y_beta = &next + &(momentum * &diff);
                y_b = next_b + momentum * (next_b - b);
                t = t_next;
            }
            beta = next;
            b = next_b;

            if !last_change.is_finite() {
                break;
            }
            if last_change < self.config.tolerance {
                return Ok((Coefficients::new(beta, b), iter));
            }
        }

        Err(GraphnetError::Convergence {
            max_iterations: self.config.max_iterations,
            last_change,
            l1,
            delta: problem.delta,
        })
    }
}

/// Fixed data of one training problem.
struct Problem<'a> {
    x: ArrayView2<'a, f64>,
    targets: Array1<f64>,
    edges: Vec<(usize, usize, f64)>,
    l2: f64,
    l3: f64,
    delta: f64,
    lipschitz: f64,
}

impl<'a> Problem<'a> {
    fn new(
        x: ArrayView2<'a, f64>,
        targets: Array1<f64>,
        trial_mask: &TrialMask,
        params: &PenaltyParams,
    ) -> Self {
        let edges = if params.l3 > 0.0 {
            trial_mask.edges()
        } else {
            Vec::new()
        };
        let mut degree = vec![0.0_f64; x.nrows()];
        for &(i, k, w) in &edges {
            degree[i] += w;
            degree[k] += w;
        }
        let laplacian_bound = 2.0 * degree.iter().fold(0.0_f64, |acc, &d| acc.max(d));
        let sigma2 = spectral_bound(x);
        let lipschitz = (sigma2 * (1.0 / params.delta + params.l3 * laplacian_bound) + params.l2)
            .max(f64::MIN_POSITIVE);
        Self {
            x,
            targets,
            edges,
            l2: params.l2,
            l3: params.l3,
            delta: params.delta,
            lipschitz,
        }
    }

    /// Gradient of the smooth part with respect to `β` and `b`.
    fn gradient(&self, beta: ArrayView1<f64>, b: f64) -> (Array1<f64>, f64) {
        let fitted = self.x.dot(&beta);
        let mut residual = Array1::zeros(fitted.len());
        Zip::from(&mut residual)
            .and(&fitted)
            .and(&self.targets)
            .for_each(|r, &f, &t| *r = t * smoothed_hinge_slope(t * (f + b), self.delta));
        let grad_b = residual.sum();

        if self.l3 > 0.0 {
            for &(i, k, w) in &self.edges {
                let d = self.l3 * w * (fitted[i] - fitted[k]);
                residual[i] += d;
                residual[k] -= d;
            }
        }

        let mut grad = self.x.t().dot(&residual);
        if self.l2 > 0.0 {
            grad.scaled_add(self.l2, &beta);
        }
        (grad, grad_b)
    }
}

/// Derivative of the smoothed hinge at margin `m`.
fn smoothed_hinge_slope(m: f64, delta: f64) -> f64 {
    if m >= 1.0 {
        0.0
    } else if m > 1.0 - delta {
        -(1.0 - m) / delta
    } else {
        -1.0
    }
}

fn soft_threshold(value: f64, threshold: f64) -> f64 {
    if value > threshold {
        value - threshold
    } else if value < -threshold {
        value + threshold
    } else {
        0.0
    }
}

/// Upper estimate of the largest eigenvalue of `[X 1]ᵀ[X 1]`.
fn spectral_bound(x: ArrayView2<f64>) -> f64 {
    let p = x.ncols();
    let frobenius = x.iter().map(|v| v * v).sum::<f64>() + x.nrows() as f64;
    let mut v = Array1::from_shape_fn(p + 1, |j| 1.0 + j as f64 / (p as f64 + 1.0));
    let norm = v.dot(&v).sqrt();
    v /= norm;

    let mut estimate = 0.0;
    for _ in 0..POWER_ITERATIONS {
        let av = x.dot(&v.slice(s![..p])) + v[p];
        let mut next = Array1::zeros(p + 1);
        next.slice_mut(s![..p]).assign(&x.t().dot(&av));
        next[p] = av.sum();
        let norm = next.dot(&next).sqrt();
        if norm == 0.0 || !norm.is_finite() {
            break;
        }
        estimate = norm;
        v = next / norm;
    }
    (estimate * LIPSCHITZ_SAFETY).min(frobenius)
}

/// Maps the two label values of `y` to margin targets `+1` (larger value)
/// and `-1`, returning the codes in that order.
fn binary_targets(y: ArrayView1<f64>) -> Result<(Array1<f64>, [f64; 2])> {
    let mut codes: Vec<f64> = Vec::with_capacity(2);
    for &v in y {
        if !v.is_finite() {
            return Err(GraphnetError::alignment(None, format!("label {v} is not finite")));
        }
        if !codes.contains(&v) {
            codes.push(v);
            if codes.len() > 2 {
                return Err(GraphnetError::alignment(
                    None,
                    format!("labels take more than two values: {codes:?}"),
                ));
            }
        }
    }
    if codes.len() < 2 {
        return Err(GraphnetError::insufficient(format!(
            "training labels contain a single class {codes:?}"
        )));
    }
    let (positive, negative) = if codes[0] > codes[1] {
        (codes[0], codes[1])
    } else {
        (codes[1], codes[0])
    };
    let targets = y.mapv(|v| if v == positive { 1.0 } else { -1.0 });
    Ok((targets, [positive, negative]))
}
