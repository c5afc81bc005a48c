//! Acquisition functions and their maximization over the encoded domain.
//!
//! The maximizer runs `restarts` independent local searches. Each restart
//! draws [`CANDIDATES_PER_RESTART`] uniform points of the encoded box, starts
//! from the best of them, and refines it with a bounded compass (pattern)
//! search. Every evaluated point is projected onto a valid encoding first,
//! so integer and categorical slots are scored as they would be decoded.

use hd_types::{AcquisitionError, AcquisitionKind, ObjectiveDirection, SurrogateError};
use rand::Rng;
use tracing::debug;

use crate::gp::SurrogateModel;
use crate::space::ParameterSpace;

/// Random candidates screened per restart before local refinement.
pub const CANDIDATES_PER_RESTART: usize = 64;
/// Acquisition values at or below this, relative to the spread of the
/// observed objectives, are treated as zero.
pub const FLAT_TOLERANCE: f64 = 1e-12;

const INITIAL_STEP: f64 = 0.1;
const MIN_STEP: f64 = 1e-5;
const MAX_EVALUATIONS: usize = 2_000;

/// Standard normal PDF.
pub fn norm_pdf(x: f64) -> f64 {
    const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

/// Standard normal CDF (Abramowitz-Stegun rational approximation).
pub fn norm_cdf(x: f64) -> f64 {
    if x < -8.0 {
        return 0.0;
    }
    if x > 8.0 {
        return 1.0;
    }

    let abs_x = x.abs();
    let t = 1.0 / (1.0 + 0.231_641_9 * abs_x);
    let t2 = t * t;
    let t3 = t2 * t;
    let t4 = t3 * t;
    let t5 = t4 * t;

    let poly = 0.319_381_530 * t - 0.356_563_782 * t2 + 1.781_477_937 * t3 - 1.821_255_978 * t4
        + 1.330_274_429 * t5;
    let cdf = 1.0 - norm_pdf(abs_x) * poly;

    if x >= 0.0 {
        cdf
    } else {
        1.0 - cdf
    }
}

/// Expected improvement of a prediction over `best`.
///
/// `EI = Δ·Φ(Δ/σ) + σ·φ(Δ/σ)` with `Δ = best - mean - xi` when minimizing
/// and `Δ = mean - best - xi` when maximizing; zero when `σ = 0`.
pub fn expected_improvement(
    mean: f64,
    variance: f64,
    best: f64,
    direction: ObjectiveDirection,
    xi: f64,
) -> f64 {
    let sigma = variance.max(0.0).sqrt();
    if sigma <= 0.0 {
        return 0.0;
    }
    let delta = match direction {
        ObjectiveDirection::Minimize => best - mean,
        ObjectiveDirection::Maximize => mean - best,
    } - xi;
    let z = delta / sigma;
    (delta * norm_cdf(z) + sigma * norm_pdf(z)).max(0.0)
}

/// Optimistic confidence bound, oriented so that larger is always better.
pub fn confidence_bound(
    mean: f64,
    variance: f64,
    direction: ObjectiveDirection,
    kappa: f64,
) -> f64 {
    let sigma = variance.max(0.0).sqrt();
    match direction {
        ObjectiveDirection::Minimize => kappa * sigma - mean,
        ObjectiveDirection::Maximize => mean + kappa * sigma,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionOptimizer {
    kind: AcquisitionKind,
    restarts: usize,
}

impl AcquisitionOptimizer {
    pub fn new(kind: AcquisitionKind, restarts: usize) -> Self {
        Self {
            kind,
            restarts: restarts.max(1),
        }
    }

    pub fn kind(&self) -> AcquisitionKind {
        self.kind
    }

    /// Acquisition value of the (already valid) encoded point `x`.
    pub fn score(
        &self,
        model: &SurrogateModel,
        x: &[f64],
        best_value: f64,
        direction: ObjectiveDirection,
    ) -> Result<f64, SurrogateError> {
        let (mean, variance) = model.predict(x)?;
        Ok(match self.kind {
            AcquisitionKind::Ei { xi } => {
                expected_improvement(mean, variance, best_value, direction, xi)
            }
            AcquisitionKind::Ucb { kappa } => {
                confidence_bound(mean, variance, direction, kappa)
            }
        })
    }

    /// Encoded point maximizing the acquisition, projected onto a valid
    /// encoding. Fails with [`AcquisitionError::Degenerate`] when the
    /// surface is flat everywhere it was sampled.
    pub fn propose_next<R: Rng + ?Sized>(
        &self,
        model: &SurrogateModel,
        space: &ParameterSpace,
        best_value: f64,
        direction: ObjectiveDirection,
        rng: &mut R,
    ) -> Result<Vec<f64>, AcquisitionError> {
        let evaluate = |x: &[f64]| -> Result<(Vec<f64>, f64), SurrogateError> {
            let projected = space.project(x);
            let value = self.score(model, &projected, best_value, direction)?;
            Ok((projected, value))
        };

        let mut lowest = f64::INFINITY;
        let mut best: Option<(Vec<f64>, f64)> = None;

        for restart in 0..self.restarts {
            let mut start: Option<(Vec<f64>, f64)> = None;
            for _ in 0..CANDIDATES_PER_RESTART {
                let (candidate, value) = evaluate(&space.sample_unit(rng))?;
                lowest = lowest.min(value);
                if start.as_ref().map_or(true, |(_, v)| value > *v) {
                    start = Some((candidate, value));
                }
            }
            let Some((x0, v0)) = start else { continue };

            let (x, value) = pattern_search(x0, v0, |x| evaluate(x).map(|(_, v)| v))?;
            debug!(restart, value, "acquisition local search finished");
            if best.as_ref().map_or(true, |(_, v)| value > *v) {
                best = Some((x, value));
            }
        }

        let Some((x, value)) = best else {
            return Err(AcquisitionError::Degenerate {
                restarts: self.restarts,
                best: f64::NEG_INFINITY,
            });
        };
        // EI is in objective units; compare it with the objective spread.
        let spread = model
            .state()
            .map(|state| state.y_std())
            .filter(|std| *std > 0.0)
            .unwrap_or(1.0);
        let flat = match self.kind {
            AcquisitionKind::Ei { .. } => !(value > FLAT_TOLERANCE * spread),
            AcquisitionKind::Ucb { .. } => {
                !(value - lowest > FLAT_TOLERANCE * value.abs().max(spread))
            }
        };
        if flat {
            return Err(AcquisitionError::Degenerate {
                restarts: self.restarts,
                best: value,
            });
        }
        Ok(space.project(&x))
    }
}

/// Bounded compass search maximizing `f` inside `[0, 1]^d`: try ±step
/// along each axis, move on the first improvement, halve the step when no
/// move improves.
fn pattern_search<F>(
    start: Vec<f64>,
    start_value: f64,
    mut f: F,
) -> Result<(Vec<f64>, f64), SurrogateError>
where
    F: FnMut(&[f64]) -> Result<f64, SurrogateError>,
{
    let mut x = start;
    let mut fx = start_value;
    let mut step = INITIAL_STEP;
    let mut evaluations = 0;

    while step > MIN_STEP && evaluations < MAX_EVALUATIONS {
        let mut improved = false;
        'axes: for i in 0..x.len() {
            for direction in [1.0, -1.0] {
                let moved = (x[i] + direction * step).clamp(0.0, 1.0);
                if moved == x[i] {
                    continue;
                }
                let mut candidate = x.clone();
                candidate[i] = moved;
                evaluations += 1;
                let value = f(&candidate)?;
                if value > fx {
                    x = candidate;
                    fx = value;
                    improved = true;
                    break 'axes;
                }
            }
        }
        if !improved {
            step *= 0.5;
        }
    }
    Ok((x, fx))
}
