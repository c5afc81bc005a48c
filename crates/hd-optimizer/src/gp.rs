//! Gaussian-process surrogate model.
//!
//! Observations are standardized (zero mean, unit variance) before fitting
//! and predictions are mapped back to the objective's own scale, so the
//! acquisition function can compare them with raw objective values.
//! The covariance `K + σ²I` is factorized by Cholesky; when the
//! factorization fails the jitter σ² is raised tenfold, up to
//! [`MAX_JITTER_ATTEMPTS`] attempts.

use hd_types::SurrogateError;
use nalgebra::{Cholesky, DVector, Dyn};
use tracing::debug;

use crate::kernel::Kernel;
use crate::trial::ObservationHistory;

/// Default jitter added to the covariance diagonal.
pub const DEFAULT_NOISE: f64 = 1e-6;
/// Bounded number of Cholesky attempts with growing jitter.
pub const MAX_JITTER_ATTEMPTS: usize = 6;

/// Fitted state, recomputed from scratch on every fit.
#[derive(Debug, Clone)]
pub struct SurrogateState {
    x_train: Vec<Vec<f64>>,
    /// `None` below two observations: the model answers with the prior.
    cholesky: Option<Cholesky<f64, Dyn>>,
    /// `(K + σ²I)^{-1} y` on standardized targets.
    alpha: DVector<f64>,
    y_mean: f64,
    y_std: f64,
    jitter: f64,
}

impl SurrogateState {
    pub fn observations(&self) -> usize {
        self.x_train.len()
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn y_mean(&self) -> f64 {
        self.y_mean
    }

    pub fn y_std(&self) -> f64 {
        self.y_std
    }
}

#[derive(Debug, Clone)]
pub struct SurrogateModel {
    kernel: Kernel,
    noise: f64,
    state: Option<SurrogateState>,
}

impl SurrogateModel {
    pub fn new(kernel: Kernel) -> Self {
        Self {
            kernel,
            noise: DEFAULT_NOISE,
            state: None,
        }
    }

    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn state(&self) -> Option<&SurrogateState> {
        self.state.as_ref()
    }

    /// Fit on every succeeded trial of `history`.
    pub fn fit(&mut self, history: &ObservationHistory) -> Result<(), SurrogateError> {
        let (xs, ys) = history.design();
        self.fit_points(xs, ys)
    }

    pub fn fit_points(&mut self, xs: Vec<Vec<f64>>, ys: Vec<f64>) -> Result<(), SurrogateError> {
        self.state = None;
        let n = ys.len();

        if let Some(dim) = xs.first().map(Vec::len) {
            if let Some(bad) = xs.iter().find(|x| x.len() != dim) {
                return Err(SurrogateError::DimensionMismatch {
                    expected: dim,
                    got: bad.len(),
                });
            }
        }

        let y_mean = if n == 0 {
            0.0
        } else {
            ys.iter().sum::<f64>() / n as f64
        };
        if n < 2 {
            self.state = Some(SurrogateState {
                x_train: xs,
                cholesky: None,
                alpha: DVector::zeros(0),
                y_mean,
                y_std: 1.0,
                jitter: self.noise,
            });
            return Ok(());
        }

        let y_var = ys.iter().map(|y| (y - y_mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        // Identical observations carry no shape: the posterior collapses to
        // the constant mean with zero variance. Spread within rounding of the
        // largest magnitude counts as identical.
        let magnitude = ys.iter().fold(0.0f64, |m, y| m.max(y.abs()));
        let y_std = y_var.sqrt();
        let y_std = if y_std > 4.0 * f64::EPSILON * magnitude {
            y_std
        } else {
            0.0
        };
        let divisor = if y_std > 0.0 { y_std } else { 1.0 };
        let y_standardized = DVector::from_iterator(n, ys.iter().map(|y| (y - y_mean) / divisor));

        let gram = self.kernel.matrix(&xs);
        let mut jitter = self.noise;
        for attempt in 1..=MAX_JITTER_ATTEMPTS {
            let mut k = gram.clone();
            for i in 0..n {
                k[(i, i)] += jitter;
            }
            if let Some(cholesky) = Cholesky::new(k) {
                let alpha = cholesky.solve(&y_standardized);
                debug!(observations = n, jitter, attempt, "surrogate fitted");
                self.state = Some(SurrogateState {
                    x_train: xs,
                    cholesky: Some(cholesky),
                    alpha,
                    y_mean,
                    y_std,
                    jitter,
                });
                return Ok(());
            }
            if attempt < MAX_JITTER_ATTEMPTS {
                jitter *= 10.0;
            }
        }

        Err(SurrogateError::SingularCovariance {
            attempts: MAX_JITTER_ATTEMPTS,
            jitter,
        })
    }

    /// Posterior mean and variance at `x`, on the objective's scale.
    pub fn predict(&self, x: &[f64]) -> Result<(f64, f64), SurrogateError> {
        let state = self.state.as_ref().ok_or(SurrogateError::NotFitted)?;
        if let Some(first) = state.x_train.first() {
            if first.len() != x.len() {
                return Err(SurrogateError::DimensionMismatch {
                    expected: first.len(),
                    got: x.len(),
                });
            }
        }

        let Some(cholesky) = &state.cholesky else {
            return Ok((state.y_mean, self.kernel.diagonal()));
        };

        let k_star = self.kernel.vector(x, &state.x_train);
        let mean = k_star.dot(&state.alpha);
        let v = cholesky.solve(&k_star);
        let variance = (self.kernel.diagonal() - k_star.dot(&v)).max(0.0);

        Ok((
            state.y_mean + mean * state.y_std,
            variance * state.y_std * state.y_std,
        ))
    }
}
