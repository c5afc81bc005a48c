//! Covariance functions for the Gaussian-process surrogate.

use hd_types::{config_error, ConfigError, KernelKind};
use nalgebra::{DMatrix, DVector};

const SQRT_3: f64 = 1.732_050_807_568_877_2;
const SQRT_5: f64 = 2.236_067_977_499_79;

/// Supported Matérn smoothness values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Smoothness {
    Half,
    ThreeHalves,
    FiveHalves,
}

impl TryFrom<f64> for Smoothness {
    type Error = ConfigError;

    fn try_from(nu: f64) -> Result<Self, Self::Error> {
        if nu == 0.5 {
            Ok(Self::Half)
        } else if nu == 1.5 {
            Ok(Self::ThreeHalves)
        } else if nu == 2.5 {
            Ok(Self::FiveHalves)
        } else {
            Err(config_error!("unsupported Matern nu {nu}; use 0.5, 1.5 or 2.5"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Form {
    Rbf,
    Matern(Smoothness),
}

/// Stationary kernel with a shared length-scale and unit signal variance,
/// matching the standardized targets the surrogate fits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kernel {
    form: Form,
    scale: f64,
}

impl Kernel {
    pub fn new(kind: KernelKind, scale: f64) -> Result<Self, ConfigError> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(config_error!("kernel scale must be positive, got {scale}"));
        }
        let form = match kind {
            KernelKind::Rbf => Form::Rbf,
            KernelKind::Matern { nu } => Form::Matern(Smoothness::try_from(nu)?),
        };
        Ok(Self { form, scale })
    }

    /// Squared exponential: `exp(-||a - b||² / (2 scale²))`.
    pub fn rbf(scale: f64) -> Result<Self, ConfigError> {
        Self::new(KernelKind::Rbf, scale)
    }

    pub fn matern(nu: f64, scale: f64) -> Result<Self, ConfigError> {
        Self::new(KernelKind::Matern { nu }, scale)
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Prior variance `k(x, x)`.
    pub fn diagonal(&self) -> f64 {
        1.0
    }

    pub fn eval(&self, a: &[f64], b: &[f64]) -> f64 {
        let sq_dist: f64 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
        match self.form {
            Form::Rbf => (-sq_dist / (2.0 * self.scale * self.scale)).exp(),
            Form::Matern(nu) => {
                let r = sq_dist.sqrt() / self.scale;
                match nu {
                    Smoothness::Half => (-r).exp(),
                    Smoothness::ThreeHalves => (1.0 + SQRT_3 * r) * (-SQRT_3 * r).exp(),
                    Smoothness::FiveHalves => {
                        (1.0 + SQRT_5 * r + 5.0 / 3.0 * r * r) * (-SQRT_5 * r).exp()
                    }
                }
            }
        }
    }

    /// Gram matrix `K(X, X)` over the rows of `xs`.
    pub fn matrix(&self, xs: &[Vec<f64>]) -> DMatrix<f64> {
        let n = xs.len();
        DMatrix::from_fn(n, n, |i, j| self.eval(&xs[i], &xs[j]))
    }

    /// Cross-covariance vector `k(x, X)`.
    pub fn vector(&self, x: &[f64], xs: &[Vec<f64>]) -> DVector<f64> {
        DVector::from_fn(xs.len(), |i, _| self.eval(x, &xs[i]))
    }
}
