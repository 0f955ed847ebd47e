//! A module for bidirectional mappings between the unconstrained values seen
//! by the optimizer and the strictly positive values the model works with.
//!
//! All variance-like and scale-like parameters (latent variances, kernel
//! variance, lengthscales, noise variance) go through [`Positive`]; latent
//! means and inducing inputs are unconstrained by nature and bypass it.

use crate::errors::{GplvmError, Result};
use linfa::Float;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Softplus mapping with a lower clip: `value = lower + ln(1 + exp(raw))`.
///
/// The mapping is strictly monotonic and differentiable everywhere, and the
/// clip keeps variance-like parameters away from zero so that downstream
/// Cholesky solves stay well posed.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Positive<F: Float> {
    /// Smallest reachable constrained value
    lower: F,
}

impl<F: Float> Default for Positive<F> {
    fn default() -> Positive<F> {
        Positive {
            lower: F::cast(Positive::<F>::DEFAULT_LOWER),
        }
    }
}

impl<F: Float> Positive<F> {
    /// Default lower clip for positive parameters
    pub const DEFAULT_LOWER: f64 = 1e-6;

    /// A constructor given the lower clip value
    pub fn new(lower: F) -> Positive<F> {
        Positive { lower }
    }

    /// Lower clip value
    pub fn lower(&self) -> F {
        self.lower
    }

    /// Map an unconstrained value to its positive counterpart.
    pub fn forward(&self, raw: F) -> F {
        // softplus computed as max(u, 0) + ln(1 + exp(-|u|)) to avoid overflow
        let softplus = raw.max(F::zero()) + F::exp(-raw.abs()).ln_1p();
        self.lower + softplus
    }

    /// Map a positive value back to the unconstrained space.
    ///
    /// Values at or below the lower clip are rejected as configuration errors.
    pub fn inverse(&self, value: F) -> Result<F> {
        let v = value - self.lower;
        if v <= F::zero() {
            return Err(GplvmError::InvalidValueError(format!(
                "Positive transform expects a value greater than {}, got {}",
                self.lower, value
            )));
        }
        // ln(exp(v) - 1) = v + ln(1 - exp(-v))
        Ok(v + F::ln(-F::exp_m1(-v)))
    }

    /// Derivative of [`Positive::forward`] at `raw`, the chain-rule factor
    /// turning constrained-space gradients into unconstrained-space ones.
    pub fn forward_grad(&self, raw: F) -> F {
        // sigmoid(u)
        F::one() / (F::one() + F::exp(-raw))
    }
}
