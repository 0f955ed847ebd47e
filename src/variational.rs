//! A module for the factorized Gaussian posterior over latent inputs.

use crate::errors::{GplvmError, Result};
use linfa::Float;
use ndarray::{Array2, Axis};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Independent Gaussian posterior over each latent coordinate: one mean and
/// one strictly positive variance per data point and latent dimension.
#[derive(Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(serialize = "F: Serialize", deserialize = "F: Deserialize<'de>"))
)]
pub struct LatentPosterior<F: Float> {
    /// Posterior means (n, q)
    means: Array2<F>,
    /// Posterior variances (n, q), strictly positive
    variances: Array2<F>,
}

impl<F: Float> Clone for LatentPosterior<F> {
    fn clone(&self) -> Self {
        LatentPosterior {
            means: self.means.to_owned(),
            variances: self.variances.to_owned(),
        }
    }
}

impl<F: Float> LatentPosterior<F> {
    /// A constructor checking shape consistency and variance positivity.
    pub fn new(means: Array2<F>, variances: Array2<F>) -> Result<LatentPosterior<F>> {
        if means.dim() != variances.dim() {
            return Err(GplvmError::InvalidValueError(format!(
                "Latent means {:?} and variances {:?} should have the same shape",
                means.dim(),
                variances.dim()
            )));
        }
        if variances.iter().any(|v| *v <= F::zero()) {
            return Err(GplvmError::InvalidValueError(
                "Latent variances should be strictly positive".to_string(),
            ));
        }
        Ok(LatentPosterior { means, variances })
    }

    /// Posterior means (n, q)
    pub fn means(&self) -> &Array2<F> {
        &self.means
    }

    /// Posterior variances (n, q)
    pub fn variances(&self) -> &Array2<F> {
        &self.variances
    }

    /// Number of data points
    pub fn n_points(&self) -> usize {
        self.means.nrows()
    }

    /// Latent dimension
    pub fn latent_dim(&self) -> usize {
        self.means.ncols()
    }

    /// Closed-form Kullback-Leibler divergence to the standard normal prior,
    /// summed over all points and latent dimensions.
    ///
    /// Zero exactly when every mean is zero and every variance is one.
    pub fn kl_divergence(&self) -> F {
        let half = F::cast(0.5);
        let mu2 = self.means.mapv(|v| v * v).sum();
        let s = self.variances.sum();
        let ln_s = self.variances.mapv(|v| v.ln()).sum();
        let count = F::cast(self.means.len());
        half * (mu2 + s - ln_s - count)
    }

    /// Gradients of [`LatentPosterior::kl_divergence`] w.r.t. means and variances.
    pub fn kl_gradients(&self) -> (Array2<F>, Array2<F>) {
        let half = F::cast(0.5);
        let dmeans = self.means.to_owned();
        let dvariances = self.variances.mapv(|v| half * (F::one() - F::one() / v));
        (dmeans, dvariances)
    }

    /// Per-point KL divergence as an (n,) vector, mostly useful for reporting.
    pub fn kl_divergence_per_point(&self) -> ndarray::Array1<F> {
        let half = F::cast(0.5);
        let q = F::cast(self.latent_dim());
        let mu2 = self.means.mapv(|v| v * v).sum_axis(Axis(1));
        let s = self.variances.sum_axis(Axis(1));
        let ln_s = self.variances.mapv(|v| v.ln()).sum_axis(Axis(1));
        (mu2 + s - ln_s).mapv(|v| half * (v - q))
    }
}
