use crate::errors::{GplvmError, Result};
use crate::kernels::LatentKernel;
use crate::optimization::LbfgsParams;
use linfa::{Float, ParamGuard};
use ndarray::Array2;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Noise variance estimation method
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum ParamTuning<F: Float> {
    /// Constant parameter (ie given not estimated)
    Fixed(F),
    /// Parameter is estimated starting from the initial guess
    Estimated {
        /// Initial guess parameter value
        init: F,
    },
}
impl<F: Float> Default for ParamTuning<F> {
    fn default() -> ParamTuning<F> {
        Self::Estimated {
            init: F::cast(1e-2),
        }
    }
}

impl<F: Float> ParamTuning<F> {
    /// Initial (or constant) parameter value
    pub fn init(&self) -> F {
        match self {
            ParamTuning::Fixed(v) => *v,
            ParamTuning::Estimated { init } => *init,
        }
    }

    /// Whether the parameter takes part in the optimization
    pub fn is_estimated(&self) -> bool {
        matches!(self, ParamTuning::Estimated { .. })
    }
}

/// Inducing points specification
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum Inducings<F: Float> {
    /// `usize` points are sub-sampled from the initial latent means
    Randomized(usize),
    /// Points are given as a (npoints, latent_dim) matrix
    Located(Array2<F>),
}
impl<F: Float> Default for Inducings<F> {
    fn default() -> Inducings<F> {
        Self::Randomized(10)
    }
}

/// Latent posterior mean initialization
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum LatentInit<F: Float> {
    /// Seed the means with a principal component projection of the data
    Pca,
    /// Means are given as a (n, latent_dim) matrix
    Located(Array2<F>),
}
impl<F: Float> Default for LatentInit<F> {
    fn default() -> LatentInit<F> {
        Self::Pca
    }
}

/// A set of validated GPLVM parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "F: Serialize, Kern: Serialize",
        deserialize = "F: Deserialize<'de>, Kern: Deserialize<'de>"
    ))
)]
pub struct GplvmValidParams<F: Float, Kern: LatentKernel<F>> {
    /// Covariance kernel over the latent space
    pub(crate) kern: Kern,
    /// Latent space dimension
    pub(crate) latent_dim: usize,
    /// Inducing points
    pub(crate) z: Inducings<F>,
    /// Latent posterior mean initialization
    pub(crate) latent_init: LatentInit<F>,
    /// Initial latent posterior variance
    pub(crate) latent_variance_init: F,
    /// Initial kernel variance
    pub(crate) variance_init: F,
    /// Initial kernel lengthscale, shared across latent dimensions
    pub(crate) lengthscale_init: F,
    /// Gaussian homoscedastic noise variance handling
    pub(crate) noise: ParamTuning<F>,
    /// Parameter to improve numerical stability
    pub(crate) nugget: F,
    /// Optimizer tunings
    pub(crate) optim: LbfgsParams,
    /// Random generator seed
    pub(crate) seed: Option<u64>,
}

impl<F: Float, Kern: LatentKernel<F>> Default for GplvmValidParams<F, Kern> {
    fn default() -> GplvmValidParams<F, Kern> {
        GplvmValidParams {
            kern: Kern::default(),
            latent_dim: 2,
            z: Inducings::default(),
            latent_init: LatentInit::default(),
            latent_variance_init: F::cast(GplvmValidParams::<F, Kern>::DEFAULT_LATENT_VARIANCE),
            variance_init: F::one(),
            lengthscale_init: F::one(),
            noise: ParamTuning::default(),
            nugget: F::cast(GplvmValidParams::<F, Kern>::DEFAULT_NUGGET),
            optim: LbfgsParams::default(),
            seed: None,
        }
    }
}

impl<F: Float, Kern: LatentKernel<F>> GplvmValidParams<F, Kern> {
    /// Default initial variance of the latent posterior
    pub const DEFAULT_LATENT_VARIANCE: f64 = 0.1;
    /// Default nugget added to the inducing covariance diagonal
    pub const DEFAULT_NUGGET: f64 = 1e-6;

    /// Get covariance kernel k(x, x')
    pub fn kern(&self) -> &Kern {
        &self.kern
    }

    /// Get latent space dimension
    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    /// Get inducing points specification
    pub fn inducings(&self) -> &Inducings<F> {
        &self.z
    }

    /// Get latent mean initialization
    pub fn latent_init(&self) -> &LatentInit<F> {
        &self.latent_init
    }

    /// Get initial latent posterior variance
    pub fn latent_variance_init(&self) -> F {
        self.latent_variance_init
    }

    /// Get initial kernel variance
    pub fn variance_init(&self) -> F {
        self.variance_init
    }

    /// Get initial kernel lengthscale
    pub fn lengthscale_init(&self) -> F {
        self.lengthscale_init
    }

    /// Get noise variance configuration
    pub fn noise_variance(&self) -> &ParamTuning<F> {
        &self.noise
    }

    /// Get nugget value
    pub fn nugget(&self) -> F {
        self.nugget
    }

    /// Get optimizer tunings
    pub fn optim(&self) -> &LbfgsParams {
        &self.optim
    }

    /// Get seed
    pub fn seed(&self) -> Option<&u64> {
        self.seed.as_ref()
    }
}

#[derive(Clone, Debug)]
/// The set of hyperparameters that can be specified for the execution of
/// the [GPLVM algorithm](struct.Gplvm.html).
pub struct GplvmParams<F: Float, Kern: LatentKernel<F>>(pub(crate) GplvmValidParams<F, Kern>);

impl<F: Float, Kern: LatentKernel<F>> GplvmParams<F, Kern> {
    /// A constructor for GPLVM parameters given a kernel and the latent dimension
    pub fn new(kern: Kern, latent_dim: usize) -> GplvmParams<F, Kern> {
        Self(GplvmValidParams {
            kern,
            latent_dim,
            ..Default::default()
        })
    }

    /// Set the covariance kernel
    pub fn kern(mut self, kern: Kern) -> Self {
        self.0.kern = kern;
        self
    }

    /// Specify nz inducing points as an (nz, latent_dim) matrix.
    pub fn inducings(mut self, z: Array2<F>) -> Self {
        self.0.z = Inducings::Located(z);
        self
    }

    /// Specify the number of inducing points sub-sampled from the initial latent means.
    pub fn n_inducings(mut self, nz: usize) -> Self {
        self.0.z = Inducings::Randomized(nz);
        self
    }

    /// Set the latent mean initialization.
    pub fn latent_init(mut self, init: LatentInit<F>) -> Self {
        self.0.latent_init = init;
        self
    }

    /// Set the initial latent posterior variance.
    pub fn latent_variance_init(mut self, init: F) -> Self {
        self.0.latent_variance_init = init;
        self
    }

    /// Set the initial kernel variance.
    pub fn variance_init(mut self, init: F) -> Self {
        self.0.variance_init = init;
        self
    }

    /// Set the initial kernel lengthscale, shared across latent dimensions.
    pub fn lengthscale_init(mut self, init: F) -> Self {
        self.0.lengthscale_init = init;
        self
    }

    /// Set noise variance configuration defining noise handling.
    pub fn noise_variance(mut self, config: ParamTuning<F>) -> Self {
        self.0.noise = config;
        self
    }

    /// Set nugget value.
    ///
    /// Nugget is used to improve numerical stability
    pub fn nugget(mut self, nugget: F) -> Self {
        self.0.nugget = nugget;
        self
    }

    /// Set the optimizer tunings.
    pub fn optim(mut self, optim: LbfgsParams) -> Self {
        self.0.optim = optim;
        self
    }

    /// Set the optimizer iteration budget.
    pub fn max_iter(mut self, max_iter: u64) -> Self {
        self.0.optim.max_iter = max_iter;
        self
    }

    /// Set the random generator seed used for inducing point sub-sampling.
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.0.seed = seed;
        self
    }
}

impl<F: Float, Kern: LatentKernel<F>> From<GplvmValidParams<F, Kern>> for GplvmParams<F, Kern> {
    fn from(valid: GplvmValidParams<F, Kern>) -> Self {
        GplvmParams(valid)
    }
}

impl<F: Float, Kern: LatentKernel<F>> ParamGuard for GplvmParams<F, Kern> {
    type Checked = GplvmValidParams<F, Kern>;
    type Error = GplvmError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        if self.0.latent_dim == 0 {
            return Err(GplvmError::InvalidValueError(
                "`latent_dim` cannot be 0!".to_string(),
            ));
        }
        if self.0.variance_init <= F::zero() {
            return Err(GplvmError::InvalidValueError(format!(
                "Initial kernel variance should be strictly positive, got {}",
                self.0.variance_init
            )));
        }
        if self.0.lengthscale_init <= F::zero() {
            return Err(GplvmError::InvalidValueError(format!(
                "Initial lengthscale should be strictly positive, got {}",
                self.0.lengthscale_init
            )));
        }
        if self.0.latent_variance_init <= F::zero() {
            return Err(GplvmError::InvalidValueError(format!(
                "Initial latent variance should be strictly positive, got {}",
                self.0.latent_variance_init
            )));
        }
        if self.0.noise.init() <= F::zero() {
            return Err(GplvmError::InvalidValueError(
                "Noise variance should be strictly positive".to_string(),
            ));
        }
        if self.0.nugget < F::zero() {
            return Err(GplvmError::InvalidValueError(
                "Nugget should not be negative".to_string(),
            ));
        }
        match &self.0.z {
            Inducings::Randomized(0) => {
                return Err(GplvmError::InvalidValueError(
                    "At least one inducing point is required".to_string(),
                ));
            }
            Inducings::Located(z) => {
                if z.nrows() == 0 || z.ncols() != self.0.latent_dim {
                    return Err(GplvmError::InvalidValueError(format!(
                        "Inducing points shape {:?} inconsistent with latent dim {}",
                        z.dim(),
                        self.0.latent_dim
                    )));
                }
            }
            _ => (),
        }
        if let LatentInit::Located(x) = &self.0.latent_init {
            if x.ncols() != self.0.latent_dim {
                return Err(GplvmError::InvalidValueError(format!(
                    "Latent init shape {:?} inconsistent with latent dim {}",
                    x.dim(),
                    self.0.latent_dim
                )));
            }
        }
        if self.0.optim.memory == 0 {
            return Err(GplvmError::InvalidValueError(
                "L-BFGS memory cannot be 0".to_string(),
            ));
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::SquaredExponentialKernel;
    use ndarray::Array2;

    #[test]
    fn test_eager_configuration_errors() {
        let p = GplvmParams::<f64, SquaredExponentialKernel>::new(
            SquaredExponentialKernel::default(),
            0,
        );
        assert!(p.check().is_err());

        let p = GplvmParams::<f64, SquaredExponentialKernel>::new(
            SquaredExponentialKernel::default(),
            2,
        )
        .lengthscale_init(-1.);
        assert!(p.check().is_err());

        let p = GplvmParams::<f64, SquaredExponentialKernel>::new(
            SquaredExponentialKernel::default(),
            2,
        )
        .noise_variance(ParamTuning::Fixed(0.));
        assert!(p.check().is_err());

        // inducing points in a 3d latent space while latent_dim is 2
        let p = GplvmParams::<f64, SquaredExponentialKernel>::new(
            SquaredExponentialKernel::default(),
            2,
        )
        .inducings(Array2::zeros((5, 3)));
        assert!(p.check().is_err());
    }

    #[test]
    fn test_valid_configuration() {
        let p = GplvmParams::<f64, SquaredExponentialKernel>::new(
            SquaredExponentialKernel::default(),
            2,
        )
        .n_inducings(15)
        .seed(Some(42));
        let checked = p.check().unwrap();
        assert_eq!(checked.latent_dim(), 2);
        assert_eq!(checked.inducings(), &Inducings::Randomized(15));
        assert!(checked.noise_variance().is_estimated());
    }
}
