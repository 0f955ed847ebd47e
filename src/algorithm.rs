use crate::elbo::evidence_lower_bound;
use crate::errors::{GplvmError, Result};
use crate::kernels::{LatentKernel, SquaredExponentialKernel};
use crate::optimization::{minimize_bound, BoundProblem, FitOutcome, ParamLayout};
use crate::parameters::{GplvmParams, GplvmValidParams, Inducings, LatentInit, ParamTuning};
use crate::transforms::Positive;
use crate::utils::{center, pca_scores};
use crate::variational::LatentPosterior;

use linfa::prelude::{DatasetBase, Fit, Float};
use ndarray::{Array1, Array2, ArrayBase, ArrayView2, Data, Ix2, Zip};
use ndarray_rand::rand::seq::SliceRandom;
use ndarray_rand::rand::SeedableRng;
use rand_xoshiro::Xoshiro256Plus;

use log::debug;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bayesian Gaussian process latent variable model trained by sparse
/// variational inference.
///
/// Each of the `d` observed output dimensions is modeled as an independent
/// Gaussian process over an unobserved `q`-dimensional input, `q < d`. The
/// latent inputs get a factorized Gaussian posterior regularized towards a
/// standard normal prior, and a set of `m` inducing points keeps the cost at
/// `O(n m^2)` per bound evaluation instead of `O(n^3)`.
///
/// Training jointly adjusts the latent posterior, the inducing inputs, the
/// ARD kernel hyperparameters and optionally the noise variance to maximize
/// the evidence lower bound with L-BFGS. With one lengthscale per latent
/// dimension, irrelevant dimensions get large lengthscales and are
/// effectively pruned (automatic relevance determination).
///
/// # Implementation
///
/// [`Gplvm`] is parameterized by [`GplvmParams`]. Inducing points can be
/// either sub-sampled from the initial latent means or provided through the
/// [`Inducings`] specification; the latent means are seeded from a principal
/// component projection unless given with [`LatentInit`]. Noise variance can
/// be a known constant or estimated (see [`ParamTuning`]). Class labels or
/// any other targets carried by the training dataset are ignored: training
/// is unsupervised.
///
/// # Features
///
/// ## serializable
///
/// The `serializable` feature enables the serialization of trained models
/// using the [`serde crate`](https://serde.rs/).
///
/// # Example
///
/// ```no_run
/// use gplvm::RbfGplvm;
/// use linfa::prelude::{DatasetBase, Fit};
/// use ndarray::Array;
/// use ndarray_rand::RandomExt;
/// use ndarray_rand::rand_distr::Normal;
///
/// // 30 twelve-dimensional observations
/// let y = Array::random((30, 12), Normal::new(0., 1.).unwrap());
///
/// let model = RbfGplvm::params(2)
///     .n_inducings(10)
///     .seed(Some(42))
///     .fit(&DatasetBase::from(y))
///     .expect("GPLVM fitted");
///
/// println!("elbo={}", model.elbo());
/// println!("embedding={:?}", model.latent_means());
/// ```
///
/// # Reference
///
/// Titsias, M. and Lawrence, N.
/// [Bayesian Gaussian Process Latent Variable Model](https://proceedings.mlr.press/v9/titsias10a.html).
/// In: Proceedings of the Thirteenth International Conference on Artificial
/// Intelligence and Statistics, PMLR 9:844-851, 2010.
#[derive(Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "F: Serialize, Kern: Serialize",
        deserialize = "F: Deserialize<'de>, Kern: Deserialize<'de>"
    ))
)]
pub struct Gplvm<F: Float, Kern: LatentKernel<F>> {
    /// Covariance kernel
    kern: Kern,
    /// Optimized kernel lengthscales, one per latent dimension
    lengthscales: Array1<F>,
    /// Optimized kernel variance
    variance: F,
    /// Gaussian noise variance
    noise: F,
    /// Variational posterior over the latent inputs
    latent: LatentPosterior<F>,
    /// Inducing points in latent space
    inducings: Array2<F>,
    /// Column means subtracted from the observations before training
    y_mean: Array1<F>,
    /// Evidence lower bound at the optimum
    elbo: F,
    /// Optimizer run report
    outcome: FitOutcome,
    /// Training observations
    pub(crate) training_data: Array2<F>,
    /// Parameters used to fit this model
    pub(crate) params: GplvmValidParams<F, Kern>,
}

/// Bayesian GPLVM special case when using the squared exponential kernel
pub type RbfGplvm<F> = GplvmParams<F, SquaredExponentialKernel>;

impl<F: Float> RbfGplvm<F> {
    /// A constructor for RbfGplvm parameters given the latent dimension
    pub fn params(latent_dim: usize) -> RbfGplvm<F> {
        GplvmParams::new(SquaredExponentialKernel::default(), latent_dim)
    }
}

impl<F: Float, Kern: LatentKernel<F>> Clone for Gplvm<F, Kern> {
    fn clone(&self) -> Self {
        Self {
            kern: self.kern,
            lengthscales: self.lengthscales.to_owned(),
            variance: self.variance,
            noise: self.noise,
            latent: self.latent.clone(),
            inducings: self.inducings.to_owned(),
            y_mean: self.y_mean.to_owned(),
            elbo: self.elbo,
            outcome: self.outcome.clone(),
            training_data: self.training_data.to_owned(),
            params: self.params.clone(),
        }
    }
}

impl<F: Float, Kern: LatentKernel<F>> fmt::Display for Gplvm<F, Kern> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "GPLVM(kernel={}, lengthscales={}, variance={}, noise variance={}, elbo={}, converged={})",
            self.kern,
            self.lengthscales,
            self.variance,
            self.noise,
            self.elbo,
            self.outcome.converged
        )
    }
}

/// Name, shape, constraint and current value of one parameter block of a
/// trained model.
#[derive(Debug, Clone)]
pub struct ParamSummary<F: Float> {
    /// Parameter block name
    pub name: &'static str,
    /// Parameter block shape
    pub shape: Vec<usize>,
    /// Constraint enforced on the block values
    pub constraint: &'static str,
    /// Current values, row major
    pub value: Vec<F>,
}

impl<F: Float> fmt::Display for ParamSummary<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} shape={:?} constraint={} ({} values)",
            self.name,
            self.shape,
            self.constraint,
            self.value.len()
        )
    }
}

impl<F: Float, Kern: LatentKernel<F>> Gplvm<F, Kern> {
    /// Gplvm parameters constructor
    pub fn params<NewKern: LatentKernel<F>>(
        kern: NewKern,
        latent_dim: usize,
    ) -> GplvmParams<F, NewKern> {
        GplvmParams::new(kern, latent_dim)
    }

    /// Posterior latent means (n, q), the learned embedding
    pub fn latent_means(&self) -> &Array2<F> {
        self.latent.means()
    }

    /// Posterior latent variances (n, q)
    pub fn latent_variances(&self) -> &Array2<F> {
        self.latent.variances()
    }

    /// Variational posterior over the latent inputs
    pub fn latent(&self) -> &LatentPosterior<F> {
        &self.latent
    }

    /// Optimized inducing points
    pub fn inducings(&self) -> &Array2<F> {
        &self.inducings
    }

    /// Optimized lengthscales
    pub fn lengthscales(&self) -> &Array1<F> {
        &self.lengthscales
    }

    /// Optimized kernel variance
    pub fn variance(&self) -> F {
        self.variance
    }

    /// Optimized (or fixed) noise variance
    pub fn noise_variance(&self) -> F {
        self.noise
    }

    /// Evidence lower bound value at the optimum.
    /// Maybe used to compare different trained models
    pub fn elbo(&self) -> F {
        self.elbo
    }

    /// Optimizer run report
    pub fn outcome(&self) -> &FitOutcome {
        &self.outcome
    }

    /// Column means subtracted from the observations before training
    pub fn offset(&self) -> &Array1<F> {
        &self.y_mean
    }

    /// Retrieve data and latent dimensions as (n, d, q, m)
    pub fn dims(&self) -> (usize, usize, usize, usize) {
        (
            self.training_data.nrows(),
            self.training_data.ncols(),
            self.latent.latent_dim(),
            self.inducings.nrows(),
        )
    }

    /// Relevance weight of each latent dimension, the inverse squared
    /// lengthscale: pruned dimensions get a weight close to zero.
    pub fn relevance(&self) -> Array1<F> {
        self.lengthscales.mapv(|v| F::one() / (v * v))
    }

    /// Read-only description of every parameter block: name, shape,
    /// constraint and current value.
    pub fn param_summary(&self) -> Vec<ParamSummary<F>> {
        let (n, _, q, m) = self.dims();
        vec![
            ParamSummary {
                name: "latent/mean",
                shape: vec![n, q],
                constraint: "none",
                value: self.latent.means().iter().copied().collect(),
            },
            ParamSummary {
                name: "latent/variance",
                shape: vec![n, q],
                constraint: "positive",
                value: self.latent.variances().iter().copied().collect(),
            },
            ParamSummary {
                name: "inducings",
                shape: vec![m, q],
                constraint: "none",
                value: self.inducings.iter().copied().collect(),
            },
            ParamSummary {
                name: "kernel/lengthscales",
                shape: vec![q],
                constraint: "positive",
                value: self.lengthscales.to_vec(),
            },
            ParamSummary {
                name: "kernel/variance",
                shape: vec![],
                constraint: "positive",
                value: vec![self.variance],
            },
            ParamSummary {
                name: "likelihood/variance",
                shape: vec![],
                constraint: "positive",
                value: vec![self.noise],
            },
        ]
    }
}

impl<F: Float, Kern: LatentKernel<F>, D: Data<Elem = F>, T> Fit<ArrayBase<D, Ix2>, T, GplvmError>
    for GplvmValidParams<F, Kern>
{
    type Object = Gplvm<F, Kern>;

    /// Fit the latent variable model by maximizing the evidence lower bound.
    ///
    /// Only the dataset records are used; targets (e.g. class labels) are
    /// ignored as training is unsupervised.
    fn fit(&self, dataset: &DatasetBase<ArrayBase<D, Ix2>, T>) -> Result<Self::Object> {
        let y = dataset.records();
        let n = y.nrows();
        let d = y.ncols();
        let q = self.latent_dim();

        if n == 0 {
            return Err(GplvmError::InvalidValueError(
                "At least one observation is required".to_string(),
            ));
        }
        if q > d {
            return Err(GplvmError::InvalidValueError(format!(
                "Latent dimension {q} should be smaller than data dimension {d}"
            )));
        }

        let (yc, y_mean) = center(y);

        let means0 = match self.latent_init() {
            LatentInit::Pca => pca_scores(&yc, q)?,
            LatentInit::Located(x) => {
                if x.nrows() != n {
                    return Err(GplvmError::InvalidValueError(format!(
                        "Latent init has {} rows but the dataset has {} observations",
                        x.nrows(),
                        n
                    )));
                }
                x.to_owned()
            }
        };
        let variances0 = Array2::from_elem((n, q), self.latent_variance_init());

        let mut rng = match self.seed() {
            Some(seed) => Xoshiro256Plus::seed_from_u64(*seed),
            None => Xoshiro256Plus::from_entropy(),
        };
        let z0 = match self.inducings() {
            Inducings::Randomized(nz) => make_inducings(*nz, &means0.view(), &mut rng),
            Inducings::Located(z) => z.to_owned(),
        };
        let m = z0.nrows();

        let lengthscales0 = Array1::from_elem(q, self.lengthscale_init());
        let (noise_estimated, noise0) = match self.noise_variance() {
            ParamTuning::Fixed(c) => (false, *c),
            ParamTuning::Estimated { init } => (true, *init),
        };

        let layout = ParamLayout {
            n,
            q,
            m,
            noise_estimated,
        };
        let transform = Positive::default();
        let init = layout.pack(
            &means0,
            &variances0,
            &z0,
            &lengthscales0,
            self.variance_init(),
            noise0,
            &transform,
        )?;

        debug!(
            "Optimize {} parameters over {} iterations at most",
            init.len(),
            self.optim().max_iter
        );
        let problem = BoundProblem::new(*self.kern(), &yc, layout, transform, noise0, self.nugget());
        let (best, outcome) = minimize_bound(problem, init, self.optim())?;
        debug!("{outcome}");

        let (latent, inducings, lengthscales, variance, noise) =
            layout.unpack(&best, &transform, noise0);

        // Recompute the bound with optimized parameters
        let elbo = evidence_lower_bound(
            self.kern(),
            &yc,
            &latent,
            &inducings,
            variance,
            &lengthscales,
            noise,
            self.nugget(),
        )?;

        Ok(Gplvm {
            kern: *self.kern(),
            lengthscales,
            variance,
            noise,
            latent,
            inducings,
            y_mean,
            elbo,
            outcome,
            training_data: y.to_owned(),
            params: self.clone(),
        })
    }
}

fn make_inducings<F: Float>(
    n_inducing: usize,
    x: &ArrayView2<F>,
    rng: &mut Xoshiro256Plus,
) -> Array2<F> {
    let mut indices = (0..x.nrows()).collect::<Vec<_>>();
    indices.shuffle(rng);
    let n = n_inducing.min(x.nrows());
    let mut z = Array2::zeros((n, x.ncols()));
    let idx = indices[..n].to_vec();
    Zip::from(z.rows_mut())
        .and(&Array1::from_vec(idx))
        .for_each(|mut zi, i| zi.assign(&x.row(*i)));
    z
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::SquaredExponentialKernel;
    use crate::parameters::LatentInit;

    use approx::assert_abs_diff_eq;
    use linfa::prelude::{Dataset, DatasetBase};
    use ndarray::{Array, Axis};
    use ndarray_npy::write_npy;
    use ndarray_rand::rand_distr::Normal;
    use ndarray_rand::RandomExt;
    use ndarray_stats::QuantileExt;
    use rand_xoshiro::Xoshiro256Plus;

    /// n observations of dimension d lying on a q-dimensional linear
    /// manifold, plus gaussian noise with variance eta2.
    fn make_test_data(
        n: usize,
        d: usize,
        q: usize,
        eta2: f64,
        rng: &mut Xoshiro256Plus,
    ) -> Array2<f64> {
        let x = Array::random_using((n, q), Normal::new(0., 1.).unwrap(), rng);
        let w = Array::random_using((q, d), Normal::new(0., 1.).unwrap(), rng);
        let noise = Array::random_using((n, d), Normal::new(0., eta2.sqrt()).unwrap(), rng);
        x.dot(&w) + noise
    }

    #[test]
    fn test_gplvm_end_to_end() {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let yt = make_test_data(100, 12, 2, 0.01, &mut rng);

        let model = RbfGplvm::params(2)
            .n_inducings(20)
            .max_iter(1000)
            .seed(Some(42))
            .fit(&DatasetBase::from(yt.clone()))
            .expect("GPLVM fitted");

        println!("{model}");
        println!("{}", model.outcome());

        assert!(model.elbo().is_finite());
        let (n, d, q, m) = model.dims();
        assert_eq!((n, d, q, m), (100, 12, 2, 20));

        // every variance-like parameter stays strictly positive
        assert!(model.variance() > 0.);
        assert!(model.noise_variance() > 0.);
        assert!(model.lengthscales().iter().all(|v| *v > 0.));
        assert!(model.latent_variances().iter().all(|v| *v > 0.));

        // stopping condition is either convergence or budget exhaustion
        let outcome = model.outcome();
        assert!(outcome.converged || outcome.n_iter >= 1000);
        assert!(outcome.final_cost.is_finite());

        let test_dir = "target/tests";
        std::fs::create_dir_all(test_dir).ok();
        write_npy(format!("{test_dir}/gplvm_yt.npy"), &yt).expect("yt saved");
        write_npy(format!("{test_dir}/gplvm_x.npy"), model.latent_means()).expect("x saved");
        write_npy(format!("{test_dir}/gplvm_z.npy"), model.inducings()).expect("z saved");
    }

    #[test]
    fn test_bound_improves_over_initialization() {
        let mut rng = Xoshiro256Plus::seed_from_u64(1);
        let yt = make_test_data(40, 6, 2, 0.05, &mut rng);
        let (yc, _) = crate::utils::center(&yt);

        // fully explicit initial state so the initial bound is reproducible
        let means0 = crate::utils::pca_scores(&yc, 2).unwrap();
        let variances0 = Array2::from_elem((40, 2), 0.1);
        let z0 = means0.slice(ndarray::s![..10, ..]).to_owned();
        let posterior0 = crate::variational::LatentPosterior::new(
            means0.clone(),
            variances0.clone(),
        )
        .unwrap();
        let kern = SquaredExponentialKernel::default();
        let nugget = 1e-6;
        let initial = crate::elbo::evidence_lower_bound(
            &kern,
            &yc,
            &posterior0,
            &z0,
            1.,
            &ndarray::array![1., 1.],
            1e-2,
            nugget,
        )
        .unwrap();

        let model = Gplvm::<f64, SquaredExponentialKernel>::params(kern, 2)
            .latent_init(LatentInit::Located(means0))
            .inducings(z0)
            .max_iter(300)
            .fit(&DatasetBase::from(yt))
            .expect("GPLVM fitted");

        assert!(
            model.elbo() >= initial,
            "bound decreased: {} < {}",
            model.elbo(),
            initial
        );
    }

    #[test]
    fn test_labels_do_not_influence_training() {
        let mut rng = Xoshiro256Plus::seed_from_u64(3);
        let yt = make_test_data(25, 5, 2, 0.05, &mut rng);
        let labels = Array::from_iter((0..25).map(|i| i % 3));

        let params = || {
            Gplvm::<f64, SquaredExponentialKernel>::params(SquaredExponentialKernel::default(), 2)
                .n_inducings(8)
                .max_iter(100)
                .seed(Some(0))
        };
        let unlabeled = params().fit(&DatasetBase::from(yt.clone())).unwrap();
        let labeled = params().fit(&Dataset::new(yt, labels)).unwrap();

        assert_abs_diff_eq!(
            unlabeled.latent_means(),
            labeled.latent_means(),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(unlabeled.elbo(), labeled.elbo(), epsilon = 1e-12);
    }

    #[test]
    fn test_single_observation() {
        // degenerate n=1 case must not produce NaN
        let yt = Array2::from_shape_vec((1, 3), vec![0.3, -0.2, 1.1]).unwrap();
        let model = RbfGplvm::<f64>::params(1)
            .n_inducings(1)
            .max_iter(50)
            .seed(Some(7))
            .fit(&DatasetBase::from(yt))
            .expect("GPLVM fitted");
        assert!(model.elbo().is_finite());
        assert!(model.latent().kl_divergence().is_finite());
    }

    #[test]
    fn test_latent_dim_larger_than_data_rejected() {
        let yt = Array2::<f64>::zeros((10, 2));
        let res = RbfGplvm::params(5)
            .fit(&DatasetBase::from(yt));
        assert!(res.is_err());
    }

    #[test]
    fn test_fixed_noise_is_not_estimated() {
        let mut rng = Xoshiro256Plus::seed_from_u64(5);
        let yt = make_test_data(20, 4, 2, 0.05, &mut rng);
        let model = RbfGplvm::params(2)
            .n_inducings(6)
            .noise_variance(ParamTuning::Fixed(0.01))
            .max_iter(100)
            .seed(Some(5))
            .fit(&DatasetBase::from(yt))
            .unwrap();
        assert_abs_diff_eq!(model.noise_variance(), 0.01, epsilon = 1e-15);
    }

    #[test]
    fn test_relevance_prunes_spurious_dimension() {
        // data generated from a single latent direction: with two latent
        // dimensions available, ARD should weight one of them much higher
        let mut rng = Xoshiro256Plus::seed_from_u64(11);
        let yt = make_test_data(60, 8, 1, 0.01, &mut rng);
        let model = RbfGplvm::params(2)
            .n_inducings(15)
            .max_iter(500)
            .seed(Some(11))
            .fit(&DatasetBase::from(yt))
            .unwrap();
        let r = model.relevance();
        let hi = r[r.argmax().unwrap()];
        let lo = r[r.argmin().unwrap()];
        assert!(
            hi > 1.5 * lo,
            "expected one dominant latent dimension, got {r}"
        );
    }

    #[test]
    fn test_param_summary_covers_every_block() {
        let mut rng = Xoshiro256Plus::seed_from_u64(9);
        let yt = make_test_data(15, 4, 2, 0.05, &mut rng);
        let model = RbfGplvm::params(2)
            .n_inducings(5)
            .max_iter(30)
            .seed(Some(9))
            .fit(&DatasetBase::from(yt))
            .unwrap();

        let summary = model.param_summary();
        let names: Vec<_> = summary.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                "latent/mean",
                "latent/variance",
                "inducings",
                "kernel/lengthscales",
                "kernel/variance",
                "likelihood/variance"
            ]
        );
        for block in &summary {
            assert_eq!(
                block.value.len(),
                block.shape.iter().product::<usize>().max(1)
            );
            if block.constraint == "positive" {
                assert!(block.value.iter().all(|v| *v > 0.));
            }
        }
        // centering offset is exposed for reporting collaborators
        assert_eq!(model.offset().len(), 4);
        assert_abs_diff_eq!(
            model.offset(),
            &model.training_data.mean_axis(Axis(0)).unwrap(),
            epsilon = 1e-12
        );
    }
}
