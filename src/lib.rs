//! This library implements the Bayesian
//! [Gaussian Process Latent Variable Model](https://proceedings.mlr.press/v9/titsias10a.html)
//! (GPLVM) for unsupervised dimensionality reduction: observed data in D
//! dimensions is explained by Gaussian processes over an unobserved latent
//! space of dimension Q with Q < D.
//!
//! Inference is sparse and variational: a set of M inducing points keeps the
//! cost of one training step in O(N.M^2) instead of O(N^3) where N is the
//! number of observations, and the latent inputs carry a factorized Gaussian
//! posterior whose divergence from the standard normal prior regularizes the
//! embedding. Kernel hyperparameters use one lengthscale per latent dimension
//! (automatic relevance determination), so superfluous latent dimensions are
//! pruned by the optimization itself.
//!
//! The model is implemented by [Gplvm] parameterized by [GplvmParams].
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
mod elbo;
mod errors;
pub mod kernels;
mod variational;

mod parameters;
mod transforms;
mod utils;

mod optimization;

pub use algorithm::*;
pub use elbo::*;
pub use errors::*;
pub use kernels::{LatentKernel, SquaredExponentialKernel};
pub use optimization::{FitOutcome, LbfgsParams};
pub use parameters::*;
pub use transforms::Positive;
pub use utils::pca_scores;
pub use variational::*;
