//! A module for the collapsed evidence lower bound of the latent variable
//! model and its analytic gradients.
//!
//! The optimal distribution over the inducing outputs is marginalized out in
//! closed form, so the bound only depends on the latent posterior, the
//! inducing inputs and the hyperparameters. All solves go through Cholesky
//! factorizations of the inducing system; an ill-conditioned system surfaces
//! as a linear algebra error instead of silently propagating NaN.

use crate::errors::{GplvmError, Result};
use crate::kernels::{BoundPartials, LatentKernel};
use crate::variational::LatentPosterior;
use linfa::Float;
use linfa_linalg::{cholesky::*, triangular::*};
use ndarray::{Array, Array1, Array2};

/// Gradients of the evidence lower bound w.r.t. every free parameter,
/// expressed in the constrained (model) space.
#[derive(Debug, Clone)]
pub struct ElboGrads<F: Float> {
    /// w.r.t. latent posterior means (n, q)
    pub dmeans: Array2<F>,
    /// w.r.t. latent posterior variances (n, q)
    pub dvariances: Array2<F>,
    /// w.r.t. inducing inputs (m, q)
    pub dinducings: Array2<F>,
    /// w.r.t. kernel lengthscales (q)
    pub dlengthscales: Array1<F>,
    /// w.r.t. kernel variance
    pub dvariance: F,
    /// w.r.t. likelihood noise variance
    pub dnoise: F,
}

/// Factorized state of the inducing system shared by the bound value and its
/// gradients.
struct InducingSystem<F: Float> {
    psi0: F,
    psi1: Array2<F>,
    psi2: Array2<F>,
    /// inverse of Kmm (with nugget)
    kinv: Array2<F>,
    /// inverse of C = Kmm + beta * psi2
    cinv: Array2<F>,
    /// C^-1 psi1^T Y (m, d)
    q1: Array2<F>,
    /// log det of Kmm
    logdet_kmm: F,
    /// log det of C
    logdet_c: F,
}

fn factorize<F: Float, K: LatentKernel<F>>(
    kern: &K,
    y: &Array2<F>,
    posterior: &LatentPosterior<F>,
    z: &Array2<F>,
    variance: F,
    lengthscales: &Array1<F>,
    noise: F,
    nugget: F,
) -> Result<InducingSystem<F>> {
    let m = z.nrows();
    let beta = F::one() / noise;

    let stats = kern.psi(
        posterior.means(),
        posterior.variances(),
        z,
        variance,
        lengthscales,
    );
    let kmm = kern.value(z, z, variance, lengthscales) + Array::eye(m) * nugget;
    let c = &kmm + &stats.psi2.mapv(|v| v * beta);

    // Cholesky factorizations; failure is reported, never worked around
    let l = kmm.cholesky()?;
    let lc = c.cholesky()?;

    let li = l.solve_triangular(&Array::eye(m), UPLO::Lower)?;
    let lci = lc.solve_triangular(&Array::eye(m), UPLO::Lower)?;
    let kinv = li.t().dot(&li);
    let cinv = lci.t().dot(&lci);

    let e = stats.psi1.t().dot(y);
    let q1 = cinv.dot(&e);

    let two = F::cast(2.);
    let logdet_kmm = two * l.diag().mapv(|v| v.ln()).sum();
    let logdet_c = two * lc.diag().mapv(|v| v.ln()).sum();

    Ok(InducingSystem {
        psi0: stats.psi0,
        psi1: stats.psi1,
        psi2: stats.psi2,
        kinv,
        cinv,
        q1,
        logdet_kmm,
        logdet_c,
    })
}

fn bound_value<F: Float>(
    sys: &InducingSystem<F>,
    y: &Array2<F>,
    posterior: &LatentPosterior<F>,
    noise: F,
) -> F {
    let (n, d) = y.dim();
    let half = F::cast(0.5);
    let beta = F::one() / noise;
    let nd = F::cast(n * d);
    let d_out = F::cast(d);

    let tr_yy = y.mapv(|v| v * v).sum();
    let e = sys.psi1.t().dot(y);
    let tr_eq1 = (&e * &sys.q1).sum();
    let tr_kinv_psi2 = (&sys.kinv * &sys.psi2).sum();

    let two_pi = F::cast(2. * std::f64::consts::PI);
    let data_fit = half * nd * (beta.ln() - two_pi.ln()) - half * beta * tr_yy
        + half * beta * beta * tr_eq1;
    let logdet = -half * d_out * (sys.logdet_c - sys.logdet_kmm);
    let trace_correction = -half * d_out * beta * sys.psi0 + half * d_out * beta * tr_kinv_psi2;

    data_fit + logdet + trace_correction - posterior.kl_divergence()
}

/// Compute the evidence lower bound on the log marginal likelihood of `y`.
///
/// The optimizer maximizes this value by minimizing its negative.
#[allow(clippy::too_many_arguments)]
pub fn evidence_lower_bound<F: Float, K: LatentKernel<F>>(
    kern: &K,
    y: &Array2<F>,
    posterior: &LatentPosterior<F>,
    z: &Array2<F>,
    variance: F,
    lengthscales: &Array1<F>,
    noise: F,
    nugget: F,
) -> Result<F> {
    let sys = factorize(kern, y, posterior, z, variance, lengthscales, noise, nugget)?;
    let value = bound_value(&sys, y, posterior, noise);
    if !value.is_finite() {
        return Err(GplvmError::EvidenceComputationError(format!(
            "Non finite bound value: {value}"
        )));
    }
    Ok(value)
}

/// Compute the evidence lower bound together with its gradients w.r.t. all
/// free parameters.
#[allow(clippy::too_many_arguments)]
pub fn evidence_lower_bound_with_grads<F: Float, K: LatentKernel<F>>(
    kern: &K,
    y: &Array2<F>,
    posterior: &LatentPosterior<F>,
    z: &Array2<F>,
    variance: F,
    lengthscales: &Array1<F>,
    noise: F,
    nugget: F,
) -> Result<(F, ElboGrads<F>)> {
    let sys = factorize(kern, y, posterior, z, variance, lengthscales, noise, nugget)?;
    let value = bound_value(&sys, y, posterior, noise);
    if !value.is_finite() {
        return Err(GplvmError::EvidenceComputationError(format!(
            "Non finite bound value: {value}"
        )));
    }

    let (n, d) = y.dim();
    let half = F::cast(0.5);
    let beta = F::one() / noise;
    let d_out = F::cast(d);
    let nd = F::cast(n * d);

    let q1q1t = sys.q1.dot(&sys.q1.t());
    let kinv_psi2_kinv = sys.kinv.dot(&sys.psi2).dot(&sys.kinv);

    // partials w.r.t. the kernel-dependent matrices
    let dkmm = (sys.cinv.mapv(|v| -d_out * v) + sys.kinv.mapv(|v| d_out * v)
        - q1q1t.mapv(|v| beta * beta * v)
        - kinv_psi2_kinv.mapv(|v| d_out * beta * v))
    .mapv(|v| half * v);
    let dpsi2 = (sys.cinv.mapv(|v| -d_out * beta * v)
        - q1q1t.mapv(|v| beta * beta * beta * v)
        + sys.kinv.mapv(|v| d_out * beta * v))
    .mapv(|v| half * v);
    let dpsi1 = y.dot(&sys.q1.t()).mapv(|v| beta * beta * v);
    let dpsi0 = -half * d_out * beta;

    let kernel_grads = kern.psi_backward(
        posterior.means(),
        posterior.variances(),
        z,
        variance,
        lengthscales,
        &BoundPartials {
            dpsi0,
            dpsi1,
            dpsi2,
            dkmm,
        },
    );

    // partial w.r.t. the noise precision, then chained to the noise variance
    let e = sys.psi1.t().dot(y);
    let tr_yy = y.mapv(|v| v * v).sum();
    let tr_eq1 = (&e * &sys.q1).sum();
    let tr_cinv_psi2 = (&sys.cinv * &sys.psi2).sum();
    let tr_kinv_psi2 = (&sys.kinv * &sys.psi2).sum();
    let tr_q1_psi2_q1 = (&sys.psi2.dot(&sys.q1) * &sys.q1).sum();

    let dbeta = half * nd / beta - half * d_out * tr_cinv_psi2 - half * tr_yy + beta * tr_eq1
        - half * beta * beta * tr_q1_psi2_q1
        - half * d_out * sys.psi0
        + half * d_out * tr_kinv_psi2;
    let dnoise = -beta * beta * dbeta;

    // KL regularizer acts on the latent posterior only
    let (dkl_means, dkl_variances) = posterior.kl_gradients();

    let grads = ElboGrads {
        dmeans: kernel_grads.dmeans - dkl_means,
        dvariances: kernel_grads.dvariances - dkl_variances,
        dinducings: kernel_grads.dinducings,
        dlengthscales: kernel_grads.dlengthscales,
        dvariance: kernel_grads.dvariance,
        dnoise,
    };

    Ok((value, grads))
}
