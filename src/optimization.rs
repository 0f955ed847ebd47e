//! A module driving the maximization of the evidence lower bound with a
//! limited-memory BFGS optimizer.
//!
//! The optimizer only ever sees one flat unconstrained vector; the layout
//! and the positivity transforms live here. Failed bound evaluations return
//! an infinite cost so the line search rejects the step instead of crashing.

use crate::elbo::{evidence_lower_bound, evidence_lower_bound_with_grads};
use crate::errors::{GplvmError, Result};
use crate::kernels::LatentKernel;
use crate::transforms::Positive;
use crate::variational::LatentPosterior;
use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use linfa::Float;
use ndarray::{Array1, Array2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};

/// Tunings of the L-BFGS driver
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct LbfgsParams {
    /// Iteration budget
    pub max_iter: u64,
    /// Convergence tolerance on the gradient norm
    pub gtol: f64,
    /// Convergence tolerance on the cost decrease
    pub ftol: f64,
    /// Number of corrections kept to approximate the inverse Hessian
    pub memory: usize,
}

impl Default for LbfgsParams {
    fn default() -> Self {
        LbfgsParams {
            max_iter: 1000,
            gtol: 1e-5,
            ftol: 1e-9,
            memory: 10,
        }
    }
}

/// Report of one optimization run.
///
/// Running out of budget is a reported status, not an error.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct FitOutcome {
    /// Whether the stopping condition was convergence (budget exhaustion otherwise)
    pub converged: bool,
    /// Number of iterations run
    pub n_iter: u64,
    /// Number of bound evaluations
    pub n_fev: usize,
    /// Number of gradient evaluations
    pub n_gev: usize,
    /// Final cost (negative bound) value
    pub final_cost: f64,
    /// Termination message from the solver
    pub message: String,
}

impl fmt::Display for FitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FitOutcome(converged={}, n_iter={}, n_fev={}, n_gev={}, final_cost={:.6})",
            self.converged, self.n_iter, self.n_fev, self.n_gev, self.final_cost
        )
    }
}

/// Positions of the parameter blocks inside the flat unconstrained vector:
/// `[means, variances, inducings, lengthscales, variance, noise?]` with the
/// noise slot present only when the noise variance is estimated.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ParamLayout {
    pub n: usize,
    pub q: usize,
    pub m: usize,
    pub noise_estimated: bool,
}

impl ParamLayout {
    pub fn len(&self) -> usize {
        2 * self.n * self.q + self.m * self.q + self.q + 1 + self.noise_estimated as usize
    }

    /// Map constrained model values into the flat unconstrained vector.
    #[allow(clippy::too_many_arguments)]
    pub fn pack<F: Float>(
        &self,
        means: &Array2<F>,
        variances: &Array2<F>,
        z: &Array2<F>,
        lengthscales: &Array1<F>,
        variance: F,
        noise: F,
        transform: &Positive<F>,
    ) -> Result<Vec<f64>> {
        let mut p = Vec::with_capacity(self.len());
        p.extend(means.iter().map(into_f64));
        for v in variances.iter() {
            p.push(into_f64(&transform.inverse(*v)?));
        }
        p.extend(z.iter().map(into_f64));
        for v in lengthscales.iter() {
            p.push(into_f64(&transform.inverse(*v)?));
        }
        p.push(into_f64(&transform.inverse(variance)?));
        if self.noise_estimated {
            p.push(into_f64(&transform.inverse(noise)?));
        }
        Ok(p)
    }

    /// Split the flat vector back into constrained model values.
    ///
    /// `fixed_noise` is used when the noise variance has no slot in the vector.
    #[allow(clippy::type_complexity)]
    pub fn unpack<F: Float>(
        &self,
        p: &[f64],
        transform: &Positive<F>,
        fixed_noise: F,
    ) -> (LatentPosterior<F>, Array2<F>, Array1<F>, F, F) {
        let ParamLayout { n, q, m, .. } = *self;
        let (means_p, rest) = p.split_at(n * q);
        let (variances_p, rest) = rest.split_at(n * q);
        let (z_p, rest) = rest.split_at(m * q);
        let (lengthscales_p, rest) = rest.split_at(q);

        let means =
            Array2::from_shape_vec((n, q), means_p.iter().map(|v| F::cast(*v)).collect()).unwrap();
        let variances = Array2::from_shape_vec(
            (n, q),
            variances_p
                .iter()
                .map(|v| transform.forward(F::cast(*v)))
                .collect(),
        )
        .unwrap();
        let z = Array2::from_shape_vec((m, q), z_p.iter().map(|v| F::cast(*v)).collect()).unwrap();
        let lengthscales = Array1::from_vec(
            lengthscales_p
                .iter()
                .map(|v| transform.forward(F::cast(*v)))
                .collect(),
        );
        let variance = transform.forward(F::cast(rest[0]));
        let noise = if self.noise_estimated {
            transform.forward(F::cast(rest[1]))
        } else {
            fixed_noise
        };
        // transform output is strictly positive, the posterior cannot be rejected
        let posterior = LatentPosterior::new(means, variances).unwrap();
        (posterior, z, lengthscales, variance, noise)
    }
}

#[derive(Default)]
struct FuncCounts {
    cost: AtomicUsize,
    grad: AtomicUsize,
}

/// Negative evidence lower bound as an `argmin` problem over the flat
/// unconstrained parameter vector.
pub(crate) struct BoundProblem<'a, F: Float, K: LatentKernel<F>> {
    pub kern: K,
    pub y: &'a Array2<F>,
    pub layout: ParamLayout,
    pub transform: Positive<F>,
    /// Noise variance value used when it is not estimated
    pub fixed_noise: F,
    pub nugget: F,
    counts: Arc<FuncCounts>,
}

impl<'a, F: Float, K: LatentKernel<F>> BoundProblem<'a, F, K> {
    pub fn new(
        kern: K,
        y: &'a Array2<F>,
        layout: ParamLayout,
        transform: Positive<F>,
        fixed_noise: F,
        nugget: F,
    ) -> Self {
        BoundProblem {
            kern,
            y,
            layout,
            transform,
            fixed_noise,
            nugget,
            counts: Arc::new(FuncCounts::default()),
        }
    }

    /// Split the flat vector back into constrained model values.
    #[allow(clippy::type_complexity)]
    pub fn unpack(&self, p: &[f64]) -> (LatentPosterior<F>, Array2<F>, Array1<F>, F, F) {
        self.layout.unpack(p, &self.transform, self.fixed_noise)
    }
}

impl<F: Float, K: LatentKernel<F>> CostFunction for BoundProblem<'_, F, K> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, p: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        self.counts.cost.fetch_add(1, Ordering::Relaxed);
        for v in p.iter() {
            // the optimizer may probe nan values, shortcut to the worst cost
            if v.is_nan() {
                return Ok(f64::INFINITY);
            }
        }
        let (posterior, z, lengthscales, variance, noise) = self.unpack(p);
        match evidence_lower_bound(
            &self.kern,
            self.y,
            &posterior,
            &z,
            variance,
            &lengthscales,
            noise,
            self.nugget,
        ) {
            Ok(value) => Ok(-into_f64(&value)),
            Err(e) => {
                warn!("Bound evaluation rejected: {e}");
                Ok(f64::INFINITY)
            }
        }
    }
}

impl<F: Float, K: LatentKernel<F>> Gradient for BoundProblem<'_, F, K> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(
        &self,
        p: &Self::Param,
    ) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        self.counts.grad.fetch_add(1, Ordering::Relaxed);
        if p.iter().any(|v| v.is_nan()) {
            return Ok(vec![0.; p.len()]);
        }
        let (posterior, z, lengthscales, variance, noise) = self.unpack(p);
        let grads = match evidence_lower_bound_with_grads(
            &self.kern,
            self.y,
            &posterior,
            &z,
            variance,
            &lengthscales,
            noise,
            self.nugget,
        ) {
            Ok((_, grads)) => grads,
            Err(e) => {
                warn!("Gradient evaluation rejected: {e}");
                return Ok(vec![0.; p.len()]);
            }
        };

        // negate for minimization, chain positive parameters through the transform
        let ParamLayout { n, q, .. } = self.layout;
        let mut g = Vec::with_capacity(p.len());
        g.extend(grads.dmeans.iter().map(|v| -into_f64(v)));
        for (i, v) in grads.dvariances.iter().enumerate() {
            let raw = F::cast(p[n * q + i]);
            g.push(-into_f64(v) * into_f64(&self.transform.forward_grad(raw)));
        }
        g.extend(grads.dinducings.iter().map(|v| -into_f64(v)));
        let mut at = 2 * n * q + self.layout.m * q;
        for v in grads.dlengthscales.iter() {
            let raw = F::cast(p[at]);
            g.push(-into_f64(v) * into_f64(&self.transform.forward_grad(raw)));
            at += 1;
        }
        let raw = F::cast(p[at]);
        g.push(-into_f64(&grads.dvariance) * into_f64(&self.transform.forward_grad(raw)));
        at += 1;
        if self.layout.noise_estimated {
            let raw = F::cast(p[at]);
            g.push(-into_f64(&grads.dnoise) * into_f64(&self.transform.forward_grad(raw)));
        }
        Ok(g)
    }
}

/// Minimize the negative bound with L-BFGS starting from `init`.
///
/// Returns the best parameter vector and the run outcome.
pub(crate) fn minimize_bound<F: Float, K: LatentKernel<F>>(
    problem: BoundProblem<'_, F, K>,
    init: Vec<f64>,
    opts: &LbfgsParams,
) -> Result<(Vec<f64>, FitOutcome)> {
    let counts = problem.counts.clone();

    let linesearch = MoreThuenteLineSearch::new();
    let solver = LBFGS::new(linesearch, opts.memory)
        .with_tolerance_grad(opts.gtol)
        .map_err(|e| GplvmError::InvalidValueError(format!("Bad gradient tolerance: {e}")))?
        .with_tolerance_cost(opts.ftol)
        .map_err(|e| GplvmError::InvalidValueError(format!("Bad cost tolerance: {e}")))?;

    let now = Instant::now();
    let res = Executor::new(problem, solver)
        .configure(|state| state.param(init).max_iters(opts.max_iter))
        .run()
        .map_err(|e| GplvmError::EvidenceComputationError(format!("Optimization failed: {e}")))?;
    debug!("elapsed optim = {:?}", now.elapsed().as_millis());

    let state = res.state();
    let best = state
        .get_best_param()
        .ok_or_else(|| {
            GplvmError::EvidenceComputationError("No best parameters found".to_string())
        })?
        .clone();
    let final_cost = state.get_best_cost();
    if !final_cost.is_finite() {
        return Err(GplvmError::EvidenceComputationError(format!(
            "Non finite best cost: {final_cost}"
        )));
    }

    let termination = state.get_termination_status();
    let converged = matches!(
        termination,
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
            | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
    );
    let outcome = FitOutcome {
        converged,
        n_iter: state.get_iter(),
        n_fev: counts.cost.load(Ordering::Relaxed),
        n_gev: counts.grad.load(Ordering::Relaxed),
        final_cost,
        message: termination.to_string(),
    };
    Ok((best, outcome))
}

#[inline(always)]
pub(crate) fn into_f64<F: Float>(v: &F) -> f64 {
    unsafe { *(v as *const F as *const f64) }
}
