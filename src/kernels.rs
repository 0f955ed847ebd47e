//! A module for covariance kernels over the latent space.
//!
//! Kernels used by the latent variable model have to provide, besides the
//! usual Gram matrix evaluation, the closed-form expectations of the kernel
//! under the Gaussian variational posterior of the latent inputs (the psi
//! statistics) together with an analytic backward pass. Only the ARD squared
//! exponential kernel is implemented: it is the kernel for which all three
//! expectations are available in closed form.

use crate::utils::pairwise_differences;
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use rayon::prelude::*;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

/// Expectations of the kernel under the latent variational posterior.
#[derive(Debug, Clone)]
pub struct PsiStats<F: Float> {
    /// Sum over data points of the expected kernel diagonal (scalar)
    pub psi0: F,
    /// Expected cross covariance between data latents and inducing inputs (n, m)
    pub psi1: Array2<F>,
    /// Sum over data points of the expected inducing outer product (m, m)
    pub psi2: Array2<F>,
}

/// Partial derivatives of the bound w.r.t. the kernel-dependent matrices,
/// fed to [`LatentKernel::psi_backward`].
#[derive(Debug, Clone)]
pub struct BoundPartials<F: Float> {
    /// d bound / d psi0
    pub dpsi0: F,
    /// d bound / d psi1 (n, m)
    pub dpsi1: Array2<F>,
    /// d bound / d psi2 (m, m)
    pub dpsi2: Array2<F>,
    /// d bound / d Kmm (m, m), nugget excluded
    pub dkmm: Array2<F>,
}

/// Gradients of the bound w.r.t. kernel inputs and hyperparameters, as
/// accumulated by the kernel backward pass.
#[derive(Debug, Clone)]
pub struct KernelGrads<F: Float> {
    /// w.r.t. latent means (n, q)
    pub dmeans: Array2<F>,
    /// w.r.t. latent variances (n, q)
    pub dvariances: Array2<F>,
    /// w.r.t. inducing inputs (m, q)
    pub dinducings: Array2<F>,
    /// w.r.t. kernel variance
    pub dvariance: F,
    /// w.r.t. lengthscales (q)
    pub dlengthscales: Array1<F>,
}

/// A trait for covariance kernels over uncertain (Gaussian) latent inputs.
pub trait LatentKernel<F: Float>: Clone + Copy + Default + fmt::Display + Sync {
    /// Compute the Gram matrix k(a, b) as an (nrows(a), nrows(b)) matrix
    /// given `variance` and per-dimension `lengthscales`.
    fn value(
        &self,
        a: &ArrayBase<impl Data<Elem = F>, Ix2>,
        b: &ArrayBase<impl Data<Elem = F>, Ix2>,
        variance: F,
        lengthscales: &Array1<F>,
    ) -> Array2<F>;

    /// Compute the psi statistics given the latent posterior `means` and
    /// `variances` (n, q) and the inducing inputs `z` (m, q).
    fn psi(
        &self,
        means: &Array2<F>,
        variances: &Array2<F>,
        z: &Array2<F>,
        variance: F,
        lengthscales: &Array1<F>,
    ) -> PsiStats<F>;

    /// Back-propagate bound partials through the psi statistics and the
    /// inducing Gram matrix onto kernel inputs and hyperparameters.
    fn psi_backward(
        &self,
        means: &Array2<F>,
        variances: &Array2<F>,
        z: &Array2<F>,
        variance: F,
        lengthscales: &Array1<F>,
        upstream: &BoundPartials<F>,
    ) -> KernelGrads<F>;
}

/// ARD squared exponential kernel
///
/// k(x, x') = variance * prod_q exp(-0.5 * (x_q - x'_q)^2 / lengthscale_q^2)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct SquaredExponentialKernel();

impl From<SquaredExponentialKernel> for String {
    fn from(_item: SquaredExponentialKernel) -> String {
        "SquaredExponential".to_string()
    }
}

impl TryFrom<String> for SquaredExponentialKernel {
    type Error = &'static str;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s == "SquaredExponential" {
            Ok(Self::default())
        } else {
            Err("Bad string value for SquaredExponentialKernel, should be \'SquaredExponential\'")
        }
    }
}

impl fmt::Display for SquaredExponentialKernel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SquaredExponential")
    }
}

impl<F: Float> LatentKernel<F> for SquaredExponentialKernel {
    fn value(
        &self,
        a: &ArrayBase<impl Data<Elem = F>, Ix2>,
        b: &ArrayBase<impl Data<Elem = F>, Ix2>,
        variance: F,
        lengthscales: &Array1<F>,
    ) -> Array2<F> {
        let lam = lengthscales.mapv(|v| v * v);
        let dx = pairwise_differences(a, b);
        let half = F::cast(0.5);
        let wsq = dx.mapv(|v| v * v).dot(&lam.mapv(|v| F::one() / v));
        wsq.mapv(|v| variance * F::exp(-half * v))
            .into_shape((a.nrows(), b.nrows()))
            .unwrap()
    }

    fn psi(
        &self,
        means: &Array2<F>,
        variances: &Array2<F>,
        z: &Array2<F>,
        variance: F,
        lengthscales: &Array1<F>,
    ) -> PsiStats<F> {
        let (n, q) = means.dim();
        let m = z.nrows();
        let lam = lengthscales.mapv(|v| v * v);

        let psi0 = F::cast(n) * variance;

        let mut psi1 = Array2::zeros((n, m));
        for i in 0..n {
            for j in 0..m {
                let mut t = variance;
                for k in 0..q {
                    let d1 = lam[k] + variances[[i, k]];
                    let diff = means[[i, k]] - z[[j, k]];
                    t = t * (lam[k] / d1).sqrt()
                        * F::exp(-diff * diff / (F::cast(2.) * d1));
                }
                psi1[[i, j]] = t;
            }
        }

        // pair factor independent of the data point
        let mut psi2 = Array2::zeros((m, m));
        let var2 = variance * variance;
        for a in 0..m {
            for b in a..m {
                let mut w = F::one();
                for k in 0..q {
                    let dz = z[[a, k]] - z[[b, k]];
                    w = w * F::exp(-dz * dz / (F::cast(4.) * lam[k]));
                }
                let mut acc = F::zero();
                for i in 0..n {
                    let mut h = F::one();
                    for k in 0..q {
                        let d2 = lam[k] + F::cast(2.) * variances[[i, k]];
                        let zbar = (z[[a, k]] + z[[b, k]]) / F::cast(2.);
                        let dm = means[[i, k]] - zbar;
                        h = h * (lam[k] / d2).sqrt() * F::exp(-dm * dm / d2);
                    }
                    acc += h;
                }
                let v = var2 * w * acc;
                psi2[[a, b]] = v;
                psi2[[b, a]] = v;
            }
        }

        PsiStats { psi0, psi1, psi2 }
    }

    fn psi_backward(
        &self,
        means: &Array2<F>,
        variances: &Array2<F>,
        z: &Array2<F>,
        variance: F,
        lengthscales: &Array1<F>,
        upstream: &BoundPartials<F>,
    ) -> KernelGrads<F> {
        let (n, q) = means.dim();
        let m = z.nrows();
        let lam = lengthscales.mapv(|v| v * v);
        let half = F::cast(0.5);
        let two = F::cast(2.);

        let mut dmeans = Array2::zeros((n, q));
        let mut dvariances = Array2::zeros((n, q));
        let mut dinducings = Array2::zeros((m, q));
        let mut dlam = Array1::zeros(q);
        let mut dvariance = F::zero();

        // psi0 = n * variance
        dvariance += upstream.dpsi0 * F::cast(n);

        // Gram matrix at the inducing inputs (nugget excluded)
        let kmm = self.value(z, z, variance, lengthscales);
        for a in 0..m {
            for b in 0..m {
                let u = upstream.dkmm[[a, b]] * kmm[[a, b]];
                dvariance += u / variance;
                for k in 0..q {
                    let dz = z[[a, k]] - z[[b, k]];
                    // both argument slots of the Gram entry depend on z
                    dinducings[[a, k]] -= u * dz / lam[k];
                    dinducings[[b, k]] += u * dz / lam[k];
                    dlam[k] += u * dz * dz / (two * lam[k] * lam[k]);
                }
            }
        }

        // psi1 and psi2 chains, accumulated per data point
        let var2 = variance * variance;
        let folded = (0..n)
            .into_par_iter()
            .map(|i| {
                let mut dmu_i = Array1::<F>::zeros(q);
                let mut ds_i = Array1::<F>::zeros(q);
                let mut dz_i = Array2::<F>::zeros((m, q));
                let mut dlam_i = Array1::<F>::zeros(q);
                let mut dvar_i = F::zero();

                for j in 0..m {
                    let mut p = variance;
                    for k in 0..q {
                        let d1 = lam[k] + variances[[i, k]];
                        let diff = means[[i, k]] - z[[j, k]];
                        p = p * (lam[k] / d1).sqrt() * F::exp(-diff * diff / (two * d1));
                    }
                    let u = upstream.dpsi1[[i, j]] * p;
                    dvar_i += u / variance;
                    for k in 0..q {
                        let d1 = lam[k] + variances[[i, k]];
                        let diff = means[[i, k]] - z[[j, k]];
                        dmu_i[k] -= u * diff / d1;
                        dz_i[[j, k]] += u * diff / d1;
                        ds_i[k] += u * (diff * diff / (two * d1 * d1) - half / d1);
                        dlam_i[k] += u
                            * (variances[[i, k]] / (two * lam[k] * d1)
                                + diff * diff / (two * d1 * d1));
                    }
                }

                for a in 0..m {
                    for b in 0..m {
                        let mut g = var2;
                        for k in 0..q {
                            let dz = z[[a, k]] - z[[b, k]];
                            let d2 = lam[k] + two * variances[[i, k]];
                            let zbar = (z[[a, k]] + z[[b, k]]) / two;
                            let dm = means[[i, k]] - zbar;
                            g = g
                                * (lam[k] / d2).sqrt()
                                * F::exp(-dz * dz / (F::cast(4.) * lam[k]) - dm * dm / d2);
                        }
                        let u = upstream.dpsi2[[a, b]] * g;
                        dvar_i += two * u / variance;
                        for k in 0..q {
                            let dz = z[[a, k]] - z[[b, k]];
                            let d2 = lam[k] + two * variances[[i, k]];
                            let zbar = (z[[a, k]] + z[[b, k]]) / two;
                            let dm = means[[i, k]] - zbar;
                            dmu_i[k] -= u * two * dm / d2;
                            ds_i[k] += u * (two * dm * dm / (d2 * d2) - F::one() / d2);
                            dz_i[[a, k]] += u * (dm / d2 - dz / (two * lam[k]));
                            dz_i[[b, k]] += u * (dm / d2 + dz / (two * lam[k]));
                            dlam_i[k] += u
                                * (variances[[i, k]] / (lam[k] * d2)
                                    + dz * dz / (F::cast(4.) * lam[k] * lam[k])
                                    + dm * dm / (d2 * d2));
                        }
                    }
                }

                (i, dmu_i, ds_i, dz_i, dlam_i, dvar_i)
            })
            .collect::<Vec<_>>();

        for (i, dmu_i, ds_i, dz_i, dlam_i, dvar_i) in folded {
            dmeans.row_mut(i).assign(&dmu_i);
            dvariances.row_mut(i).assign(&ds_i);
            dinducings += &dz_i;
            dlam += &dlam_i;
            dvariance += dvar_i;
        }

        // chain lam = lengthscale^2
        let dlengthscales = (dlam * lengthscales).mapv(|v| two * v);

        KernelGrads {
            dmeans,
            dvariances,
            dinducings,
            dvariance,
            dlengthscales,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use linfa_linalg::eigh::*;
    use ndarray::{array, Array};
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use ndarray_rand::rand::SeedableRng;
    use rand_xoshiro::Xoshiro256Plus;

    #[test]
    fn test_gram_symmetric_and_psd() {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let x = Array::random_using((12, 3), Uniform::new(-2., 2.), &mut rng);
        let kern = SquaredExponentialKernel::default();
        let gram = kern.value(&x, &x, 1.5, &array![0.7, 1.3, 0.4]);

        assert_abs_diff_eq!(gram, gram.t().to_owned(), epsilon = 1e-12);
        let (eigs, _) = gram.eigh_into().unwrap();
        for e in eigs.iter() {
            assert!(*e > -1e-9, "negative eigenvalue {e}");
        }
    }

    #[test]
    fn test_gram_diag_is_variance() {
        let x = array![[0.3, -1.2], [2.0, 0.1]];
        let kern = SquaredExponentialKernel::default();
        let gram = kern.value(&x, &x, 2.5, &array![1., 1.]);
        assert_abs_diff_eq!(gram[[0, 0]], 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(gram[[1, 1]], 2.5, epsilon = 1e-12);
    }

    #[test]
    fn test_psi_reduce_to_kernel_at_zero_variance() {
        // with vanishing latent variance the expectations collapse onto
        // plain kernel evaluations at the means
        let mut rng = Xoshiro256Plus::seed_from_u64(0);
        let means = Array::random_using((7, 2), Uniform::new(-1., 1.), &mut rng);
        let variances = Array2::from_elem((7, 2), 1e-12);
        let z = Array::random_using((4, 2), Uniform::new(-1., 1.), &mut rng);
        let ell = array![0.9, 1.4];

        let kern = SquaredExponentialKernel::default();
        let stats = kern.psi(&means, &variances, &z, 1.2, &ell);
        let knm = kern.value(&means, &z, 1.2, &ell);

        assert_abs_diff_eq!(stats.psi0, 7. * 1.2, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.psi1, knm, epsilon = 1e-8);
        assert_abs_diff_eq!(stats.psi2, knm.t().dot(&knm), epsilon = 1e-8);
    }

    /// Pack every kernel input into one flat vector and contract the psi
    /// statistics against fixed upstream weights, giving a scalar objective
    /// whose gradient is checked against central finite differences.
    #[test]
    fn test_psi_backward_matches_finite_differences() {
        let n = 5;
        let m = 3;
        let q = 2;
        let mut rng = Xoshiro256Plus::seed_from_u64(7);
        let means = Array::random_using((n, q), Uniform::new(-1., 1.), &mut rng);
        let variances = Array::random_using((n, q), Uniform::new(0.05, 0.5), &mut rng);
        let z = Array::random_using((m, q), Uniform::new(-1., 1.), &mut rng);
        let ell = array![0.8, 1.3];
        let variance = 1.4;

        let upstream = BoundPartials {
            dpsi0: 0.3,
            dpsi1: Array::random_using((n, m), Uniform::new(-1., 1.), &mut rng),
            dpsi2: {
                let a: Array2<f64> = Array::random_using((m, m), Uniform::new(-1., 1.), &mut rng);
                (&a + &a.t()).mapv(|v| 0.5 * v)
            },
            dkmm: {
                let a: Array2<f64> = Array::random_using((m, m), Uniform::new(-1., 1.), &mut rng);
                (&a + &a.t()).mapv(|v| 0.5 * v)
            },
        };

        let kern = SquaredExponentialKernel::default();
        let pack = |means: &Array2<f64>,
                    variances: &Array2<f64>,
                    z: &Array2<f64>,
                    ell: &Array1<f64>,
                    variance: f64| {
            let mut v = Vec::new();
            v.extend(means.iter());
            v.extend(variances.iter());
            v.extend(z.iter());
            v.extend(ell.iter());
            v.push(variance);
            Array1::from_vec(v)
        };
        let x0 = pack(&means, &variances, &z, &ell, variance);

        let objective = |x: &Array1<f64>| -> f64 {
            let mut at = 0;
            let mut take = |len: usize| {
                let s = x.slice(ndarray::s![at..at + len]).to_owned();
                at += len;
                s
            };
            let means = take(n * q).into_shape((n, q)).unwrap();
            let variances = take(n * q).into_shape((n, q)).unwrap();
            let z = take(m * q).into_shape((m, q)).unwrap();
            let ell = take(q);
            let variance = take(1)[0];

            let stats = kern.psi(&means, &variances, &z, variance, &ell);
            let kmm = kern.value(&z, &z, variance, &ell);
            upstream.dpsi0 * stats.psi0
                + (&upstream.dpsi1 * &stats.psi1).sum()
                + (&upstream.dpsi2 * &stats.psi2).sum()
                + (&upstream.dkmm * &kmm).sum()
        };

        let numeric = x0.central_diff(&objective);
        let grads = kern.psi_backward(&means, &variances, &z, variance, &ell, &upstream);
        let analytic = pack(
            &grads.dmeans,
            &grads.dvariances,
            &grads.dinducings,
            &grads.dlengthscales,
            grads.dvariance,
        );

        assert_abs_diff_eq!(analytic, numeric, epsilon = 1e-5);
    }
}
