use criterion::{criterion_group, criterion_main, Criterion};
use gplvm::{
    evidence_lower_bound, evidence_lower_bound_with_grads, LatentPosterior,
    SquaredExponentialKernel,
};
use ndarray::{Array, Array1, Array2};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;

#[allow(clippy::type_complexity)]
fn make_instance(
    n: usize,
    d: usize,
    q: usize,
    m: usize,
) -> (
    Array2<f64>,
    LatentPosterior<f64>,
    Array2<f64>,
    Array1<f64>,
) {
    let mut rng = Xoshiro256Plus::seed_from_u64(42);
    let y = Array::random_using((n, d), Normal::new(0., 1.).unwrap(), &mut rng);
    let means = Array::random_using((n, q), Uniform::new(-1., 1.), &mut rng);
    let variances = Array2::from_elem((n, q), 0.1);
    let z = Array::random_using((m, q), Uniform::new(-1., 1.), &mut rng);
    let lengthscales = Array1::from_elem(q, 1.);
    let posterior = LatentPosterior::new(means, variances).unwrap();
    (y, posterior, z, lengthscales)
}

fn criterion_elbo(c: &mut Criterion) {
    let kern = SquaredExponentialKernel::default();
    let mut group = c.benchmark_group("elbo");
    group.sample_size(20);

    for (n, d, q, m) in [(100, 12, 2, 20), (400, 12, 3, 50)] {
        let (y, posterior, z, ell) = make_instance(n, d, q, m);

        group.bench_function(format!("bound {n}x{d} q={q} m={m}"), |b| {
            b.iter(|| {
                std::hint::black_box(
                    evidence_lower_bound(&kern, &y, &posterior, &z, 1., &ell, 1e-2, 1e-6)
                        .unwrap(),
                )
            })
        });
        group.bench_function(format!("bound+grads {n}x{d} q={q} m={m}"), |b| {
            b.iter(|| {
                std::hint::black_box(
                    evidence_lower_bound_with_grads(&kern, &y, &posterior, &z, 1., &ell, 1e-2, 1e-6)
                        .unwrap(),
                )
            })
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_elbo);
criterion_main!(benches);
