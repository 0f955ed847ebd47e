use crate::errors::Result;
use linfa::Float;
use linfa_linalg::eigh::*;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix2};

/// Computes differences between each element of x and each element of y
/// resulting in a 2d array of shape (nrows(x) * nrows(y), ncols(x));
/// *Panics* if x and y have not the same column numbers
pub fn pairwise_differences<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    y: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Array2<F> {
    assert!(x.ncols() == y.ncols());

    let nx = x.nrows();
    let ny = y.nrows();
    let ncols = x.ncols();
    let mut result = Array2::zeros((nx * ny, ncols));

    for (i, x_row) in x.rows().into_iter().enumerate() {
        for (j, y_row) in y.rows().into_iter().enumerate() {
            let idx = i * ny + j;
            for k in 0..ncols {
                result[[idx, k]] = x_row[k] - y_row[k];
            }
        }
    }

    result
}

/// Remove the column means of `y`, returning the centered data and the mean vector.
pub fn center<F: Float>(
    y: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> (Array2<F>, Array1<F>) {
    let y_mean = y.mean_axis(Axis(0)).unwrap();
    let centered = y - &y_mean;
    (centered, y_mean)
}

/// Project centered data onto its `q` leading principal axes.
///
/// Eigendecomposition of the sample covariance gives the principal axes;
/// scores are rescaled to unit column variance so they are commensurate with
/// a standard normal prior over the latent space.
pub fn pca_scores<F: Float>(
    y_centered: &ArrayBase<impl Data<Elem = F>, Ix2>,
    q: usize,
) -> Result<Array2<F>> {
    let n = y_centered.nrows();
    let denom = F::cast((n - 1).max(1));
    let cov = y_centered.t().dot(y_centered).mapv(|v| v / denom);
    let (vals, vecs) = cov.eigh_into()?;

    // select the q largest eigenvalues
    let mut order: Vec<usize> = (0..vals.len()).collect();
    order.sort_by(|&a, &b| vals[b].partial_cmp(&vals[a]).unwrap());

    let mut axes = Array2::zeros((y_centered.ncols(), q));
    for (j, &i) in order.iter().take(q).enumerate() {
        axes.column_mut(j).assign(&vecs.column(i));
    }

    let mut scores = y_centered.dot(&axes);
    if n > 1 {
        for mut col in scores.columns_mut() {
            let std = col.std(F::one());
            if std > F::zero() {
                col.mapv_inplace(|v| v / std);
            }
        }
    }
    Ok(scores)
}
