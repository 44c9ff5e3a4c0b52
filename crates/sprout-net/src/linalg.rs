//! Dense linear algebra helpers used by the curvature estimator.
//!
//! All inverses here are SVD pseudo-inverses: rank-deficient moment
//! matrices are the normal case, not an error.

use nalgebra::DMatrix;
use sprout_core::SproutError;

/// Dense `f64` matrix, row-per-datum for batched data.
pub type Mat = DMatrix<f64>;

/// Relative cutoff below which singular values are treated as zero.
pub const PINV_RCOND: f64 = 1e-10;

/// Moore-Penrose pseudo-inverse via SVD.
///
/// Singular values below `PINV_RCOND * max_sv` are dropped.
///
/// # Example
///
/// ```
/// use sprout_net::linalg::{pinv, Mat};
///
/// // Rank-one matrix: pinv(M) M pinv(M) == pinv(M).
/// let m = Mat::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
/// let p = pinv(&m);
/// let back = &p * &m * &p;
/// assert!((back - &p).abs().max() < 1e-9);
/// ```
pub fn pinv(m: &Mat) -> Mat {
    let (rows, cols) = m.shape();
    if rows == 0 || cols == 0 {
        return Mat::zeros(cols, rows);
    }
    let svd = m.clone().svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Mat::zeros(cols, rows);
    };
    let max_sv = svd.singular_values.iter().cloned().fold(0.0, f64::max);
    let cutoff = (max_sv * PINV_RCOND).max(f64::MIN_POSITIVE);

    // pinv = V diag(1/s) U^T, summed over the kept singular triplets.
    let mut out = Mat::zeros(cols, rows);
    for (k, &sv) in svd.singular_values.iter().enumerate() {
        if sv > cutoff {
            let v_k = v_t.row(k).transpose();
            let u_k = u.column(k).transpose();
            out += (v_k * u_k) / sv;
        }
    }
    out
}

/// `m + strength * I`.
pub fn tikhonov(m: &Mat, strength: f64) -> Mat {
    let mut out = m.clone();
    for i in 0..out.nrows().min(out.ncols()) {
        out[(i, i)] += strength;
    }
    out
}

/// Mean of the diagonal, `tr(M) / n`. Zero for an empty matrix.
pub fn mean_diag(m: &Mat) -> f64 {
    let n = m.nrows().min(m.ncols());
    if n == 0 {
        return 0.0;
    }
    (0..n).map(|i| m[(i, i)]).sum::<f64>() / n as f64
}

/// Batch second moment `XᵀX / N` of row-per-datum data.
pub fn second_moment(x: &Mat) -> Mat {
    let n = x.nrows().max(1) as f64;
    x.tr_mul(x) / n
}

/// Batch cross moment `XᵀY / N`.
///
/// # Errors
///
/// Returns [`SproutError::Shape`] if the batch sizes differ.
pub fn cross_moment(x: &Mat, y: &Mat) -> Result<Mat, SproutError> {
    if x.nrows() != y.nrows() {
        return Err(SproutError::shape(format!(
            "cross moment over {} and {} rows",
            x.nrows(),
            y.nrows()
        )));
    }
    let n = x.nrows().max(1) as f64;
    Ok(x.tr_mul(y) / n)
}

/// `log det(KᵀK)` and its gradient `2 K (KᵀK)⁺` with respect to `K`.
///
/// The value is `2 Σ ln s_i` over the singular values of `K`, so a
/// degenerate kernel gives a very negative (but finite) value.
pub fn slogdet_gram(kernel: &Mat) -> (f64, Mat) {
    let sv = kernel.clone().singular_values();
    let value = 2.0 * sv.iter().map(|s| s.max(f64::MIN_POSITIVE).ln()).sum::<f64>();
    let gram = kernel.tr_mul(kernel);
    let grad = kernel * pinv(&gram) * 2.0;
    (value, grad)
}

/// Clips the singular values of a square kernel to at least `1e-3` times
/// their mean and returns the clipped kernel with its exact inverse.
///
/// An all-zero kernel is replaced by the identity.
///
/// # Errors
///
/// Returns [`SproutError::Shape`] for a non-square kernel.
pub fn make_invertible(kernel: &Mat) -> Result<(Mat, Mat), SproutError> {
    let (rows, cols) = kernel.shape();
    if rows != cols {
        return Err(SproutError::shape(format!(
            "cannot invert a {rows}x{cols} kernel"
        )));
    }
    let svd = kernel.clone().svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(SproutError::Internal {
            message: "svd did not return singular vectors".to_string(),
        });
    };
    let mean = svd.singular_values.mean();
    if !mean.is_finite() || mean <= 0.0 {
        return Ok((Mat::identity(rows, cols), Mat::identity(rows, cols)));
    }
    let floor = 1e-3 * mean;
    let clipped = svd.singular_values.map(|s| s.max(floor));
    let inv_s = clipped.map(|s| 1.0 / s);

    let w = &u * Mat::from_diagonal(&clipped) * &v_t;
    let w_inv = v_t.transpose() * Mat::from_diagonal(&inv_s) * u.transpose();
    Ok((w, w_inv))
}

/// Sum of squares of every entry.
pub fn sqnorm(m: &Mat) -> f64 {
    m.norm_squared()
}

/// Column sums as a `1 × cols` matrix.
pub fn column_sums(m: &Mat) -> Mat {
    let mut out = Mat::zeros(1, m.ncols());
    for j in 0..m.ncols() {
        out[(0, j)] = m.column(j).sum();
    }
    out
}

/// Adds a `1 × cols` row to every row of `m`.
pub fn add_row(m: &mut Mat, row: &Mat) {
    for j in 0..m.ncols() {
        let b = row[(0, j)];
        for i in 0..m.nrows() {
            m[(i, j)] += b;
        }
    }
}

/// Multiplies every row of `m` elementwise by a `1 × cols` row.
pub fn scale_columns(m: &Mat, row: &Mat) -> Mat {
    let mut out = m.clone();
    for j in 0..out.ncols() {
        let s = row[(0, j)];
        for i in 0..out.nrows() {
            out[(i, j)] *= s;
        }
    }
    out
}
