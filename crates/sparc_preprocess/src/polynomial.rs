//! Least-squares polynomial surface fitting.

use nalgebra::{DMatrix, DVector, SVD};
use ndarray::{Array2, ArrayView2};
use tracing::warn;

/// Iteration cap for the SVD; non-finite input never converges.
const SVD_MAX_ITERATIONS: usize = 1000;

/// Monomial exponents `(i, j)` for `x^i * y^j` with `i + j <= order`.
fn exponents(order: usize) -> Vec<(usize, usize)> {
    let mut terms = Vec::new();
    for i in 0..=order {
        for j in 0..=(order - i) {
            terms.push((i, j));
        }
    }
    terms
}

/// Pixel index mapped onto `[-1, 1]`.
fn normalized(index: usize, len: usize) -> f64 {
    if len <= 1 {
        0.0
    } else {
        2.0 * index as f64 / (len - 1) as f64 - 1.0
    }
}

fn powers(len: usize, order: usize) -> Vec<Vec<f64>> {
    (0..len)
        .map(|i| {
            let t = normalized(i, len);
            let mut p = Vec::with_capacity(order + 1);
            let mut acc = 1.0;
            for _ in 0..=order {
                p.push(acc);
                acc *= t;
            }
            p
        })
        .collect()
}

/// Minimum-norm least-squares coefficients, one per entry of `exponents(order)`.
///
/// Singular values below `max(rows, terms) * eps * sigma_max` are treated as
/// zero, so duplicated monomials (e.g. `x^2 == 1` on a two-pixel row) share
/// the weight instead of one of them absorbing it.
fn fit_coefficients(image: ArrayView2<f64>, order: usize) -> DVector<f64> {
    let (rows, cols) = image.dim();
    let terms = exponents(order);
    let n = terms.len();
    let samples = rows * cols;
    if samples == 0 {
        return DVector::zeros(n);
    }
    let xp = powers(cols, order);
    let yp = powers(rows, order);

    // Row k is pixel (k / cols, k % cols) in row-major order.
    let design = DMatrix::<f64>::from_fn(samples, n, |k, t| {
        let (i, j) = terms[t];
        xp[k % cols][i] * yp[k / cols][j]
    });
    let values = DVector::<f64>::from_iterator(samples, image.iter().copied());

    let Some(svd) = SVD::try_new(design, true, true, f64::EPSILON, SVD_MAX_ITERATIONS) else {
        warn!(rows, cols, order, "Polynomial fit did not converge; using a zero surface");
        return DVector::zeros(n);
    };
    let rank_tolerance = svd.singular_values.max() * f64::EPSILON * samples.max(n) as f64;
    match svd.solve(&values, rank_tolerance) {
        Ok(coeffs) => coeffs,
        Err(message) => {
            warn!(rows, cols, order, "Polynomial fit failed: {message}");
            DVector::zeros(n)
        }
    }
}

/// Fit a 2-D polynomial of total degree `order` and evaluate it on the grid.
pub(crate) fn polynomial_surface(image: ArrayView2<f64>, order: usize) -> Array2<f64> {
    let (rows, cols) = image.dim();
    let terms = exponents(order);
    let xp = powers(cols, order);
    let yp = powers(rows, order);
    let coeffs = fit_coefficients(image, order);

    Array2::from_shape_fn((rows, cols), |(y, x)| {
        terms
            .iter()
            .zip(coeffs.iter())
            .map(|(&(i, j), c)| c * xp[x][i] * yp[y][j])
            .sum()
    })
}
