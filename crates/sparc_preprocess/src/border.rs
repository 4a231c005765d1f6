//! Boundary handling and separable 1-D filters.
//!
//! Out-of-range samples use symmetric reflection (`d c b a | a b c d | d c b a`).

use ndarray::{Array2, ArrayView2, Axis};

/// Map a possibly out-of-range index into `0..len` by symmetric reflection.
pub(crate) fn reflect_index(index: isize, len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    let len = len as isize;
    let period = 2 * len;
    let mut m = index.rem_euclid(period);
    if m >= len {
        m = period - 1 - m;
    }
    m as usize
}

/// Copy `line` into `buf` with `pad` reflected samples on each side.
pub(crate) fn pad_reflect<'a>(line: impl Iterator<Item = &'a f64>, len: usize, pad: usize, buf: &mut Vec<f64>) {
    let values: Vec<f64> = line.copied().collect();
    buf.clear();
    buf.extend((0..len + 2 * pad).map(|i| values[reflect_index(i as isize - pad as isize, len)]));
}

/// Correlate every lane along `axis` with a centred odd-length kernel.
pub(crate) fn correlate1d(image: ArrayView2<f64>, kernel: &[f64], axis: Axis) -> Array2<f64> {
    let half = kernel.len() / 2;
    let mut out = Array2::<f64>::zeros(image.raw_dim());
    let len = image.len_of(axis);
    let mut padded = Vec::with_capacity(len + 2 * half);

    for (src, mut dst) in image.lanes(axis).into_iter().zip(out.lanes_mut(axis)) {
        pad_reflect(src.iter(), len, half, &mut padded);
        for (i, value) in dst.iter_mut().enumerate() {
            *value = kernel
                .iter()
                .zip(&padded[i..i + kernel.len()])
                .map(|(w, v)| w * v)
                .sum();
        }
    }
    out
}

/// Apply the same 1-D kernel along both axes.
pub(crate) fn correlate_separable(image: ArrayView2<f64>, kernel: &[f64]) -> Array2<f64> {
    let rows = correlate1d(image, kernel, Axis(0));
    correlate1d(rows.view(), kernel, Axis(1))
}
