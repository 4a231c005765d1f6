//! Grayscale morphology with disk footprints, and the rolling-ball estimator.

use ndarray::{s, Array2, ArrayView2, Zip};

use crate::border::{pad_reflect, reflect_index};

/// Horizontal half-width of a disk of `radius` at each row offset `-r..=r`.
fn disk_half_widths(radius: usize) -> Vec<usize> {
    let r = radius as isize;
    let r2 = r * r;
    (-r..=r)
        .map(|dy| {
            let mut w = 0isize;
            while (w + 1) * (w + 1) + dy * dy <= r2 {
                w += 1;
            }
            w as usize
        })
        .collect()
}

/// Sliding-window extreme over `padded` (van Herk / Gil-Werman).
///
/// `out[i]` is the extreme of `padded[i..i + window]`.
fn sliding_extreme(padded: &[f64], window: usize, pick: fn(f64, f64) -> f64, out: &mut [f64]) {
    let n = padded.len();
    let mut prefix = vec![0.0; n];
    let mut suffix = vec![0.0; n];

    for i in 0..n {
        prefix[i] = if i % window == 0 {
            padded[i]
        } else {
            pick(prefix[i - 1], padded[i])
        };
    }
    for i in (0..n).rev() {
        suffix[i] = if i == n - 1 || (i + 1) % window == 0 {
            padded[i]
        } else {
            pick(suffix[i + 1], padded[i])
        };
    }
    for (i, value) in out.iter_mut().enumerate() {
        *value = pick(suffix[i], prefix[i + window - 1]);
    }
}

fn horizontal_extreme(image: ArrayView2<f64>, half_width: usize, pick: fn(f64, f64) -> f64) -> Array2<f64> {
    let (rows, cols) = image.dim();
    let window = 2 * half_width + 1;
    let mut out = Array2::<f64>::zeros((rows, cols));
    let mut padded = Vec::with_capacity(cols + 2 * half_width);
    let mut line = vec![0.0; cols];

    for (src, mut dst) in image.outer_iter().zip(out.outer_iter_mut()) {
        pad_reflect(src.iter(), cols, half_width, &mut padded);
        sliding_extreme(&padded, window, pick, &mut line);
        dst.iter_mut().zip(&line).for_each(|(d, v)| *d = *v);
    }
    out
}

/// Min/max filter over a disk footprint.
///
/// The disk is decomposed into one horizontal run per row offset; each
/// distinct run width is filtered once and rows are then combined.
fn disk_filter(image: ArrayView2<f64>, radius: usize, pick: fn(f64, f64) -> f64, identity: f64) -> Array2<f64> {
    let (rows, cols) = image.dim();
    let widths = disk_half_widths(radius);
    let mut distinct = widths.clone();
    distinct.sort_unstable();
    distinct.dedup();

    let runs: Vec<Array2<f64>> = distinct
        .iter()
        .map(|&w| horizontal_extreme(image, w, pick))
        .collect();

    let mut out = Array2::from_elem((rows, cols), identity);
    for (offset, width) in widths.iter().enumerate() {
        let dy = offset as isize - radius as isize;
        let run = match distinct.binary_search(width) {
            Ok(idx) => &runs[idx],
            Err(_) => continue,
        };
        for y in 0..rows {
            let source_row = run.row(reflect_index(y as isize + dy, rows));
            Zip::from(out.row_mut(y))
                .and(source_row)
                .for_each(|o, &v| *o = pick(*o, v));
        }
    }
    out
}

pub(crate) fn grey_erosion_disk(image: ArrayView2<f64>, radius: usize) -> Array2<f64> {
    disk_filter(image, radius, f64::min, f64::INFINITY)
}

pub(crate) fn grey_dilation_disk(image: ArrayView2<f64>, radius: usize) -> Array2<f64> {
    disk_filter(image, radius, f64::max, f64::NEG_INFINITY)
}

/// Erosion followed by dilation with the same disk.
pub(crate) fn grey_opening_disk(image: ArrayView2<f64>, radius: usize) -> Array2<f64> {
    let eroded = grey_erosion_disk(image, radius);
    grey_dilation_disk(eroded.view(), radius)
}

/// Rolling-ball background: the lower envelope traced by a ball of
/// `radius` rolled under the intensity surface.
///
/// Samples outside the image never touch the ball.
pub(crate) fn rolling_ball(image: ArrayView2<f64>, radius: usize) -> Array2<f64> {
    let (rows, cols) = image.dim();
    let (rows_i, cols_i) = (rows as isize, cols as isize);
    let r = radius as isize;
    let r2 = (radius * radius) as f64;
    let apex = radius as f64;

    let mut background = Array2::from_elem((rows, cols), f64::INFINITY);
    for dy in -r..=r {
        for dx in -r..=r {
            let d2 = (dx * dx + dy * dy) as f64;
            if d2 > r2 {
                continue;
            }
            let lift = apex - (r2 - d2).sqrt();

            let y0 = (-dy).max(0);
            let y1 = (rows_i - dy).min(rows_i);
            let x0 = (-dx).max(0);
            let x1 = (cols_i - dx).min(cols_i);
            if y0 >= y1 || x0 >= x1 {
                continue;
            }

            let src = image.slice(s![y0 + dy..y1 + dy, x0 + dx..x1 + dx]);
            let dst = background.slice_mut(s![y0..y1, x0..x1]);
            Zip::from(dst).and(src).for_each(|b, &v| {
                let candidate = v + lift;
                if candidate < *b {
                    *b = candidate;
                }
            });
        }
    }
    background
}
