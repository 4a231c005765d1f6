//! Local threshold surfaces.

use ndarray::{Array2, ArrayView2};

use crate::border::correlate_separable;
use crate::method::LocalWeighting;

const GAUSSIAN_TRUNCATE: f64 = 4.0;

/// Normalized 1-D Gaussian kernel truncated at four standard deviations.
pub(crate) fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (GAUSSIAN_TRUNCATE * sigma + 0.5) as usize;
    if sigma <= 0.0 || radius == 0 {
        return vec![1.0];
    }
    let denom = -0.5 / (sigma * sigma);
    let mut kernel: Vec<f64> = (0..=2 * radius)
        .map(|i| {
            let x = i as f64 - radius as f64;
            (denom * x * x).exp()
        })
        .collect();
    let total: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|w| *w /= total);
    kernel
}

/// Weighted local mean over an odd square block, minus `offset`.
pub(crate) fn local_threshold(
    image: ArrayView2<f64>,
    block_size: usize,
    offset: f64,
    weighting: LocalWeighting,
) -> Array2<f64> {
    let kernel = match weighting {
        LocalWeighting::Gaussian => gaussian_kernel((block_size as f64 - 1.0) / 6.0),
        LocalWeighting::Mean => vec![1.0 / block_size as f64; block_size],
    };
    let mut surface = correlate_separable(image, &kernel);
    if offset != 0.0 {
        surface.mapv_inplace(|v| v - offset);
    }
    surface
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_is_normalized_and_symmetric() {
        let k = gaussian_kernel(34.0 / 6.0);
        assert_eq!(k.len(), 2 * 23 + 1);
        assert!((k.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        for i in 0..k.len() / 2 {
            assert!((k[i] - k[k.len() - 1 - i]).abs() < 1e-15);
        }
    }

    #[test]
    fn degenerate_sigma_is_identity() {
        assert_eq!(gaussian_kernel(0.0), vec![1.0]);
    }

    #[test]
    fn threshold_of_constant_subtracts_offset() {
        let image = Array2::from_elem((12, 12), 9.0);
        for weighting in [LocalWeighting::Gaussian, LocalWeighting::Mean] {
            let out = local_threshold(image.view(), 5, 2.0, weighting);
            assert!(out.iter().all(|v| (v - 7.0).abs() < 1e-9));
        }
    }

    #[test]
    fn mean_weighting_averages_block() {
        let mut image = Array2::zeros((9, 9));
        image[[4, 4]] = 81.0;
        let out = local_threshold(image.view(), 9, 0.0, LocalWeighting::Mean);
        assert!((out[[4, 4]] - 1.0).abs() < 1e-12);
    }
}
