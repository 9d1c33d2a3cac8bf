//! Intensity normalisation applied to the raw input block before tiling.

use ndarray::Array3;

/// Percentile of the intensity distribution that is mapped to 1.0.
pub const SCALING_PERCENTILE: f64 = 99.9;

/// Estimate a multiplicative factor that maps the upper intensity range to ~1.0.
///
/// Returns the reciprocal of the [`SCALING_PERCENTILE`] intensity. Images that are
/// empty, non-finite or not positive at that percentile get a factor of 1.0.
pub fn calculate_scaling_factor(image: &Array3<f32>) -> f32 {
    let mut finite: Vec<f32> = image.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return 1.0;
    }

    let rank = ((SCALING_PERCENTILE / 100.0) * (finite.len() - 1) as f64).round() as usize;
    let rank = rank.min(finite.len() - 1);
    let (_, reference, _) = finite.select_nth_unstable_by(rank, f32::total_cmp);

    if *reference > 0.0 {
        1.0 / *reference
    } else {
        1.0
    }
}

/// Multiply every voxel by `factor` in place.
pub fn scale_image(image: &mut Array3<f32>, factor: f32) {
    image.mapv_inplace(|v| v * factor);
}
