//! Frame pre-processing and the two-stage change-score comparator.

use image::{GrayImage, RgbImage};
use imageproc::filter::gaussian_blur_f32;

/// Both axes of the comparison square ("256-px square").
pub const RESIZE_DIM: u32 = 256;

const HUE_BINS: usize = 50;
const SAT_BINS: usize = 60;

/// Matches OpenCV's implicit sigma for a 7x7 Gaussian kernel
/// (`0.3 * ((ksize - 1) * 0.5 - 1) + 0.8`).
const GAUSSIAN_SIGMA: f32 = 1.4;

const EARLY_EXIT_CORRELATION: f64 = 0.95;
const STRUCTURAL_DIFF_THRESHOLD: i32 = 25;

/// The two derived artifacts a frame is reduced to before comparison
///: a blurred grayscale square and a
/// hue/saturation histogram, both cheap to diff.
#[derive(Clone)]
pub struct PreparedFrame {
    pub gray: GrayImage,
    /// 50x60 flattened hue/saturation histogram, normalized to unit sum.
    pub histogram: Vec<f64>,
}

pub fn preprocess_frame(frame: &RgbImage) -> PreparedFrame {
    let small = image::imageops::resize(
        frame,
        RESIZE_DIM,
        RESIZE_DIM,
        image::imageops::FilterType::Triangle,
    );
    let gray = image::imageops::grayscale(&small);
    let blurred = gaussian_blur_f32(&gray, GAUSSIAN_SIGMA);
    let histogram = compute_hs_histogram(&small);
    PreparedFrame { gray: blurred, histogram }
}

fn compute_hs_histogram(frame: &RgbImage) -> Vec<f64> {
    let mut hist = vec![0.0_f64; HUE_BINS * SAT_BINS];
    for pixel in frame.pixels() {
        let [r, g, b] = pixel.0;
        let (h, s) = rgb_to_opencv_hs(r, g, b);
        let h_bin = ((h / 180.0) * HUE_BINS as f32)
            .floor()
            .clamp(0.0, (HUE_BINS - 1) as f32) as usize;
        let s_bin = ((s / 256.0) * SAT_BINS as f32)
            .floor()
            .clamp(0.0, (SAT_BINS - 1) as f32) as usize;
        hist[h_bin * SAT_BINS + s_bin] += 1.0;
    }
    let total: f64 = hist.iter().sum();
    if total > 0.0 {
        for v in hist.iter_mut() {
            *v /= total;
        }
    }
    hist
}

/// Hue in `[0, 180)`, saturation in `[0, 256)` — OpenCV's 8-bit HSV convention.
fn rgb_to_opencv_hs(r: u8, g: u8, b: u8) -> (f32, f32) {
    let rf = r as f32 / 255.0;
    let gf = g as f32 / 255.0;
    let bf = b as f32 / 255.0;
    let max = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let delta = max - min;

    let hue_deg = if delta == 0.0 {
        0.0
    } else if max == rf {
        60.0 * (((gf - bf) / delta).rem_euclid(6.0))
    } else if max == gf {
        60.0 * (((bf - rf) / delta) + 2.0)
    } else {
        60.0 * (((rf - gf) / delta) + 4.0)
    };

    let sat = if max == 0.0 { 0.0 } else { delta / max };
    (hue_deg / 2.0, sat * 255.0)
}

/// Pearson correlation of two equal-length histograms (`cv2.compareHist`'s
/// `HISTCMP_CORREL`).
fn pearson_correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        numerator += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    if var_a == 0.0 || var_b == 0.0 {
        return if var_a == var_b { 1.0 } else { 0.0 };
    }
    numerator / (var_a.sqrt() * var_b.sqrt())
}

/// Two-stage comparator: cheap histogram correlation first, with an early
/// exit that skips the structural pixel diff when the histograms already
/// agree closely.
pub fn compute_change_score(curr: &PreparedFrame, prev: &PreparedFrame) -> f64 {
    let hist_corr = pearson_correlation(&prev.histogram, &curr.histogram);
    let hist_change = 1.0 - hist_corr.max(0.0);

    if hist_corr > EARLY_EXIT_CORRELATION {
        return round4(hist_change * 0.5);
    }

    let total_pixels = (RESIZE_DIM * RESIZE_DIM) as f64;
    let changed_pixels = prev
        .gray
        .pixels()
        .zip(curr.gray.pixels())
        .filter(|(p, c)| (p.0[0] as i32 - c.0[0] as i32).abs() > STRUCTURAL_DIFF_THRESHOLD)
        .count() as f64;
    let struct_change = changed_pixels / total_pixels;

    round4(0.5 * hist_change + 0.5 * struct_change)
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(r: u8, g: u8, b: u8) -> RgbImage {
        RgbImage::from_pixel(32, 32, image::Rgb([r, g, b]))
    }

    #[test]
    fn identical_frames_score_zero() {
        let prep = preprocess_frame(&solid(100, 150, 200));
        let score = compute_change_score(&prep, &prep.clone());
        assert!(score < 0.01, "expected near-zero score, got {score}");
    }

    #[test]
    fn drastically_different_frames_score_high() {
        let prev = preprocess_frame(&solid(0, 0, 0));
        let curr = preprocess_frame(&solid(255, 255, 255));
        let score = compute_change_score(&curr, &prev);
        assert!(score > 0.1, "expected a high score, got {score}");
    }

    #[test]
    fn change_score_is_always_in_unit_range() {
        let prev = preprocess_frame(&solid(10, 200, 30));
        let curr = preprocess_frame(&solid(230, 5, 90));
        let score = compute_change_score(&curr, &prev);
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn histogram_sums_to_one() {
        let prep = preprocess_frame(&solid(50, 60, 70));
        let sum: f64 = prep.histogram.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }
}
