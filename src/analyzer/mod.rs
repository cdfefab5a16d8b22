//! Pure image analysis: sun exposure and wetness estimation.
//!
//! `analyze` is deterministic and does no I/O: identical bytes always
//! produce identical scores. Undecodable input yields a zero-valued
//! result with zero confidence instead of an error, so a corrupt
//! snapshot can never abort a pipeline cycle.
//!
//! Sun exposure uses a local-neighborhood adaptive threshold over a
//! blurred luminance channel, so uneven illumination across a frame
//! does not skew the bright-pixel fraction the way a single global
//! cutoff would.
//!
//! Wetness fuses four independent indicators computed over an HSV
//! decomposition plus a gradient-magnitude map:
//! - reflection: specular highlights (high value, low saturation)
//! - dark surface: low-luminance wet pavement
//! - low saturation: desaturation from water sheen
//! - edge density: puddle boundaries produce distinct edges

use chrono::Utc;
use image::GrayImage;
use tracing::debug;

use crate::config::AnalyzerConfig;
use crate::models::{AnalysisResult, IndicatorScores};

/// Analyze one image and produce the full per-location result.
pub fn analyze(location_id: &str, bytes: &[u8], config: &AnalyzerConfig) -> AnalysisResult {
    let img = match image::load_from_memory(bytes) {
        Ok(img) => img,
        Err(e) => {
            debug!("Failed to decode image for {}: {}", location_id, e);
            return AnalysisResult::degraded(location_id.to_string());
        }
    };

    let rgb = img.to_rgb8();
    let luma = img.to_luma8();
    let (width, height) = (rgb.width(), rgb.height());

    if width == 0 || height == 0 {
        return AnalysisResult::degraded(location_id.to_string());
    }

    let sun_exposure = sun_exposure_score(&luma, config);
    let indicators = wetness_indicators(&rgb, &luma, config);
    let wetness = fuse_wetness(&indicators, config);
    let wetness_confidence = indicator_confidence(&indicators.as_array());

    debug!(
        "Analysis for {}: sun={:.3} wetness={:.3} confidence={:.3}",
        location_id, sun_exposure, wetness, wetness_confidence
    );

    AnalysisResult {
        location_id: location_id.to_string(),
        sun_exposure,
        wetness,
        wetness_confidence,
        indicators,
        analyzed_at: Utc::now(),
    }
}

/// Fraction of pixels classified bright by local adaptive thresholding.
///
/// A pixel counts as bright when it exceeds the mean of its blurred
/// neighborhood minus a small constant, matching an adaptive binary
/// threshold with block size `adaptive_block_size`.
fn sun_exposure_score(luma: &GrayImage, config: &AnalyzerConfig) -> f64 {
    let (width, height) = (luma.width() as usize, luma.height() as usize);
    let total = (width * height) as f64;

    // 5x5 mean blur to suppress sensor noise before thresholding.
    let blurred = mean_filter(luma.as_raw(), width, height, 5);
    let integral = integral_image(&blurred, width, height);

    let radius = (config.adaptive_block_size / 2) as usize;
    let mut bright = 0usize;

    for y in 0..height {
        for x in 0..width {
            let mean = window_mean(&integral, width, height, x, y, radius);
            let pixel = blurred[y * width + x] as f64;
            if pixel > mean - config.adaptive_constant {
                bright += 1;
            }
        }
    }

    bright as f64 / total
}

/// Compute the four wetness indicator scores over the full frame.
fn wetness_indicators(
    rgb: &image::RgbImage,
    luma: &GrayImage,
    config: &AnalyzerConfig,
) -> IndicatorScores {
    let (width, height) = (rgb.width() as usize, rgb.height() as usize);
    let total = (width * height) as f64;

    let mut reflection = 0usize;
    let mut dark = 0usize;
    let mut low_sat = 0usize;

    for (pixel, l) in rgb.pixels().zip(luma.pixels()) {
        let [r, g, b] = pixel.0;
        let (saturation, value) = hsv_sat_value(r, g, b);

        if value > config.bright_value_min && saturation < config.reflection_saturation_max {
            reflection += 1;
        }
        if l.0[0] < config.dark_luma_max {
            dark += 1;
        }
        if saturation < config.low_saturation_max {
            low_sat += 1;
        }
    }

    let edges = edge_pixel_count(luma, config.edge_threshold);

    IndicatorScores {
        reflection: reflection as f64 / total,
        dark_surface: dark as f64 / total,
        low_saturation: low_sat as f64 / total,
        edge_density: edges as f64 / total,
    }
}

/// Fixed-weight linear combination of the indicator scores.
fn fuse_wetness(indicators: &IndicatorScores, config: &AnalyzerConfig) -> f64 {
    let wetness = indicators.reflection * config.reflection_weight
        + indicators.dark_surface * config.dark_surface_weight
        + indicators.low_saturation * config.low_saturation_weight
        + indicators.edge_density * config.edge_density_weight;

    wetness.clamp(0.0, 1.0)
}

/// Confidence from indicator agreement: one minus the coefficient of
/// variation, clamped to [0, 1]. A zero mean has no defined coefficient
/// of variation and yields the neutral value 0.5.
fn indicator_confidence(scores: &[f64; 4]) -> f64 {
    let mean: f64 = scores.iter().sum::<f64>() / scores.len() as f64;
    if mean <= 0.0 {
        return 0.5;
    }

    let variance: f64 =
        scores.iter().map(|s| (s - mean) * (s - mean)).sum::<f64>() / scores.len() as f64;
    let std_dev = variance.sqrt();

    (1.0 - std_dev / mean).clamp(0.0, 1.0)
}

/// Saturation and value channels of a pixel, in OpenCV's 0-255 HSV scale.
fn hsv_sat_value(r: u8, g: u8, b: u8) -> (u8, u8) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);

    let saturation = if max == 0 {
        0
    } else {
        ((255u32 * (max - min) as u32) / max as u32) as u8
    };

    (saturation, max)
}

/// Count of pixels whose Sobel gradient magnitude exceeds the threshold.
///
/// Border pixels are skipped, matching edge filters that leave a
/// one-pixel frame unflagged.
fn edge_pixel_count(luma: &GrayImage, threshold: f64) -> usize {
    let (width, height) = (luma.width() as usize, luma.height() as usize);
    if width < 3 || height < 3 {
        return 0;
    }

    let data = luma.as_raw();
    let at = |x: usize, y: usize| data[y * width + x] as i32;
    let mut count = 0usize;

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let gx = -at(x - 1, y - 1) + at(x + 1, y - 1) - 2 * at(x - 1, y) + 2 * at(x + 1, y)
                - at(x - 1, y + 1)
                + at(x + 1, y + 1);
            let gy = -at(x - 1, y - 1) - 2 * at(x, y - 1) - at(x + 1, y - 1)
                + at(x - 1, y + 1)
                + 2 * at(x, y + 1)
                + at(x + 1, y + 1);

            let magnitude = ((gx * gx + gy * gy) as f64).sqrt();
            if magnitude > threshold {
                count += 1;
            }
        }
    }

    count
}

/// Mean filter with a square window, clamped at the image borders.
fn mean_filter(data: &[u8], width: usize, height: usize, size: usize) -> Vec<u8> {
    let integral = integral_image(data, width, height);
    let radius = size / 2;
    let mut out = vec![0u8; width * height];

    for y in 0..height {
        for x in 0..width {
            let mean = window_mean(&integral, width, height, x, y, radius);
            out[y * width + x] = mean.round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}

/// Summed-area table with a zero row/column prefix.
fn integral_image(data: &[u8], width: usize, height: usize) -> Vec<u64> {
    let w = width + 1;
    let mut integral = vec![0u64; w * (height + 1)];

    for y in 0..height {
        let mut row_sum = 0u64;
        for x in 0..width {
            row_sum += data[y * width + x] as u64;
            integral[(y + 1) * w + (x + 1)] = integral[y * w + (x + 1)] + row_sum;
        }
    }

    integral
}

/// Mean of the window centered at (x, y), clamped to the image bounds.
fn window_mean(
    integral: &[u64],
    width: usize,
    height: usize,
    x: usize,
    y: usize,
    radius: usize,
) -> f64 {
    let w = width + 1;
    let x0 = x.saturating_sub(radius);
    let y0 = y.saturating_sub(radius);
    let x1 = (x + radius + 1).min(width);
    let y1 = (y + radius + 1).min(height);

    let sum = integral[y1 * w + x1] + integral[y0 * w + x0]
        - integral[y0 * w + x1]
        - integral[y1 * w + x0];
    let area = ((x1 - x0) * (y1 - y0)) as f64;

    sum as f64 / area
}
