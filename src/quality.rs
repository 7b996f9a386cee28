//! Advisory quality gate for generated portraits.
//!
//! [`QualityAnalyzer::analyze`] never fails: unreadable input, detector errors and metric
//! errors all degrade into issue tags on the returned [`QualityAnalysis`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use image::{GrayImage, RgbImage};
use imageproc::filter::{box_filter, laplacian_filter};
use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::{IsolationError, Result};
use crate::traits::PersonDetector;

/// Laplacian variance mapped to a blur score of 1.0.
const BLUR_VARIANCE_SCALE: f64 = 300.0;
/// Estimated noise sigma (in 8-bit levels) mapped to a noise score of 1.0.
const NOISE_SIGMA_SCALE: f64 = 20.0;
/// Neutral value substituted for a metric that could not be computed.
const NEUTRAL_ESTIMATE: f32 = 0.5;
const MIN_METRIC_EXTENT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssue {
    #[serde(rename = "could not load image")]
    CouldNotLoadImage,
    PersonDetectionFailed,
    NoPersonDetected,
    MultiplePeopleDetected,
    ImageTooBlurry,
    ImageTooNoisy,
    PoorBrightness,
    BlurAnalysisFailed,
    NoiseAnalysisFailed,
    BrightnessAnalysisFailed,
    ContrastAnalysisFailed,
}

impl QualityIssue {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CouldNotLoadImage => "could not load image",
            Self::PersonDetectionFailed => "person_detection_failed",
            Self::NoPersonDetected => "no_person_detected",
            Self::MultiplePeopleDetected => "multiple_people_detected",
            Self::ImageTooBlurry => "image_too_blurry",
            Self::ImageTooNoisy => "image_too_noisy",
            Self::PoorBrightness => "poor_brightness",
            Self::BlurAnalysisFailed => "blur_analysis_failed",
            Self::NoiseAnalysisFailed => "noise_analysis_failed",
            Self::BrightnessAnalysisFailed => "brightness_analysis_failed",
            Self::ContrastAnalysisFailed => "contrast_analysis_failed",
        }
    }

    /// Tags raised by the analyzer itself failing rather than by the image.
    pub const fn is_internal_failure(&self) -> bool {
        matches!(
            self,
            Self::CouldNotLoadImage
                | Self::PersonDetectionFailed
                | Self::BlurAnalysisFailed
                | Self::NoiseAnalysisFailed
                | Self::BrightnessAnalysisFailed
                | Self::ContrastAnalysisFailed
        )
    }
}

impl std::fmt::Display for QualityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityAnalysis {
    pub is_valid: bool,
    pub person_detected: bool,
    pub person_count: usize,
    pub quality_score: f32,
    pub issues: Vec<QualityIssue>,
    pub confidence_scores: BTreeMap<String, f32>,
}

impl QualityAnalysis {
    fn unreadable() -> Self {
        Self {
            is_valid: false,
            person_detected: false,
            person_count: 0,
            quality_score: 0.0,
            issues: vec![QualityIssue::CouldNotLoadImage],
            confidence_scores: BTreeMap::new(),
        }
    }

    pub fn has_issue(&self, issue: QualityIssue) -> bool {
        self.issues.contains(&issue)
    }
}

#[derive(Debug, Clone)]
pub struct QualityThresholds {
    pub min_quality_score: f32,
    pub min_blur_score: f32,
    pub max_noise_score: f32,
    pub brightness_range: (f32, f32),
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_quality_score: 0.6,
            min_blur_score: 0.5,
            max_noise_score: 0.7,
            brightness_range: (0.3, 0.9),
        }
    }
}

pub struct QualityAnalyzer {
    detector: Arc<dyn PersonDetector>,
    thresholds: QualityThresholds,
}

impl QualityAnalyzer {
    pub fn new(detector: Arc<dyn PersonDetector>) -> Self {
        Self::with_thresholds(detector, QualityThresholds::default())
    }

    pub fn with_thresholds(detector: Arc<dyn PersonDetector>, thresholds: QualityThresholds) -> Self {
        Self {
            detector,
            thresholds,
        }
    }

    pub fn analyze(&self, image_path: &Path) -> QualityAnalysis {
        match image::open(image_path) {
            Ok(image) => self.analyze_image(&image.to_rgb8()),
            Err(e) => {
                warn!(path = %image_path.display(), error = %e, "could not load image for analysis");
                QualityAnalysis::unreadable()
            }
        }
    }

    pub fn analyze_image(&self, image: &RgbImage) -> QualityAnalysis {
        let mut issues = Vec::new();
        let mut scores = BTreeMap::new();

        let (person_detected, person_count) = match self.detector.detect(image) {
            Ok(detection) => {
                scores.insert("person_detection".to_string(), detection.confidence);
                (detection.detected && detection.count > 0, detection.count)
            }
            Err(e) => {
                warn!(detector = self.detector.name(), error = %e, "person detection failed");
                issues.push(QualityIssue::PersonDetectionFailed);
                scores.insert("person_detection".to_string(), 0.0);
                (false, 0)
            }
        };

        let gray = image::imageops::grayscale(image);
        let mut metric = |name: &str, failure: QualityIssue, value: Result<f32>| {
            let value = value.unwrap_or_else(|e| {
                warn!(metric = name, error = %e, "quality metric failed, using neutral estimate");
                issues.push(failure);
                NEUTRAL_ESTIMATE
            });
            scores.insert(name.to_string(), value);
            value
        };
        let blur = metric("blur", QualityIssue::BlurAnalysisFailed, blur_score(&gray));
        let noise = metric("noise", QualityIssue::NoiseAnalysisFailed, noise_score(&gray));
        let brightness = metric(
            "brightness",
            QualityIssue::BrightnessAnalysisFailed,
            brightness_score(&gray),
        );
        metric(
            "contrast",
            QualityIssue::ContrastAnalysisFailed,
            contrast_score(&gray),
        );

        let quality_score = combined_score(blur, noise, brightness);

        if person_count == 0 {
            issues.push(QualityIssue::NoPersonDetected);
        } else if person_count > 1 {
            issues.push(QualityIssue::MultiplePeopleDetected);
        }
        if blur < self.thresholds.min_blur_score {
            issues.push(QualityIssue::ImageTooBlurry);
        }
        if noise > self.thresholds.max_noise_score {
            issues.push(QualityIssue::ImageTooNoisy);
        }
        let (low, high) = self.thresholds.brightness_range;
        if !(low..=high).contains(&brightness) {
            issues.push(QualityIssue::PoorBrightness);
        }

        let is_valid = person_detected
            && person_count == 1
            && quality_score >= self.thresholds.min_quality_score
            && !issues.iter().any(QualityIssue::is_internal_failure);

        debug!(quality_score, person_count, ?issues, is_valid, "quality analysis complete");

        QualityAnalysis {
            is_valid,
            person_detected,
            person_count,
            quality_score,
            issues,
            confidence_scores: scores,
        }
    }
}

/// `0.4·blur + 0.3·(1 − noise) + 0.3·(2·min(brightness, 1 − brightness))`, clamped to `[0, 1]`.
pub fn combined_score(blur: f32, noise: f32, brightness: f32) -> f32 {
    let blur = blur.clamp(0.0, 1.0);
    let noise = noise.clamp(0.0, 1.0);
    let brightness = brightness.clamp(0.0, 1.0);
    let exposure = 2.0 * brightness.min(1.0 - brightness);
    (0.4 * blur + 0.3 * (1.0 - noise) + 0.3 * exposure).clamp(0.0, 1.0)
}

fn ensure_metric_extent(gray: &GrayImage) -> Result<()> {
    let (width, height) = gray.dimensions();
    if width < MIN_METRIC_EXTENT || height < MIN_METRIC_EXTENT {
        return Err(IsolationError::Validation {
            field: "image".to_string(),
            reason: format!("{}x{} is too small to measure", width, height),
        });
    }
    Ok(())
}

/// Sharpness from Laplacian variance; higher is sharper.
pub fn blur_score(gray: &GrayImage) -> Result<f32> {
    ensure_metric_extent(gray)?;
    let laplacian = laplacian_filter(gray);
    let n = laplacian.pixels().len() as f64;
    let mean = laplacian.pixels().map(|p| p[0] as f64).sum::<f64>() / n;
    let variance = laplacian
        .pixels()
        .map(|p| (p[0] as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    Ok((variance / BLUR_VARIANCE_SCALE).min(1.0) as f32)
}

/// Noise from the median absolute deviation of each pixel against its 3×3 mean.
///
/// The median ignores the sparse large residuals along real edges.
pub fn noise_score(gray: &GrayImage) -> Result<f32> {
    ensure_metric_extent(gray)?;
    let smoothed = box_filter(gray, 1, 1);

    let mut histogram = [0u64; 256];
    for (original, local) in gray.pixels().zip(smoothed.pixels()) {
        histogram[original[0].abs_diff(local[0]) as usize] += 1;
    }

    let total: u64 = histogram.iter().sum();
    let mut cumulative = 0;
    let mut median = 0usize;
    for (level, count) in histogram.iter().enumerate() {
        cumulative += count;
        if cumulative * 2 >= total {
            median = level;
            break;
        }
    }

    let sigma = 1.4826 * median as f64;
    Ok((sigma / NOISE_SIGMA_SCALE).min(1.0) as f32)
}

/// Mean luminance in `[0, 1]`.
pub fn brightness_score(gray: &GrayImage) -> Result<f32> {
    ensure_metric_extent(gray)?;
    let n = gray.pixels().len() as f64;
    let sum: f64 = gray.pixels().map(|p| p[0] as f64).sum();
    Ok((sum / n / 255.0) as f32)
}

/// Luminance standard deviation, with 128 levels mapped to 1.0.
pub fn contrast_score(gray: &GrayImage) -> Result<f32> {
    ensure_metric_extent(gray)?;
    let n = gray.pixels().len() as f64;
    let mean = gray.pixels().map(|p| p[0] as f64).sum::<f64>() / n;
    let variance = gray
        .pixels()
        .map(|p| (p[0] as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    Ok((variance.sqrt() / 128.0).min(1.0) as f32)
}
