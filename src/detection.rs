//! Person detection with a primary → secondary → centered-guess fallback chain.

use image::{GrayImage, RgbImage};
use imageproc::gradients::sobel_gradients;
use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::{IsolationError, Result};
use crate::traits::PersonDetector;

/// Confidence assigned when every detector failed and a centered subject is assumed.
pub const CENTERED_FALLBACK_CONFIDENCE: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.width as f32 / 2.0,
            self.y as f32 + self.height as f32 / 2.0,
        )
    }

    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn intersection_over_union(&self, other: &Self) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) as f32 * (y2 - y1) as f32;
        let union = self.area() as f32 + other.area() as f32 - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Clips the box to an image of the given extent.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let x = self.x.min(width.saturating_sub(1));
        let y = self.y.min(height.saturating_sub(1));
        Self {
            x,
            y,
            width: self.width.min(width - x).max(1),
            height: self.height.min(height - y).max(1),
        }
    }
}

/// 検出結果（パイプライン内部でのみ使用）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PersonDetection {
    pub detected: bool,
    pub confidence: f32,
    pub count: usize,
    pub bounding_boxes: Vec<(BoundingBox, f32)>,
}

impl PersonDetection {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_boxes(bounding_boxes: Vec<(BoundingBox, f32)>) -> Self {
        let confidence = bounding_boxes
            .iter()
            .map(|(_, weight)| *weight)
            .fold(0.0_f32, f32::max);
        Self {
            detected: !bounding_boxes.is_empty(),
            confidence: confidence.clamp(0.0, 1.0),
            count: bounding_boxes.len(),
            bounding_boxes,
        }
    }

    /// One subject covering the middle third of the frame.
    pub fn centered_fallback(width: u32, height: u32) -> Self {
        let bbox = BoundingBox::new(width / 3, height / 6, (width / 3).max(1), (height * 2 / 3).max(1));
        Self {
            detected: true,
            confidence: CENTERED_FALLBACK_CONFIDENCE,
            count: 1,
            bounding_boxes: vec![(bbox, CENTERED_FALLBACK_CONFIDENCE)],
        }
    }

    pub fn strongest(&self) -> Option<&(BoundingBox, f32)> {
        self.bounding_boxes
            .iter()
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

/// Runs the detection fallback chain.
///
/// The primary result is used when it clears `threshold`. Otherwise the secondary
/// detector decides; if it errors, a centered subject is assumed so the pipeline keeps
/// going. Only "nobody anywhere" is reported as an error, and that error is retryable.
pub fn detect_with_fallback(
    primary: Option<&dyn PersonDetector>,
    secondary: &dyn PersonDetector,
    image: &RgbImage,
    threshold: f32,
) -> Result<PersonDetection> {
    let mut weak_primary = None;

    if let Some(primary) = primary {
        match primary.detect(image) {
            Ok(detection) if detection.detected && detection.confidence >= threshold => {
                debug!(
                    detector = primary.name(),
                    confidence = detection.confidence,
                    count = detection.count,
                    "primary detection accepted"
                );
                return Ok(detection);
            }
            Ok(detection) => {
                debug!(
                    detector = primary.name(),
                    confidence = detection.confidence,
                    threshold,
                    "primary detection below threshold"
                );
                if detection.detected {
                    weak_primary = Some(detection);
                }
            }
            Err(e) => warn!(detector = primary.name(), error = %e, "primary detector failed"),
        }
    }

    match secondary.detect(image) {
        Ok(detection) if detection.detected => Ok(detection),
        Ok(_) => weak_primary.ok_or_else(|| IsolationError::detection("no person found in image")),
        Err(e) => {
            warn!(
                detector = secondary.name(),
                error = %e,
                "secondary detector failed, assuming centered subject"
            );
            let (width, height) = image.dimensions();
            Ok(PersonDetection::centered_fallback(width, height))
        }
    }
}

/// Gradient-energy heuristic used when no detection model is available or trusted.
///
/// Finds the region holding the bulk of strong Sobel edges and scores it by how much
/// denser its edges are than the rest of the frame. It cannot count people, so it
/// reports at most one.
#[derive(Debug, Clone)]
pub struct EdgeDensityDetector {
    /// Lower bound on the gradient magnitude treated as an edge.
    pub min_edge_strength: u16,
    /// Fraction of edge pixels trimmed from each side of the projection.
    pub trim_fraction: f32,
}

impl Default for EdgeDensityDetector {
    fn default() -> Self {
        Self {
            min_edge_strength: 160,
            trim_fraction: 0.05,
        }
    }
}

const MIN_DETECTOR_EXTENT: u32 = 8;
const MIN_EDGE_FRACTION: f32 = 0.002;
const MIN_REGION_FRACTION: f32 = 0.01;

impl PersonDetector for EdgeDensityDetector {
    fn name(&self) -> &'static str {
        "edge_density"
    }

    fn detect(&self, image: &RgbImage) -> Result<PersonDetection> {
        let (width, height) = image.dimensions();
        if width < MIN_DETECTOR_EXTENT || height < MIN_DETECTOR_EXTENT {
            return Err(IsolationError::detection(format!(
                "image {}x{} too small for edge analysis",
                width, height
            )));
        }

        let gray: GrayImage = image::imageops::grayscale(image);
        let gradients = sobel_gradients(&gray);

        let mean = gradients.pixels().map(|p| p[0] as f64).sum::<f64>() / (width * height) as f64;
        let threshold = (mean * 2.0).max(self.min_edge_strength as f64) as u16;

        let mut columns = vec![0u32; width as usize];
        let mut rows = vec![0u32; height as usize];
        let mut total = 0u32;
        for (x, y, p) in gradients.enumerate_pixels() {
            if p[0] > threshold {
                columns[x as usize] += 1;
                rows[y as usize] += 1;
                total += 1;
            }
        }

        if (total as f32) < (width * height) as f32 * MIN_EDGE_FRACTION {
            return Ok(PersonDetection::none());
        }

        let (x1, x2) = trimmed_range(&columns, total, self.trim_fraction);
        let (y1, y2) = trimmed_range(&rows, total, self.trim_fraction);
        let bbox = BoundingBox::new(x1, y1, x2 - x1 + 1, y2 - y1 + 1);

        let frame_area = (width * height) as f32;
        if (bbox.area() as f32) < frame_area * MIN_REGION_FRACTION {
            return Ok(PersonDetection::none());
        }

        let inside = gradients
            .enumerate_pixels()
            .filter(|(x, y, p)| {
                p[0] > threshold
                    && (bbox.x..bbox.x + bbox.width).contains(x)
                    && (bbox.y..bbox.y + bbox.height).contains(y)
            })
            .count() as f32;
        let outside = total as f32 - inside;
        let inside_density = inside / bbox.area() as f32;
        let outside_area = frame_area - bbox.area() as f32;
        let outside_density = if outside_area > 0.0 {
            outside / outside_area
        } else {
            0.0
        };

        let contrast = inside_density / (inside_density + outside_density + f32::EPSILON);
        let confidence = (0.3 + 0.6 * contrast).clamp(0.0, 0.9);

        Ok(PersonDetection::from_boxes(vec![(bbox, confidence)]))
    }
}

/// Index range holding the middle `1 - 2 * trim` share of `total` counts.
fn trimmed_range(counts: &[u32], total: u32, trim: f32) -> (u32, u32) {
    let cut = (total as f32 * trim).floor() as u32;
    let mut cumulative = 0u32;
    let mut start = 0usize;
    for (i, &count) in counts.iter().enumerate() {
        cumulative += count;
        if cumulative > cut {
            start = i;
            break;
        }
    }

    cumulative = 0;
    let mut end = counts.len().saturating_sub(1);
    for (i, &count) in counts.iter().enumerate().rev() {
        cumulative += count;
        if cumulative > cut {
            end = i;
            break;
        }
    }

    (start as u32, end.max(start) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{portrait_image, FailingDetector, MockPersonDetector};
    use image::Rgb;

    #[test]
    fn test_iou() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(5, 5, 10, 10);
        let iou = a.intersection_over_union(&b);
        assert!((iou - 25.0 / 175.0).abs() < 1e-6);
        assert_eq!(a.intersection_over_union(&BoundingBox::new(20, 20, 5, 5)), 0.0);
    }

    #[test]
    fn test_clamp_keeps_box_inside() {
        let clamped = BoundingBox::new(90, 95, 50, 50).clamp_to(100, 100);
        assert_eq!(clamped, BoundingBox::new(90, 95, 10, 5));
    }

    #[test]
    fn test_edge_density_finds_subject() -> Result<()> {
        let image = portrait_image(120, 160);
        let detection = EdgeDensityDetector::default().detect(&image)?;

        assert!(detection.detected);
        assert_eq!(detection.count, 1);
        let (bbox, _) = detection.strongest().unwrap();
        let (cx, cy) = bbox.center();
        assert!((cx - 60.0).abs() < 15.0, "center x {}", cx);
        assert!((cy - 80.0).abs() < 20.0, "center y {}", cy);
        Ok(())
    }

    #[test]
    fn test_edge_density_reports_nobody_on_flat_image() -> Result<()> {
        let image = RgbImage::from_pixel(64, 64, Rgb([120, 120, 120]));
        let detection = EdgeDensityDetector::default().detect(&image)?;
        assert!(!detection.detected);
        Ok(())
    }

    #[test]
    fn test_confident_primary_wins() -> Result<()> {
        let image = portrait_image(64, 64);
        let primary = MockPersonDetector::single(BoundingBox::new(10, 10, 20, 40), 0.95);
        let secondary = FailingDetector;

        let detection = detect_with_fallback(Some(&primary), &secondary, &image, 0.5)?;
        assert_eq!(detection.confidence, 0.95);
        Ok(())
    }

    #[test]
    fn test_low_confidence_primary_falls_back_to_secondary() -> Result<()> {
        let image = portrait_image(64, 64);
        let primary = MockPersonDetector::single(BoundingBox::new(0, 0, 10, 10), 0.2);
        let secondary = MockPersonDetector::single(BoundingBox::new(20, 10, 24, 44), 0.7);

        let detection = detect_with_fallback(Some(&primary), &secondary, &image, 0.5)?;
        assert_eq!(detection.confidence, 0.7);
        Ok(())
    }

    #[test]
    fn test_everything_failing_assumes_centered_subject() -> Result<()> {
        let image = portrait_image(90, 120);
        let detection = detect_with_fallback(Some(&FailingDetector), &FailingDetector, &image, 0.5)?;

        assert_eq!(detection.count, 1);
        assert_eq!(detection.confidence, CENTERED_FALLBACK_CONFIDENCE);
        assert_eq!(detection.bounding_boxes[0].0, BoundingBox::new(30, 20, 30, 80));
        Ok(())
    }

    #[test]
    fn test_nobody_found_is_a_detection_error() {
        let image = RgbImage::from_pixel(32, 32, Rgb([0, 0, 0]));
        let result = detect_with_fallback(None, &MockPersonDetector::nobody(), &image, 0.5);
        assert!(matches!(result, Err(IsolationError::PersonDetection { .. })));
    }
}
