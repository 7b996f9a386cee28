//! Soft foreground masks.
//!
//! A mask is a `height × width` field of `f32` in `[0, 1]` aligned to its source image:
//! 1 is foreground, 0 is background, with soft values along the boundary.

use image::{GrayImage, Luma, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::morphology::{close, dilate, open};
use ndarray::{Array2, Zip};

use crate::detection::{BoundingBox, PersonDetection};
use crate::errors::{IsolationError, Result};

/// Gain applied to `1 - d` of the normalised elliptical distance `d`.
/// With 3.0 the mask is solid out to two thirds of the radius.
const FALLOFF_GAIN: f32 = 3.0;
/// Largest share of mask confidence removed next to an edge.
const EDGE_PENALTY: f32 = 0.3;
const CANNY_LOW: f32 = 50.0;
const CANNY_HIGH: f32 = 150.0;
const MORPH_RADIUS: u8 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    data: Array2<f32>,
}

impl Mask {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            data: Array2::zeros((height as usize, width as usize)),
        }
    }

    /// Values are clamped into `[0, 1]`.
    pub fn from_array(mut data: Array2<f32>) -> Self {
        data.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) });
        Self { data }
    }

    /// Builds the mask for a detection, or the centered fallback when it has no boxes.
    pub fn from_detection(width: u32, height: u32, detection: &PersonDetection) -> Self {
        if detection.bounding_boxes.is_empty() {
            return Self::centered_fallback(width, height);
        }
        Self::from_boxes(width, height, &detection.bounding_boxes)
    }

    /// Union of elliptical falloffs, one per box, combined by per-pixel maximum.
    pub fn from_boxes(width: u32, height: u32, boxes: &[(BoundingBox, f32)]) -> Self {
        let mut data = Array2::<f32>::zeros((height as usize, width as usize));
        Zip::indexed(&mut data).par_for_each(|(y, x), value| {
            *value = boxes
                .iter()
                .map(|(bbox, _)| elliptical_falloff(bbox, x as f32 + 0.5, y as f32 + 0.5))
                .fold(0.0, f32::max);
        });
        Self { data }
    }

    /// Ellipse over the middle third of the frame.
    pub fn centered_fallback(width: u32, height: u32) -> Self {
        let bbox = BoundingBox::new(
            width / 3,
            height / 6,
            (width / 3).max(1),
            (height * 2 / 3).max(1),
        );
        Self::from_boxes(width, height, &[(bbox, 1.0)])
    }

    pub fn width(&self) -> u32 {
        self.data.ncols() as u32
    }

    pub fn height(&self) -> u32 {
        self.data.nrows() as u32
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[[y as usize, x as usize]]
    }

    pub fn as_array(&self) -> &Array2<f32> {
        &self.data
    }

    /// Mean foreground probability.
    pub fn coverage(&self) -> f32 {
        self.data.mean().unwrap_or(0.0)
    }

    pub fn binarize(&self, threshold: f32) -> Self {
        Self {
            data: self.data.mapv(|v| if v >= threshold { 1.0 } else { 0.0 }),
        }
    }

    pub fn to_luma8(&self) -> GrayImage {
        GrayImage::from_fn(self.width(), self.height(), |x, y| {
            Luma([(self.get(x, y) * 255.0).round() as u8])
        })
    }

    pub fn from_luma8(image: &GrayImage) -> Self {
        let (width, height) = image.dimensions();
        let data = Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
            image.get_pixel(x as u32, y as u32)[0] as f32 / 255.0
        });
        Self { data }
    }

    /// Pulls the mask down along image edges and removes speckle.
    ///
    /// Edge pixels (Canny, dilated once) lose up to 30% of their confidence. The
    /// binarised support is then closed and opened; pixels that fall out of the cleaned
    /// support are pushed below 0.5 and filled holes are lifted to at least 0.5.
    pub fn refine_with_edges(&self, image: &RgbImage) -> Result<Self> {
        if image.dimensions() != self.dimensions() {
            return Err(IsolationError::Validation {
                field: "mask".to_string(),
                reason: format!(
                    "extent {:?} does not match image {:?}",
                    self.dimensions(),
                    image.dimensions()
                ),
            });
        }

        let gray = image::imageops::grayscale(image);
        let edges = dilate(&canny(&gray, CANNY_LOW, CANNY_HIGH), Norm::LInf, 1);

        let mut data = self.data.clone();
        Zip::indexed(&mut data).par_for_each(|(y, x), value| {
            let edge = edges.get_pixel(x as u32, y as u32)[0] as f32 / 255.0;
            *value -= *value * EDGE_PENALTY * edge;
        });

        let support = Self { data: data.clone() }.binarize(0.5).to_luma8();
        let cleaned = open(&close(&support, Norm::LInf, MORPH_RADIUS), Norm::LInf, MORPH_RADIUS);

        Zip::indexed(&mut data).par_for_each(|(y, x), value| {
            *value = if cleaned.get_pixel(x as u32, y as u32)[0] > 0 {
                value.max(0.5)
            } else {
                value.min(0.49)
            };
        });

        Ok(Self { data })
    }
}

fn elliptical_falloff(bbox: &BoundingBox, x: f32, y: f32) -> f32 {
    let (cx, cy) = bbox.center();
    let rx = (bbox.width as f32 / 2.0).max(1.0);
    let ry = (bbox.height as f32 / 2.0).max(1.0);
    let d = (((x - cx) / rx).powi(2) + ((y - cy) / ry).powi(2)).sqrt();
    ((1.0 - d) * FALLOFF_GAIN).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::portrait_image;

    #[test]
    fn test_box_mask_is_solid_at_center_and_empty_outside() {
        let mask = Mask::from_boxes(100, 100, &[(BoundingBox::new(25, 25, 50, 50), 0.9)]);
        assert_eq!(mask.dimensions(), (100, 100));
        assert_eq!(mask.get(50, 50), 1.0);
        assert_eq!(mask.get(2, 2), 0.0);
        assert_eq!(mask.get(98, 50), 0.0);

        // soft boundary
        let edge = mask.get(72, 50);
        assert!(edge > 0.0 && edge < 1.0, "edge value {}", edge);
    }

    #[test]
    fn test_multiple_boxes_union_by_maximum() {
        let left = (BoundingBox::new(0, 0, 40, 40), 0.8);
        let right = (BoundingBox::new(60, 0, 40, 40), 0.6);
        let union = Mask::from_boxes(100, 40, &[left, right]);
        let only_left = Mask::from_boxes(100, 40, &[left]);

        assert_eq!(union.get(20, 20), 1.0);
        assert_eq!(union.get(80, 20), 1.0);
        assert_eq!(only_left.get(80, 20), 0.0);
        for (a, b) in union.as_array().iter().zip(only_left.as_array()) {
            assert!(a >= b);
        }
    }

    #[test]
    fn test_detection_without_boxes_uses_centered_ellipse() {
        let mask = Mask::from_detection(90, 90, &PersonDetection::none());
        assert_eq!(mask, Mask::centered_fallback(90, 90));
        assert_eq!(mask.get(45, 45), 1.0);
        assert_eq!(mask.get(10, 45), 0.0);
    }

    #[test]
    fn test_luma_conversion() {
        let mask = Mask::from_boxes(20, 20, &[(BoundingBox::new(5, 5, 10, 10), 1.0)]);
        let restored = Mask::from_luma8(&mask.to_luma8());
        for (a, b) in mask.as_array().iter().zip(restored.as_array()) {
            assert!((a - b).abs() <= 1.0 / 255.0);
        }
    }

    #[test]
    fn test_refinement_stays_in_range_and_keeps_core() -> Result<()> {
        let image = portrait_image(80, 100);
        let mask = Mask::from_boxes(80, 100, &[(BoundingBox::new(20, 15, 40, 70), 0.9)]);
        let refined = mask.refine_with_edges(&image)?;

        assert_eq!(refined.dimensions(), mask.dimensions());
        assert!(refined.as_array().iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(refined.get(40, 50) >= 0.5);
        assert!(refined.get(1, 1) < 0.5);
        Ok(())
    }

    #[test]
    fn test_refinement_rejects_mismatched_extent() {
        let image = portrait_image(40, 40);
        assert!(Mask::new(20, 20).refine_with_edges(&image).is_err());
    }

    #[test]
    fn test_from_array_clamps() {
        let mask = Mask::from_array(Array2::from_elem((2, 2), 3.0));
        assert_eq!(mask.get(1, 1), 1.0);
        assert_eq!(mask.coverage(), 1.0);
    }
}
