use image::{ImageBuffer, Pixel, Primitive, Rgb, RgbImage, Rgba};
use num_traits::AsPrimitive;

use crate::errors::{IsolationError, Result};
use crate::imageops_ai::get_max_value;
use crate::mask::Mask;

/// マスクをアルファチャンネルとして適用する
pub trait AlphaMaskApplicable<S>
where
    Rgba<S>: Pixel<Subpixel = S>,
    S: Primitive + AsPrimitive<f32> + 'static,
{
    fn apply_alpha_mask(&self, mask: &Mask) -> Result<ImageBuffer<Rgba<S>, Vec<S>>>;
}

impl<S> AlphaMaskApplicable<S> for ImageBuffer<Rgb<S>, Vec<S>>
where
    Rgb<S>: Pixel<Subpixel = S>,
    Rgba<S>: Pixel<Subpixel = S>,
    S: Primitive + AsPrimitive<f32> + 'static,
    f32: AsPrimitive<S>,
{
    fn apply_alpha_mask(&self, mask: &Mask) -> Result<ImageBuffer<Rgba<S>, Vec<S>>> {
        ensure_same_extent(self.dimensions(), mask)?;

        let max: f32 = get_max_value::<S>().as_();
        let pixels = self
            .enumerate_pixels()
            .flat_map(|(x, y, &Rgb([red, green, blue]))| {
                let alpha: S = (mask.get(x, y) * max).round().as_();
                [red, green, blue, alpha]
            })
            .collect::<Vec<S>>();

        ImageBuffer::from_raw(self.width(), self.height(), pixels).ok_or_else(|| {
            IsolationError::Validation {
                field: "alpha mask".to_string(),
                reason: "pixel buffer does not match image extent".to_string(),
            }
        })
    }
}

/// Blends the foreground over a solid color, using the mask as blend weight.
pub fn composite_on_color(image: &RgbImage, mask: &Mask, color: [u8; 3]) -> Result<RgbImage> {
    ensure_same_extent(image.dimensions(), mask)?;

    Ok(RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let weight = mask.get(x, y);
        let Rgb(foreground) = *image.get_pixel(x, y);
        let mut blended = [0u8; 3];
        for ((out, fg), bg) in blended.iter_mut().zip(foreground).zip(color) {
            *out = (fg as f32 * weight + bg as f32 * (1.0 - weight)).round() as u8;
        }
        Rgb(blended)
    }))
}

fn ensure_same_extent(dimensions: (u32, u32), mask: &Mask) -> Result<()> {
    if dimensions != mask.dimensions() {
        return Err(IsolationError::Validation {
            field: "mask".to_string(),
            reason: format!(
                "画像とマスクのサイズが一致しません: 画像{}x{}, マスク{}x{}",
                dimensions.0,
                dimensions.1,
                mask.width(),
                mask.height()
            ),
        });
    }
    Ok(())
}
