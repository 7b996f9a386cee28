use image::{imageops, GenericImageView, ImageBuffer, Pixel, Primitive};

/// 画像を正方形キャンバスの中央に配置する
///
/// Returns the padded image and the offset of the original inside it.
pub fn pad_to_square<I, P, S>(image: &I, color: P) -> (ImageBuffer<P, Vec<S>>, (u32, u32))
where
    I: GenericImageView<Pixel = P>,
    P: Pixel<Subpixel = S>,
    S: Primitive,
{
    let (width, height) = image.dimensions();
    let side = width.max(height);
    let (x, y) = ((side - width) / 2, (side - height) / 2);

    let mut canvas = ImageBuffer::from_pixel(side, side, color);
    imageops::overlay(&mut canvas, image, x as i64, y as i64);
    (canvas, (x, y))
}
