//! 二维图像编码

use crate::cache::EncodedImage;
use crate::error::{ReconstructionError, Result};
use bytes::Bytes;
use image::{DynamicImage, ImageBuffer, ImageFormat, Luma};
use ndarray::Array2;
use std::io::Cursor;

/// 8位灰度图像编码为PNG
pub fn encode_png(pixels: &Array2<u8>) -> Result<EncodedImage> {
    let (height, width) = pixels.dim();
    if width == 0 || height == 0 {
        return Err(ReconstructionError::InvalidRequest("图像尺寸为零".to_string()));
    }
    let raw: Vec<u8> = pixels.iter().copied().collect();
    let buffer = ImageBuffer::<Luma<u8>, _>::from_raw(width as u32, height as u32, raw)
        .ok_or_else(|| ReconstructionError::Internal("像素缓冲区尺寸不匹配".to_string()))?;

    let mut encoded = Vec::new();
    DynamicImage::ImageLuma8(buffer)
        .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
        .map_err(|e| ReconstructionError::Internal(format!("PNG编码失败: {}", e)))?;

    Ok(EncodedImage {
        bytes: Bytes::from(encoded),
        width: width as u32,
        height: height as u32,
        format: "png",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_png_dimensions_and_signature() {
        let pixels = Array2::from_shape_fn((3, 5), |(r, c)| (r * 50 + c) as u8);
        let image = encode_png(&pixels).unwrap();
        assert_eq!((image.width, image.height), (5, 3));
        assert_eq!(&image.bytes[..8], b"\x89PNG\r\n\x1a\n");

        let decoded = image::load_from_memory(&image.bytes).unwrap().to_luma8();
        assert_eq!(decoded.get_pixel(4, 2).0[0], 104);
    }

    #[test]
    fn test_empty_image_is_rejected() {
        assert!(encode_png(&Array2::zeros((0, 4))).is_err());
    }
}
