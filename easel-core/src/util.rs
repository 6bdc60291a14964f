use anyhow::Result;
use base64::{prelude::BASE64_STANDARD, Engine};
use candle_core::{Device, Tensor};
use image::{imageops::FilterType, DynamicImage};

use crate::EaselError;

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Decodes a base64 reference image (optionally a `data:` URL), resizes it to
/// the requested output size and returns a u8 tensor shaped (3, height, width).
pub fn decode_reference_image(
    encoded: &str,
    width: usize,
    height: usize,
    device: &Device,
) -> Result<Tensor, EaselError> {
    let payload = match encoded.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    }
    .trim();
    if payload.is_empty() {
        return Err(EaselError::InvalidInput("reference image is empty".into()));
    }
    let bytes = BASE64_STANDARD
        .decode(payload)
        .map_err(|e| EaselError::InvalidInput(format!("reference image is not valid base64: {e}")))?;
    let img = image::load_from_memory(&bytes)
        .map_err(|e| EaselError::InvalidInput(format!("failed to decode reference image: {e}")))?;
    let rgb = img
        .resize_exact(width as u32, height as u32, FilterType::Lanczos3)
        .to_rgb8();
    let tensor = Tensor::from_vec(rgb.into_raw(), (height, width, 3), device)?;
    Ok(tensor.permute((2, 0, 1))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encoded_png(width: u32, height: u32) -> String {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            width,
            height,
            image::Rgb([200, 10, 30]),
        ));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        BASE64_STANDARD.encode(&bytes)
    }

    #[test]
    fn decodes_and_resizes_reference() {
        let b64 = format!("data:image/png;base64,{}", encoded_png(20, 10));
        let tensor = decode_reference_image(&b64, 16, 8, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims3().unwrap(), (3, 8, 16));
        let back = tensor_to_image(&tensor).unwrap();
        let red = back.to_rgb8().get_pixel(3, 3).0[0];
        assert!((198..=202).contains(&red));
    }

    #[test]
    fn rejects_garbage() {
        let err = decode_reference_image("not base64!!", 8, 8, &Device::Cpu).unwrap_err();
        assert!(matches!(err, EaselError::InvalidInput(_)));
        let err = decode_reference_image(&BASE64_STANDARD.encode(b"hello"), 8, 8, &Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, EaselError::InvalidInput(_)));
        assert!(decode_reference_image("  ", 8, 8, &Device::Cpu).is_err());
    }
}
