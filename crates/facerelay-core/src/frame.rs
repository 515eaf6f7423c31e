//! Image codec helpers: decode inbound bytes, normalize and re-encode crops.

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use thiserror::Error;

/// JPEG quality used for the canonical crop encoding.
pub const CROP_JPEG_QUALITY: u8 = 95;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("image has zero area ({width}x{height})")]
    Empty { width: u32, height: u32 },
    #[error("image decode failed: {0}")]
    Decode(#[source] image::ImageError),
    #[error("image encode failed: {0}")]
    Encode(#[source] image::ImageError),
}

/// Decode any supported container (JPEG, PNG, ...) into 8-bit RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, FrameError> {
    let image = image::load_from_memory(bytes)
        .map_err(FrameError::Decode)?
        .to_rgb8();
    if image.width() == 0 || image.height() == 0 {
        return Err(FrameError::Empty {
            width: image.width(),
            height: image.height(),
        });
    }
    Ok(image)
}

/// Encode an RGB image as JPEG, the canonical crop encoding on the work queue.
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, FrameError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(FrameError::Empty {
            width: image.width(),
            height: image.height(),
        });
    }
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, CROP_JPEG_QUALITY);
    image.write_with_encoder(encoder).map_err(FrameError::Encode)?;
    Ok(buf)
}

/// Stretch intensities so the darkest sample maps to 0 and the brightest to 255.
///
/// A flat image (all samples equal) is left untouched.
pub fn normalize_min_max(image: &mut RgbImage) {
    let (min, max) = image
        .as_raw()
        .iter()
        .fold((u8::MAX, u8::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if max <= min {
        return;
    }
    let range = (max - min) as f32;
    for v in image.iter_mut() {
        *v = (((*v - min) as f32 / range) * 255.0).round() as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_jpeg_roundtrip_keeps_dimensions() {
        let img = RgbImage::from_pixel(48, 32, Rgb([200, 40, 40]));
        let bytes = encode_jpeg(&img).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8], "JPEG SOI marker");
        let back = decode_image(&bytes).unwrap();
        assert_eq!(back.dimensions(), (48, 32));
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = decode_image(b"definitely not an image").unwrap_err();
        assert!(matches!(err, FrameError::Decode(_)));
    }

    #[test]
    fn test_decode_empty_fails() {
        assert!(decode_image(&[]).is_err());
    }

    #[test]
    fn test_encode_zero_area_fails() {
        let img = RgbImage::new(0, 10);
        assert!(matches!(encode_jpeg(&img), Err(FrameError::Empty { .. })));
    }

    #[test]
    fn test_normalize_stretches_range() {
        let mut img = RgbImage::from_fn(4, 1, |x, _| Rgb([100 + x as u8 * 10; 3]));
        normalize_min_max(&mut img);
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(img.get_pixel(3, 0).0, [255, 255, 255]);
        assert_eq!(img.get_pixel(1, 0).0, [85, 85, 85]);
    }

    #[test]
    fn test_normalize_flat_image_unchanged() {
        let mut img = RgbImage::from_pixel(3, 3, Rgb([7, 7, 7]));
        normalize_min_max(&mut img);
        assert!(img.pixels().all(|p| p.0 == [7, 7, 7]));
    }
}
