//! Frame compression for transmission.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbImage};

/// Compresses a rendered frame. A failure leaves the previous snapshot published.
pub trait FrameEncoder: Send {
    fn encode(&mut self, image: &RgbImage) -> Result<Vec<u8>>;

    /// MIME type of the encoded bytes.
    fn content_type(&self) -> &'static str;
}

/// Baseline JPEG at a fixed quality.
#[derive(Clone, Debug)]
pub struct JpegCodec {
    quality: u8,
}

impl JpegCodec {
    pub const DEFAULT_QUALITY: u8 = 85;

    /// Quality is clamped into `1..=100`.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Default for JpegCodec {
    fn default() -> Self {
        Self::new(Self::DEFAULT_QUALITY)
    }
}

impl FrameEncoder for JpegCodec {
    fn encode(&mut self, image: &RgbImage) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(image.as_raw().len() / 8);
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .write_image(
                image.as_raw(),
                image.width(),
                image.height(),
                ExtendedColorType::Rgb8,
            )
            .context("encode JPEG frame")?;
        Ok(out)
    }

    fn content_type(&self) -> &'static str {
        "image/jpeg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_output_has_soi_and_eoi_markers() {
        let image = RgbImage::from_pixel(32, 16, image::Rgb([36, 36, 36]));
        let bytes = JpegCodec::default().encode(&image).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(&bytes[bytes.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn quality_is_clamped() {
        assert_eq!(JpegCodec::new(0).quality(), 1);
        assert_eq!(JpegCodec::new(200).quality(), 100);
    }
}
