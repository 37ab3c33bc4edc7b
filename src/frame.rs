//! Owned pixel frames.
//!
//! - `Frame`: RGB8 pixel grid produced once per tick by a video source. Bytes are private,
//!   there is no `Clone`, and the buffer is zeroized when the frame is dropped.
//! - `FrameRead`: result of asking a source for the next frame.
//!
//! Frames are ephemeral. The worker hands the pixels to the detector by reference and
//! then moves them into the annotator. The rendered image is passed to `scrub` once it
//! has been encoded, so nothing retains frame pixels after publication.

use anyhow::{anyhow, Result};
use image::RgbImage;
use zeroize::Zeroize;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One decoded video frame in packed RGB8 layout.
pub struct Frame {
    /// Private pixel data, `width * height * 3` bytes.
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Source-assigned sequence number (monotonic per source).
    pub sequence: u64,
}

// Explicitly NOT implementing Clone: a tick owns exactly one frame.

impl Frame {
    /// Wrap packed RGB8 bytes. Fails when the buffer length does not match the dimensions.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            sequence,
        })
    }

    /// A frame filled with one color.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3], sequence: u64) -> Result<Self> {
        let len = rgb_len(width, height)?;
        let mut data = Vec::with_capacity(len);
        for _ in 0..(len / 3) {
            data.extend_from_slice(&rgb);
        }
        Self::from_rgb(data, width, height, sequence)
    }

    /// Read-only pixel access for detector backends.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Consume the frame into an image buffer for rendering. The caller owns the pixels
    /// from here on and should `scrub` the image when done with it.
    pub fn into_rgb_image(mut self) -> Result<RgbImage> {
        let data = std::mem::take(&mut self.data);
        RgbImage::from_raw(self.width, self.height, data)
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Zero every pixel of a rendered or cropped image.
pub fn scrub(image: &mut RgbImage) {
    let pixels: &mut [u8] = image;
    pixels.zeroize();
}

pub(crate) fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

// ----------------------------------------------------------------------------
// FrameRead
// ----------------------------------------------------------------------------

/// Outcome of a single `VideoSource::next_frame` call.
#[derive(Debug)]
pub enum FrameRead {
    /// A frame is ready for this tick.
    Ready(Frame),
    /// Nothing available yet. Transient: the caller backs off and retries the same tick.
    Pending,
}

impl FrameRead {
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            FrameRead::Ready(frame) => Some(frame),
            FrameRead::Pending => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rgb_rejects_wrong_length() {
        assert!(Frame::from_rgb(vec![0u8; 10], 2, 2, 0).is_err());
        assert!(Frame::from_rgb(vec![0u8; 12], 2, 2, 0).is_ok());
    }

    #[test]
    fn solid_frame_round_trips_into_image() {
        let frame = Frame::solid(4, 3, [10, 20, 30], 7).unwrap();
        assert_eq!(frame.sequence, 7);
        assert_eq!(frame.pixels().len(), 36);
        let image = frame.into_rgb_image().unwrap();
        assert_eq!(image.dimensions(), (4, 3));
        assert_eq!(image.get_pixel(3, 2).0, [10, 20, 30]);
    }

    #[test]
    fn scrub_zeroes_rendered_pixels() {
        let mut image = Frame::solid(8, 4, [200, 100, 50], 0)
            .unwrap()
            .into_rgb_image()
            .unwrap();
        scrub(&mut image);
        assert_eq!(image.dimensions(), (8, 4));
        assert!(image.as_raw().iter().all(|&b| b == 0));
    }

    #[test]
    fn pending_has_no_frame() {
        assert!(FrameRead::Pending.into_frame().is_none());
    }
}
