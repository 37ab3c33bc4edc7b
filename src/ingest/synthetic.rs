use anyhow::Result;

use crate::detect::SyntheticBackend;
use crate::frame::{rgb_len, Frame, FrameRead};
use crate::ingest::{SourceStats, VideoSource};

const BACKGROUND: u8 = 36;
const SUBJECT: [u8; 3] = [196, 164, 132];

/// Generated test pattern: a dark gray field with one walking figure.
///
/// The figure occupies exactly the box `SyntheticBackend` reports for the same
/// sequence number, so synthetic detections line up with the pixels.
pub struct SyntheticSource {
    url: String,
    width: u32,
    height: u32,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(url: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            url: url.into(),
            width,
            height,
            frame_count: 0,
        }
    }

    fn render(&self, sequence: u64) -> Result<Vec<u8>> {
        let mut pixels = vec![BACKGROUND; rgb_len(self.width, self.height)?];
        if let Some(bbox) = SyntheticBackend::box_at(sequence, self.width, self.height) {
            let bbox = bbox.clamp_to(self.width, self.height);
            let stride = self.width as usize * 3;
            for y in bbox.y1 as usize..bbox.y2 as usize {
                for x in bbox.x1 as usize..bbox.x2 as usize {
                    let idx = y * stride + x * 3;
                    pixels[idx..idx + 3].copy_from_slice(&SUBJECT);
                }
            }
        }
        Ok(pixels)
    }
}

impl VideoSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!("SyntheticSource: connected to {} (synthetic)", self.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<FrameRead> {
        let sequence = self.frame_count;
        let pixels = self.render(sequence)?;
        self.frame_count += 1;
        Ok(FrameRead::Ready(Frame::from_rgb(
            pixels,
            self.width,
            self.height,
            sequence,
        )?))
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.url.clone(),
        }
    }
}
