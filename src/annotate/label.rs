//! Overlay text rendered from a TrueType/OpenType font.
//!
//! No font is bundled. `LabelFont::discover` loads a configured font file, or the first
//! common system font it finds. Without one the annotator draws boxes only.

use std::path::{Path, PathBuf};

use ab_glyph::{FontVec, PxScale};
use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

pub const DEFAULT_SCALE: f32 = 14.0;

/// Padding around text drawn on a background, in pixels.
const PAD: i32 = 2;

const SYSTEM_FONT_PATHS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSansMono.ttf",
    "/usr/share/fonts/dejavu-sans-mono-fonts/DejaVuSansMono.ttf",
    "/usr/share/fonts/TTF/DejaVuSansMono.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationMono-Regular.ttf",
    "/System/Library/Fonts/Menlo.ttc",
];

pub struct LabelFont {
    font: FontVec,
    scale: PxScale,
    source: PathBuf,
}

impl LabelFont {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read font {}", path.display()))?;
        let font = FontVec::try_from_vec(bytes)
            .map_err(|_| anyhow!("{} is not a usable font file", path.display()))?;
        Ok(Self {
            font,
            scale: PxScale::from(DEFAULT_SCALE),
            source: path.to_path_buf(),
        })
    }

    /// The configured font, else the first system font found. `None` disables labels.
    pub fn discover(configured: Option<&Path>) -> Option<Self> {
        if let Some(path) = configured {
            match Self::from_path(path) {
                Ok(font) => return Some(font),
                Err(e) => log::error!("annotate: {:#}; trying system fonts", e),
            }
        }
        let found = SYSTEM_FONT_PATHS
            .iter()
            .map(Path::new)
            .filter(|path| path.is_file())
            .find_map(|path| Self::from_path(path).ok());
        if found.is_none() {
            log::warn!("annotate: no label font available; drawing boxes without text");
        }
        found
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = PxScale::from(scale);
        self
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Height of one line drawn by `draw`, padding included.
    pub fn line_height(&self) -> i32 {
        self.scale.y.ceil() as i32 + PAD * 2
    }

    /// Draw `text` with its top-left at `(x, y)` on a filled background.
    pub fn draw(
        &self,
        image: &mut RgbImage,
        text: &str,
        x: i32,
        y: i32,
        color: Rgb<u8>,
        background: Rgb<u8>,
    ) {
        let (w, _) = text_size(self.scale, &self.font, text);
        if w == 0 {
            return;
        }
        let rect = Rect::at(x, y).of_size(w + (PAD * 2) as u32, self.line_height() as u32);
        draw_filled_rect_mut(image, rect, background);
        draw_text_mut(image, color, x + PAD, y + PAD, self.scale, &self.font, text);
    }
}

impl std::fmt::Debug for LabelFont {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabelFont")
            .field("source", &self.source)
            .field("scale", &self.scale.y)
            .finish_non_exhaustive()
    }
}
