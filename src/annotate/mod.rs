//! Frame overlays.
//!
//! The annotator turns one frame plus the tick's located tracks into the rendered image
//! that gets encoded and published. Privacy blur runs first, on the raw pixels, so no
//! unmasked face ever reaches the encoder. Boxes, labels, and the HUD line are drawn
//! on top of the blurred image.

pub mod label;

pub use label::LabelFont;

use anyhow::Result;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::filter::gaussian_blur_f32;
use imageproc::rect::Rect;
use serde::Serialize;

use crate::config::DetectorConfig;
use crate::detect::{DetectionCapability, DetectorBackend};
use crate::frame::{scrub, Frame};
use crate::pipeline::GeoTrack;
use crate::{BBox, CameraPose, GeoPoint, Mode};

pub const BLUR_SIGMA: f32 = 8.0;
const BOX_THICKNESS: i32 = 2;

const SAR_COLOR: Rgb<u8> = Rgb([255, 191, 0]);
const SUSPECT_COLOR: Rgb<u8> = Rgb([230, 40, 40]);
const LABEL_TEXT: Rgb<u8> = Rgb([16, 16, 16]);
const HUD_TEXT: Rgb<u8> = Rgb([240, 240, 240]);
const HUD_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);

/// How face regions are found for privacy blur.
pub enum FaceLocator {
    /// A dedicated face detector, separate from the main object detector.
    Model(Box<dyn DetectorBackend>),
    /// Head-and-shoulders estimate from `person` tracks: the upper fifth of the box,
    /// middle 60% of its width.
    HeadRegions,
}

impl FaceLocator {
    /// Face model from `face_model_path`, or head regions when none is configured or it
    /// cannot be loaded.
    pub fn from_config(config: &DetectorConfig) -> Self {
        let Some(path) = config.face_model_path.as_ref() else {
            return FaceLocator::HeadRegions;
        };

        #[cfg(feature = "backend-tract")]
        {
            match crate::detect::TractBackend::face(path, config.input_size) {
                Ok(backend) => {
                    log::info!("annotate: face model loaded from {}", path.display());
                    FaceLocator::Model(Box::new(
                        backend.with_thresholds(config.confidence, config.iou),
                    ))
                }
                Err(e) => {
                    log::error!(
                        "annotate: face model {} unavailable ({:#}); using head regions",
                        path.display(),
                        e
                    );
                    FaceLocator::HeadRegions
                }
            }
        }

        #[cfg(not(feature = "backend-tract"))]
        {
            log::error!(
                "annotate: face model {} configured but built without backend-tract; using head regions",
                path.display()
            );
            FaceLocator::HeadRegions
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FaceLocator::Model(backend) => backend.name(),
            FaceLocator::HeadRegions => "head-regions",
        }
    }

    /// Regions to blur this tick. A face model that fails falls back to head regions,
    /// so an enabled blur never publishes a frame unmasked.
    fn locate(&mut self, image: &RgbImage, tracks: &[GeoTrack]) -> Vec<BBox> {
        if let FaceLocator::Model(backend) = self {
            match backend.detect(image.as_raw(), image.width(), image.height()) {
                Ok(faces) => return faces.iter().map(|face| face.bbox()).collect(),
                Err(e) => log::warn!(
                    "annotate: face model {} failed, blurring head regions: {:#}",
                    backend.name(),
                    e
                ),
            }
        }
        head_regions(tracks)
    }
}

fn head_regions(tracks: &[GeoTrack]) -> Vec<BBox> {
    tracks
        .iter()
        .filter(|entry| entry.track.class_label() == "person")
        .map(|entry| head_region(&entry.track.bbox()))
        .collect()
}

fn head_region(bbox: &BBox) -> BBox {
    let inset = bbox.width() * 0.2;
    BBox::new(
        bbox.x1 + inset,
        bbox.y1,
        bbox.x2 - inset,
        bbox.y1 + bbox.height() / 5.0,
    )
}

/// Serializable per-track row published with each snapshot.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionSummary {
    pub id: u64,
    pub class: String,
    pub confidence: f32,
    /// Pixel box `[x1, y1, x2, y2]`.
    pub bbox: [f32; 4],
    /// Box normalized by frame size.
    pub bbox_norm: [f32; 4],
    pub geo: Option<GeoPoint>,
}

impl DetectionSummary {
    pub fn from_track(entry: &GeoTrack, width: u32, height: u32) -> Self {
        let bbox = entry.track.bbox();
        let w = width.max(1) as f32;
        let h = height.max(1) as f32;
        Self {
            id: entry.track.id(),
            class: entry.track.class_label().to_string(),
            confidence: entry.track.confidence(),
            bbox: bbox.as_array(),
            bbox_norm: [bbox.x1 / w, bbox.y1 / h, bbox.x2 / w, bbox.y2 / h],
            geo: Some(entry.geo),
        }
    }
}

/// Per-tick overlay settings, read once at the top of the tick.
#[derive(Clone, Copy, Debug)]
pub struct Overlay {
    pub mode: Mode,
    pub privacy_blur: bool,
    pub pose: CameraPose,
}

pub struct Annotated {
    pub image: RgbImage,
    pub summaries: Vec<DetectionSummary>,
    pub faces_blurred: usize,
}

pub struct Annotator {
    faces: FaceLocator,
    labels: Option<LabelFont>,
}

impl Annotator {
    pub fn new(faces: FaceLocator) -> Self {
        if let FaceLocator::Model(backend) = &faces {
            if !backend.supports(DetectionCapability::FaceDetection) {
                log::warn!(
                    "annotate: face locator {} does not advertise face detection",
                    backend.name()
                );
            }
        }
        Self {
            faces,
            labels: None,
        }
    }

    /// Font for track labels and the HUD line. Without one only boxes are drawn.
    pub fn with_labels(mut self, labels: Option<LabelFont>) -> Self {
        self.labels = labels;
        self
    }

    pub fn face_locator(&self) -> &str {
        self.faces.name()
    }

    pub fn label_font(&self) -> Option<&LabelFont> {
        self.labels.as_ref()
    }

    /// Render overlays for one tick. The frame is consumed.
    pub fn annotate(
        &mut self,
        frame: Frame,
        tracks: &[GeoTrack],
        overlay: &Overlay,
    ) -> Result<Annotated> {
        let mut image = frame.into_rgb_image()?;
        let (width, height) = image.dimensions();

        let mut faces_blurred = 0;
        if overlay.privacy_blur {
            for region in self.faces.locate(&image, tracks) {
                if blur_region(&mut image, &region) {
                    faces_blurred += 1;
                }
            }
        }

        let color = match overlay.mode {
            Mode::Sar => SAR_COLOR,
            Mode::Suspect => SUSPECT_COLOR,
        };
        for entry in tracks {
            draw_track(&mut image, entry, color, self.labels.as_ref());
        }
        if let Some(font) = &self.labels {
            draw_hud(&mut image, overlay, font);
        }

        let summaries = tracks
            .iter()
            .map(|entry| DetectionSummary::from_track(entry, width, height))
            .collect();

        Ok(Annotated {
            image,
            summaries,
            faces_blurred,
        })
    }
}

impl Default for Annotator {
    fn default() -> Self {
        Self::new(FaceLocator::HeadRegions)
    }
}

/// Gaussian-blur one region in place. Returns false when the region is empty after clipping.
fn blur_region(image: &mut RgbImage, region: &BBox) -> bool {
    let clipped = region.clamp_to(image.width(), image.height());
    let x = clipped.x1.floor() as u32;
    let y = clipped.y1.floor() as u32;
    let w = (clipped.x2.ceil() as u32).saturating_sub(x);
    let h = (clipped.y2.ceil() as u32).saturating_sub(y);
    if w == 0 || h == 0 {
        return false;
    }
    let mut patch = image::imageops::crop_imm(&*image, x, y, w, h).to_image();
    let blurred = gaussian_blur_f32(&patch, BLUR_SIGMA);
    scrub(&mut patch);
    image::imageops::replace(image, &blurred, i64::from(x), i64::from(y));
    true
}

fn track_label(entry: &GeoTrack) -> String {
    format!(
        "id{} {} {:.2}",
        entry.track.id(),
        entry.track.class_label(),
        entry.track.confidence()
    )
}

fn draw_track(image: &mut RgbImage, entry: &GeoTrack, color: Rgb<u8>, font: Option<&LabelFont>) {
    let bbox = entry.track.bbox().clamp_to(image.width(), image.height());
    let w = bbox.width().round() as u32;
    let h = bbox.height().round() as u32;
    if w == 0 || h == 0 {
        return;
    }
    let x = bbox.x1.round() as i32;
    let y = bbox.y1.round() as i32;
    for offset in 0..BOX_THICKNESS {
        let rect = Rect::at(x - offset, y - offset)
            .of_size(w + (offset * 2) as u32, h + (offset * 2) as u32);
        draw_hollow_rect_mut(image, rect, color);
    }

    let Some(font) = font else {
        return;
    };
    let above = y - BOX_THICKNESS - font.line_height();
    let label_y = if above >= 0 {
        above
    } else {
        (bbox.y2.round() as i32) + BOX_THICKNESS
    };
    font.draw(image, &track_label(entry), x - BOX_THICKNESS + 1, label_y, LABEL_TEXT, color);
}

fn draw_hud(image: &mut RgbImage, overlay: &Overlay, font: &LabelFont) {
    let heading = overlay.pose.yaw_deg.rem_euclid(360.0);
    let mut hud = format!(
        "{} ALT {:.0}M HDG {:03.0}",
        overlay.mode.as_str(),
        overlay.pose.altitude_m,
        heading
    );
    if overlay.privacy_blur {
        hud.push_str(" BLUR");
    }
    font.draw(image, &hud, 4, 4, HUD_TEXT, HUD_BACKGROUND);
}
