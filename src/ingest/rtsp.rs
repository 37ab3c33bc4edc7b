//! Network stream source.
//!
//! `RtspSource` decodes RTSP, UDP, or file URIs through a GStreamer `uridecodebin`
//! pipeline into RGB frames. `stub://` URLs map to the synthetic pattern so the whole
//! pipeline runs without a camera.
//!
//! A stalled stream yields `FrameRead::Pending`. After a bus error or end-of-stream the
//! pipeline is restarted, at most once per `RECONNECT_INTERVAL`.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::Result;
use serde::Serialize;
#[cfg(feature = "rtsp-gstreamer")]
use std::time::{Duration, Instant};

use crate::frame::FrameRead;
#[cfg(feature = "rtsp-gstreamer")]
use crate::frame::Frame;
use crate::ingest::{SyntheticSource, VideoSource};

/// Configuration for a stream source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// Stream URL (e.g., "rtsp://192.168.1.100:554/stream", "udp://0.0.0.0:11111").
    pub url: String,
    /// Expected frame rate; bounds the pull timeout.
    pub target_fps: u32,
    /// Frame width (synthetic frames only).
    pub width: u32,
    /// Frame height (synthetic frames only).
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "stub://synthetic".to_string(),
            target_fps: 15,
            width: 640,
            height: 360,
        }
    }
}

/// Statistics for a source.
#[derive(Clone, Debug, Serialize)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub url: String,
}

/// Stream source.
///
/// Uses GStreamer for real decode, with a synthetic fallback for `stub://` URLs.
pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        if config.url.starts_with("stub://") || config.url == "synthetic" {
            Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticSource::new(
                    config.url,
                    config.width,
                    config.height,
                )),
            })
        } else {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    backend: RtspBackend::Gstreamer(GstreamerSource::new(config)?),
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                anyhow::bail!(
                    "stream source {} requires the rtsp-gstreamer feature",
                    config.url
                )
            }
        }
    }
}

impl VideoSource for RtspSource {
    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.connect(),
        }
    }

    fn next_frame(&mut self) -> Result<FrameRead> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.next_frame(),
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.is_healthy(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.is_healthy(),
        }
    }

    fn stats(&self) -> SourceStats {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.stats(),
        }
    }
}

// ----------------------------------------------------------------------------
// Production source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerSource {
    config: RtspConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerSource {
    /// Build `uridecodebin ! videoconvert ! appsink` with RGB caps.
    fn new(config: RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let uri = gst_uri(&config.url);
        let pipeline_description = format!(
            "uridecodebin uri={} ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            uri
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build stream pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("stream pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            config,
            pipeline,
            appsink,
            frame_count: 0,
            last_frame_at: None,
            connected_at: None,
            last_error: None,
        })
    }

    fn connect(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set stream pipeline to Playing")?;
        self.connected_at = Some(Instant::now());
        self.last_error = None;
        log::info!("RtspSource: connected to {}", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<FrameRead> {
        self.poll_bus();

        if let Some(error) = self.last_error.clone() {
            let due = self
                .connected_at
                .map_or(true, |at| at.elapsed() >= RECONNECT_INTERVAL);
            if !due {
                return Ok(FrameRead::Pending);
            }
            log::warn!("RtspSource: restarting {} after: {}", self.config.url, error);
            self.pipeline
                .set_state(gstreamer::State::Null)
                .context("reset stream pipeline")?;
            self.connect()?;
        }

        let Some(sample) = self.appsink.try_pull_sample(self.frame_timeout()) else {
            return Ok(FrameRead::Pending);
        };

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        let sequence = self.frame_count;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());

        Ok(FrameRead::Ready(Frame::from_rgb(pixels, width, height, sequence)?))
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= Duration::from_secs(5);
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.config.url.clone(),
        }
    }

    fn frame_timeout(&self) -> gstreamer::ClockTime {
        let base_ms = if self.config.target_fps == 0 {
            100
        } else {
            (1000 / self.config.target_fps).saturating_mul(2)
        };
        gstreamer::ClockTime::from_mseconds(u64::from(base_ms.clamp(20, 500)))
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            2_000
        } else {
            (1000 / self.config.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

/// Plain filesystem paths become `file://` URIs; everything else passes through.
#[cfg(any(feature = "rtsp-gstreamer", test))]
fn gst_uri(url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        let path = std::path::Path::new(url);
        let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        format!("file://{}", absolute.display())
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("stream sample missing buffer")?;
    let caps = sample.caps().context("stream sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse stream caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map stream buffer")?;
    let data = map.as_slice();

    if stride == row_bytes && data.len() == row_bytes * height as usize {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("stream buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
