//! Video sources.
//!
//! A source produces the next raw frame or reports that none is ready yet:
//! - Synthetic source (`stub://` URLs, demos and tests)
//! - RTSP / UDP / file streams decoded by GStreamer (feature: rtsp-gstreamer)
//!
//! `FrameRead::Pending` is the transient "nothing yet" signal; the pipeline backs off and
//! retries the same tick. `Err` is reserved for unexpected read failures.

pub mod rtsp;
pub mod synthetic;

use anyhow::Result;

use crate::frame::FrameRead;

pub use rtsp::{RtspConfig, RtspSource, SourceStats};
pub use synthetic::SyntheticSource;

/// The video source capability consumed by the pipeline worker.
pub trait VideoSource: Send {
    /// Open the underlying stream. Called once before the first `next_frame`.
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Produce the next frame, or `Pending` when none is ready.
    fn next_frame(&mut self) -> Result<FrameRead>;

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats;
}

/// Open the source named by `config.url`.
pub fn open_source(config: RtspConfig) -> Result<Box<dyn VideoSource>> {
    Ok(Box::new(RtspSource::new(config)?))
}
