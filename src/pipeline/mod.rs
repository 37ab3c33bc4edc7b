//! Pipeline runner.
//!
//! One dedicated worker thread runs the tick loop serially:
//! source -> detector -> tracker -> geolocation -> annotation -> encoding -> publish.
//!
//! State machine: Stopped -> Running -> Stopped. `start` is idempotent and spawns at most
//! one worker. `stop` raises a flag and joins the worker after its in-flight tick; the
//! worker hands the stages back, so tracker identities continue across restarts.
//!
//! No per-tick failure ends the worker:
//! - `FrameRead::Pending` backs off and retries without touching counters or the snapshot.
//! - A source `Err` backs off, retries, and counts toward `consecutive_source_failures`.
//! - A detector failure substitutes an empty set (`DetectorStatus::Degraded`).
//! - An encode failure keeps the previous snapshot (`TickOutcome::EncodeFailed`).
//!
//! Persistent failure shows up as `Health::Stale` in `PipelineState`, never as termination.

mod controls;
mod snapshot;
mod stats;

pub use controls::Controls;
pub use snapshot::{FrameStats, GeoTrack, Snapshot, SnapshotCell};
pub use stats::{mean_geo_error, RollingStats};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::annotate::{Annotator, DetectionSummary, FaceLocator, LabelFont, Overlay};
use crate::codec::{FrameEncoder, JpegCodec};
use crate::config::ForesightConfig;
use crate::detect::{Detector, DetectorStatus};
use crate::frame::{scrub, Frame, FrameRead};
use crate::geo::GeoEstimator;
use crate::ingest::{open_source, VideoSource};
use crate::track::Tracker;
use crate::{CameraPose, Mode};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Repeating failures are logged on the first hit and every `LOG_EVERY`th after.
const LOG_EVERY: u64 = 100;

// ----------------------------------------------------------------------------
// Options and stages
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
pub struct RunnerOptions {
    /// Upper bound on the tick rate; each tick waits out the rest of `1 / target_fps`.
    pub target_fps: f64,
    /// Sleep between retries when the source has no frame.
    pub source_backoff: Duration,
    /// Snapshot age beyond which a running pipeline reports `stale`.
    pub stale_after: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            target_fps: 15.0,
            source_backoff: Duration::from_millis(10),
            stale_after: Duration::from_millis(5_000),
        }
    }
}

/// Everything the worker owns while running.
pub struct Stages {
    source: Box<dyn VideoSource>,
    detector: Detector,
    tracker: Tracker,
    geo: GeoEstimator,
    annotator: Annotator,
    encoder: Box<dyn FrameEncoder>,
    source_connected: bool,
}

impl Stages {
    pub fn new(
        source: Box<dyn VideoSource>,
        detector: Detector,
        tracker: Tracker,
        annotator: Annotator,
        encoder: Box<dyn FrameEncoder>,
    ) -> Self {
        Self {
            source,
            detector,
            tracker,
            geo: GeoEstimator::new(),
            annotator,
            encoder,
            source_connected: false,
        }
    }

    /// Assemble every stage named by configuration.
    pub fn from_config(config: &ForesightConfig) -> Result<Self> {
        let source = open_source(config.source.clone())
            .with_context(|| format!("open source {}", config.source.url))?;
        let detector = Detector::from_config(&config.detector);
        let annotator = Annotator::new(FaceLocator::from_config(&config.detector))
            .with_labels(LabelFont::discover(config.pipeline.font_path.as_deref()));
        log::info!(
            "pipeline: stages ready (synthetic_detector={} face_locator={} label_font={})",
            detector.is_synthetic(),
            annotator.face_locator(),
            annotator
                .label_font()
                .map_or_else(|| "none".to_string(), |font| font.source().display().to_string())
        );
        Ok(Self::new(
            source,
            detector,
            Tracker::new(config.tracker),
            annotator,
            Box::new(JpegCodec::new(config.pipeline.jpeg_quality)),
        ))
    }

    /// Run steps 2 through 6 of a tick on an acquired frame.
    fn process(&mut self, frame: Frame, overlay: &Overlay) -> TickOutcome {
        let started = Instant::now();
        let frame_sequence = frame.sequence;
        let (width, height) = (frame.width, frame.height);

        let detected = self.detector.infer(&frame);
        let tracks = self.tracker.update(&detected.detections);
        let located: Vec<GeoTrack> = tracks
            .into_iter()
            .map(|track| GeoTrack {
                geo: self
                    .geo
                    .estimate_bbox(&track.bbox(), width, height, &overlay.pose),
                track,
            })
            .collect();

        let mut annotated = match self.annotator.annotate(frame, &located, overlay) {
            Ok(annotated) => annotated,
            Err(e) => return TickOutcome::EncodeFailed(e.context("render frame")),
        };
        let encoded = self.encoder.encode(&annotated.image);
        scrub(&mut annotated.image);
        let encoded = match encoded {
            Ok(bytes) => bytes,
            Err(e) => return TickOutcome::EncodeFailed(e),
        };
        let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;

        TickOutcome::Published(Processed {
            frame_sequence,
            width,
            height,
            frame: Arc::from(encoded),
            content_type: self.encoder.content_type(),
            latency_ms,
            mean_geo_error_m: mean_geo_error(located.iter().map(|entry| &entry.geo)),
            detector: detected.status,
            detector_failure: detected.failure,
            faces_blurred: annotated.faces_blurred,
            tracks: located,
            detections: annotated.summaries,
        })
    }
}

/// Result of one processed frame, before fps and tick numbering are attached.
struct Processed {
    frame_sequence: u64,
    width: u32,
    height: u32,
    frame: Arc<[u8]>,
    content_type: &'static str,
    latency_ms: f64,
    mean_geo_error_m: f64,
    detector: DetectorStatus,
    detector_failure: Option<String>,
    faces_blurred: usize,
    tracks: Vec<GeoTrack>,
    detections: Vec<DetectionSummary>,
}

enum TickOutcome {
    Published(Processed),
    /// Rendering or encoding failed; the previous snapshot stays visible.
    EncodeFailed(anyhow::Error),
}

// ----------------------------------------------------------------------------
// State query
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Not running.
    Idle,
    /// Running, no snapshot published yet in this run.
    Starting,
    /// Running, but nothing published within `stale_after`.
    Stale,
    Ok,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Idle => "idle",
            Health::Starting => "starting",
            Health::Stale => "stale",
            Health::Ok => "ok",
        }
    }
}

/// Point-in-time view served by the state query and the telemetry stream.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineState {
    pub running: bool,
    pub tick: u64,
    pub fps: f64,
    pub latency_ms: f64,
    pub mean_geo_error_m: f64,
    pub detections: Vec<DetectionSummary>,
    pub mode: Mode,
    pub blur_enabled: bool,
    pub detector: &'static str,
    pub detector_status: Option<DetectorStatus>,
    pub pose: CameraPose,
    pub snapshot_age_ms: Option<u64>,
    pub health: Health,
    pub consecutive_source_failures: u64,
}

// ----------------------------------------------------------------------------
// Runner
// ----------------------------------------------------------------------------

struct Shared {
    snapshot: SnapshotCell,
    controls: Controls,
    running: AtomicBool,
    shutdown: AtomicBool,
    consecutive_source_failures: AtomicU64,
    /// Start instant and starting tick of the current run.
    run: Mutex<Option<(Instant, u64)>>,
}

pub struct PipelineRunner {
    shared: Arc<Shared>,
    options: RunnerOptions,
    detector_name: &'static str,
    /// Stages rest here while stopped.
    idle: Mutex<Option<Stages>>,
    worker: Mutex<Option<JoinHandle<Stages>>>,
}

impl PipelineRunner {
    pub fn new(stages: Stages, controls: Controls, options: RunnerOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                snapshot: SnapshotCell::new(),
                controls,
                running: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                consecutive_source_failures: AtomicU64::new(0),
                run: Mutex::new(None),
            }),
            options,
            detector_name: stages.detector.name(),
            idle: Mutex::new(Some(stages)),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker. Returns `false` when already running.
    pub fn start(&self) -> Result<bool> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| anyhow!("pipeline worker lock poisoned"))?;
        if worker.is_some() {
            return Ok(false);
        }
        let stages = self
            .idle
            .lock()
            .map_err(|_| anyhow!("pipeline stages lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("pipeline stages unavailable after a worker panic"))?;

        self.shared.shutdown.store(false, Ordering::SeqCst);
        self.shared
            .consecutive_source_failures
            .store(0, Ordering::SeqCst);
        *self.shared.run.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((Instant::now(), self.shared.snapshot.latest_tick()));

        let shared = Arc::clone(&self.shared);
        let options = self.options;
        let handle = std::thread::Builder::new()
            .name("foresight-worker".to_string())
            .spawn(move || run_worker(stages, &shared, options))
            .context("spawn pipeline worker")?;

        *worker = Some(handle);
        self.shared.running.store(true, Ordering::SeqCst);
        log::info!("pipeline: started (detector={})", self.detector_name);
        Ok(true)
    }

    /// Stop the worker after its in-flight tick. Returns `false` when already stopped.
    pub fn stop(&self) -> Result<bool> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| anyhow!("pipeline worker lock poisoned"))?;
        let Some(handle) = worker.take() else {
            return Ok(false);
        };

        self.shared.shutdown.store(true, Ordering::SeqCst);
        let joined = handle.join();
        self.shared.running.store(false, Ordering::SeqCst);
        *self.shared.run.lock().unwrap_or_else(PoisonError::into_inner) = None;

        let stages = joined.map_err(|_| anyhow!("pipeline worker panicked"))?;
        *self
            .idle
            .lock()
            .map_err(|_| anyhow!("pipeline stages lock poisoned"))? = Some(stages);
        log::info!("pipeline: stopped");
        Ok(true)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn controls(&self) -> &Controls {
        &self.shared.controls
    }

    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.shared.snapshot.latest()
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector_name
    }

    pub fn options(&self) -> RunnerOptions {
        self.options
    }

    pub fn health(&self) -> Health {
        self.health_for(self.latest_snapshot().as_deref())
    }

    fn health_for(&self, snapshot: Option<&Snapshot>) -> Health {
        if !self.is_running() {
            return Health::Idle;
        }
        let run = *self.shared.run.lock().unwrap_or_else(PoisonError::into_inner);
        let Some((started_at, start_tick)) = run else {
            return Health::Idle;
        };
        match snapshot.filter(|snapshot| snapshot.tick > start_tick) {
            Some(snapshot) if snapshot.published_at.elapsed() > self.options.stale_after => {
                Health::Stale
            }
            Some(_) => Health::Ok,
            None if started_at.elapsed() > self.options.stale_after => Health::Stale,
            None => Health::Starting,
        }
    }

    /// State query: latest snapshot plus current controls.
    pub fn state(&self) -> PipelineState {
        let snapshot = self.latest_snapshot();
        let controls = self.shared.controls.current();
        let health = self.health_for(snapshot.as_deref());
        let consecutive_source_failures = self
            .shared
            .consecutive_source_failures
            .load(Ordering::SeqCst);

        match snapshot {
            Some(snapshot) => PipelineState {
                running: self.is_running(),
                tick: snapshot.tick,
                fps: snapshot.stats.fps,
                latency_ms: snapshot.stats.latency_ms,
                mean_geo_error_m: snapshot.stats.mean_geo_error_m,
                detections: snapshot.detections.clone(),
                mode: controls.mode,
                blur_enabled: controls.privacy_blur,
                detector: self.detector_name,
                detector_status: Some(snapshot.stats.detector),
                pose: controls.pose,
                snapshot_age_ms: Some(snapshot.age_ms()),
                health,
                consecutive_source_failures,
            },
            None => PipelineState {
                running: self.is_running(),
                tick: 0,
                fps: 0.0,
                latency_ms: 0.0,
                mean_geo_error_m: crate::geo::GEO_ERROR_PLACEHOLDER_M,
                detections: Vec::new(),
                mode: controls.mode,
                blur_enabled: controls.privacy_blur,
                detector: self.detector_name,
                detector_status: None,
                pose: controls.pose,
                snapshot_age_ms: None,
                health,
                consecutive_source_failures,
            },
        }
    }
}

impl Drop for PipelineRunner {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("pipeline: stop on drop failed: {:#}", e);
        }
    }
}

// ----------------------------------------------------------------------------
// Worker
// ----------------------------------------------------------------------------

/// Counts repeats of one failure kind and decides which ones to log.
#[derive(Default)]
struct RateLimit {
    count: u64,
}

impl RateLimit {
    fn hit(&mut self) -> Option<u64> {
        self.count += 1;
        (self.count == 1 || self.count % LOG_EVERY == 0).then_some(self.count)
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}

fn run_worker(mut stages: Stages, shared: &Shared, options: RunnerOptions) -> Stages {
    let period = if options.target_fps > 0.0 {
        Duration::from_secs_f64(1.0 / options.target_fps)
    } else {
        Duration::ZERO
    };
    let mut stats = RollingStats::new();
    let mut source_errors = RateLimit::default();
    let mut detector_errors = RateLimit::default();
    let mut encode_errors = RateLimit::default();
    let mut last_health_log = Instant::now();

    while !shared.shutdown.load(Ordering::SeqCst) {
        let tick_started = Instant::now();

        if !stages.source_connected {
            match stages.source.connect() {
                Ok(()) => stages.source_connected = true,
                Err(e) => {
                    note_source_failure(shared, &mut source_errors, &e);
                    std::thread::sleep(options.source_backoff);
                    continue;
                }
            }
        }

        let overlay = shared.controls.current();

        let frame = match stages.source.next_frame() {
            Ok(FrameRead::Ready(frame)) => {
                source_errors.reset();
                shared.consecutive_source_failures.store(0, Ordering::SeqCst);
                frame
            }
            Ok(FrameRead::Pending) => {
                std::thread::sleep(options.source_backoff);
                continue;
            }
            Err(e) => {
                note_source_failure(shared, &mut source_errors, &e);
                std::thread::sleep(options.source_backoff);
                continue;
            }
        };

        match stages.process(frame, &overlay) {
            TickOutcome::Published(processed) => {
                if processed.detector == DetectorStatus::Degraded {
                    if let Some(count) = detector_errors.hit() {
                        log::warn!(
                            "pipeline: detector degraded (x{}): {}",
                            count,
                            processed.detector_failure.as_deref().unwrap_or("unknown")
                        );
                    }
                } else {
                    detector_errors.reset();
                }
                encode_errors.reset();
                let fps = stats.record(Instant::now());
                shared
                    .snapshot
                    .publish(into_snapshot(processed, shared, fps, &overlay));
            }
            TickOutcome::EncodeFailed(e) => {
                if let Some(count) = encode_errors.hit() {
                    log::error!("pipeline: frame not published (x{}): {:#}", count, e);
                }
            }
        }

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            last_health_log = Instant::now();
            let source = stages.source.stats();
            log::info!(
                "pipeline: tick={} fps={:.1} tracks={} detector={} source={} frames={} source_healthy={}",
                shared.snapshot.latest_tick(),
                stats.fps(),
                stages.tracker.len(),
                stages.detector.name(),
                source.url,
                source.frames_captured,
                stages.source.is_healthy()
            );
        }

        let elapsed = tick_started.elapsed();
        if elapsed < period {
            std::thread::sleep(period - elapsed);
        }
    }

    stages
}

fn note_source_failure(shared: &Shared, limiter: &mut RateLimit, error: &anyhow::Error) {
    shared
        .consecutive_source_failures
        .fetch_add(1, Ordering::SeqCst);
    if let Some(count) = limiter.hit() {
        log::warn!("pipeline: source read failed (x{}): {:#}", count, error);
    }
}

fn into_snapshot(processed: Processed, shared: &Shared, fps: f64, overlay: &Overlay) -> Snapshot {
    Snapshot {
        tick: shared.snapshot.latest_tick() + 1,
        frame_sequence: processed.frame_sequence,
        published_at: Instant::now(),
        width: processed.width,
        height: processed.height,
        frame: processed.frame,
        content_type: processed.content_type,
        stats: FrameStats {
            fps,
            latency_ms: processed.latency_ms,
            mean_geo_error_m: processed.mean_geo_error_m,
            detector: processed.detector,
            faces_blurred: processed.faces_blurred,
        },
        tracks: processed.tracks,
        detections: processed.detections,
        mode: overlay.mode,
        blur_enabled: overlay.privacy_blur,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JpegCodec;
    use crate::ingest::SyntheticSource;
    use image::RgbImage;

    /// Fails on the listed call indices, succeeds otherwise.
    struct FlakyEncoder {
        calls: usize,
        fail_on: Vec<usize>,
    }

    impl FrameEncoder for FlakyEncoder {
        fn encode(&mut self, image: &RgbImage) -> Result<Vec<u8>> {
            let call = self.calls;
            self.calls += 1;
            if self.fail_on.contains(&call) {
                return Err(anyhow!("encoder out of memory"));
            }
            Ok(vec![call as u8, image.width() as u8])
        }

        fn content_type(&self) -> &'static str {
            "application/octet-stream"
        }
    }

    fn stages(encoder: Box<dyn FrameEncoder>) -> Stages {
        Stages::new(
            Box::new(SyntheticSource::new("stub://unit", 320, 240)),
            Detector::synthetic(),
            Tracker::default(),
            Annotator::default(),
            encoder,
        )
    }

    fn next_frame(stages: &mut Stages) -> Frame {
        match stages.source.next_frame() {
            Ok(FrameRead::Ready(frame)) => frame,
            other => panic!("expected a frame, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn process_locates_every_track() {
        let mut stages = stages(Box::new(JpegCodec::default()));
        let overlay = Controls::default().current();
        let frame = next_frame(&mut stages);

        let TickOutcome::Published(processed) = stages.process(frame, &overlay) else {
            panic!("tick should publish");
        };
        assert_eq!(processed.tracks.len(), 1);
        assert_eq!(processed.detections.len(), 1);
        assert_eq!(processed.detections[0].id, processed.tracks[0].track.id());
        assert_eq!(processed.detector, DetectorStatus::Synthetic);
        assert_eq!(processed.mean_geo_error_m, crate::GEO_ERROR_PLACEHOLDER_M);
        assert_eq!(&processed.frame[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn encode_failure_keeps_previous_snapshot() {
        let mut stages = stages(Box::new(FlakyEncoder {
            calls: 0,
            fail_on: vec![1],
        }));
        let shared = Shared {
            snapshot: SnapshotCell::new(),
            controls: Controls::default(),
            running: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            consecutive_source_failures: AtomicU64::new(0),
            run: Mutex::new(None),
        };
        let overlay = shared.controls.current();

        let frame = next_frame(&mut stages);
        let TickOutcome::Published(first) = stages.process(frame, &overlay) else {
            panic!("first tick should publish");
        };
        shared.snapshot.publish(into_snapshot(first, &shared, 0.0, &overlay));

        let frame = next_frame(&mut stages);
        assert!(matches!(
            stages.process(frame, &overlay),
            TickOutcome::EncodeFailed(_)
        ));

        let kept = shared.snapshot.latest().unwrap();
        assert_eq!(kept.tick, 1);
        assert_eq!(kept.frame_sequence, 0);
        assert_eq!(&kept.frame[..], &[0, 64]);
    }

    #[test]
    fn rate_limit_logs_first_and_every_hundredth() {
        let mut limit = RateLimit::default();
        let logged: Vec<u64> = (0..250).filter_map(|_| limit.hit()).collect();
        assert_eq!(logged, vec![1, 100, 200]);
        limit.reset();
        assert_eq!(limit.hit(), Some(1));
    }
}
