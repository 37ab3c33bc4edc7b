use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::RtspConfig;
use crate::pipeline::{Controls, RunnerOptions};
use crate::track::TrackerConfig;
use crate::{CameraPose, Mode, PoseUpdate};

const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_SOURCE_URL: &str = "stub://synthetic";
const DEFAULT_SOURCE_FPS: u32 = 15;
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 360;
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_NMS_IOU: f32 = 0.45;
const DEFAULT_JPEG_QUALITY: u8 = 85;
const DEFAULT_SOURCE_BACKOFF_MS: u64 = 10;
const DEFAULT_STALE_AFTER_MS: u64 = 5_000;
const DEFAULT_BROADCAST_HZ: f64 = 5.0;
const DEFAULT_MQTT_TOPIC: &str = "foresight/telemetry";

#[derive(Debug, Deserialize, Default)]
struct ForesightConfigFile {
    api: Option<ApiConfigFile>,
    source: Option<SourceConfigFile>,
    detector: Option<DetectorConfigFile>,
    tracker: Option<TrackerConfig>,
    pose: Option<PoseUpdate>,
    pipeline: Option<PipelineConfigFile>,
    telemetry: Option<TelemetryConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    model_path: Option<PathBuf>,
    face_model_path: Option<PathBuf>,
    input_size: Option<u32>,
    confidence: Option<f32>,
    iou: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    mode: Option<String>,
    blur: Option<bool>,
    jpeg_quality: Option<u8>,
    source_backoff_ms: Option<u64>,
    autostart: Option<bool>,
    stale_after_ms: Option<u64>,
    font_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct TelemetryConfigFile {
    broadcast_hz: Option<f64>,
    mqtt_broker: Option<String>,
    mqtt_topic: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ForesightConfig {
    pub api_addr: String,
    pub source: RtspConfig,
    pub detector: DetectorConfig,
    pub tracker: TrackerConfig,
    pub pose: CameraPose,
    pub pipeline: PipelineSettings,
    pub telemetry: TelemetrySettings,
}

/// Object and face detector selection. No `model_path` means the synthetic detector.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub model_path: Option<PathBuf>,
    pub face_model_path: Option<PathBuf>,
    /// Square model input edge in pixels.
    pub input_size: u32,
    pub confidence: f32,
    /// IOU threshold for non-maximum suppression.
    pub iou: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            face_model_path: None,
            input_size: DEFAULT_INPUT_SIZE,
            confidence: DEFAULT_CONFIDENCE,
            iou: DEFAULT_NMS_IOU,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub mode: Mode,
    pub blur: bool,
    pub jpeg_quality: u8,
    pub source_backoff: Duration,
    pub autostart: bool,
    pub stale_after: Duration,
    /// Label font; unset means the first system font found.
    pub font_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub broadcast_hz: f64,
    pub mqtt_broker: Option<String>,
    pub mqtt_topic: String,
}

impl ForesightConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FORESIGHT_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ForesightConfigFile) -> Self {
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());

        let source = file.source.unwrap_or_default();
        let source = RtspConfig {
            url: source
                .url
                .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
            target_fps: source.target_fps.unwrap_or(DEFAULT_SOURCE_FPS),
            width: source.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
            height: source.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
        };

        let detector = file.detector.unwrap_or_default();
        let detector = DetectorConfig {
            model_path: detector.model_path,
            face_model_path: detector.face_model_path,
            input_size: detector.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            confidence: detector.confidence.unwrap_or(DEFAULT_CONFIDENCE),
            iou: detector.iou.unwrap_or(DEFAULT_NMS_IOU),
        };

        let mut pose = CameraPose::default();
        if let Some(update) = file.pose {
            pose.apply(&update);
        }

        let pipeline = file.pipeline.unwrap_or_default();
        let pipeline = PipelineSettings {
            mode: pipeline
                .mode
                .as_deref()
                .map(Mode::parse)
                .unwrap_or_default(),
            blur: pipeline.blur.unwrap_or(true),
            jpeg_quality: pipeline.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            source_backoff: Duration::from_millis(
                pipeline
                    .source_backoff_ms
                    .unwrap_or(DEFAULT_SOURCE_BACKOFF_MS),
            ),
            autostart: pipeline.autostart.unwrap_or(true),
            stale_after: Duration::from_millis(
                pipeline.stale_after_ms.unwrap_or(DEFAULT_STALE_AFTER_MS),
            ),
            font_path: pipeline.font_path,
        };

        let telemetry = file.telemetry.unwrap_or_default();
        let telemetry = TelemetrySettings {
            broadcast_hz: telemetry.broadcast_hz.unwrap_or(DEFAULT_BROADCAST_HZ),
            mqtt_broker: telemetry.mqtt_broker,
            mqtt_topic: telemetry
                .mqtt_topic
                .unwrap_or_else(|| DEFAULT_MQTT_TOPIC.to_string()),
        };

        Self {
            api_addr,
            source,
            detector,
            tracker: file.tracker.unwrap_or_default(),
            pose,
            pipeline,
            telemetry,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("FORESIGHT_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(url) = non_empty_env("FORESIGHT_SOURCE") {
            self.source.url = url;
        }
        if let Some(path) = non_empty_env("FORESIGHT_MODEL") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty_env("FORESIGHT_FACE_MODEL") {
            self.detector.face_model_path = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty_env("FORESIGHT_FONT") {
            self.pipeline.font_path = Some(PathBuf::from(path));
        }
        if let Some(home) = non_empty_env("FORESIGHT_HOME") {
            let parts = split_csv(&home);
            let [lat, lon] = parts.as_slice() else {
                return Err(anyhow!("FORESIGHT_HOME must be \"lat,lon\""));
            };
            self.pose.lat = lat
                .parse()
                .map_err(|_| anyhow!("FORESIGHT_HOME latitude is not a number"))?;
            self.pose.lon = lon
                .parse()
                .map_err(|_| anyhow!("FORESIGHT_HOME longitude is not a number"))?;
        }
        if let Some(heading) = non_empty_env("FORESIGHT_HEADING") {
            self.pose.yaw_deg = heading
                .parse()
                .map_err(|_| anyhow!("FORESIGHT_HEADING must be a number of degrees"))?;
        }
        if let Some(mode) = non_empty_env("FORESIGHT_MODE") {
            self.pipeline.mode = Mode::parse(&mode);
        }
        if let Some(blur) = non_empty_env("FORESIGHT_BLUR") {
            self.pipeline.blur = parse_flag(&blur)
                .ok_or_else(|| anyhow!("FORESIGHT_BLUR must be true/false, got {}", blur))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let iou = self.tracker.iou_threshold;
        if !(iou > 0.0 && iou <= 1.0) {
            return Err(anyhow!("tracker iou_threshold must be within (0, 1]"));
        }
        if self.tracker.max_age == 0 {
            return Err(anyhow!("tracker max_age must be at least 1"));
        }
        if !(1..=100).contains(&self.pipeline.jpeg_quality) {
            return Err(anyhow!("pipeline jpeg_quality must be within 1..=100"));
        }
        if self.source.target_fps == 0 {
            return Err(anyhow!("source target_fps must be greater than zero"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source width and height must be greater than zero"));
        }
        if !(self.telemetry.broadcast_hz > 0.0 && self.telemetry.broadcast_hz.is_finite()) {
            return Err(anyhow!("telemetry broadcast_hz must be greater than zero"));
        }
        if !(self.detector.confidence >= 0.0 && self.detector.confidence <= 1.0) {
            return Err(anyhow!("detector confidence must be within [0, 1]"));
        }
        if !(self.detector.iou > 0.0 && self.detector.iou <= 1.0) {
            return Err(anyhow!("detector iou must be within (0, 1]"));
        }
        if self.detector.input_size == 0 {
            return Err(anyhow!("detector input_size must be greater than zero"));
        }
        self.pose.validate().context("invalid pose")?;
        Ok(())
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            target_fps: f64::from(self.source.target_fps),
            source_backoff: self.pipeline.source_backoff,
            stale_after: self.pipeline.stale_after,
        }
    }

    pub fn controls(&self) -> Controls {
        Controls::new(self.pipeline.mode, self.pipeline.blur, self.pose)
    }

    pub fn broadcast_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.telemetry.broadcast_hz)
    }
}

fn read_config_file(path: &Path) -> Result<ForesightConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ForesightConfig::from_file(ForesightConfigFile::default());
        cfg.validate().unwrap();
        assert_eq!(cfg.api_addr, DEFAULT_API_ADDR);
        assert_eq!(cfg.source.url, DEFAULT_SOURCE_URL);
        assert_eq!(cfg.detector, DetectorConfig::default());
        assert_eq!(cfg.pose, CameraPose::default());
        assert_eq!(cfg.broadcast_period(), Duration::from_millis(200));
        assert_eq!(cfg.runner_options().target_fps, 15.0);
    }

    #[test]
    fn flags_parse_loosely() {
        assert_eq!(parse_flag(" On "), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
