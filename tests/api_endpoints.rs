use anyhow::{anyhow, Result};
use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use foresight_pipeline::{
    Annotator, ApiConfig, ApiHandle, ApiServer, Broadcaster, Controls, Detector, JpegCodec,
    PipelineRunner, RunnerOptions, Stages, SyntheticSource, Tracker,
};

struct TestApi {
    runner: Arc<PipelineRunner>,
    broadcaster: Arc<Broadcaster>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        let stages = Stages::new(
            Box::new(SyntheticSource::new("stub://api-test", 320, 240)),
            Detector::synthetic(),
            Tracker::default(),
            Annotator::default(),
            Box::new(JpegCodec::default()),
        );
        let runner = Arc::new(PipelineRunner::new(
            stages,
            Controls::default(),
            RunnerOptions {
                target_fps: 60.0,
                ..RunnerOptions::default()
            },
        ));
        let broadcaster = Arc::new(Broadcaster::spawn(
            Arc::clone(&runner),
            Duration::from_millis(50),
        )?);
        let api_handle = ApiServer::new(
            ApiConfig {
                addr: "127.0.0.1:0".to_string(),
            },
            Arc::clone(&runner),
        )
        .with_telemetry(Arc::clone(&broadcaster))
        .spawn()?;

        Ok(Self {
            runner,
            broadcaster,
            api_handle: Some(api_handle),
        })
    }

    fn addr(&self) -> SocketAddr {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
            .addr
    }

    fn wait_for_frame(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.runner.latest_snapshot().is_none() {
            assert!(Instant::now() < deadline, "pipeline never published");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
        self.broadcaster.stop();
        let _ = self.runner.stop();
    }
}

/// Send one request and read the whole response. Returns (head, body).
fn request(addr: SocketAddr, method: &str, path: &str, body: Option<&str>) -> Result<(String, Vec<u8>)> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let body = body.unwrap_or("");
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        method,
        path,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes())?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("response has no header terminator"))?;
    let head = String::from_utf8_lossy(&response[..split]).to_string();
    Ok((head, response[split + 4..].to_vec()))
}

fn json(body: &[u8]) -> Value {
    serde_json::from_slice(body).expect("response body should be json")
}

#[test]
fn health_and_frame_before_start() -> Result<()> {
    let api = TestApi::new()?;

    let (head, body) = request(api.addr(), "GET", "/health", None)?;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(json(&body)["status"], "idle");

    let (head, body) = request(api.addr(), "GET", "/frame.jpg", None)?;
    assert!(head.starts_with("HTTP/1.1 204 No Content"));
    assert!(head.contains("X-Frame-Status: pending"));
    assert!(head.contains("Access-Control-Allow-Origin: *"));
    assert!(head.contains("Cache-Control: no-store"));
    assert!(body.is_empty());
    Ok(())
}

#[test]
fn start_publishes_jpeg_frames_and_state() -> Result<()> {
    let api = TestApi::new()?;

    let (head, body) = request(api.addr(), "POST", "/api/pipeline/start", None)?;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(json(&body)["running"], true);
    api.wait_for_frame();

    let (head, body) = request(api.addr(), "GET", "/frame.jpg", None)?;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert!(head.contains("Content-Type: image/jpeg"));
    assert_eq!(&body[..2], &[0xFF, 0xD8]);

    let (_, body) = request(api.addr(), "GET", "/api/state", None)?;
    let state = json(&body);
    assert_eq!(state["running"], true);
    assert!(state["tick"].as_u64().unwrap() >= 1);
    assert_eq!(state["detector"], "synthetic");
    let detections = state["detections"].as_array().unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0]["class"], "person");
    assert!(detections[0]["geo"]["lat"].is_number());

    let (_, body) = request(api.addr(), "POST", "/api/pipeline/stop", None)?;
    assert_eq!(json(&body)["running"], false);
    let (_, body) = request(api.addr(), "GET", "/health", None)?;
    assert_eq!(json(&body)["status"], "idle");
    Ok(())
}

#[test]
fn mode_and_blur_controls() -> Result<()> {
    let api = TestApi::new()?;

    let (head, body) = request(api.addr(), "POST", "/api/mode", Some(r#"{"mode":"SUSPECT"}"#))?;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(json(&body)["mode"], "suspect");

    let (_, body) = request(api.addr(), "POST", "/api/mode", Some(r#"{"mode":"thermal"}"#))?;
    assert_eq!(json(&body)["mode"], "sar");

    let (_, body) = request(api.addr(), "POST", "/api/blur", Some(r#"{"enabled":false}"#))?;
    assert_eq!(json(&body)["blur_enabled"], false);

    let (head, _) = request(api.addr(), "POST", "/api/blur", Some(r#"{"enabled":"#))?;
    assert!(head.starts_with("HTTP/1.1 400 Bad Request"));
    assert!(!api.runner.controls().blur_enabled());
    Ok(())
}

#[test]
fn pose_updates_are_validated() -> Result<()> {
    let api = TestApi::new()?;

    let (head, body) = request(api.addr(), "POST", "/api/pose", Some(r#"{"yaw_deg":90.0}"#))?;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(json(&body)["yaw_deg"], 90.0);

    let (head, _) = request(api.addr(), "POST", "/api/pose", Some(r#"{"lat":95.0,"yaw_deg":10.0}"#))?;
    assert!(head.starts_with("HTTP/1.1 400 Bad Request"));

    let (_, body) = request(api.addr(), "GET", "/api/pose", None)?;
    let pose = json(&body);
    assert_eq!(pose["yaw_deg"], 90.0);
    assert_eq!(pose["lat"], 6.1164);
    Ok(())
}

#[test]
fn preflight_unknown_routes_and_wrong_methods() -> Result<()> {
    let api = TestApi::new()?;

    let (head, _) = request(api.addr(), "OPTIONS", "/api/mode", None)?;
    assert!(head.starts_with("HTTP/1.1 204 No Content"));
    assert!(head.contains("Access-Control-Allow-Methods: GET, POST, OPTIONS"));

    let (head, _) = request(api.addr(), "GET", "/ocr", None)?;
    assert!(head.starts_with("HTTP/1.1 404 Not Found"));

    let (head, _) = request(api.addr(), "GET", "/api/pipeline/start", None)?;
    assert!(head.starts_with("HTTP/1.1 405 Method Not Allowed"));
    Ok(())
}

#[test]
fn oversized_body_is_rejected() -> Result<()> {
    let api = TestApi::new()?;
    // Declared length alone is enough; nothing is left unread on the socket.
    let mut stream = TcpStream::connect(api.addr())?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(
        b"POST /api/mode HTTP/1.1\r\nHost: localhost\r\nContent-Length: 9000\r\n\r\n",
    )?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request"));
    assert_eq!(api.runner.controls().mode(), foresight_pipeline::Mode::Sar);
    Ok(())
}

#[test]
fn telemetry_stream_delivers_stats_events() -> Result<()> {
    let api = TestApi::new()?;
    api.runner.start()?;

    let mut stream = TcpStream::connect(api.addr())?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(b"GET /telemetry HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let mut reader = BufReader::new(stream);

    let mut status = String::new();
    reader.read_line(&mut status)?;
    assert!(status.starts_with("HTTP/1.1 200 OK"));

    let mut events = Vec::new();
    let mut line = String::new();
    while events.len() < 3 {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(anyhow!("telemetry stream closed early"));
        }
        if let Some(payload) = line.trim_end().strip_prefix("data: ") {
            events.push(serde_json::from_str::<Value>(payload)?);
        }
    }
    for event in &events {
        assert_eq!(event["type"], "stats");
        assert!(event.get("fps").is_some());
        assert!(event.get("detections").is_some());
        assert!(event.get("frame").is_none());
    }
    assert_eq!(api.broadcaster.subscriber_count(), 1);
    Ok(())
}

#[test]
fn mjpeg_stream_emits_one_part_per_tick() -> Result<()> {
    let api = TestApi::new()?;
    api.runner.start()?;

    let mut stream = TcpStream::connect(api.addr())?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(b"GET /video.mjpg HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let marker = b"X-Frame-Tick: ";
    let deadline = Instant::now() + Duration::from_secs(10);
    while data.windows(marker.len()).filter(|w| w == marker).count() < 3 {
        assert!(Instant::now() < deadline, "video stream too slow");
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("video stream closed early"));
        }
        data.extend_from_slice(&buf[..n]);
    }

    let text = String::from_utf8_lossy(&data);
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
    let ticks: Vec<u64> = text
        .split("X-Frame-Tick: ")
        .skip(1)
        .filter_map(|rest| rest.split("\r\n").next())
        .filter_map(|tick| tick.parse().ok())
        .collect();
    assert!(ticks.len() >= 3);
    assert!(ticks.windows(2).all(|pair| pair[1] > pair[0]));
    Ok(())
}
