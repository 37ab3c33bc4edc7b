//! HTTP request layer.
//!
//! A small HTTP/1.1 server on `std::net`. The accept loop runs on one thread and hands
//! each connection to its own short-lived thread, so long-lived streams (`/video.mjpg`,
//! `/telemetry`) never hold up control requests. Handlers only read the published
//! snapshot or mutate `Controls`; none of them touch the pipeline worker directly.

mod stream;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::broadcast::Broadcaster;
use crate::pipeline::{Health, PipelineRunner};
use crate::{Mode, PoseUpdate};

const MAX_REQUEST_BYTES: usize = 8192;
const READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections. Open streams end at their next write.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Shared by every connection thread.
#[derive(Clone)]
struct ApiContext {
    runner: Arc<PipelineRunner>,
    telemetry: Option<Arc<Broadcaster>>,
    shutdown: Arc<AtomicBool>,
}

pub struct ApiServer {
    cfg: ApiConfig,
    runner: Arc<PipelineRunner>,
    telemetry: Option<Arc<Broadcaster>>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, runner: Arc<PipelineRunner>) -> Self {
        Self {
            cfg,
            runner,
            telemetry: None,
        }
    }

    /// Serve `/telemetry` by registering subscribers with `broadcaster`.
    pub fn with_telemetry(mut self, broadcaster: Arc<Broadcaster>) -> Self {
        self.telemetry = Some(broadcaster);
        self
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address {}", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = ApiContext {
            runner: self.runner,
            telemetry: self.telemetry,
            shutdown: Arc::clone(&shutdown),
        };
        let join = std::thread::Builder::new()
            .name("foresight-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, ctx) {
                    log::error!("api stopped: {:#}", err);
                }
            })
            .context("spawn api server")?;

        log::info!("api: listening on http://{}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, ctx: ApiContext) -> Result<()> {
    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let conn_ctx = ctx.clone();
                let spawned = std::thread::Builder::new()
                    .name("foresight-api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &conn_ctx) {
                            log::warn!("api request from {} rejected: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("api: could not spawn connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, ctx: &ApiContext) -> Result<()> {
    // Accepted sockets inherit non-blocking mode on some platforms.
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        Response::error(403, "forbidden").write_to(&mut stream)?;
        return Ok(());
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            let _ = Response::error(400, "bad_request").write_to(&mut stream);
            return Err(err);
        }
    };

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/video.mjpg") => return stream::serve_mjpeg(stream, ctx),
        ("GET", "/telemetry") => return stream::subscribe_telemetry(stream, ctx),
        _ => {}
    }

    route(&request, ctx).write_to(&mut stream)
}

// ----------------------------------------------------------------------------
// Routes
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
struct ModeRequest {
    #[serde(default)]
    mode: String,
}

#[derive(Deserialize)]
struct BlurRequest {
    enabled: bool,
}

#[derive(Serialize)]
struct RunningReply {
    ok: bool,
    running: bool,
}

fn route(request: &HttpRequest, ctx: &ApiContext) -> Response {
    let runner = &ctx.runner;
    match (request.method.as_str(), request.path.as_str()) {
        ("OPTIONS", _) => Response::empty(204)
            .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type"),

        ("GET", "/health") => {
            let health = runner.health();
            let status = if health == Health::Stale { 503 } else { 200 };
            Response::json(status, &json!({ "status": health.as_str() }))
        }

        ("POST", "/api/pipeline/start") => match runner.start() {
            Ok(_) => Response::json(
                200,
                &RunningReply {
                    ok: true,
                    running: runner.is_running(),
                },
            ),
            Err(err) => Response::error(500, &format!("{:#}", err)),
        },
        ("POST", "/api/pipeline/stop") => match runner.stop() {
            Ok(_) => Response::json(
                200,
                &RunningReply {
                    ok: true,
                    running: runner.is_running(),
                },
            ),
            Err(err) => Response::error(500, &format!("{:#}", err)),
        },

        ("GET", "/api/state") => Response::json(200, &runner.state()),

        ("POST", "/api/mode") => {
            let body: ModeRequest = match request.json_body() {
                Ok(body) => body,
                Err(err) => return Response::error(400, &err),
            };
            match runner.controls().set_mode(Mode::parse(&body.mode)) {
                Ok(()) => Response::json(200, &runner.state()),
                Err(err) => Response::error(500, &format!("{:#}", err)),
            }
        }
        ("POST", "/api/blur") => {
            let body: BlurRequest = match request.json_body() {
                Ok(body) => body,
                Err(err) => return Response::error(400, &err),
            };
            match runner.controls().set_blur(body.enabled) {
                Ok(()) => Response::json(200, &runner.state()),
                Err(err) => Response::error(500, &format!("{:#}", err)),
            }
        }

        ("GET", "/api/pose") => Response::json(200, &runner.controls().pose()),
        ("POST", "/api/pose") => {
            let update: PoseUpdate = match request.json_body() {
                Ok(update) => update,
                Err(err) => return Response::error(400, &err),
            };
            match runner.controls().update_pose(&update) {
                Ok(pose) => Response::json(200, &pose),
                Err(err) => Response::error(400, &format!("{:#}", err)),
            }
        }

        ("GET", "/frame.jpg") => match runner.latest_snapshot() {
            Some(snapshot) => Response {
                status: 200,
                content_type: snapshot.content_type,
                body: snapshot.frame.to_vec(),
                headers: vec![("X-Frame-Tick", snapshot.tick.to_string())],
            },
            None => Response::empty(204).header("X-Frame-Status", "pending"),
        },

        (_, path) if is_known_path(path) => Response::error(405, "method_not_allowed"),
        _ => Response::error(404, "not_found"),
    }
}

fn is_known_path(path: &str) -> bool {
    matches!(
        path,
        "/health"
            | "/api/pipeline/start"
            | "/api/pipeline/stop"
            | "/api/state"
            | "/api/mode"
            | "/api/blur"
            | "/api/pose"
            | "/frame.jpg"
            | "/video.mjpg"
            | "/telemetry"
    )
}

// ----------------------------------------------------------------------------
// HTTP plumbing
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn content_length(&self) -> Result<usize> {
        match self.headers.get("content-length") {
            Some(value) => value
                .parse()
                .map_err(|_| anyhow!("invalid content-length")),
            None => Ok(0),
        }
    }

    /// Decode the body, mapping failures to a client-facing message.
    fn json_body<T: DeserializeOwned>(&self) -> std::result::Result<T, String> {
        serde_json::from_slice(&self.body).map_err(|e| format!("invalid json body: {}", e))
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let head_len = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before request head"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
    };

    let text = String::from_utf8_lossy(&data[..head_len]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    let mut request = HttpRequest {
        method: method.to_uppercase(),
        path,
        headers,
        body: Vec::new(),
    };

    let body_len = request.content_length()?;
    if head_len + body_len > MAX_REQUEST_BYTES {
        return Err(anyhow!("request too large"));
    }
    let mut body = data.split_off(head_len);
    while body.len() < body_len {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before request body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(body_len);
    request.body = body;
    Ok(request)
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
    headers: Vec<(&'static str, String)>,
}

impl Response {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: "application/json",
                body,
                headers: Vec::new(),
            },
            Err(err) => {
                log::error!("api: response serialization failed: {}", err);
                Self::error(500, "serialization_failed")
            }
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: json!({ "error": message }).to_string().into_bytes(),
            headers: Vec::new(),
        }
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: Vec::new(),
            headers: Vec::new(),
        }
    }

    fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn write_to(&self, stream: &mut TcpStream) -> Result<()> {
        let mut head = format!(
            "{}\r\nContent-Type: {}\r\nContent-Length: {}\r\n{}",
            status_line(self.status),
            self.content_type,
            self.body.len(),
            COMMON_HEADERS
        );
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("Connection: close\r\n\r\n");
        stream.write_all(head.as_bytes())?;
        stream.write_all(&self.body)?;
        stream.flush()?;
        Ok(())
    }
}

/// Sent on every response, streams included.
const COMMON_HEADERS: &str = "Cache-Control: no-store\r\nAccess-Control-Allow-Origin: *\r\n";

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}
