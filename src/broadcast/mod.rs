//! Periodic telemetry fan-out.
//!
//! The broadcaster runs on its own timer, independent of the tick rate. Each period it
//! serializes the current `PipelineState` once as `{"type":"stats", ...}` and writes it
//! to every registered sink. A sink whose write fails is dropped; the others still
//! receive the payload. The encoded frame is never part of the payload.

#[cfg(feature = "telemetry-mqtt")]
mod mqtt;

#[cfg(feature = "telemetry-mqtt")]
pub use mqtt::MqttSink;

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::pipeline::{PipelineRunner, PipelineState};

pub const DEFAULT_PERIOD: Duration = Duration::from_millis(200);

/// Longest single sleep while waiting for the next period, so `stop` stays prompt.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// A registered telemetry subscriber.
pub trait TelemetrySink: Send {
    /// Short description for logs.
    fn describe(&self) -> String;

    /// Deliver one serialized payload. An error removes the sink.
    fn send(&mut self, payload: &str) -> Result<()>;
}

#[derive(Serialize)]
struct StatsEvent<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    state: &'a PipelineState,
}

/// Serialize the telemetry payload for one period.
pub fn stats_payload(state: &PipelineState) -> Result<String> {
    serde_json::to_string(&StatsEvent {
        kind: "stats",
        state,
    })
    .context("serialize telemetry payload")
}

type Entry = (u64, Box<dyn TelemetrySink>);

#[derive(Default)]
struct Sinks {
    idle: Vec<Entry>,
    /// Sinks checked out by a fan-out pass that has not merged them back yet.
    in_flight: usize,
}

struct Registry {
    sinks: Mutex<Sinks>,
    next_id: AtomicU64,
    shutdown: AtomicBool,
}

impl Registry {
    fn new() -> Self {
        Self {
            sinks: Mutex::new(Sinks::default()),
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Sinks> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: u64, sink: Box<dyn TelemetrySink>) {
        self.lock().idle.push((id, sink));
    }

    fn len(&self) -> usize {
        let sinks = self.lock();
        sinks.idle.len() + sinks.in_flight
    }

    /// Write `payload` to every sink, dropping the ones that fail. Returns how many
    /// sinks took it.
    ///
    /// Sinks are checked out of the registry for the writes, so a stalled subscriber
    /// never blocks `register` or `subscriber_count`.
    fn fan_out(&self, payload: &str) -> usize {
        let mut batch = {
            let mut sinks = self.lock();
            let batch = std::mem::take(&mut sinks.idle);
            sinks.in_flight += batch.len();
            batch
        };
        let taken = batch.len();

        batch.retain_mut(|(id, sink)| match sink.send(payload) {
            Ok(()) => true,
            Err(e) => {
                log::info!(
                    "telemetry: dropping subscriber {} ({}): {:#}",
                    id,
                    sink.describe(),
                    e
                );
                false
            }
        });
        let delivered = batch.len();

        let mut sinks = self.lock();
        sinks.in_flight -= taken;
        if !self.shutdown.load(Ordering::SeqCst) {
            // Survivors keep their place ahead of sinks registered during the pass.
            batch.append(&mut sinks.idle);
            sinks.idle = batch;
        }
        delivered
    }
}

pub struct Broadcaster {
    registry: Arc<Registry>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Broadcaster {
    /// Start broadcasting `runner.state()` every `period`.
    pub fn spawn(runner: Arc<PipelineRunner>, period: Duration) -> Result<Self> {
        if period.is_zero() {
            return Err(anyhow!("broadcast period must be positive"));
        }
        let registry = Arc::new(Registry::new());

        let thread_registry = Arc::clone(&registry);
        let handle = std::thread::Builder::new()
            .name("foresight-telemetry".to_string())
            .spawn(move || run_broadcast(&thread_registry, &runner, period))
            .context("spawn telemetry broadcaster")?;

        Ok(Self {
            registry,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Add a subscriber. Returns its id.
    pub fn register(&self, sink: Box<dyn TelemetrySink>) -> u64 {
        let id = self.registry.next_id.fetch_add(1, Ordering::SeqCst);
        log::debug!("telemetry: subscriber {} registered ({})", id, sink.describe());
        self.registry.insert(id, sink);
        id
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Push one payload immediately, outside the timer. Returns how many sinks took it.
    pub fn broadcast_now(&self, state: &PipelineState) -> Result<usize> {
        let payload = stats_payload(state)?;
        Ok(self.registry.fan_out(&payload))
    }

    /// Stop the timer thread and drop every subscriber.
    pub fn stop(&self) {
        self.registry.shutdown.store(true, Ordering::SeqCst);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("telemetry: broadcaster thread panicked");
            }
        }
        self.registry.lock().idle.clear();
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_broadcast(registry: &Registry, runner: &PipelineRunner, period: Duration) {
    let mut next = Instant::now() + period;
    while !registry.shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now < next {
            std::thread::sleep((next - now).min(POLL_SLICE));
            continue;
        }
        next += period;
        if next < now {
            // Fell behind (suspended host); skip missed periods.
            next = now + period;
        }

        if registry.len() == 0 {
            continue;
        }
        match stats_payload(&runner.state()) {
            Ok(payload) => {
                registry.fan_out(&payload);
            }
            Err(e) => log::error!("telemetry: {:#}", e),
        }
    }
}

// ----------------------------------------------------------------------------
// Sinks
// ----------------------------------------------------------------------------

/// In-process subscriber backed by a channel. Fails once the receiver is dropped.
pub struct ChannelSink {
    tx: mpsc::Sender<String>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl TelemetrySink for ChannelSink {
    fn describe(&self) -> String {
        "channel".to_string()
    }

    fn send(&mut self, payload: &str) -> Result<()> {
        self.tx
            .send(payload.to_string())
            .map_err(|_| anyhow!("channel receiver dropped"))
    }
}

/// HTTP server-sent-events subscriber. The response head must already be written.
pub struct EventStreamSink {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl EventStreamSink {
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

    pub fn new(stream: TcpStream) -> Result<Self> {
        stream
            .set_write_timeout(Some(Self::WRITE_TIMEOUT))
            .context("set event stream write timeout")?;
        let peer = stream.peer_addr().ok();
        Ok(Self { stream, peer })
    }
}

impl TelemetrySink for EventStreamSink {
    fn describe(&self) -> String {
        match self.peer {
            Some(peer) => format!("event-stream {}", peer),
            None => "event-stream".to_string(),
        }
    }

    fn send(&mut self, payload: &str) -> Result<()> {
        write!(self.stream, "data: {}\n\n", payload).context("write event")?;
        self.stream.flush().context("flush event")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl TelemetrySink for Broken {
        fn describe(&self) -> String {
            "broken".to_string()
        }

        fn send(&mut self, _payload: &str) -> Result<()> {
            Err(anyhow!("broken pipe"))
        }
    }

    fn ids(registry: &Registry) -> Vec<u64> {
        registry.lock().idle.iter().map(|(id, _)| *id).collect()
    }

    #[test]
    fn failing_sink_is_removed_and_others_still_receive() {
        let registry = Registry::new();
        let (first, first_rx) = ChannelSink::new();
        let (second, second_rx) = ChannelSink::new();
        registry.insert(1, Box::new(first));
        registry.insert(2, Box::new(Broken));
        registry.insert(3, Box::new(second));

        assert_eq!(registry.fan_out("{\"type\":\"stats\"}"), 2);
        assert_eq!(first_rx.try_recv().unwrap(), "{\"type\":\"stats\"}");
        assert_eq!(second_rx.try_recv().unwrap(), "{\"type\":\"stats\"}");
        assert_eq!(ids(&registry), vec![1, 3]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn dropped_receiver_deregisters_channel_sink() {
        let registry = Registry::new();
        let (sink, rx) = ChannelSink::new();
        registry.insert(1, Box::new(sink));
        drop(rx);
        assert_eq!(registry.fan_out("x"), 0);
        assert_eq!(registry.len(), 0);
    }

    /// Blocks inside `send` until released.
    struct StalledSink {
        entered: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    impl TelemetrySink for StalledSink {
        fn describe(&self) -> String {
            "stalled".to_string()
        }

        fn send(&mut self, _payload: &str) -> Result<()> {
            let _ = self.entered.send(());
            self.release
                .recv_timeout(Duration::from_secs(5))
                .map_err(|_| anyhow!("never released"))
        }
    }

    #[test]
    fn stalled_sink_does_not_block_registration() {
        let registry = Arc::new(Registry::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        registry.insert(
            1,
            Box::new(StalledSink {
                entered: entered_tx,
                release: release_rx,
            }),
        );

        let writer = Arc::clone(&registry);
        let pass = std::thread::spawn(move || writer.fan_out("x"));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // The pass is mid-write; the registry lock must be free.
        assert!(registry.sinks.try_lock().is_ok());
        let (late, late_rx) = ChannelSink::new();
        registry.insert(2, Box::new(late));
        assert_eq!(registry.len(), 2);

        release_tx.send(()).unwrap();
        assert_eq!(pass.join().unwrap(), 1);
        assert_eq!(ids(&registry), vec![1, 2]);
        // The late sink joined after the payload went out.
        assert!(late_rx.try_recv().is_err());
    }

    #[test]
    fn sinks_checked_out_during_shutdown_are_dropped() {
        let registry = Registry::new();
        let (sink, _rx) = ChannelSink::new();
        registry.insert(1, Box::new(sink));
        registry.shutdown.store(true, Ordering::SeqCst);
        assert_eq!(registry.fan_out("x"), 1);
        assert_eq!(registry.len(), 0);
    }
}
