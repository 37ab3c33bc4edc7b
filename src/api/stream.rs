use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::api::{ApiContext, Response, COMMON_HEADERS};
use crate::broadcast::{stats_payload, EventStreamSink, TelemetrySink};

const BOUNDARY: &str = "frame";
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
/// How often an idle video stream checks whether its client has gone away.
const PEER_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Serve `multipart/x-mixed-replace` until the client goes away or the server stops.
///
/// A part is written only when a new tick has been published, so the stream never runs
/// faster than the pipeline. While no ticks arrive the peer is checked every
/// `PEER_CHECK_INTERVAL` so a closed client does not keep the thread alive.
pub(super) fn serve_mjpeg(mut stream: TcpStream, ctx: &ApiContext) -> Result<()> {
    stream.set_write_timeout(Some(STREAM_WRITE_TIMEOUT))?;
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\n{}Connection: close\r\n\r\n",
        BOUNDARY, COMMON_HEADERS
    );
    stream.write_all(head.as_bytes())?;

    let mut last_tick = 0;
    let mut parts = 0u64;
    let mut last_check = Instant::now();
    while !ctx.shutdown.load(Ordering::SeqCst) {
        let snapshot = match ctx.runner.latest_snapshot() {
            Some(snapshot) if snapshot.tick != last_tick => snapshot,
            _ => {
                if last_check.elapsed() >= PEER_CHECK_INTERVAL {
                    last_check = Instant::now();
                    if peer_closed(&mut stream) {
                        log::debug!("api: video client left after {} parts", parts);
                        return Ok(());
                    }
                }
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
        };
        last_tick = snapshot.tick;

        let part_head = format!(
            "--{}\r\nContent-Type: {}\r\nContent-Length: {}\r\nX-Frame-Tick: {}\r\n\r\n",
            BOUNDARY,
            snapshot.content_type,
            snapshot.frame.len(),
            snapshot.tick
        );
        let written = stream
            .write_all(part_head.as_bytes())
            .and_then(|()| stream.write_all(&snapshot.frame))
            .and_then(|()| stream.write_all(b"\r\n"))
            .and_then(|()| stream.flush());
        if let Err(e) = written {
            log::debug!("api: video stream closed after {} parts: {}", parts, e);
            return Ok(());
        }
        parts += 1;
    }
    Ok(())
}

/// Nonblocking check for a closed client. Stray bytes from the client are discarded.
fn peer_closed(stream: &mut TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return true;
    }
    let mut buf = [0u8; 512];
    let closed = loop {
        match stream.read(&mut buf) {
            Ok(0) => break true,
            Ok(_) => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => break false,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break true,
        }
    };
    closed || stream.set_nonblocking(false).is_err()
}

/// Answer with an event-stream head and hand the connection to the broadcaster.
pub(super) fn subscribe_telemetry(mut stream: TcpStream, ctx: &ApiContext) -> Result<()> {
    let Some(broadcaster) = ctx.telemetry.as_ref() else {
        return Response::error(503, "telemetry_disabled").write_to(&mut stream);
    };

    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n{}Connection: keep-alive\r\n\r\n",
        COMMON_HEADERS
    );
    stream.write_all(head.as_bytes())?;

    let mut sink = EventStreamSink::new(stream)?;
    // First event right away so a new subscriber need not wait a full period.
    sink.send(&stats_payload(&ctx.runner.state())?)?;
    broadcaster.register(Box::new(sink));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    #[test]
    fn open_peer_is_not_closed() {
        let (mut server, mut client) = connected_pair();
        client.write_all(b"stray").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!peer_closed(&mut server));
        // Back in blocking mode for the part writes that follow.
        server.write_all(b"x").unwrap();
    }

    #[test]
    fn departed_peer_is_detected() {
        let (mut server, client) = connected_pair();
        drop(client);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !peer_closed(&mut server) {
            assert!(Instant::now() < deadline, "closed peer never detected");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
