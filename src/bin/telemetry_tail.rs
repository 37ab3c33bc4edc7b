//! telemetry_tail - print telemetry events from a running foresightd.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

#[derive(Parser, Debug)]
#[command(author, version, about = "Print telemetry events from foresightd")]
struct Args {
    /// API address of foresightd.
    #[arg(long, env = "FORESIGHT_API_ADDR", default_value = "127.0.0.1:8000")]
    addr: String,
    /// Stop after this many events.
    #[arg(long)]
    count: Option<u64>,
    /// Print the raw JSON payload instead of a summary line.
    #[arg(long)]
    raw: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut stream =
        TcpStream::connect(&args.addr).with_context(|| format!("connect to {}", args.addr))?;
    write!(
        stream,
        "GET /telemetry HTTP/1.1\r\nHost: {}\r\nAccept: text/event-stream\r\n\r\n",
        args.addr
    )?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut status = String::new();
    reader.read_line(&mut status)?;
    if !status.starts_with("HTTP/1.1 200") {
        return Err(anyhow!("telemetry unavailable: {}", status.trim()));
    }
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 {
            return Err(anyhow!("connection closed during response head"));
        }
        if header.trim().is_empty() {
            break;
        }
    }

    let mut seen = 0u64;
    for line in reader.lines() {
        let line = line?;
        let Some(payload) = line.strip_prefix("data: ") else {
            continue;
        };
        if args.raw {
            println!("{}", payload);
        } else {
            match serde_json::from_str::<Value>(payload) {
                Ok(event) => println!("{}", summarize(&event)),
                Err(e) => log::warn!("unparseable event: {}", e),
            }
        }
        seen += 1;
        if args.count.is_some_and(|count| seen >= count) {
            break;
        }
    }
    log::info!("received {} events", seen);
    Ok(())
}

fn summarize(event: &Value) -> String {
    let tracks = event["detections"].as_array().map_or(0, |list| list.len());
    format!(
        "tick={} fps={:.1} latency={:.1}ms tracks={} mode={} health={}",
        event["tick"].as_u64().unwrap_or(0),
        event["fps"].as_f64().unwrap_or(0.0),
        event["latency_ms"].as_f64().unwrap_or(0.0),
        tracks,
        event["mode"].as_str().unwrap_or("?"),
        event["health"].as_str().unwrap_or("?")
    )
}
