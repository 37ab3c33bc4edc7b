//! demo - bounded end-to-end synthetic run
//!
//! Drives the full pipeline (synthetic source and detector, real tracker, geolocation,
//! annotation and JPEG encoding) for a fixed time, then writes the last published frame
//! and the state query result to the output directory.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use foresight_pipeline::{
    Annotator, CameraPose, Controls, Detector, JpegCodec, LabelFont, Mode, PipelineRunner,
    RunnerOptions, Stages, SyntheticSource, Tracker,
};

const FRAME_WIDTH: u32 = 640;
const FRAME_HEIGHT: u32 = 360;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// How long to run the pipeline.
    #[arg(long, default_value_t = 5)]
    seconds: u64,
    /// Tick rate cap.
    #[arg(long, default_value_t = 15)]
    fps: u32,
    /// Output directory for frame.jpg and state.json.
    #[arg(long, default_value = "demo_out")]
    out: String,
    /// Overlay mode: sar or suspect.
    #[arg(long, default_value = "sar")]
    mode: String,
    /// Disable privacy blur.
    #[arg(long)]
    no_blur: bool,
    /// Font file for labels; defaults to a system font when one is installed.
    #[arg(long, env = "FORESIGHT_FONT")]
    font: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.fps == 0 {
        return Err(anyhow!("fps must be >= 1"));
    }

    let out_dir = PathBuf::from(&args.out);
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("create output directory {}", out_dir.display()))?;

    let stages = Stages::new(
        Box::new(SyntheticSource::new("stub://demo", FRAME_WIDTH, FRAME_HEIGHT)),
        Detector::synthetic(),
        Tracker::default(),
        Annotator::default().with_labels(LabelFont::discover(args.font.as_deref())),
        Box::new(JpegCodec::default()),
    );
    let controls = Controls::new(Mode::parse(&args.mode), !args.no_blur, CameraPose::default());
    let runner = PipelineRunner::new(
        stages,
        controls,
        RunnerOptions {
            target_fps: f64::from(args.fps),
            ..RunnerOptions::default()
        },
    );

    runner.start()?;
    std::thread::sleep(Duration::from_secs(args.seconds));
    runner.stop()?;

    let snapshot = runner
        .latest_snapshot()
        .ok_or_else(|| anyhow!("no frame was published in {}s", args.seconds))?;
    let frame_path = out_dir.join("frame.jpg");
    fs::write(&frame_path, &snapshot.frame[..])
        .with_context(|| format!("write {}", frame_path.display()))?;

    let state = runner.state();
    let state_path = out_dir.join("state.json");
    fs::write(&state_path, serde_json::to_vec_pretty(&state)?)
        .with_context(|| format!("write {}", state_path.display()))?;

    println!(
        "demo: {} ticks, {:.1} fps, {} tracks, mode={}, blur={}",
        state.tick,
        state.fps,
        state.detections.len(),
        state.mode.as_str(),
        state.blur_enabled
    );
    for detection in &state.detections {
        if let Some(geo) = detection.geo {
            println!(
                "  id{} {} {:.2} -> {:.6}, {:.6} (+/- {:.1} m)",
                detection.id,
                detection.class,
                detection.confidence,
                geo.lat,
                geo.lon,
                geo.error_m
            );
        }
    }
    println!("wrote {} and {}", frame_path.display(), state_path.display());
    Ok(())
}
