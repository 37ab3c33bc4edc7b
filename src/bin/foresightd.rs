//! foresightd - aerial analytics daemon
//!
//! This daemon:
//! 1. Loads configuration (`FORESIGHT_CONFIG` file, then `FORESIGHT_*` overrides)
//! 2. Builds the source, detector, tracker, annotator and encoder stages
//! 3. Runs the pipeline worker (unless autostart is off)
//! 4. Broadcasts telemetry to event-stream subscribers and, optionally, MQTT
//! 5. Serves the HTTP API until Ctrl-C

use anyhow::{Context, Result};
use std::sync::mpsc;
use std::sync::Arc;

use foresight_pipeline::{
    ApiConfig, ApiServer, Broadcaster, ForesightConfig, PipelineRunner, Stages,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ForesightConfig::load()?;
    log::info!(
        "foresightd {} source={} mode={} blur={}",
        env!("CARGO_PKG_VERSION"),
        config.source.url,
        config.pipeline.mode.as_str(),
        config.pipeline.blur
    );

    let stages = Stages::from_config(&config)?;
    let runner = Arc::new(PipelineRunner::new(
        stages,
        config.controls(),
        config.runner_options(),
    ));
    log::info!("detector: {}", runner.detector_name());
    if config.pipeline.autostart {
        runner.start()?;
    } else {
        log::info!("autostart disabled; POST /api/pipeline/start to begin");
    }

    let broadcaster = Arc::new(Broadcaster::spawn(
        Arc::clone(&runner),
        config.broadcast_period(),
    )?);
    if let Some(broker) = config.telemetry.mqtt_broker.as_deref() {
        attach_mqtt(&broadcaster, broker, &config.telemetry.mqtt_topic);
    }

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: config.api_addr.clone(),
        },
        Arc::clone(&runner),
    )
    .with_telemetry(Arc::clone(&broadcaster))
    .spawn()?;
    log::info!("api listening on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("foresightd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    api_handle.stop()?;
    broadcaster.stop();
    runner.stop()?;
    Ok(())
}

#[cfg(feature = "telemetry-mqtt")]
fn attach_mqtt(broadcaster: &Broadcaster, broker: &str, topic: &str) {
    match foresight_pipeline::broadcast::MqttSink::connect(broker, topic, "foresightd") {
        Ok(sink) => {
            broadcaster.register(Box::new(sink));
        }
        Err(e) => log::error!("telemetry: MQTT disabled: {:#}", e),
    }
}

#[cfg(not(feature = "telemetry-mqtt"))]
fn attach_mqtt(_broadcaster: &Broadcaster, broker: &str, _topic: &str) {
    log::warn!(
        "telemetry: MQTT broker {} configured but built without telemetry-mqtt",
        broker
    );
}
