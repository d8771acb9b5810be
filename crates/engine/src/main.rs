//! Process entry point: loads configuration, opens the relay board, builds
//! the valve/sensor pools and the Engine, then runs the scheduler and
//! diagnostics server until a shutdown signal arrives.
//!
//! The cloud transport adapter (connect, WELCOME/invite-code handshake,
//! reconnect-with-backoff) is out of scope here: `messages::parse_inbound`
//! and the outbound DTOs in `messages` are the contract a transport crate
//! integrates against. In this binary, inbound commands and outbound
//! progress/result events are logged through `tracing` instead of pushed
//! over a socket, so the engine and its safety behavior can be exercised
//! standalone.

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use irrigation_engine::algorithm::AlgorithmParams;
use irrigation_engine::config::Config;
use irrigation_engine::diagnostics;
use irrigation_engine::engine::{Engine, EngineScheduleSink};
use irrigation_engine::events::{ChannelEventSink, EventSink, ProgressEvent, ResultEvent};
use irrigation_engine::managers::{SensorManager, ValveManager};
use irrigation_engine::relay::{RelayConfig, RelayDriver};
use irrigation_engine::scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("loading config from {config_path}"))?;
    info!(
        total_valves = config.total_valves,
        total_sensors = config.total_sensors,
        simulation_mode = config.simulation_mode,
        "configuration loaded"
    );

    // ── Relay board ──────────────────────────────────────────────────
    let relay_config = RelayConfig {
        vendor_id: config.relay_vendor_id,
        product_id: config.relay_product_id,
        ..RelayConfig::default()
    };
    let relay = Arc::new(RelayDriver::open(relay_config, config.simulation_mode));
    let all_channels: Vec<u8> = (1..=config.total_valves).collect();
    relay.all_off(&all_channels);

    // ── Resource pools ───────────────────────────────────────────────
    let valves = ValveManager::new(config.total_valves, relay.clone());
    let sensors = SensorManager::new(config.sensor_ports(), 1, config.simulation_mode);

    // ── Event sink: progress/result events logged in lieu of a transport ──
    let (channel_sink, mut receiver) = ChannelEventSink::new();
    let sink: Arc<dyn EventSink> = Arc::new(channel_sink);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(progress) = receiver.progress_rx.recv() => log_progress(&progress),
                Some(result) = receiver.result_rx.recv() => log_result(&result),
                else => break,
            }
        }
    });

    let scheduler = Arc::new(Scheduler::new());
    let engine = Arc::new(Engine::new(
        valves,
        sensors,
        scheduler.clone(),
        sink,
        AlgorithmParams::default(),
    ));

    // ── Scheduler tick loop ──────────────────────────────────────────
    let schedule_sink = Arc::new(EngineScheduleSink::new(engine.clone()));
    let scheduler_for_task = scheduler.clone();
    let mut scheduler_handle = tokio::spawn(async move {
        scheduler_for_task.run(schedule_sink).await;
    });

    // ── Diagnostics server ───────────────────────────────────────────
    let diagnostics_engine = engine.clone();
    let diagnostics_addr = config.diagnostics_bind_addr.clone();
    let mut diagnostics_handle = tokio::spawn(async move {
        if let Err(e) = diagnostics::serve(diagnostics_engine, &diagnostics_addr).await {
            error!("diagnostics server exited: {e:#}");
        }
    });

    // ── Signal handling ──────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason;
    let mut diagnostics_done = false;
    loop {
        tokio::select! {
            result = &mut scheduler_handle => {
                error!("CRITICAL: scheduler task exited unexpectedly: {result:?}");
                exit_reason = "scheduler task died";
                break;
            }
            result = &mut diagnostics_handle, if !diagnostics_done => {
                warn!("diagnostics server task exited: {result:?}");
                diagnostics_done = true;
            }
            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }
            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }
        }
    }

    warn!(signal = exit_reason, "shutting down — cancelling tasks and turning all valves off");
    engine.shutdown().await;
    relay.all_off(&all_channels);
    relay.close();
    info!("shutdown complete");
    Ok(())
}

fn log_progress(event: &ProgressEvent) {
    info!(
        plant_id = event.plant_id,
        session_id = %event.session_id,
        stage = ?event.stage,
        "progress"
    );
}

fn log_result(event: &ResultEvent) {
    info!(
        plant_id = event.plant_id,
        session_id = %event.session_id,
        outcome = ?event.outcome,
        "task finished"
    );
}
