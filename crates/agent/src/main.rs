//! Wires the agent config, inspection engine, ingestion worker, snapshot
//! queue, connectivity manager and telemetry sender together and runs them
//! until a shutdown signal arrives. Grounded on the teacher's
//! `multithread_engine_example`: install the logging subscriber, build the
//! long-running components, run, then join every registered task.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use agent_config::AgentConfig;
use color_eyre::eyre::{Result, WrapErr};
use connectivity::{ConnectivityConfig, ConnectivityManager, QoS};
use engine::InspectionEngine;
use ingestion::message::WorkerMessage;
use ingestion::{IngestionWorker, WorkerConfig};
use inspection_matrix::InspectionMatrix;
use task::labels::{ProcessLabels, TaskLabels};
use task::TaskManager;
use telemetry_sender::effect::EffectHandler;
use telemetry_sender::persistence::OfflineStore;
use telemetry_sender::{DebugInfo, SenderConfig, TelemetrySender};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as u64
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn init_logging() -> Result<()> {
    color_eyre::install()?;
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).wrap_err("setting default tracing subscriber failed")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let config_path = std::env::args().nth(1).ok_or_else(|| color_eyre::eyre::eyre!("usage: agent <config-file-path>"))?;
    let config = AgentConfig::load(&config_path).wrap_err("loading agent config")?;
    tracing::info!(broker_host = %config.broker.host, broker_port = config.broker.port, "agent config loaded");

    let diagnostics = Arc::new(diagnostics::Counters::new());
    let matrix = InspectionMatrix::load(&config.inspection_matrix_path, &diagnostics).wrap_err("loading inspection matrix")?;

    let mut engine = InspectionEngine::new(config.engine.ring_byte_budget, diagnostics.clone());
    engine.replace_matrix(matrix, now_ms());

    let (inbound_tx, inbound_rx) = flume::bounded::<WorkerMessage>(config.engine.inbound_channel_capacity);
    let (snapshot_producer, snapshot_consumer) = snapshot_queue::bounded(config.engine.snapshot_channel_capacity);

    let worker = IngestionWorker::new(
        engine,
        inbound_rx,
        snapshot_producer,
        diagnostics.clone(),
        WorkerConfig {
            idle_time_ms: config.engine.idle_time_ms,
            evaluate_interval_ms: config.engine.evaluate_interval_ms,
        },
    );

    let process_labels = ProcessLabels::new("agent");
    let mut task_manager = TaskManager::with_process_labels(process_labels.clone());

    ingestion::spawn(worker, &mut task_manager, now_ms);

    let connectivity_manager = ConnectivityManager::new(
        ConnectivityConfig {
            broker_host: config.broker.host.clone(),
            broker_port: config.broker.port,
            client_id: config.broker.client_id.clone(),
            keep_alive_secs: config.broker.keep_alive_secs,
            session_expiry_secs: config.broker.session_expiry_secs,
            start_backoff_ms: config.broker.start_backoff_ms,
            max_backoff_ms: config.broker.max_backoff_ms,
            root_ca_path: config.broker.root_ca_path.clone(),
        },
        diagnostics.clone(),
    );
    let connectivity_handle = connectivity_manager.handle();
    connectivity::spawn(connectivity_manager, &mut task_manager);

    let sender_task_labels = TaskLabels::new("telemetry-sender", "send-loop", "agent");
    let effect = EffectHandler::new(DebugInfo::new(process_labels, sender_task_labels));
    let offline_store = OfflineStore::new(config.sender.persistence_path.clone());
    let sender = TelemetrySender::new(
        snapshot_consumer,
        connectivity_handle.clone(),
        offline_store,
        diagnostics.clone(),
        effect,
        SenderConfig {
            topic: config.sender.topic.clone(),
            qos: qos_from_level(config.sender.qos),
            byte_budget: config.sender.byte_budget,
            reconnect_retry_interval_ms: config.sender.reconnect_retry_interval_ms,
        },
    );
    telemetry_sender::spawn(sender, &mut task_manager);

    tokio::signal::ctrl_c().await.wrap_err("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received, draining tasks");

    // Keep the inbound sender alive until shutdown is requested so the
    // ingestion worker's channel doesn't look disconnected to it the moment
    // decoder threads (out of scope) aren't yet attached.
    let _ = inbound_tx.send(WorkerMessage::Shutdown);
    drop(inbound_tx);
    connectivity_handle.stop();

    task_manager.join().await;
    Ok(())
}
