#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The task that drains the snapshot queue onto the MQTT session, falling
//! back to an on-disk offline store while disconnected or over budget.
//!
//! Grounded on the teacher's exporter task lifecycle (`init` -> export loop
//! -> `stop`) and its `EffectHandler`-style structured logging; persistence
//! framing is grounded on `PayloadManager`'s always-compress-at-rest record
//! format.

pub mod effect;
pub mod persistence;
pub mod serialize;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use connectivity::{ConnectivityEvent, ConnectivityHandle, QoS};
use effect::EffectHandler;
use engine::TriggeredSnapshot;
use persistence::OfflineStore;
use serialize::serialize_snapshot;
use snapshot_queue::SnapshotConsumer;
use task::labels::{ProcessLabels, TaskLabels};
use task::{JoinHandleTask, TaskManager};

/// All the errors this crate returns directly. Most failures (publish
/// rejection, broker disconnects) are handled internally by persisting and
/// are never surfaced as a `Result` at all.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The offline store failed to read or write a record.
    #[error("offline store error: {0}")]
    Persistence(#[from] persistence::Error),
}

/// Identity attached to every log line the sender emits.
#[derive(Clone, Debug)]
pub struct DebugInfo {
    /// The id of the process this sender runs in.
    pub process_id: String,
    /// The category of this sender's task.
    pub task_cat: String,
    /// The id of this sender's task.
    pub task_id: String,
    /// The source of this sender's task.
    pub task_source: String,
}

impl DebugInfo {
    /// Builds debug info from a process/task label pair.
    pub fn new(process_labels: ProcessLabels, task_labels: TaskLabels) -> Self {
        Self {
            process_id: process_labels.process_id,
            task_cat: task_labels.task_cat,
            task_id: task_labels.task_id,
            task_source: task_labels.task_source,
        }
    }
}

/// Static knobs for one sender task.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// MQTT topic published snapshots are sent on.
    pub topic: String,
    /// Quality of service used for every publish.
    pub qos: QoS,
    /// Byte budget capping the sender's view of the broker's in-flight queue;
    /// crossing it returns `QUOTA_REACHED` to the caller, which persists.
    pub byte_budget: u64,
    /// How often, in milliseconds, the sender retries draining the offline
    /// store while connected.
    pub reconnect_retry_interval_ms: u64,
}

/// Drains the snapshot queue onto the broker, or the offline store while
/// disconnected or over budget.
pub struct TelemetrySender {
    consumer: SnapshotConsumer,
    connectivity: ConnectivityHandle,
    lifecycle: flume::Receiver<ConnectivityEvent>,
    offline: OfflineStore,
    diagnostics: Arc<diagnostics::Counters>,
    effect: EffectHandler,
    config: SenderConfig,
    connected: bool,
    in_flight_bytes: AtomicU64,
}

impl TelemetrySender {
    /// Builds a sender around an already-connected handle. The connectivity
    /// manager's own poll loop is expected to run independently; this only
    /// subscribes to its lifecycle events.
    pub fn new(
        consumer: SnapshotConsumer,
        connectivity: ConnectivityHandle,
        offline: OfflineStore,
        diagnostics: Arc<diagnostics::Counters>,
        effect: EffectHandler,
        config: SenderConfig,
    ) -> Self {
        let lifecycle = connectivity.subscribe_lifecycle();
        Self {
            consumer,
            connectivity,
            lifecycle,
            offline,
            diagnostics,
            effect,
            config,
            connected: false,
            in_flight_bytes: AtomicU64::new(0),
        }
    }

    /// Runs the sender loop until the snapshot queue or the connectivity
    /// manager's lifecycle channel disconnects.
    pub async fn run(mut self) {
        let mut retry_interval = tokio::time::interval(Duration::from_millis(self.config.reconnect_retry_interval_ms));

        loop {
            tokio::select! {
                snapshot = self.consumer.recv_async() => {
                    match snapshot {
                        Some(snapshot) => self.handle_snapshot(snapshot).await,
                        None => {
                            self.effect.info("snapshot queue has no remaining producer, stopping");
                            return;
                        }
                    }
                }
                event = self.lifecycle.recv_async() => {
                    match event {
                        Ok(event) => self.handle_lifecycle(event).await,
                        Err(_) => {
                            self.effect.info("connectivity manager is gone, stopping");
                            return;
                        }
                    }
                }
                _ = retry_interval.tick() => {
                    if self.connected {
                        self.drain_offline().await;
                    }
                }
            }
        }
    }

    async fn handle_lifecycle(&mut self, event: ConnectivityEvent) {
        match event {
            ConnectivityEvent::Success { rejoined } => {
                self.connected = true;
                self.effect.info(format!("mqtt session established (rejoined={rejoined})"));
                self.drain_offline().await;
            }
            ConnectivityEvent::Resumed => {
                self.connected = true;
            }
            ConnectivityEvent::Interrupted { code } => {
                self.connected = false;
                self.effect.warn("mqtt session interrupted", code.map(|c| c.to_string()).as_deref());
            }
            ConnectivityEvent::Failure { code, reason } => {
                self.connected = false;
                let detail = format!("code={code:?} reason={reason}");
                self.effect.warn("mqtt connection attempt failed", Some(&detail));
            }
            ConnectivityEvent::Attempting => {}
            ConnectivityEvent::Stopped => {
                self.connected = false;
                self.effect.info("mqtt session stopped");
            }
            _ => {}
        }
    }

    async fn handle_snapshot(&mut self, snapshot: TriggeredSnapshot) {
        let event_id = snapshot.event_id;
        let persist_on_failure = snapshot.metadata.persist;
        let wire_compressed = snapshot.metadata.compress;
        let payload = serialize_snapshot(&snapshot);

        if !self.connected {
            self.persist_or_drop(&payload, wire_compressed, persist_on_failure);
            return;
        }

        let payload_len = payload.len() as u64;
        if self.in_flight_bytes.load(Ordering::Relaxed) + payload_len > self.config.byte_budget {
            self.diagnostics.inc_send_quota_reached();
            self.effect.warn("QUOTA_REACHED", Some(&format!("snapshot {event_id}")));
            self.persist_or_drop(&payload, wire_compressed, persist_on_failure);
            return;
        }

        let _ = self.in_flight_bytes.fetch_add(payload_len, Ordering::Relaxed);
        let result = self.connectivity.publish(&self.config.topic, self.config.qos, payload.clone()).await;
        let _ = self.in_flight_bytes.fetch_sub(payload_len, Ordering::Relaxed);

        match result {
            Ok(()) => self.effect.info(format!("published snapshot {event_id}")),
            Err(error) => {
                self.diagnostics.inc_send_publish_failed();
                self.effect.warn("publish failed", Some(&error.to_string()));
                self.persist_or_drop(&payload, wire_compressed, persist_on_failure);
            }
        }
    }

    fn persist_or_drop(&self, payload: &[u8], wire_compressed: bool, persist: bool) {
        if !persist {
            return;
        }
        if let Err(error) = self.offline.append(payload, wire_compressed) {
            self.diagnostics.inc_persistence_write_failed();
            self.effect.error("failed to persist snapshot", Some(&error.to_string()));
        }
    }

    async fn drain_offline(&mut self) {
        let records = match self.offline.read_all() {
            Ok(records) => records,
            Err(error) => {
                self.diagnostics.inc_persistence_read_failed();
                self.effect.error("failed to read offline store", Some(&error.to_string()));
                return;
            }
        };
        if records.is_empty() {
            return;
        }

        let mut published = 0;
        for record in &records {
            match self.connectivity.publish(&self.config.topic, self.config.qos, record.payload.clone()).await {
                Ok(()) => published += 1,
                Err(error) => {
                    self.effect.warn("reconnect-retry publish failed", Some(&error.to_string()));
                    break;
                }
            }
        }

        if let Err(error) = self.offline.finish_drain(&records, published) {
            self.diagnostics.inc_persistence_write_failed();
            self.effect.error("failed to commit drained offline store", Some(&error.to_string()));
        } else if published > 0 {
            self.effect.info(format!("drained {published} persisted snapshot(s) from the offline store"));
        }
    }
}

/// Spawns `sender`'s loop on the async runtime and registers it with
/// `task_manager`, the way the teacher registers its exporter tasks.
pub fn spawn(sender: TelemetrySender, task_manager: &mut TaskManager) {
    let task_labels = TaskLabels::new("telemetry-sender", "send-loop", "agent");
    let cleanup_labels = task_labels.clone();
    let process_labels = task_manager.process_labels();

    let join_handle: JoinHandleTask = tokio::task::spawn(async move {
        sender.run().await;
        TaskManager::no_task_cleaner(process_labels, cleanup_labels)
    });

    task_manager.register(join_handle, &task_labels);
}

#[cfg(test)]
mod test {
    use super::*;
    use inspection_matrix::ConditionMetadata;

    fn metadata(compress: bool, persist: bool) -> ConditionMetadata {
        ConditionMetadata {
            campaign_id: "campaign-1".into(),
            decoder_id: "decoder-1".into(),
            priority: 0,
            compress,
            persist,
            campaign_arn: None,
        }
    }

    fn snapshot(event_id: u32, compress: bool, persist: bool) -> TriggeredSnapshot {
        TriggeredSnapshot {
            metadata: metadata(compress, persist),
            event_id,
            trigger_system_ts_ms: 0,
            collected_samples: Vec::new(),
            active_dtcs: None,
            kind: engine::SnapshotKind::Telemetry,
        }
    }

    #[tokio::test]
    async fn a_snapshot_persists_when_disconnected_and_persist_is_set() {
        let dir = tempfile::tempdir().unwrap();
        let offline = OfflineStore::new(dir.path().join("offline.bin"));

        let diagnostics = Arc::new(diagnostics::Counters::new());
        let debug_info = DebugInfo::new(ProcessLabels::new("agent"), TaskLabels::new("telemetry-sender", "send-loop", "agent"));

        let config = connectivity::ConnectivityConfig {
            broker_host: "localhost".into(),
            broker_port: 1883,
            client_id: "test".into(),
            keep_alive_secs: 30,
            session_expiry_secs: 0,
            start_backoff_ms: 100,
            max_backoff_ms: 1_000,
            root_ca_path: None,
        };
        let manager = connectivity::ConnectivityManager::new(config, diagnostics.clone());
        let handle = manager.handle();

        let (_producer, consumer) = snapshot_queue::bounded(4);
        let sender_config = SenderConfig {
            topic: "veh/telemetry".into(),
            qos: QoS::AtLeastOnce,
            byte_budget: 1 << 20,
            reconnect_retry_interval_ms: 1_000,
        };
        let mut sender = TelemetrySender::new(consumer, handle, offline, diagnostics, EffectHandler::new(debug_info), sender_config);

        sender.handle_snapshot(snapshot(1, false, true)).await;

        let records = sender.offline.read_all().unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn a_snapshot_is_dropped_when_disconnected_and_persist_is_unset() {
        let dir = tempfile::tempdir().unwrap();
        let offline = OfflineStore::new(dir.path().join("offline.bin"));

        let diagnostics = Arc::new(diagnostics::Counters::new());
        let debug_info = DebugInfo::new(ProcessLabels::new("agent"), TaskLabels::new("telemetry-sender", "send-loop", "agent"));

        let config = connectivity::ConnectivityConfig {
            broker_host: "localhost".into(),
            broker_port: 1883,
            client_id: "test".into(),
            keep_alive_secs: 30,
            session_expiry_secs: 0,
            start_backoff_ms: 100,
            max_backoff_ms: 1_000,
            root_ca_path: None,
        };
        let manager = connectivity::ConnectivityManager::new(config, diagnostics.clone());
        let handle = manager.handle();

        let (_producer, consumer) = snapshot_queue::bounded(4);
        let sender_config = SenderConfig {
            topic: "veh/telemetry".into(),
            qos: QoS::AtLeastOnce,
            byte_budget: 1 << 20,
            reconnect_retry_interval_ms: 1_000,
        };
        let mut sender = TelemetrySender::new(consumer, handle, offline, diagnostics, EffectHandler::new(debug_info), sender_config);

        sender.handle_snapshot(snapshot(2, false, false)).await;

        let records = sender.offline.read_all().unwrap();
        assert!(records.is_empty());
    }
}
