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

//! The dedicated thread that owns the inspection engine: drains the inbound
//! channel, swaps in a replacement matrix, runs one evaluation pass, and
//! drains completed snapshots onto the snapshot queue.
//!
//! Grounded on the teacher's receiver task: where the teacher selects
//! between a timer tick and a pipeline message over a tokio channel, this
//! worker selects between inbound data, a matrix replacement and an idle
//! timeout over a single `flume::Receiver::recv_timeout`, since all three
//! wake reasons here are driven from one synchronous loop rather than an
//! async runtime.

pub mod message;

use std::sync::Arc;
use std::time::Duration;

use engine::custom_function::{CustomFunctionRegistry, NoCustomFunctions};
use engine::{DtcSnapshot, InspectionEngine};
use signal::{Sample, SignalType};
use snapshot_queue::SnapshotProducer;
use task::labels::TaskLabels;
use task::{JoinHandleTask, TaskManager};

use message::{DecodedSample, WorkerMessage};

/// All the errors that can occur running the worker loop.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {}

/// Timing knobs for one worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum time, in milliseconds, the worker sleeps between wake-ups
    /// when the engine reports nothing armed and no window is pending.
    pub idle_time_ms: u64,
    /// Minimum spacing, in milliseconds, between evaluation passes run
    /// purely because nothing was drained — the heartbeat-condition path.
    pub evaluate_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_time_ms: 1_000,
            evaluate_interval_ms: 1_000,
        }
    }
}

/// Owns the inspection engine and its single inbound channel.
pub struct IngestionWorker<F: CustomFunctionRegistry = NoCustomFunctions> {
    engine: InspectionEngine<F>,
    inbound: flume::Receiver<WorkerMessage>,
    snapshots: SnapshotProducer,
    diagnostics: Arc<diagnostics::Counters>,
    config: WorkerConfig,
}

impl<F: CustomFunctionRegistry> IngestionWorker<F> {
    /// Creates a worker around an already-configured engine.
    pub fn new(
        engine: InspectionEngine<F>,
        inbound: flume::Receiver<WorkerMessage>,
        snapshots: SnapshotProducer,
        diagnostics: Arc<diagnostics::Counters>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            engine,
            inbound,
            snapshots,
            diagnostics,
            config,
        }
    }

    /// Runs the worker loop until the channel disconnects or a `Shutdown`
    /// message is drained. `now_ms` supplies the current time so the loop
    /// itself has no hidden dependency on the system clock, matching the
    /// way the engine's own methods take `now_ms` explicitly.
    pub fn run(mut self, now_ms: impl Fn() -> u64) {
        let mut last_evaluate_ms = now_ms();
        let mut wait_hint_ms = self.config.idle_time_ms;

        loop {
            let timeout = Duration::from_millis(wait_hint_ms.min(self.config.idle_time_ms));

            match self.inbound.recv_timeout(timeout) {
                Ok(message) => {
                    // A shutdown still gets one last evaluate + publish pass
                    // over whatever was already applied, so the agent drains
                    // gracefully rather than dropping in-flight work.
                    let mut shutdown = matches!(message, WorkerMessage::Shutdown);
                    if !shutdown {
                        self.apply(message, now_ms());
                    }

                    while !shutdown {
                        match self.inbound.try_recv() {
                            Ok(WorkerMessage::Shutdown) => shutdown = true,
                            Ok(message) => self.apply(message, now_ms()),
                            Err(_) => break,
                        }
                    }

                    let now = now_ms();
                    wait_hint_ms = self.engine.evaluate(now);
                    last_evaluate_ms = now;
                    self.publish_ready(now);

                    if shutdown {
                        tracing::info!("ingestion worker received shutdown");
                        return;
                    }
                }
                Err(flume::RecvTimeoutError::Timeout) => {
                    let now = now_ms();
                    if now.saturating_sub(last_evaluate_ms) >= self.config.evaluate_interval_ms {
                        wait_hint_ms = self.engine.evaluate(now);
                        last_evaluate_ms = now;
                        self.publish_ready(now);
                    }
                }
                Err(flume::RecvTimeoutError::Disconnected) => {
                    tracing::info!("ingestion inbound channel disconnected, stopping worker");
                    return;
                }
            }
        }
    }

    fn apply(&mut self, message: WorkerMessage, now_ms: u64) {
        match message {
            WorkerMessage::Sample(sample) => self.push_decoded(sample),
            WorkerMessage::SignalGroup(samples) => {
                for sample in samples {
                    self.push_decoded(sample);
                }
            }
            WorkerMessage::Dtc(readout) => self.engine.push_dtc(DtcSnapshot {
                ts_system_ms: readout.ts_system_ms,
                codes: readout.codes,
            }),
            WorkerMessage::ReplaceMatrix(matrix) => self.engine.replace_matrix(*matrix, now_ms),
            WorkerMessage::Shutdown => unreachable!("shutdown is intercepted by the caller"),
        }
    }

    fn push_decoded(&mut self, sample: DecodedSample) {
        if sample.signal_type == SignalType::Unknown {
            tracing::warn!(signal_id = sample.signal_id, "dropping sample with unknown signal type");
            self.diagnostics.inc_ingestion_unknown_signal_type();
            return;
        }
        self.engine.push_sample(sample.signal_id, Sample::new(sample.value, sample.monotonic_ts_ms));
    }

    fn publish_ready(&mut self, now_ms: u64) {
        while let Some(snapshot) = self.engine.collect_next(now_ms) {
            if let Err(error) = self.snapshots.try_push(snapshot) {
                tracing::warn!(%error, "snapshot queue refused a completed snapshot");
                break;
            }
        }
    }
}

/// Spawns `worker`'s loop on a dedicated blocking OS thread and registers it
/// with `task_manager` under a stable task identity, the way the teacher
/// labels and registers its receiver tasks.
pub fn spawn<F>(worker: IngestionWorker<F>, task_manager: &mut TaskManager, now_ms: impl Fn() -> u64 + Send + 'static)
where
    F: CustomFunctionRegistry + Send + 'static,
{
    let task_labels = TaskLabels::new("ingestion", "inspection-worker", "agent");
    let cleanup_labels = task_labels.clone();
    let process_labels = task_manager.process_labels();

    let join_handle: JoinHandleTask = tokio::task::spawn_blocking(move || {
        worker.run(now_ms);
        TaskManager::no_task_cleaner(process_labels, cleanup_labels)
    });

    task_manager.register(join_handle, &task_labels);
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU64, Ordering};

    use engine::InspectionEngine;
    use inspection_matrix::{Condition, ConditionMetadata, InspectionMatrix, SignalSpec};
    use signal::{SignalValue, SignalId};
    use condition_ast::{AstNode, BinaryOp};

    use super::*;

    fn metadata() -> ConditionMetadata {
        ConditionMetadata {
            campaign_id: "campaign-1".into(),
            decoder_id: "decoder-1".into(),
            priority: 0,
            compress: false,
            persist: true,
            campaign_arn: None,
        }
    }

    fn matrix_over(signal_id: SignalId) -> InspectionMatrix {
        let nodes = vec![AstNode::Float(10.0), AstNode::Binary(BinaryOp::Gt, 2, 0), AstNode::Signal(signal_id)];
        let condition = Condition {
            root_expr_ref: 1,
            signals: vec![SignalSpec {
                signal_id,
                sample_buffer_size: 4,
                min_sample_interval_ms: 0,
                fixed_window_period_ms: 0,
                is_condition_only: false,
                signal_type: SignalType::F64,
            }],
            min_publish_interval_ms: 0,
            after_duration_ms: 0,
            trigger_only_on_rising_edge: false,
            include_active_dtcs: false,
            always_evaluate: false,
            is_static: false,
            metadata: metadata(),
        };
        InspectionMatrix::activate(nodes, vec![condition], &diagnostics::Counters::new())
    }

    fn clock(ms: &'static AtomicU64) -> impl Fn() -> u64 {
        move || ms.load(Ordering::SeqCst)
    }

    #[test]
    fn a_sample_above_threshold_produces_a_queued_snapshot() {
        let diagnostics = Arc::new(diagnostics::Counters::new());
        let mut engine = InspectionEngine::new(1 << 20, diagnostics.clone());
        engine.replace_matrix(matrix_over(1001), 0);

        let (outbound_tx, inbound) = flume::unbounded();
        let (snapshots, consumer) = snapshot_queue::bounded(4);
        let worker = IngestionWorker::new(engine, inbound, snapshots, diagnostics, WorkerConfig::default());

        outbound_tx
            .send(WorkerMessage::Sample(DecodedSample {
                signal_id: 1001,
                monotonic_ts_ms: 0,
                value: SignalValue::F64(20.0),
                signal_type: SignalType::F64,
            }))
            .unwrap();
        outbound_tx.send(WorkerMessage::Shutdown).unwrap();

        static NOW: AtomicU64 = AtomicU64::new(0);
        worker.run(clock(&NOW));

        let snapshot = consumer.recv_timeout(Duration::from_millis(10)).unwrap();
        assert!(snapshot.is_some());
    }

    #[test]
    fn unknown_signal_type_is_dropped_and_counted() {
        let diagnostics = Arc::new(diagnostics::Counters::new());
        let mut engine = InspectionEngine::new(1 << 20, diagnostics.clone());
        engine.replace_matrix(matrix_over(1001), 0);

        let (outbound_tx, inbound) = flume::unbounded();
        let (snapshots, _consumer) = snapshot_queue::bounded(4);
        let worker = IngestionWorker::new(engine, inbound, snapshots, diagnostics.clone(), WorkerConfig::default());

        outbound_tx
            .send(WorkerMessage::Sample(DecodedSample {
                signal_id: 1001,
                monotonic_ts_ms: 0,
                value: SignalValue::F64(20.0),
                signal_type: SignalType::Unknown,
            }))
            .unwrap();
        outbound_tx.send(WorkerMessage::Shutdown).unwrap();

        static NOW: AtomicU64 = AtomicU64::new(0);
        worker.run(clock(&NOW));

        let counted = diagnostics.snapshot().into_iter().find(|c| c.name == "ingestion_unknown_signal_type").unwrap();
        assert_eq!(counted.value, 1);
    }
}
