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

//! The per-tick condition state machine: evaluates every active condition
//! against the current ring buffer store, arms conditions that fire, and
//! builds the snapshots that armed conditions eventually publish.
//!
//! One `InspectionEngine` owns an `InspectionMatrix`, the ring buffers it
//! feeds, and one `ConditionState` per active condition. Replacing the
//! matrix rebuilds all three; nothing is mutated incrementally across a
//! replacement.

use std::collections::HashMap;
use std::sync::Arc;

use condition_ast::ErrorKind;
use inspection_matrix::InspectionMatrix;
use ring_store::{RawDataHintSink, RingBufferSpec, RingBufferStore};
use signal::{Sample, SignalId};

pub mod custom_function;
mod dtc;
mod eval_context;
pub mod snapshot;

use custom_function::{CustomFunctionRegistry, NoCustomFunctions};
use dtc::DtcStore;
use eval_context::EngineEvalContext;
pub use inspection_matrix::ConditionMetadata;
pub use snapshot::{DtcSnapshot, SnapshotKind, TriggeredSnapshot, TypedSample};

/// A default wait hint, in milliseconds, returned when nothing is armed and
/// no window is open: keeps the ingestion worker from busy-looping on an
/// otherwise quiet matrix.
pub const DEFAULT_IDLE_WAIT_MS: u64 = 1_000;

/// Per-condition runtime state the matrix itself doesn't carry.
#[derive(Debug, Default)]
struct ConditionState {
    currently_true: bool,
    previously_true: bool,
    armed: bool,
    last_trigger_ms: Option<u64>,
    /// Set once a static condition has been resolved to false at
    /// activation; such a condition never evaluates again.
    static_disabled: bool,
}

/// Owns the active inspection matrix, the ring buffers it feeds, and the
/// per-condition trigger state machine described by the condition set.
pub struct InspectionEngine<F = NoCustomFunctions> {
    matrix: InspectionMatrix,
    store: RingBufferStore,
    hint_sink: Arc<dyn RawDataHintSink>,
    dtc: DtcStore,
    diagnostics: Arc<diagnostics::Counters>,
    conditions: Vec<ConditionState>,
    input_changed: Vec<bool>,
    signal_intervals: Vec<HashMap<SignalId, u32>>,
    next_to_collect: usize,
    event_id_counter: u32,
    epsilon: f64,
    custom_functions: F,
}

impl InspectionEngine<NoCustomFunctions> {
    /// Creates an engine with an empty matrix and no custom functions
    /// registered. Call `replace_matrix` before the first `evaluate`.
    pub fn new(byte_budget: usize, diagnostics: Arc<diagnostics::Counters>) -> Self {
        Self::with_custom_functions(byte_budget, diagnostics, NoCustomFunctions)
    }
}

impl<F: CustomFunctionRegistry> InspectionEngine<F> {
    /// Creates an engine backed by a custom-function registry other than
    /// the no-op default.
    pub fn with_custom_functions(byte_budget: usize, diagnostics: Arc<diagnostics::Counters>, custom_functions: F) -> Self {
        let hint_sink: Arc<dyn RawDataHintSink> = Arc::new(ring_store::NoOpRawDataHintSink);
        Self {
            matrix: InspectionMatrix::activate(Vec::new(), Vec::new(), &diagnostics),
            store: RingBufferStore::with_hint_sink(byte_budget, hint_sink.clone()),
            hint_sink,
            dtc: DtcStore::new(),
            diagnostics,
            conditions: Vec::new(),
            input_changed: Vec::new(),
            signal_intervals: Vec::new(),
            next_to_collect: 0,
            event_id_counter: 0,
            epsilon: 1e-9,
            custom_functions,
        }
    }

    /// Rebuilds the ring buffer store with `hint_sink` as its raw-data usage
    /// hint sink; replaces the no-op default. Call before `replace_matrix`.
    pub fn set_hint_sink(&mut self, byte_budget: usize, hint_sink: Arc<dyn RawDataHintSink>) {
        self.hint_sink = hint_sink.clone();
        self.store = RingBufferStore::with_hint_sink(byte_budget, hint_sink);
    }

    /// Replaces the active matrix: purges every ring buffer, re-registers
    /// every condition's signal bindings, and resolves static conditions
    /// exactly once against the fresh (empty) history.
    pub fn replace_matrix(&mut self, matrix: InspectionMatrix, now_ms: u64) {
        let old_invocations: std::collections::HashSet<_> = self.matrix.arena.invocation_ids().collect();
        let new_invocations: std::collections::HashSet<_> = matrix.arena.invocation_ids().collect();
        for invocation_id in old_invocations.difference(&new_invocations) {
            self.custom_functions.cleanup(*invocation_id);
        }

        self.store.purge();
        self.dtc = DtcStore::new();

        let n = matrix.conditions.len();
        self.conditions = (0..n).map(|_| ConditionState::default()).collect();
        self.input_changed = vec![false; n];
        self.signal_intervals = Vec::with_capacity(n);
        self.next_to_collect = 0;

        for (cond_idx, condition) in matrix.conditions.iter().enumerate() {
            let mut intervals = HashMap::with_capacity(condition.signals.len());
            for signal in &condition.signals {
                if let Err(err) = self.store.register(&RingBufferSpec {
                    signal_id: signal.signal_id,
                    signal_type: signal.signal_type,
                    capacity: signal.sample_buffer_size,
                    min_sample_interval_ms: signal.min_sample_interval_ms,
                    fixed_window_period_ms: signal.fixed_window_period_ms,
                    cond_idx,
                }) {
                    tracing::warn!(signal_id = signal.signal_id, error = %err, "ring buffer registration rejected at activation");
                }
                let _ = intervals.insert(signal.signal_id, signal.min_sample_interval_ms);
            }
            self.signal_intervals.push(intervals);
        }

        for skipped in self.store.allocate() {
            tracing::warn!(signal_id = skipped, "ring buffer disabled, memory budget exceeded");
            self.diagnostics.inc_memory_limit_hit();
        }

        self.matrix = matrix;

        for cond_idx in 0..self.matrix.conditions.len() {
            if !self.matrix.conditions[cond_idx].is_static {
                continue;
            }
            let result = self.evaluate_condition(cond_idx, now_ms);
            if result {
                self.conditions[cond_idx].currently_true = true;
                self.conditions[cond_idx].previously_true = true;
            } else {
                self.conditions[cond_idx].static_disabled = true;
            }
        }
    }

    /// Delivers one sample for `signal_id`, folding it into every ring
    /// buffer registered for it and marking affected conditions changed.
    pub fn push_sample(&mut self, signal_id: SignalId, sample: Sample) {
        for cond_idx in self.store.push_sample(signal_id, sample) {
            self.input_changed[cond_idx] = true;
        }
    }

    /// Records a fresh DTC readout, available to any condition with
    /// `include_active_dtcs` set that hasn't already consumed it.
    pub fn push_dtc(&mut self, snapshot: DtcSnapshot) {
        self.dtc.set(snapshot);
    }

    /// Runs one evaluation pass: closes elapsed windows, evaluates every
    /// condition whose input changed (or that always evaluates), and arms
    /// conditions that newly satisfy their trigger rule. Returns the
    /// minimum time, in milliseconds, the caller should wait before the next
    /// evaluation is worth attempting.
    pub fn evaluate(&mut self, now_ms: u64) -> u64 {
        for cond_idx in self.store.close_elapsed_windows(now_ms) {
            self.input_changed[cond_idx] = true;
        }

        for cond_idx in 0..self.matrix.conditions.len() {
            if self.conditions[cond_idx].static_disabled {
                continue;
            }

            let changed = std::mem::replace(&mut self.input_changed[cond_idx], false);
            let condition_is_static = self.matrix.conditions[cond_idx].is_static;
            let always_evaluate = self.matrix.conditions[cond_idx].always_evaluate;

            if !condition_is_static && (changed || always_evaluate) {
                let result = self.evaluate_condition(cond_idx, now_ms);
                self.conditions[cond_idx].currently_true = result;
            }

            self.try_arm(cond_idx, now_ms);
        }

        self.min_wait_hint(now_ms)
    }

    /// Evaluates one condition's root expression, logging and defaulting to
    /// `false` on every `ErrorKind` the way §7 prescribes — none of them
    /// disable the condition, only some are loud about it.
    fn evaluate_condition(&mut self, cond_idx: usize, now_ms: u64) -> bool {
        let condition = &self.matrix.conditions[cond_idx];
        let mut ctx = EngineEvalContext {
            store: &mut self.store,
            signal_intervals: &self.signal_intervals[cond_idx],
            epsilon: self.epsilon,
            custom_functions: &mut self.custom_functions,
            touched: Vec::new(),
        };

        let result = condition_ast::eval(&self.matrix.arena, condition.root_expr_ref, &mut ctx, condition_ast::MAX_AST_DEPTH);
        let touched = ctx.touched;
        self.custom_functions.condition_end(&touched, now_ms);

        match result {
            Ok(value) => value.as_bool(),
            Err(ErrorKind::SignalNotFound) => {
                self.diagnostics.inc_eval_signal_not_found();
                false
            }
            Err(ErrorKind::FunctionDataNotAvailable) => {
                self.diagnostics.inc_eval_function_data_not_available();
                false
            }
            Err(ErrorKind::TypeMismatch) => {
                tracing::warn!(cond_idx, "condition evaluated to TYPE_MISMATCH");
                self.diagnostics.inc_eval_type_mismatch();
                false
            }
            Err(ErrorKind::NotImplementedType) | Err(ErrorKind::NotImplementedFunction) => {
                tracing::warn!(cond_idx, "condition referenced an unimplemented type or function");
                self.diagnostics.inc_eval_not_implemented();
                false
            }
            Err(ErrorKind::StackDepthReached) => {
                tracing::warn!(cond_idx, "condition expression exceeded the depth limit");
                self.diagnostics.inc_eval_stack_depth_reached();
                false
            }
            Err(_) => false,
        }
    }

    fn try_arm(&mut self, cond_idx: usize, now_ms: u64) {
        let condition = &self.matrix.conditions[cond_idx];
        let state = &mut self.conditions[cond_idx];
        let currently_true = state.currently_true;

        let pacing_ok = state.last_trigger_ms.map_or(true, |last| now_ms >= last + condition.min_publish_interval_ms);
        let edge_ok = !condition.trigger_only_on_rising_edge || !state.previously_true;

        if currently_true && !state.armed && pacing_ok && edge_ok {
            state.armed = true;
            state.last_trigger_ms = Some(now_ms);
        }

        state.previously_true = currently_true;
    }

    /// Builds and returns the next armed condition's snapshot that has
    /// cleared its `after_duration`, scanning round-robin from where the
    /// last call left off. A condition whose built snapshot is empty is
    /// returned to `IDLE` without being handed back; the scan continues to
    /// the next armed condition. Returns `None` once nothing is ready.
    pub fn collect_next(&mut self, now_ms: u64) -> Option<TriggeredSnapshot> {
        let n = self.matrix.conditions.len();
        for step in 0..n {
            let cond_idx = (self.next_to_collect + step) % n;
            if !self.conditions[cond_idx].armed {
                continue;
            }

            let condition = &self.matrix.conditions[cond_idx];
            let last_trigger = self.conditions[cond_idx].last_trigger_ms.unwrap_or(now_ms);
            if now_ms < last_trigger + condition.after_duration_ms {
                continue;
            }

            self.next_to_collect = (cond_idx + 1) % n.max(1);
            self.conditions[cond_idx].armed = false;

            match self.build_snapshot(cond_idx, now_ms) {
                Some(snapshot) => return Some(snapshot),
                None => {
                    tracing::info!(cond_idx, "armed condition produced an empty snapshot, suppressing");
                    continue;
                }
            }
        }
        None
    }

    fn build_snapshot(&mut self, cond_idx: usize, now_ms: u64) -> Option<TriggeredSnapshot> {
        let condition = self.matrix.conditions[cond_idx].clone();
        let mut collected_samples = Vec::new();

        for signal in &condition.signals {
            if signal.is_condition_only {
                continue;
            }
            let samples = self.store.iterate_newest_n(
                signal.signal_id,
                signal.min_sample_interval_ms,
                cond_idx,
                signal.sample_buffer_size,
                true,
            );
            for sample in samples {
                if let Some(handle) = sample.value.as_handle() {
                    self.hint_sink.mark_selected_for_upload(handle);
                }
                collected_samples.push(TypedSample {
                    signal_id: signal.signal_id,
                    sample,
                });
            }
        }

        let active_dtcs = if condition.include_active_dtcs {
            self.dtc.take_if_unconsumed(cond_idx)
        } else {
            None
        };

        let snapshot = TriggeredSnapshot {
            metadata: condition.metadata.clone(),
            event_id: self.next_event_id(now_ms),
            trigger_system_ts_ms: now_ms,
            collected_samples,
            active_dtcs,
            kind: SnapshotKind::Telemetry,
        };

        if snapshot.is_empty() {
            None
        } else {
            Some(snapshot)
        }
    }

    fn next_event_id(&mut self, now_ms: u64) -> u32 {
        let counter = self.event_id_counter;
        self.event_id_counter = self.event_id_counter.wrapping_add(1);
        (((counter as u64) | (now_ms << 8)) & 0x7FFF_FFFF) as u32
    }

    fn min_wait_hint(&self, now_ms: u64) -> u64 {
        let mut hint = self.store.next_close_at().map(|close_at| close_at.saturating_sub(now_ms));

        for (cond_idx, condition) in self.matrix.conditions.iter().enumerate() {
            if !self.conditions[cond_idx].armed {
                continue;
            }
            let last_trigger = self.conditions[cond_idx].last_trigger_ms.unwrap_or(now_ms);
            let remaining = (last_trigger + condition.after_duration_ms).saturating_sub(now_ms);
            hint = Some(hint.map_or(remaining, |current| current.min(remaining)));
        }

        hint.unwrap_or(DEFAULT_IDLE_WAIT_MS)
    }
}

#[cfg(test)]
mod test {
    use condition_ast::{AstNode, BinaryOp};
    use inspection_matrix::{Condition, ConditionMetadata, SignalSpec};
    use signal::{SignalType, SignalValue};

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

    fn signal_spec(signal_id: SignalId) -> SignalSpec {
        SignalSpec {
            signal_id,
            sample_buffer_size: 4,
            min_sample_interval_ms: 0,
            fixed_window_period_ms: 0,
            is_condition_only: false,
            signal_type: SignalType::F64,
        }
    }

    fn condition(signal_id: SignalId) -> Condition {
        Condition {
            root_expr_ref: 1,
            signals: vec![signal_spec(signal_id)],
            min_publish_interval_ms: 0,
            after_duration_ms: 0,
            trigger_only_on_rising_edge: false,
            include_active_dtcs: false,
            always_evaluate: false,
            is_static: false,
            metadata: metadata(),
        }
    }

    fn matrix_with(condition: Condition) -> InspectionMatrix {
        let nodes = vec![
            AstNode::Float(10.0),
            AstNode::Binary(BinaryOp::Gt, 2, 0),
            AstNode::Signal(condition.signals[0].signal_id),
        ];
        InspectionMatrix::activate(nodes, vec![condition], &diagnostics::Counters::new())
    }

    #[test]
    fn condition_arms_and_publishes_when_signal_crosses_threshold() {
        let mut engine = InspectionEngine::new(1 << 20, Arc::new(diagnostics::Counters::new()));
        engine.replace_matrix(matrix_with(condition(1001)), 0);

        engine.push_sample(1001, Sample::new(SignalValue::F64(20.0), 0));
        let wait_hint = engine.evaluate(0);
        assert_eq!(wait_hint, DEFAULT_IDLE_WAIT_MS);

        let snapshot = engine.collect_next(0).expect("condition fired with a real sample");
        assert_eq!(snapshot.collected_samples.len(), 1);
        assert_eq!(snapshot.collected_samples[0].signal_id, 1001);
    }

    #[test]
    fn condition_below_threshold_never_arms() {
        let mut engine = InspectionEngine::new(1 << 20, Arc::new(diagnostics::Counters::new()));
        engine.replace_matrix(matrix_with(condition(1001)), 0);

        engine.push_sample(1001, Sample::new(SignalValue::F64(1.0), 0));
        let _ = engine.evaluate(0);
        assert!(engine.collect_next(0).is_none());
    }

    #[test]
    fn after_duration_delays_the_snapshot() {
        let mut cond = condition(1001);
        cond.after_duration_ms = 500;
        let mut engine = InspectionEngine::new(1 << 20, Arc::new(diagnostics::Counters::new()));
        engine.replace_matrix(matrix_with(cond), 0);

        engine.push_sample(1001, Sample::new(SignalValue::F64(20.0), 0));
        let wait_hint = engine.evaluate(0);
        assert_eq!(wait_hint, 500);
        assert!(engine.collect_next(0).is_none(), "after_duration hasn't elapsed yet");

        assert!(engine.collect_next(500).is_some());
    }

    #[test]
    fn rising_edge_only_suppresses_while_continuously_true() {
        let mut cond = condition(1001);
        cond.trigger_only_on_rising_edge = true;
        cond.always_evaluate = true;
        let mut engine = InspectionEngine::new(1 << 20, Arc::new(diagnostics::Counters::new()));
        engine.replace_matrix(matrix_with(cond), 0);

        engine.push_sample(1001, Sample::new(SignalValue::F64(20.0), 0));
        let _ = engine.evaluate(0);
        assert!(engine.collect_next(0).is_some());

        // Still true on the next tick, but this is not a fresh rising edge.
        let _ = engine.evaluate(1);
        assert!(engine.collect_next(1).is_none());
    }

    #[test]
    fn static_condition_is_resolved_once_at_activation() {
        let mut cond = condition(1001);
        cond.is_static = true;
        let mut engine = InspectionEngine::new(1 << 20, Arc::new(diagnostics::Counters::new()));
        // No sample pushed before activation: the signal lookup fails, the
        // static evaluation is false, and the condition is disabled for good.
        engine.replace_matrix(matrix_with(cond), 0);

        engine.push_sample(1001, Sample::new(SignalValue::F64(20.0), 0));
        let _ = engine.evaluate(1);
        assert!(engine.collect_next(1).is_none(), "a static condition resolved false at activation never re-evaluates");
    }

    #[derive(Default)]
    struct RecordingRegistry {
        cleaned_up: std::cell::RefCell<Vec<condition_ast::InvocationId>>,
    }

    impl CustomFunctionRegistry for RecordingRegistry {
        fn invoke(
            &mut self,
            _function_id: condition_ast::CustomFunctionId,
            _invocation_id: condition_ast::InvocationId,
            _args: &[condition_ast::Value],
        ) -> Result<condition_ast::Value, ErrorKind> {
            Ok(condition_ast::Value::Bool(true))
        }

        fn condition_end(&mut self, _touched_signal_ids: &[SignalId], _now_ms: u64) {}

        fn cleanup(&mut self, invocation_id: condition_ast::InvocationId) {
            self.cleaned_up.borrow_mut().push(invocation_id);
        }
    }

    #[test]
    fn replacing_the_matrix_cleans_up_invocations_that_did_not_survive() {
        let mut cond = condition(1001);
        cond.root_expr_ref = 0;
        let nodes = vec![AstNode::CustomFunction(1, 42, Vec::new())];
        let old_matrix = InspectionMatrix::activate(nodes, vec![cond.clone()], &diagnostics::Counters::new());

        let mut engine = InspectionEngine::with_custom_functions(1 << 20, Arc::new(diagnostics::Counters::new()), RecordingRegistry::default());
        engine.replace_matrix(old_matrix, 0);
        assert!(engine.custom_functions.cleaned_up.borrow().is_empty());

        let new_matrix = InspectionMatrix::activate(vec![AstNode::Boolean(true)], vec![cond], &diagnostics::Counters::new());
        engine.replace_matrix(new_matrix, 0);

        assert_eq!(*engine.custom_functions.cleaned_up.borrow(), vec![42]);
    }

    #[test]
    fn empty_snapshot_is_suppressed_and_returns_to_idle() {
        let mut cond = condition(1001);
        cond.signals[0].is_condition_only = true;
        let mut engine = InspectionEngine::new(1 << 20, Arc::new(diagnostics::Counters::new()));
        engine.replace_matrix(matrix_with(cond), 0);

        engine.push_sample(1001, Sample::new(SignalValue::F64(20.0), 0));
        let _ = engine.evaluate(0);
        assert!(engine.collect_next(0).is_none(), "condition-only binding means nothing gets collected");
    }
}
