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

//! Per-(signal-id, sample-interval) fixed-capacity circular history, with
//! attached fixed-time-window aggregates and per-condition de-duplication.
//!
//! The ring is a flat vector of capacity N; `head` advances forward on
//! insert, readers walk backward from it. Dispatch on a sample's declared
//! type is always driven by the buffer's own `SignalType` (set once at
//! `register`), never by a type argument supplied at the call site: this is
//! the one behavior the source gets wrong for `INT16` (it calls the `UINT16`
//! specialization by accident) and is the reason `push` rejects a sample
//! whose value doesn't match the buffer's declared type instead of coercing
//! it.

use std::collections::HashMap;
use std::sync::Arc;

pub mod ring;
pub mod window;

pub use ring::RingBuffer;
pub use window::{WindowAggregator, WindowQuery, WindowSnapshot};

use signal::{Sample, SignalId, SignalType};

/// All the errors that can occur while registering or allocating ring
/// buffers.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum RingError {
    /// The registration referenced the reserved `INVALID` signal id.
    #[error("invalid signal id")]
    InvalidSignalId,

    /// The registration requested a zero-size sample buffer.
    #[error("sample buffer size is zero (signal: {signal_id})")]
    ZeroBufferSize {
        /// The signal that was being registered.
        signal_id: SignalId,
    },

    /// Activating this matrix would exceed `MAX_DISTINCT_SIGNAL_IDS`.
    #[error("too many distinct signal ids (limit: {limit})")]
    TooManyDistinctSignals {
        /// The configured limit.
        limit: usize,
    },
}

/// Outcome of looking up a signal's newest sample, distinguishing the ways
/// "no value" can happen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SignalLookup {
    /// No buffer is registered for this `(signal_id, interval)`.
    NoBuffer,
    /// The buffer is registered but has not observed a sample yet.
    Empty,
    /// The newest sample carries no numeric representation (handle-kind or
    /// unknown type).
    NonNumeric,
    /// The newest sample's value, widened to `f64`.
    Value(f64),
}

/// A hook for the externally-owned raw-data buffer manager. The core never
/// dereferences a `Handle`, it only reports lifecycle hints so the manager
/// knows when bytes are safe to reclaim.
pub trait RawDataHintSink: Send + Sync {
    /// A handle-kind sample just entered the ring (it is now "in history").
    fn mark_in_history(&self, handle: signal::Handle);
    /// A handle-kind sample was evicted from the ring by an overwrite.
    fn release_in_history(&self, handle: signal::Handle);
    /// A handle-kind sample was selected into a snapshot for upload.
    fn mark_selected_for_upload(&self, handle: signal::Handle);
}

/// A `RawDataHintSink` that does nothing; used when no handle-kind signals
/// are configured, or in tests.
#[derive(Debug, Default)]
pub struct NoOpRawDataHintSink;

impl RawDataHintSink for NoOpRawDataHintSink {
    fn mark_in_history(&self, _handle: signal::Handle) {}
    fn release_in_history(&self, _handle: signal::Handle) {}
    fn mark_selected_for_upload(&self, _handle: signal::Handle) {}
}

/// Describes a single ring buffer to create or extend during `register`.
#[derive(Debug, Clone)]
pub struct RingBufferSpec {
    /// The signal this buffer stores samples for.
    pub signal_id: SignalId,
    /// The declared type of the signal; every pushed sample is checked
    /// against it.
    pub signal_type: SignalType,
    /// Number of samples retained, newest-first.
    pub capacity: usize,
    /// Minimum spacing, in milliseconds, between admitted samples. Zero
    /// admits every sample regardless of timestamp spacing.
    pub min_sample_interval_ms: u32,
    /// Width, in milliseconds, of the fixed-time window attached to this
    /// buffer. Zero means no window is created.
    pub fixed_window_period_ms: u32,
    /// Index, within the active condition set, of the condition this
    /// registration belongs to.
    pub cond_idx: usize,
}

/// Key identifying a single ring buffer: a signal id paired with the
/// sampling interval it was registered for.
pub type BufferKey = (SignalId, u32);

/// Owns every ring buffer active for the current inspection matrix.
pub struct RingBufferStore {
    buffers: HashMap<BufferKey, RingBuffer>,
    byte_budget: usize,
    total_bytes: usize,
    hint_sink: Arc<dyn RawDataHintSink>,
}

impl RingBufferStore {
    /// Creates a new, empty store with the given total byte budget across
    /// all buffers.
    pub fn new(byte_budget: usize) -> Self {
        Self::with_hint_sink(byte_budget, Arc::new(NoOpRawDataHintSink))
    }

    /// Creates a new, empty store that reports handle lifecycle hints to
    /// `hint_sink`.
    pub fn with_hint_sink(byte_budget: usize, hint_sink: Arc<dyn RawDataHintSink>) -> Self {
        Self {
            buffers: HashMap::new(),
            byte_budget,
            total_bytes: 0,
            hint_sink,
        }
    }

    /// Creates or extends the buffer for `(spec.signal_id,
    /// spec.min_sample_interval_ms)`. Capacity only ever grows; calling this
    /// repeatedly with an identical spec is a no-op beyond recording the
    /// condition in `affects_conditions`.
    pub fn register(&mut self, spec: &RingBufferSpec) -> Result<(), RingError> {
        if spec.signal_id == signal::INVALID_SIGNAL_ID {
            return Err(RingError::InvalidSignalId);
        }
        if spec.capacity == 0 {
            return Err(RingError::ZeroBufferSize {
                signal_id: spec.signal_id,
            });
        }

        let key = (spec.signal_id, spec.min_sample_interval_ms);
        let buffer = self
            .buffers
            .entry(key)
            .or_insert_with(|| RingBuffer::new(spec.signal_type, spec.min_sample_interval_ms, spec.capacity));

        if spec.capacity > buffer.capacity() {
            buffer.grow_to(spec.capacity);
        }
        if spec.fixed_window_period_ms > 0 {
            buffer.ensure_window(spec.fixed_window_period_ms);
        }
        buffer.affects_conditions.insert(spec.cond_idx);

        Ok(())
    }

    /// Reserves backing storage for every registered buffer, enforcing the
    /// byte budget. Buffers that would push the store over budget are
    /// skipped (left at capacity 0) and `false` is returned for them.
    pub fn allocate(&mut self) -> Vec<SignalId> {
        let mut skipped = Vec::new();
        let sample_cost = size_of::<Sample>();

        // Deterministic order keeps "first registered, first allocated"
        // behavior stable across runs.
        let mut keys: Vec<BufferKey> = self.buffers.keys().copied().collect();
        keys.sort_unstable();

        for key in keys {
            let buffer = self.buffers.get_mut(&key).expect("key came from the map itself");
            let bytes = buffer.capacity() * sample_cost;

            if self.total_bytes + bytes > self.byte_budget {
                tracing::warn!(signal_id = key.0, bytes, budget = self.byte_budget, "ring buffer exceeds memory budget, skipping");
                buffer.disable();
                skipped.push(key.0);
                continue;
            }

            self.total_bytes += bytes;
            buffer.allocate();
        }

        skipped
    }

    /// Delivers `sample` to every buffer registered for `signal_id`,
    /// regardless of interval; each buffer independently applies its own
    /// spacing filter. Returns the union of condition indices whose input
    /// changed as a result.
    pub fn push_sample(&mut self, signal_id: SignalId, sample: Sample) -> Vec<usize> {
        let mut changed = Vec::new();
        for ((id, _interval), buffer) in self.buffers.iter_mut() {
            if *id != signal_id {
                continue;
            }
            if buffer.push(sample.clone(), self.hint_sink.as_ref()) {
                changed.extend(buffer.affects_conditions.iter());
            }
        }
        changed.sort_unstable();
        changed.dedup();
        changed
    }

    /// Returns the newest sample's value as `f64` for `(signal_id,
    /// interval)`, or `None` if the buffer is empty or unknown.
    pub fn newest(&self, signal_id: SignalId, interval: u32) -> Option<f64> {
        self.buffers.get(&(signal_id, interval)).and_then(RingBuffer::newest_f64)
    }

    /// Looks up the newest sample for `(signal_id, interval)`, distinguishing
    /// "no buffer registered" from "buffer empty" from "newest sample has no
    /// numeric representation" — the distinction the evaluator needs to
    /// choose between `SIGNAL_NOT_FOUND` and `TYPE_MISMATCH`.
    pub fn lookup_newest(&self, signal_id: SignalId, interval: u32) -> SignalLookup {
        match self.buffers.get(&(signal_id, interval)) {
            None => SignalLookup::NoBuffer,
            Some(buffer) if buffer.is_empty() => SignalLookup::Empty,
            Some(buffer) => match buffer.newest_f64() {
                Some(value) => SignalLookup::Value(value),
                None => SignalLookup::NonNumeric,
            },
        }
    }

    /// Yields up to `n` samples newest-first for `(signal_id, interval)`,
    /// honouring per-condition de-duplication when `send_only_once` is set.
    /// Marks every yielded sample consumed for `cond_idx`.
    pub fn iterate_newest_n(
        &mut self,
        signal_id: SignalId,
        interval: u32,
        cond_idx: usize,
        n: usize,
        send_only_once: bool,
    ) -> Vec<Sample> {
        match self.buffers.get_mut(&(signal_id, interval)) {
            Some(buffer) => buffer.iterate_newest_n(cond_idx, n, send_only_once),
            None => Vec::new(),
        }
    }

    /// Closes any windows whose end time has passed, across every buffer.
    /// Returns the union of condition indices affected.
    pub fn close_elapsed_windows(&mut self, now_ms: u64) -> Vec<usize> {
        let mut changed = Vec::new();
        for buffer in self.buffers.values_mut() {
            if buffer.close_elapsed_windows(now_ms) {
                changed.extend(buffer.affects_conditions.iter());
            }
        }
        changed.sort_unstable();
        changed.dedup();
        changed
    }

    /// Returns the nearest upcoming window close time across every buffer,
    /// used to schedule cheap close checks.
    pub fn next_close_at(&self) -> Option<u64> {
        self.buffers.values().filter_map(RingBuffer::next_close_at).min()
    }

    /// Runs a window query of `period_ms` against `(signal_id, interval)`.
    pub fn query_window(&self, signal_id: SignalId, interval: u32, period_ms: u32, query: WindowQuery) -> Option<f64> {
        self.buffers.get(&(signal_id, interval))?.query_window(period_ms, query)
    }

    /// Clears every buffer and releases any "in history" handle usage hints,
    /// in preparation for a matrix replacement.
    pub fn purge(&mut self) {
        for buffer in self.buffers.values_mut() {
            buffer.purge(self.hint_sink.as_ref());
        }
        self.buffers.clear();
        self.total_bytes = 0;
    }

    /// Number of distinct `(signal_id, interval)` buffers currently
    /// registered.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use signal::SignalValue;

    fn spec(signal_id: SignalId, interval: u32, window: u32) -> RingBufferSpec {
        RingBufferSpec {
            signal_id,
            signal_type: SignalType::F64,
            capacity: 4,
            min_sample_interval_ms: interval,
            fixed_window_period_ms: window,
            cond_idx: 0,
        }
    }

    #[test]
    fn register_then_push_then_newest() {
        let mut store = RingBufferStore::new(1 << 20);
        store.register(&spec(1001, 0, 0)).unwrap();
        let _ = store.allocate();

        let _ = store.push_sample(1001, Sample::new(SignalValue::F64(42.0), 100));
        assert_eq!(store.newest(1001, 0), Some(42.0));
    }

    #[test]
    fn repeated_register_is_idempotent_for_capacity() {
        let mut store = RingBufferStore::new(1 << 20);
        store.register(&spec(1001, 0, 0)).unwrap();
        store.register(&spec(1001, 0, 0)).unwrap();
        assert_eq!(store.buffer_count(), 1);
    }

    #[test]
    fn memory_budget_skips_the_offending_buffer() {
        let mut store = RingBufferStore::new(1);
        store.register(&spec(1001, 0, 0)).unwrap();
        let skipped = store.allocate();
        assert_eq!(skipped, vec![1001]);
        let _ = store.push_sample(1001, Sample::new(SignalValue::F64(1.0), 1));
        assert_eq!(store.newest(1001, 0), None);
    }

    #[test]
    fn invalid_signal_id_is_rejected() {
        let mut store = RingBufferStore::new(1 << 20);
        assert!(matches!(
            store.register(&spec(signal::INVALID_SIGNAL_ID, 0, 0)),
            Err(RingError::InvalidSignalId)
        ));
    }

    #[test]
    fn purge_clears_every_buffer() {
        let mut store = RingBufferStore::new(1 << 20);
        store.register(&spec(1001, 0, 0)).unwrap();
        let _ = store.allocate();
        let _ = store.push_sample(1001, Sample::new(SignalValue::F64(1.0), 1));
        store.purge();
        assert_eq!(store.buffer_count(), 0);
        assert_eq!(store.newest(1001, 0), None);
    }
}
