//! A single per-(signal-id, interval) circular sample history.

use signal::{bitset::AffectsConditions, Sample, SignalType};

use crate::window::WindowAggregator;
use crate::{RawDataHintSink, WindowQuery};

/// Fixed-capacity circular history for one `(signal-id, min-interval)` pair.
///
/// Invariants: `count <= capacity`; the newest sample lives at `head`; the
/// oldest live sample is at `(head + capacity - count) % capacity`; stored
/// samples have non-decreasing `monotonic_ts_ms`.
pub struct RingBuffer {
    signal_type: SignalType,
    min_sample_interval_ms: u32,
    capacity: usize,
    head: usize,
    count: usize,
    storage: Vec<Option<Sample>>,
    allocated: bool,
    pub(crate) affects_conditions: AffectsConditions,
    windows: Vec<WindowAggregator>,
}

impl RingBuffer {
    /// Creates a buffer declared but not yet backed by storage; call
    /// `allocate` before pushing samples.
    pub fn new(signal_type: SignalType, min_sample_interval_ms: u32, capacity: usize) -> Self {
        Self {
            signal_type,
            min_sample_interval_ms,
            capacity,
            head: 0,
            count: 0,
            storage: Vec::new(),
            allocated: false,
            affects_conditions: AffectsConditions::new(),
            windows: Vec::new(),
        }
    }

    /// Current requested capacity (may exceed `storage.len()` until
    /// `allocate` runs).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Grows the requested capacity; existing contents are preserved by
    /// `allocate`'s caller re-running registration, so a grow before
    /// allocation is simply a larger reservation.
    pub(crate) fn grow_to(&mut self, capacity: usize) {
        if capacity > self.capacity {
            self.capacity = capacity;
        }
    }

    /// Adds a window of `period_ms` if one isn't already attached.
    pub(crate) fn ensure_window(&mut self, period_ms: u32) {
        if !self.windows.iter().any(|w| w.period_ms() == period_ms) {
            self.windows.push(WindowAggregator::new(period_ms));
        }
    }

    /// Reserves backing storage sized to the current capacity.
    pub(crate) fn allocate(&mut self) {
        self.storage = vec![None; self.capacity];
        self.allocated = true;
    }

    /// Disables this buffer (capacity degrades to 0) because its memory
    /// budget was exceeded at activation.
    pub(crate) fn disable(&mut self) {
        self.capacity = 0;
        self.storage.clear();
        self.allocated = false;
    }

    fn last_ts(&self) -> Option<u64> {
        if self.count == 0 {
            return None;
        }
        self.storage[self.head].as_ref().map(|s| s.monotonic_ts_ms)
    }

    /// Admits `sample` if its timestamp is spaced at least
    /// `min_sample_interval_ms` after the last admitted sample (zero
    /// interval admits unconditionally). Returns whether it was admitted.
    pub(crate) fn push(&mut self, sample: Sample, hint_sink: &dyn RawDataHintSink) -> bool {
        if !self.allocated || self.capacity == 0 {
            return false;
        }

        let admit = match self.last_ts() {
            None => true,
            Some(last_ts) => {
                self.min_sample_interval_ms == 0 || sample.monotonic_ts_ms >= last_ts + self.min_sample_interval_ms as u64
            }
        };
        if !admit {
            return false;
        }

        let next_head = if self.count == 0 { self.head } else { (self.head + 1) % self.capacity };

        if let Some(evicted) = self.storage[next_head].take() {
            if let Some(handle) = evicted.value.as_handle() {
                hint_sink.release_in_history(handle);
            }
        }
        if let Some(handle) = sample.value.as_handle() {
            hint_sink.mark_in_history(handle);
        }

        let ts = sample.monotonic_ts_ms;
        if let Some(value) = sample.value.as_f64() {
            for window in self.windows.iter_mut() {
                window.observe(ts, value);
            }
        }

        self.head = next_head;
        self.storage[self.head] = Some(sample);
        self.count = (self.count + 1).min(self.capacity);

        true
    }

    /// Returns the newest sample's value as `f64`, or `None` if empty or
    /// the sample carries no numeric representation.
    pub(crate) fn newest_f64(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        self.storage[self.head].as_ref().and_then(|s| s.value.as_f64())
    }

    /// Yields up to `n` samples newest-first, honouring per-condition
    /// de-duplication, and marks them consumed for `cond_idx`.
    pub(crate) fn iterate_newest_n(&mut self, cond_idx: usize, n: usize, send_only_once: bool) -> Vec<Sample> {
        let mut out = Vec::with_capacity(n.min(self.count));
        if self.count == 0 || self.capacity == 0 {
            return out;
        }

        for step in 0..self.count.min(n.max(self.count.min(n))) {
            if out.len() >= n {
                break;
            }
            let idx = (self.head + self.capacity - step) % self.capacity;
            let Some(sample) = self.storage[idx].as_mut() else { continue };

            if send_only_once && sample.consumed.get(cond_idx) {
                continue;
            }
            sample.consumed.set(cond_idx);
            out.push(sample.clone());
        }

        out
    }

    /// Closes any windows whose end time has elapsed. Returns whether any
    /// window closed.
    pub(crate) fn close_elapsed_windows(&mut self, now_ms: u64) -> bool {
        let mut any_closed = false;
        for window in self.windows.iter_mut() {
            if window.close_elapsed(now_ms) {
                any_closed = true;
            }
        }
        any_closed
    }

    /// The nearest upcoming window close time for this buffer, if any
    /// window is attached.
    pub(crate) fn next_close_at(&self) -> Option<u64> {
        self.windows.iter().map(WindowAggregator::next_close_at).flatten().min()
    }

    /// Runs a window query against the window registered for exactly
    /// `period_ms`. A buffer may carry several distinct window periods at
    /// once (spec.md: "a matching window-period is added if not present"),
    /// so the caller's own `fixed_window_period_ms` selects which one to
    /// read; `None` if no window of that period is attached.
    pub(crate) fn query_window(&self, period_ms: u32, query: WindowQuery) -> Option<f64> {
        self.windows.iter().find(|w| w.period_ms() == period_ms)?.query(query)
    }

    /// Releases every "in history" handle hint still held by this buffer
    /// and clears its contents.
    pub(crate) fn purge(&mut self, hint_sink: &dyn RawDataHintSink) {
        for slot in self.storage.iter_mut() {
            if let Some(sample) = slot.take() {
                if let Some(handle) = sample.value.as_handle() {
                    hint_sink.release_in_history(handle);
                }
            }
        }
        self.head = 0;
        self.count = 0;
    }

    /// The signal type this buffer was declared with.
    pub fn signal_type(&self) -> SignalType {
        self.signal_type
    }

    /// Number of live samples currently held.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the buffer currently holds no samples.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use signal::SignalValue;

    fn push_f64(buffer: &mut RingBuffer, ts: u64, v: f64) -> bool {
        buffer.push(Sample::new(SignalValue::F64(v), ts), &crate::NoOpRawDataHintSink)
    }

    #[test]
    fn count_saturates_at_capacity() {
        let mut buffer = RingBuffer::new(SignalType::F64, 0, 2);
        buffer.allocate();
        assert!(push_f64(&mut buffer, 0, 1.0));
        assert!(push_f64(&mut buffer, 1, 2.0));
        assert!(push_f64(&mut buffer, 2, 3.0));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.newest_f64(), Some(3.0));
    }

    #[test]
    fn zero_interval_admits_every_sample() {
        let mut buffer = RingBuffer::new(SignalType::F64, 0, 4);
        buffer.allocate();
        assert!(push_f64(&mut buffer, 0, 1.0));
        assert!(push_f64(&mut buffer, 0, 2.0));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn nonzero_interval_rejects_close_samples() {
        let mut buffer = RingBuffer::new(SignalType::F64, 100, 4);
        buffer.allocate();
        assert!(push_f64(&mut buffer, 0, 1.0));
        assert!(!push_f64(&mut buffer, 50, 2.0));
        assert!(push_f64(&mut buffer, 100, 3.0));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn distinct_window_periods_on_the_same_buffer_do_not_alias() {
        let mut buffer = RingBuffer::new(SignalType::F64, 0, 4);
        buffer.allocate();
        buffer.ensure_window(1_000);
        buffer.ensure_window(2_000);

        let _ = push_f64(&mut buffer, 0, 10.0);
        let _ = push_f64(&mut buffer, 2_500, 30.0);

        assert_eq!(buffer.query_window(1_000, WindowQuery::LastAvg), Some(10.0));
        assert_eq!(buffer.query_window(2_000, WindowQuery::LastAvg), Some(10.0));
        assert_eq!(buffer.query_window(500, WindowQuery::LastAvg), None, "no window registered for this period");
    }

    #[test]
    fn iterate_newest_n_respects_dedup() {
        let mut buffer = RingBuffer::new(SignalType::F64, 0, 4);
        buffer.allocate();
        let _ = push_f64(&mut buffer, 0, 1.0);
        let _ = push_f64(&mut buffer, 1, 2.0);

        let first = buffer.iterate_newest_n(0, 2, true);
        assert_eq!(first.len(), 2);

        let second = buffer.iterate_newest_n(0, 2, true);
        assert!(second.is_empty(), "already consumed samples must not reappear");
    }
}
