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

//! Process-wide error-kind counters, exposed through the self-telemetry
//! surface.
//!
//! The source models this as a global trace-module singleton; here it is an
//! explicitly constructed service, passed by reference into the components
//! that increment it, so tests stay deterministic and independent of a
//! process-global.

use std::sync::atomic::{AtomicU64, Ordering};

/// One counter per recoverable error kind the core can observe.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct Counters {
    config_rejected: AtomicU64,
    memory_limit_hit: AtomicU64,
    eval_signal_not_found: AtomicU64,
    eval_function_data_not_available: AtomicU64,
    eval_type_mismatch: AtomicU64,
    eval_not_implemented: AtomicU64,
    eval_stack_depth_reached: AtomicU64,
    ingestion_unknown_signal_type: AtomicU64,
    send_quota_reached: AtomicU64,
    send_publish_failed: AtomicU64,
    persistence_write_failed: AtomicU64,
    persistence_read_failed: AtomicU64,
}

/// A single named counter value, for rendering a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    /// The counter's name.
    pub name: &'static str,
    /// The counter's current value.
    pub value: u64,
}

impl Counters {
    /// Creates a fresh, zeroed counters registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter for a rejected matrix configuration item.
    pub fn inc_config_rejected(&self) {
        let _ = self.config_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the counter for a ring buffer skipped over the memory budget.
    pub fn inc_memory_limit_hit(&self) {
        let _ = self.memory_limit_hit.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the counter for a `SIGNAL_NOT_FOUND` evaluation outcome.
    pub fn inc_eval_signal_not_found(&self) {
        let _ = self.eval_signal_not_found.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the counter for a `FUNCTION_DATA_NOT_AVAILABLE` evaluation outcome.
    pub fn inc_eval_function_data_not_available(&self) {
        let _ = self.eval_function_data_not_available.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the counter for a `TYPE_MISMATCH` evaluation outcome.
    pub fn inc_eval_type_mismatch(&self) {
        let _ = self.eval_type_mismatch.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the counter for a `NOT_IMPLEMENTED_*` evaluation outcome.
    pub fn inc_eval_not_implemented(&self) {
        let _ = self.eval_not_implemented.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the counter for a `STACK_DEPTH_REACHED` evaluation outcome.
    pub fn inc_eval_stack_depth_reached(&self) {
        let _ = self.eval_stack_depth_reached.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the counter for a dropped sample with an unknown signal type.
    pub fn inc_ingestion_unknown_signal_type(&self) {
        let _ = self.ingestion_unknown_signal_type.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the counter for a `QUOTA_REACHED` send outcome.
    pub fn inc_send_quota_reached(&self) {
        let _ = self.send_quota_reached.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the counter for a publish failure.
    pub fn inc_send_publish_failed(&self) {
        let _ = self.send_publish_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the counter for a dropped persisted record due to a write failure.
    pub fn inc_persistence_write_failed(&self) {
        let _ = self.persistence_write_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the counter for a skipped persisted record due to a read failure.
    pub fn inc_persistence_read_failed(&self) {
        let _ = self.persistence_read_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Renders the current value of every counter.
    pub fn snapshot(&self) -> Vec<Counter> {
        vec![
            Counter {
                name: "config_rejected",
                value: self.config_rejected.load(Ordering::Relaxed),
            },
            Counter {
                name: "memory_limit_hit",
                value: self.memory_limit_hit.load(Ordering::Relaxed),
            },
            Counter {
                name: "eval_signal_not_found",
                value: self.eval_signal_not_found.load(Ordering::Relaxed),
            },
            Counter {
                name: "eval_function_data_not_available",
                value: self.eval_function_data_not_available.load(Ordering::Relaxed),
            },
            Counter {
                name: "eval_type_mismatch",
                value: self.eval_type_mismatch.load(Ordering::Relaxed),
            },
            Counter {
                name: "eval_not_implemented",
                value: self.eval_not_implemented.load(Ordering::Relaxed),
            },
            Counter {
                name: "eval_stack_depth_reached",
                value: self.eval_stack_depth_reached.load(Ordering::Relaxed),
            },
            Counter {
                name: "ingestion_unknown_signal_type",
                value: self.ingestion_unknown_signal_type.load(Ordering::Relaxed),
            },
            Counter {
                name: "send_quota_reached",
                value: self.send_quota_reached.load(Ordering::Relaxed),
            },
            Counter {
                name: "send_publish_failed",
                value: self.send_publish_failed.load(Ordering::Relaxed),
            },
            Counter {
                name: "persistence_write_failed",
                value: self.persistence_write_failed.load(Ordering::Relaxed),
            },
            Counter {
                name: "persistence_read_failed",
                value: self.persistence_read_failed.load(Ordering::Relaxed),
            },
        ]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let counters = Counters::new();
        assert!(counters.snapshot().iter().all(|c| c.value == 0));
    }

    #[test]
    fn increment_is_reflected_in_snapshot() {
        let counters = Counters::new();
        counters.inc_eval_signal_not_found();
        counters.inc_eval_signal_not_found();

        let snapshot = counters.snapshot();
        let entry = snapshot.iter().find(|c| c.name == "eval_signal_not_found").unwrap();
        assert_eq!(entry.value, 2);
    }
}
