//! The payload a triggered condition hands off to the snapshot queue.

use inspection_matrix::ConditionMetadata;
use signal::{Sample, SignalId};

/// A DTC readout captured at a point in time.
#[derive(Debug, Clone)]
pub struct DtcSnapshot {
    /// System time, in milliseconds, the codes were read at.
    pub ts_system_ms: u64,
    /// The active diagnostic trouble codes.
    pub codes: Vec<String>,
}

/// One sample collected into a snapshot, tagged with the signal it came
/// from.
#[derive(Debug, Clone)]
pub struct TypedSample {
    /// The signal this sample belongs to.
    pub signal_id: SignalId,
    /// The sample itself.
    pub sample: Sample,
}

/// Distinguishes an ordinary telemetry payload from a vision-system
/// payload; carried through so the sender can route accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    /// A regular telemetry payload.
    Telemetry,
    /// A vision-system payload.
    VisionSystem,
}

/// The fully built output of one condition firing, ready for the snapshot
/// queue.
#[derive(Debug, Clone)]
pub struct TriggeredSnapshot {
    /// Campaign/decoder provenance and delivery hints, copied from the
    /// condition that fired.
    pub metadata: ConditionMetadata,
    /// Identifier for this snapshot; top bit always zero.
    pub event_id: u32,
    /// System time, in milliseconds, the condition armed at.
    pub trigger_system_ts_ms: u64,
    /// Samples collected from every non-condition-only bound signal.
    pub collected_samples: Vec<TypedSample>,
    /// DTC codes, if the condition requested them and they hadn't already
    /// been consumed.
    pub active_dtcs: Option<DtcSnapshot>,
    /// Telemetry vs. vision-system payload.
    pub kind: SnapshotKind,
}

impl TriggeredSnapshot {
    /// Whether this snapshot carries no content at all: the fail-open case
    /// that gets suppressed rather than queued.
    pub(crate) fn is_empty(&self) -> bool {
        self.collected_samples.is_empty() && self.active_dtcs.is_none()
    }
}
