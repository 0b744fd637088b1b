//! Inbound wire-level items the worker loop consumes from the single
//! bounded channel shared with the decoder thread(s) producing them.

use inspection_matrix::InspectionMatrix;
use signal::{SignalId, SignalType, SignalValue};

/// One decoded sample as it arrives from a decoder.
#[derive(Debug, Clone)]
pub struct DecodedSample {
    /// The signal this sample belongs to.
    pub signal_id: SignalId,
    /// Monotonic timestamp, in milliseconds, the decoder observed this at.
    pub monotonic_ts_ms: u64,
    /// The sampled value.
    pub value: SignalValue,
    /// The decoder's own declared type for this signal; `Unknown` is
    /// dropped and counted rather than pushed into any ring buffer.
    pub signal_type: SignalType,
}

/// A DTC readout as it arrives from a decoder.
#[derive(Debug, Clone)]
pub struct DtcReadout {
    /// System time, in milliseconds, the codes were read at.
    pub ts_system_ms: u64,
    /// The active diagnostic trouble codes.
    pub codes: Vec<String>,
}

/// Everything the worker loop can receive on its single inbound channel.
/// Using one channel for data, matrix replacement, and shutdown gives the
/// three wake reasons in the worker's loop a single blocking primitive.
#[derive(Debug)]
#[non_exhaustive]
pub enum WorkerMessage {
    /// One decoded sample.
    Sample(DecodedSample),
    /// Several decoded samples batched for efficiency.
    SignalGroup(Vec<DecodedSample>),
    /// A fresh DTC readout.
    Dtc(DtcReadout),
    /// Replaces the active inspection matrix.
    ReplaceMatrix(Box<InspectionMatrix>),
    /// Asks the worker loop to exit after applying what's already queued.
    Shutdown,
}
