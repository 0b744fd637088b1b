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

//! A signal is a typed sample value produced by a decoder (CAN, OBD, GPS, ...)
//! and carried through the inspection engine as a tagged union. Large opaque
//! payloads (strings, complex blobs) are never copied into the engine: a
//! sample only carries a `Handle` referencing bytes owned by an external
//! raw-data manager.

use std::fmt::{Display, Formatter};

pub mod bitset;

pub use bitset::ConsumedBitset;

/// Sentinel value for an unassigned or invalid signal id.
pub const INVALID_SIGNAL_ID: u32 = 0;

/// Opaque identifier for a signal, chosen by the decoder side.
pub type SignalId = u32;

/// Declared type of a signal, as carried by the decoder manifest.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum SignalType {
    /// 8-bit unsigned integer.
    U8,
    /// 8-bit signed integer.
    I8,
    /// 16-bit unsigned integer.
    U16,
    /// 16-bit signed integer.
    I16,
    /// 32-bit unsigned integer.
    U32,
    /// 32-bit signed integer.
    I32,
    /// 64-bit unsigned integer.
    U64,
    /// 64-bit signed integer.
    I64,
    /// 32-bit floating point.
    F32,
    /// 64-bit floating point.
    F64,
    /// Boolean.
    Bool,
    /// A handle into an external string buffer.
    StringHandle,
    /// A handle into an external complex/blob buffer.
    ComplexHandle,
    /// Declared type is unknown; any value of this type is a type-mismatch.
    Unknown,
}

impl Display for SignalType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SignalType::U8 => "u8",
            SignalType::I8 => "i8",
            SignalType::U16 => "u16",
            SignalType::I16 => "i16",
            SignalType::U32 => "u32",
            SignalType::I32 => "i32",
            SignalType::U64 => "u64",
            SignalType::I64 => "i64",
            SignalType::F32 => "f32",
            SignalType::F64 => "f64",
            SignalType::Bool => "bool",
            SignalType::StringHandle => "string-handle",
            SignalType::ComplexHandle => "complex-handle",
            SignalType::Unknown => "unknown",
        })
    }
}

/// A 32-bit reference into an external raw-data buffer. The core never
/// dereferences it, it only tracks usage hints on the buffer it points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    /// The signal the handle was produced for.
    pub signal_id: SignalId,
    /// The opaque handle value.
    pub handle: u32,
}

/// A tagged union of every primitive sample value the engine can observe.
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub enum SignalValue {
    /// An 8-bit unsigned sample.
    U8(u8),
    /// An 8-bit signed sample.
    I8(i8),
    /// A 16-bit unsigned sample.
    U16(u16),
    /// A 16-bit signed sample.
    I16(i16),
    /// A 32-bit unsigned sample.
    U32(u32),
    /// A 32-bit signed sample.
    I32(i32),
    /// A 64-bit unsigned sample.
    U64(u64),
    /// A 64-bit signed sample.
    I64(i64),
    /// A 32-bit float sample.
    F32(f32),
    /// A 64-bit float sample.
    F64(f64),
    /// A boolean sample.
    Bool(bool),
    /// A handle to an externally-owned string.
    StringHandle(Handle),
    /// A handle to an externally-owned complex blob.
    ComplexHandle(Handle),
    /// A sample whose declared type is unknown.
    Unknown,
}

impl SignalValue {
    /// Returns the `SignalType` tag of this value.
    pub fn kind(&self) -> SignalType {
        match self {
            SignalValue::U8(_) => SignalType::U8,
            SignalValue::I8(_) => SignalType::I8,
            SignalValue::U16(_) => SignalType::U16,
            SignalValue::I16(_) => SignalType::I16,
            SignalValue::U32(_) => SignalType::U32,
            SignalValue::I32(_) => SignalType::I32,
            SignalValue::U64(_) => SignalType::U64,
            SignalValue::I64(_) => SignalType::I64,
            SignalValue::F32(_) => SignalType::F32,
            SignalValue::F64(_) => SignalType::F64,
            SignalValue::Bool(_) => SignalType::Bool,
            SignalValue::StringHandle(_) => SignalType::StringHandle,
            SignalValue::ComplexHandle(_) => SignalType::ComplexHandle,
            SignalValue::Unknown => SignalType::Unknown,
        }
    }

    /// Widens this value to `f64`. Boolean maps to `1.0`/`0.0`; handle-kind
    /// and unknown values have no numeric representation.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            SignalValue::U8(v) => Some(v as f64),
            SignalValue::I8(v) => Some(v as f64),
            SignalValue::U16(v) => Some(v as f64),
            SignalValue::I16(v) => Some(v as f64),
            SignalValue::U32(v) => Some(v as f64),
            SignalValue::I32(v) => Some(v as f64),
            SignalValue::U64(v) => Some(v as f64),
            SignalValue::I64(v) => Some(v as f64),
            SignalValue::F32(v) => Some(v as f64),
            SignalValue::F64(v) => Some(v),
            SignalValue::Bool(v) => Some(if v { 1.0 } else { 0.0 }),
            SignalValue::StringHandle(_) | SignalValue::ComplexHandle(_) | SignalValue::Unknown => None,
        }
    }

    /// Converts this value to `bool`. Numeric values are truthy when
    /// non-zero; a boolean value converts to itself; handle-kind and unknown
    /// values have no boolean representation.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SignalValue::Bool(v) => Some(*v),
            SignalValue::StringHandle(_) | SignalValue::ComplexHandle(_) | SignalValue::Unknown => None,
            _ => self.as_f64().map(|v| v != 0.0),
        }
    }

    /// Returns the handle carried by a handle-kind value, if any.
    pub fn as_handle(&self) -> Option<Handle> {
        match self {
            SignalValue::StringHandle(h) | SignalValue::ComplexHandle(h) => Some(*h),
            _ => None,
        }
    }
}

/// A single observed sample of a signal: its value, the monotonic timestamp
/// it was observed at, and the set of conditions that have already consumed
/// it for de-duplication purposes.
#[derive(Debug, Clone)]
pub struct Sample {
    /// The sampled value.
    pub value: SignalValue,
    /// Monotonic timestamp, in milliseconds, at which the sample was observed.
    pub monotonic_ts_ms: u64,
    /// Conditions that have already emitted this sample.
    pub consumed: ConsumedBitset,
}

impl Sample {
    /// Creates a new, not-yet-consumed sample.
    pub fn new(value: SignalValue, monotonic_ts_ms: u64) -> Self {
        Self {
            value,
            monotonic_ts_ms,
            consumed: ConsumedBitset::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn numeric_widens_to_f64() {
        assert_eq!(SignalValue::U16(42).as_f64(), Some(42.0));
        assert_eq!(SignalValue::I8(-5).as_f64(), Some(-5.0));
        assert_eq!(SignalValue::F32(1.5).as_f64(), Some(1.5));
    }

    #[test]
    fn bool_maps_to_one_and_zero() {
        assert_eq!(SignalValue::Bool(true).as_f64(), Some(1.0));
        assert_eq!(SignalValue::Bool(false).as_f64(), Some(0.0));
    }

    #[test]
    fn handle_and_unknown_have_no_numeric_value() {
        assert_eq!(SignalValue::Unknown.as_f64(), None);
        assert_eq!(
            SignalValue::StringHandle(Handle {
                signal_id: 1,
                handle: 2
            })
            .as_f64(),
            None
        );
    }

    #[test]
    fn as_bool_follows_nonzero_rule() {
        assert_eq!(SignalValue::U8(0).as_bool(), Some(false));
        assert_eq!(SignalValue::U8(3).as_bool(), Some(true));
        assert_eq!(SignalValue::Bool(true).as_bool(), Some(true));
    }

    #[test]
    fn kind_reports_the_tag() {
        assert_eq!(SignalValue::F64(0.0).kind(), SignalType::F64);
        assert_eq!(SignalValue::Unknown.kind(), SignalType::Unknown);
    }
}
