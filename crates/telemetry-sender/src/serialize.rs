//! Wire encoding for a triggered snapshot.
//!
//! The external wire format is out of scope here; this only has to produce a
//! self-contained byte buffer the sender can hand to the broker or persist
//! to disk, and it must round-trip well enough for the offline store's
//! `compressed` handling to make sense. A length-prefixed binary layout
//! keeps the sender free of any serde/schema dependency for a format it
//! doesn't otherwise care about.

use engine::{SnapshotKind, TriggeredSnapshot};

/// Encodes `snapshot` into a flat byte buffer.
pub fn serialize_snapshot(snapshot: &TriggeredSnapshot) -> Vec<u8> {
    let mut buf = Vec::new();

    buf.extend_from_slice(&snapshot.event_id.to_le_bytes());
    buf.extend_from_slice(&snapshot.trigger_system_ts_ms.to_le_bytes());
    buf.push(match snapshot.kind {
        SnapshotKind::Telemetry => 0,
        SnapshotKind::VisionSystem => 1,
    });
    write_string(&mut buf, &snapshot.metadata.campaign_id);

    buf.extend_from_slice(&(snapshot.collected_samples.len() as u32).to_le_bytes());
    for typed in &snapshot.collected_samples {
        buf.extend_from_slice(&typed.signal_id.to_le_bytes());
        buf.extend_from_slice(&typed.sample.monotonic_ts_ms.to_le_bytes());
        let value = typed.sample.value.as_f64().unwrap_or(f64::NAN);
        buf.extend_from_slice(&value.to_le_bytes());
    }

    match &snapshot.active_dtcs {
        Some(dtcs) => {
            buf.push(1);
            buf.extend_from_slice(&dtcs.ts_system_ms.to_le_bytes());
            buf.extend_from_slice(&(dtcs.codes.len() as u32).to_le_bytes());
            for code in &dtcs.codes {
                write_string(&mut buf, code);
            }
        }
        None => buf.push(0),
    }

    buf
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(bytes);
}
