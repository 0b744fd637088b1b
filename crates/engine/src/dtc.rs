//! Latest-DTC-readout storage with per-condition consumption tracking,
//! mirroring the de-dup bitset ring buffers use for ordinary samples.

use signal::bitset::ConsumedBitset;

use crate::snapshot::DtcSnapshot;

/// Holds the most recent DTC readout and which conditions have already
/// attached it to a snapshot.
#[derive(Debug, Default)]
pub struct DtcStore {
    snapshot: Option<DtcSnapshot>,
    consumed: ConsumedBitset,
}

impl DtcStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the current readout, resetting consumption for every
    /// condition: a fresh readout hasn't been seen by anyone yet.
    pub fn set(&mut self, snapshot: DtcSnapshot) {
        self.snapshot = Some(snapshot);
        self.consumed.clear();
    }

    /// Returns the current readout if `cond_idx` hasn't already consumed it,
    /// marking it consumed in the process.
    pub fn take_if_unconsumed(&mut self, cond_idx: usize) -> Option<DtcSnapshot> {
        let snapshot = self.snapshot.as_ref()?;
        if self.consumed.get(cond_idx) {
            return None;
        }
        self.consumed.set(cond_idx);
        Some(snapshot.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_readout_is_unconsumed() {
        let mut store = DtcStore::new();
        store.set(DtcSnapshot {
            ts_system_ms: 1,
            codes: vec!["P0001".into()],
        });
        assert!(store.take_if_unconsumed(0).is_some());
    }

    #[test]
    fn same_condition_does_not_get_it_twice() {
        let mut store = DtcStore::new();
        store.set(DtcSnapshot {
            ts_system_ms: 1,
            codes: vec!["P0001".into()],
        });
        assert!(store.take_if_unconsumed(3).is_some());
        assert!(store.take_if_unconsumed(3).is_none());
    }

    #[test]
    fn new_readout_resets_consumption() {
        let mut store = DtcStore::new();
        store.set(DtcSnapshot {
            ts_system_ms: 1,
            codes: vec!["P0001".into()],
        });
        let _ = store.take_if_unconsumed(0);
        store.set(DtcSnapshot {
            ts_system_ms: 2,
            codes: vec!["P0002".into()],
        });
        assert!(store.take_if_unconsumed(0).is_some());
    }
}
