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

//! The bounded, single-producer single-consumer hand-off between the
//! ingestion worker (producer) and the telemetry sender (consumer).
//!
//! Backed by a `flume` bounded channel, the same primitive the teacher uses
//! between a processor chain and its exporters, but carrying one
//! `TriggeredSnapshot` per send instead of a batch of pipeline messages.

use std::time::Duration;

use engine::TriggeredSnapshot;

/// All the errors that can occur pushing or pulling a snapshot.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The queue is at capacity; the ingestion worker must persist and drop
    /// instead of pushing.
    #[error("snapshot queue is full (capacity: {capacity})")]
    Full {
        /// The queue's configured capacity.
        capacity: usize,
    },

    /// Every sender has been dropped; the consumer side is gone for good.
    #[error("snapshot queue is disconnected")]
    Disconnected,
}

/// Producer half, owned by the ingestion worker.
#[derive(Clone)]
pub struct SnapshotProducer {
    sender: flume::Sender<TriggeredSnapshot>,
    capacity: usize,
}

impl SnapshotProducer {
    /// Attempts to push `snapshot` without blocking. Returns `Error::Full`
    /// when the queue is at capacity — the caller is expected to persist the
    /// snapshot itself rather than retry.
    pub fn try_push(&self, snapshot: TriggeredSnapshot) -> Result<(), Error> {
        self.sender.try_send(snapshot).map_err(|err| match err {
            flume::TrySendError::Full(_) => Error::Full { capacity: self.capacity },
            flume::TrySendError::Disconnected(_) => Error::Disconnected,
        })
    }
}

/// Consumer half, owned by the telemetry sender.
pub struct SnapshotConsumer {
    receiver: flume::Receiver<TriggeredSnapshot>,
}

impl SnapshotConsumer {
    /// Blocks up to `timeout` for the next snapshot. `Ok(None)` means the
    /// timeout elapsed with nothing to send; `Err` means every producer has
    /// been dropped.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<TriggeredSnapshot>, Error> {
        match self.receiver.recv_timeout(timeout) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(flume::RecvTimeoutError::Timeout) => Ok(None),
            Err(flume::RecvTimeoutError::Disconnected) => Err(Error::Disconnected),
        }
    }

    /// Drains whatever is immediately available without blocking.
    pub fn drain(&self) -> Vec<TriggeredSnapshot> {
        self.receiver.try_iter().collect()
    }

    /// Awaits the next snapshot without blocking an executor thread, for
    /// consumers running on an async runtime rather than a dedicated thread.
    /// Returns `None` once every producer has been dropped.
    pub async fn recv_async(&self) -> Option<TriggeredSnapshot> {
        self.receiver.recv_async().await.ok()
    }
}

/// Creates a bounded snapshot queue with room for `capacity` in-flight
/// snapshots.
pub fn bounded(capacity: usize) -> (SnapshotProducer, SnapshotConsumer) {
    let (sender, receiver) = flume::bounded(capacity);
    (SnapshotProducer { sender, capacity }, SnapshotConsumer { receiver })
}
