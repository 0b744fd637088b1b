//! The disk-backed fallback used while the sender has nowhere to publish.
//!
//! Grounded on `PayloadManager`'s on-disk record framing: each record is
//! prefixed with a fixed header giving its size and whether the stored bytes
//! are compressed. Storage is always physically compressed with `zstd`
//! unless the payload was already compressed for the wire, in which case it
//! is stored as-is rather than compressed twice; either way the header's
//! `compressed` flag always reflects whether the bytes actually on disk are
//! compressed, so a drain knows whether to hand them straight to the broker
//! or decompress them first.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Header prefixing every persisted record.
const HEADER_LEN: usize = 5;

/// Errors raised while writing or reading the persistence file.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The persistence file could not be read or written.
    #[error("persistence I/O error: {0}")]
    Io(#[from] io::Error),
    /// The stored payload's compression marker didn't round-trip.
    #[error("failed to compress/decompress a persisted record: {0}")]
    Compression(io::Error),
}

/// One record read back from the persistence file.
#[derive(Debug, Clone)]
pub struct PersistedRecord {
    /// The payload, already decompressed if it wasn't wire-compressed.
    pub payload: Vec<u8>,
    /// Whether this payload is expected to be compressed on the wire.
    pub wire_compressed: bool,
}

/// A single append-only file holding length-prefixed, always-compressed-at-rest
/// records.
pub struct OfflineStore {
    path: PathBuf,
}

impl OfflineStore {
    /// Opens (without creating) the persistence file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Appends one record. `wire_compressed` mirrors the snapshot metadata's
    /// `compress` flag: when true the payload is already compressed for the
    /// wire and is stored as-is, since zstd-compressing it again would waste
    /// a pass for no gain; when false it is compressed now with zstd so the
    /// file is always physically compressed regardless of wire intent. The
    /// on-disk `compressed` header bit records the latter — whether the
    /// stored bytes are zstd-encoded — not `wire_compressed` itself, since
    /// that's what a reader actually needs to know before calling
    /// `zstd::stream::decode_all` on them.
    pub fn append(&self, payload: &[u8], wire_compressed: bool) -> Result<(), Error> {
        let stored = if wire_compressed {
            payload.to_vec()
        } else {
            zstd::stream::encode_all(payload, 0).map_err(Error::Compression)?
        };
        let stored_is_zstd = !wire_compressed;

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&(stored.len() as u32).to_le_bytes());
        header[4] = stored_is_zstd as u8;
        file.write_all(&header)?;
        file.write_all(&stored)?;
        Ok(())
    }

    /// Reads every complete record currently on disk, tolerating a trailing
    /// partial record left by a write that was interrupted mid-append.
    pub fn read_all(&self) -> Result<Vec<PersistedRecord>, Error> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut records = Vec::new();
        let mut pos = 0usize;
        while pos + HEADER_LEN <= bytes.len() {
            let size = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
            let stored_is_zstd = bytes[pos + 4] != 0;
            let body_start = pos + HEADER_LEN;
            let body_end = body_start + size;
            if body_end > bytes.len() {
                break;
            }

            let stored = &bytes[body_start..body_end];
            let payload = if stored_is_zstd {
                zstd::stream::decode_all(stored).map_err(Error::Compression)?
            } else {
                stored.to_vec()
            };
            records.push(PersistedRecord {
                payload,
                wire_compressed: !stored_is_zstd,
            });
            pos = body_end;
        }

        Ok(records)
    }

    /// Attempts to publish every record in order via `publish`, stopping at
    /// the first failure. Records already published are logically removed by
    /// rewriting the file to hold only what's left; the file is only
    /// truncated to empty once every record has drained successfully.
    pub fn drain(&self, mut publish: impl FnMut(&PersistedRecord) -> bool) -> Result<usize, Error> {
        let records = self.read_all()?;
        let mut published = 0;

        for record in &records {
            if !publish(record) {
                break;
            }
            published += 1;
        }

        self.finish_drain(&records, published)?;
        Ok(published)
    }

    /// Removes the first `published` records from disk, truncating the file
    /// entirely once every record held by `records` has been accounted for.
    /// Split out from `drain` so an async caller can publish each record with
    /// `.await` between reading the file and committing the result, which a
    /// plain synchronous closure can't do.
    pub fn finish_drain(&self, records: &[PersistedRecord], published: usize) -> Result<(), Error> {
        if published == records.len() {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
            }
        } else if published > 0 {
            self.rewrite(&records[published..])?;
        }
        Ok(())
    }

    fn rewrite(&self, remaining: &[PersistedRecord]) -> Result<(), Error> {
        let tmp_path = tmp_path_for(&self.path);
        {
            let mut tmp = File::create(&tmp_path)?;
            for record in remaining {
                let stored = if record.wire_compressed {
                    record.payload.clone()
                } else {
                    zstd::stream::encode_all(record.payload.as_slice(), 0).map_err(Error::Compression)?
                };
                let mut header = [0u8; HEADER_LEN];
                header[0..4].copy_from_slice(&(stored.len() as u32).to_le_bytes());
                header[4] = (!record.wire_compressed) as u8;
                tmp.write_all(&header)?;
                tmp.write_all(&stored)?;
            }
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.to_path_buf();
    let file_name = tmp.file_name().and_then(|n| n.to_str()).unwrap_or("offline-store");
    tmp.set_file_name(format!("{file_name}.tmp"));
    tmp
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn append_then_drain_round_trips_an_uncompressed_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::new(dir.path().join("offline.bin"));

        store.append(b"hello world", false).unwrap();

        let mut seen = Vec::new();
        let published = store
            .drain(|record| {
                seen.push(record.payload.clone());
                true
            })
            .unwrap();

        assert_eq!(published, 1);
        assert_eq!(seen, vec![b"hello world".to_vec()]);
    }

    #[test]
    fn a_failed_publish_leaves_remaining_records_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::new(dir.path().join("offline.bin"));

        store.append(b"first", false).unwrap();
        store.append(b"second", false).unwrap();

        let mut calls = 0;
        let published = store
            .drain(|_record| {
                calls += 1;
                calls == 1
            })
            .unwrap();
        assert_eq!(published, 1);

        let mut remaining = Vec::new();
        let published_again = store
            .drain(|record| {
                remaining.push(record.payload.clone());
                true
            })
            .unwrap();

        assert_eq!(published_again, 1);
        assert_eq!(remaining, vec![b"second".to_vec()]);
    }

    #[test]
    fn wire_compressed_payloads_are_stored_without_double_compression() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::new(dir.path().join("offline.bin"));

        let already_compressed = zstd::stream::encode_all(&b"already compressed"[..], 0).unwrap();
        store.append(&already_compressed, true).unwrap();

        let mut seen = Vec::new();
        let _ = store
            .drain(|record| {
                seen.push(record.payload.clone());
                true
            })
            .unwrap();

        assert_eq!(seen, vec![already_compressed]);
    }

    #[test]
    fn the_default_uncompressed_path_is_stored_with_a_compressed_header_bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.bin");
        let store = OfflineStore::new(&path);

        store.append(b"hello world", false).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes[4], 1, "payload wasn't wire-compressed, so it was zstd-compressed at rest");
    }

    #[test]
    fn a_wire_compressed_payload_is_stored_with_an_uncompressed_header_bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.bin");
        let store = OfflineStore::new(&path);

        let already_compressed = zstd::stream::encode_all(&b"already compressed"[..], 0).unwrap();
        store.append(&already_compressed, true).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes[4], 0, "the payload was stored verbatim, not re-compressed by us");
    }

    #[test]
    fn a_trailing_partial_record_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.bin");
        let store = OfflineStore::new(&path);

        store.append(b"complete", false).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[9, 9, 9, 9, 0]).unwrap();

        let records = store.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"complete".to_vec());
    }
}
