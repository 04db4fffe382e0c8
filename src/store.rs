//! Crash-safe blob persistence on a block device.
//!
//! The device holds two fixed superblock slots at offsets 0 and half the
//! device length. Each slot is a 60-byte header followed by the payload:
//!
//! ```text
//! magic(8) | super_counter(8, BE) | timestamp(8, BE unix secs)
//!          | data_length(4, BE)  | checksum(32, SHA-256)
//! ```
//!
//! The checksum covers the header fields and the payload. Writes always go
//! to the slot the *previous* superblock does not occupy, so a crash at any
//! point leaves the previous superblock intact and selectable. Reads return
//! the slot with the greatest valid counter.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

/// Magic bytes identifying a superblock slot.
pub const SUPERBLOCK_MAGIC: &[u8; 8] = b"SNIGATE\0";

/// Size of the slot header in bytes.
/// Layout: magic(8) + counter(8) + timestamp(8) + data_length(4) + checksum(32)
pub const SUPERBLOCK_SIZE: usize = 60;

/// Device size used when creating a fresh backing file.
pub const DEFAULT_DEVICE_SIZE: u64 = 128 * 1024;

/// Errors surfaced by the blob store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No slot carries a valid checksum; the device is uninitialized.
    #[error("no valid superblock found (bad checksum)")]
    BadChecksum,

    /// A slot verified but its contents are structurally invalid.
    #[error("superblock decode error: {0}")]
    Decode(String),

    /// The device could not be read or written.
    #[error("device i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// The fixed header identifying a valid on-device state snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Monotonically increasing write counter. The slot with the greatest
    /// valid counter wins on read.
    pub super_counter: u64,
    /// Wall time at write.
    pub timestamp: DateTime<Utc>,
    /// Payload bytes following the header.
    pub data_length: u32,
}

/// Blob store over a two-slot block device.
pub struct BlobStore {
    file: File,
    slot_size: u64,
}

impl BlobStore {
    /// Open a block device (or backing file), creating and sizing a fresh
    /// file when the path does not exist.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut len = file.metadata()?.len();
        if len == 0 {
            file.set_len(DEFAULT_DEVICE_SIZE)?;
            len = DEFAULT_DEVICE_SIZE;
        }

        let slot_size = len / 2;
        if slot_size < SUPERBLOCK_SIZE as u64 {
            return Err(StoreError::Io(format!(
                "device too small: {} bytes, need at least {}",
                len,
                2 * SUPERBLOCK_SIZE
            )));
        }

        debug!(path = %path.display(), device_len = len, slot_size, "Blob store opened");

        Ok(Self { file, slot_size })
    }

    /// Largest payload a slot can hold.
    pub fn max_payload(&self) -> u64 {
        self.slot_size - SUPERBLOCK_SIZE as u64
    }

    /// Read the current superblock and payload.
    ///
    /// Both slots are validated; the one with the greatest counter wins.
    /// `BadChecksum` means neither slot verifies and the device should be
    /// treated as uninitialized.
    pub fn read_data(&mut self) -> Result<(Superblock, Vec<u8>), StoreError> {
        let mut best: Option<(Superblock, Vec<u8>)> = None;

        for slot in 0..2u64 {
            match self.read_slot(slot) {
                Ok((sb, payload)) => {
                    let better = best
                        .as_ref()
                        .map(|(b, _)| sb.super_counter > b.super_counter)
                        .unwrap_or(true);
                    if better {
                        best = Some((sb, payload));
                    }
                }
                Err(StoreError::Io(e)) => return Err(StoreError::Io(e)),
                Err(_) => {}
            }
        }

        best.ok_or(StoreError::BadChecksum)
    }

    /// Initialize the device with a fresh superblock: counter zero, empty
    /// payload, current timestamp.
    pub fn init(&mut self) -> Result<Superblock, StoreError> {
        let sb = Superblock {
            super_counter: 0,
            timestamp: now_secs(),
            data_length: 0,
        };
        self.write_slot(0, &sb, &[])?;
        info!("Blob store initialized");
        Ok(sb)
    }

    /// Write a new payload to the slot the previous superblock does not
    /// occupy, with the counter advanced by one.
    pub fn write_data(
        &mut self,
        prev: &Superblock,
        payload: &[u8],
    ) -> Result<Superblock, StoreError> {
        if payload.len() as u64 > self.max_payload() {
            return Err(StoreError::Io(format!(
                "payload of {} bytes exceeds slot capacity {}",
                payload.len(),
                self.max_payload()
            )));
        }

        let counter = prev.super_counter + 1;
        let sb = Superblock {
            super_counter: counter,
            timestamp: now_secs(),
            data_length: payload.len() as u32,
        };
        self.write_slot(counter % 2, &sb, payload)?;

        debug!(
            super_counter = counter,
            data_length = sb.data_length,
            "Superblock written"
        );

        Ok(sb)
    }

    fn read_slot(&mut self, slot: u64) -> Result<(Superblock, Vec<u8>), StoreError> {
        self.file.seek(SeekFrom::Start(slot * self.slot_size))?;

        let mut header = [0u8; SUPERBLOCK_SIZE];
        self.file.read_exact(&mut header)?;

        if &header[0..8] != SUPERBLOCK_MAGIC {
            return Err(StoreError::Decode("bad magic".to_string()));
        }

        let super_counter = u64::from_be_bytes(header[8..16].try_into().expect("8-byte slice"));
        let unix_secs = i64::from_be_bytes(header[16..24].try_into().expect("8-byte slice"));
        let data_length = u32::from_be_bytes(header[24..28].try_into().expect("4-byte slice"));

        if SUPERBLOCK_SIZE as u64 + data_length as u64 > self.slot_size {
            return Err(StoreError::Decode(format!(
                "data length {} exceeds slot",
                data_length
            )));
        }

        let mut payload = vec![0u8; data_length as usize];
        self.file.read_exact(&mut payload)?;

        let mut hasher = Sha256::new();
        hasher.update(&header[0..28]);
        hasher.update(&payload);
        if hasher.finalize().as_slice() != &header[28..60] {
            return Err(StoreError::BadChecksum);
        }

        let timestamp = Utc
            .timestamp_opt(unix_secs, 0)
            .single()
            .ok_or_else(|| StoreError::Decode(format!("timestamp {} out of range", unix_secs)))?;

        Ok((
            Superblock {
                super_counter,
                timestamp,
                data_length,
            },
            payload,
        ))
    }

    fn write_slot(&mut self, slot: u64, sb: &Superblock, payload: &[u8]) -> Result<(), StoreError> {
        let mut header = [0u8; SUPERBLOCK_SIZE];
        header[0..8].copy_from_slice(SUPERBLOCK_MAGIC);
        header[8..16].copy_from_slice(&sb.super_counter.to_be_bytes());
        header[16..24].copy_from_slice(&sb.timestamp.timestamp().to_be_bytes());
        header[24..28].copy_from_slice(&sb.data_length.to_be_bytes());

        let mut hasher = Sha256::new();
        hasher.update(&header[0..28]);
        hasher.update(payload);
        header[28..60].copy_from_slice(hasher.finalize().as_slice());

        self.file.seek(SeekFrom::Start(slot * self.slot_size))?;
        self.file.write_all(&header)?;
        self.file.write_all(payload)?;
        self.file.sync_all()?;

        Ok(())
    }
}

/// Current wall time truncated to whole seconds, matching the on-disk
/// resolution so a written superblock round-trips exactly.
fn now_secs() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_opt(now.timestamp(), 0)
        .single()
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> BlobStore {
        BlobStore::open(&dir.path().join("state.img")).unwrap()
    }

    #[test]
    fn test_fresh_device_is_uninitialized() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        assert!(matches!(store.read_data(), Err(StoreError::BadChecksum)));
    }

    #[test]
    fn test_init_then_read() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        let sb = store.init().unwrap();
        assert_eq!(sb.super_counter, 0);
        assert_eq!(sb.data_length, 0);

        let (read_sb, payload) = store.read_data().unwrap();
        assert_eq!(read_sb, sb);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_write_advances_counter() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        let sb0 = store.init().unwrap();
        let sb1 = store.write_data(&sb0, b"first").unwrap();
        assert_eq!(sb1.super_counter, 1);

        let (read_sb, payload) = store.read_data().unwrap();
        assert_eq!(read_sb.super_counter, 1);
        assert_eq!(payload, b"first");

        let sb2 = store.write_data(&sb1, b"second").unwrap();
        assert_eq!(sb2.super_counter, 2);

        let (read_sb, payload) = store.read_data().unwrap();
        assert_eq!(read_sb.super_counter, 2);
        assert_eq!(payload, b"second");
    }

    #[test]
    fn test_durable_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.img");

        {
            let mut store = BlobStore::open(&path).unwrap();
            let sb = store.init().unwrap();
            store.write_data(&sb, b"persisted").unwrap();
        }

        let mut store = BlobStore::open(&path).unwrap();
        let (sb, payload) = store.read_data().unwrap();
        assert_eq!(sb.super_counter, 1);
        assert_eq!(payload, b"persisted");
    }

    #[test]
    fn test_corrupt_newer_slot_falls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.img");

        let mut store = BlobStore::open(&path).unwrap();
        let sb0 = store.init().unwrap();
        let sb1 = store.write_data(&sb0, b"old").unwrap();
        store.write_data(&sb1, b"new").unwrap();

        // Counter 2 lives in slot 0. Flip a payload byte there.
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut f = OpenOptions::new().write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(SUPERBLOCK_SIZE as u64)).unwrap();
            f.write_all(b"X").unwrap();
        }

        let mut store = BlobStore::open(&path).unwrap();
        let (sb, payload) = store.read_data().unwrap();
        assert_eq!(sb.super_counter, 1);
        assert_eq!(payload, b"old");
    }

    #[test]
    fn test_both_slots_corrupt_reports_bad_checksum() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.img");

        let mut store = BlobStore::open(&path).unwrap();
        let sb = store.init().unwrap();
        store.write_data(&sb, b"payload").unwrap();

        {
            use std::io::{Seek, SeekFrom, Write};
            let len = std::fs::metadata(&path).unwrap().len();
            let mut f = OpenOptions::new().write(true).open(&path).unwrap();
            for offset in [30u64, len / 2 + 30] {
                f.seek(SeekFrom::Start(offset)).unwrap();
                f.write_all(&[0xFF; 4]).unwrap();
            }
        }

        let mut store = BlobStore::open(&path).unwrap();
        assert!(matches!(store.read_data(), Err(StoreError::BadChecksum)));
    }

    #[test]
    fn test_payload_too_large_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let sb = store.init().unwrap();

        let huge = vec![0u8; DEFAULT_DEVICE_SIZE as usize];
        assert!(matches!(
            store.write_data(&sb, &huge),
            Err(StoreError::Io(_))
        ));
    }

    #[test]
    fn test_timestamp_roundtrips() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let sb = store.init().unwrap();
        let (read_sb, _) = store.read_data().unwrap();
        assert_eq!(read_sb.timestamp, sb.timestamp);
        // RFC3339 rendering must be possible for diagnostics.
        let _ = read_sb.timestamp.to_rfc3339();
    }
}
