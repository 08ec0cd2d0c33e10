//! # Snapshot Storage
//!
//! Backends hold the most recent snapshot envelope. Integrity checks live
//! in the envelope itself, so every backend returns either a verified
//! [`Snapshot`] or an error.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use meridian_core::Snapshot;
use parking_lot::Mutex;

use crate::error::StorageError;

/// Prefix of LZ4-compressed snapshot files.
const COMPRESSED_MARKER: &[u8; 4] = b"MLZ4";

/// Where snapshots go.
pub trait SnapshotStorage: Send + Sync {
    /// Replaces the stored snapshot.
    ///
    /// # Errors
    ///
    /// Backend failure; the previous snapshot is then still the stored one.
    fn store(&self, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// Loads and verifies the stored snapshot.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if nothing is stored, or any read,
    /// decompression or envelope failure.
    fn load(&self) -> Result<Snapshot, StorageError>;

    /// True if a snapshot is stored.
    fn exists(&self) -> bool;
}

/// Discards snapshots.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopStorage;

impl SnapshotStorage for NopStorage {
    fn store(&self, _snapshot: &Snapshot) -> Result<(), StorageError> {
        Ok(())
    }

    fn load(&self) -> Result<Snapshot, StorageError> {
        Err(StorageError::NotFound)
    }

    fn exists(&self) -> bool {
        false
    }
}

/// Keeps the encoded envelope in memory. Clones share the slot.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    slot: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the stored bytes.
    pub fn put_raw(&self, bytes: Vec<u8>) {
        *self.slot.lock() = Some(bytes);
    }

    /// Stored bytes, if any.
    #[must_use]
    pub fn raw(&self) -> Option<Vec<u8>> {
        self.slot.lock().clone()
    }
}

impl SnapshotStorage for MemoryStorage {
    fn store(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.put_raw(snapshot.encode());
        Ok(())
    }

    fn load(&self) -> Result<Snapshot, StorageError> {
        let slot = self.slot.lock();
        let bytes = slot.as_deref().ok_or(StorageError::NotFound)?;
        Ok(Snapshot::decode(bytes)?)
    }

    fn exists(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// Writes the envelope to a single file.
///
/// Writes go to a sibling temporary file that is then renamed over the
/// target, so a crash mid-write leaves the previous snapshot intact.
#[derive(Clone, Debug)]
pub struct FileStorage {
    path: PathBuf,
    compress: bool,
}

impl FileStorage {
    /// Storage at `path`, LZ4-compressed if `compress`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, compress: bool) -> Self {
        Self {
            path: path.into(),
            compress,
        }
    }

    /// Target file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SnapshotStorage for FileStorage {
    fn store(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let envelope = snapshot.encode();
        let bytes = if self.compress {
            let mut out = COMPRESSED_MARKER.to_vec();
            out.extend_from_slice(&compress_prepend_size(&envelope));
            out
        } else {
            envelope
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let temp = self.temp_path();
        fs::write(&temp, &bytes)?;
        fs::rename(&temp, &self.path)?;
        tracing::debug!(
            path = %self.path.display(),
            bytes = bytes.len(),
            compressed = self.compress,
            "wrote snapshot file"
        );
        Ok(())
    }

    fn load(&self) -> Result<Snapshot, StorageError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return Err(StorageError::NotFound),
            Err(error) => return Err(error.into()),
        };
        // Files are self-describing, so `compress` only affects writes
        let envelope = match bytes.strip_prefix(COMPRESSED_MARKER.as_slice()) {
            Some(compressed) => {
                decompress_size_prepended(compressed).map_err(|e| StorageError::Decompress(e.to_string()))?
            }
            None => bytes,
        };
        Ok(Snapshot::decode(&envelope)?)
    }

    fn exists(&self) -> bool {
        self.path.is_file()
    }
}
