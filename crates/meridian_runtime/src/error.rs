//! # Runtime Error Types

use std::path::PathBuf;

use meridian_core::{CommandError, SnapshotError, StateHash, TickError};
use thiserror::Error;

/// Errors raised while loading or checking a shard configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The TOML did not parse into a configuration.
    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Errors raised by snapshot storage backends.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Filesystem failure.
    #[error("snapshot storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// No snapshot has been stored.
    #[error("no snapshot stored")]
    NotFound,

    /// The stored bytes are not a valid envelope.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// The compressed file did not decompress.
    #[error("snapshot decompression failed: {0}")]
    Decompress(String),
}

/// Errors raised by an epoch log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EpochLogError {
    /// The published epoch does not extend the log.
    #[error("epoch {actual} does not follow log height {expected}")]
    OutOfOrder {
        /// Next height the log accepts.
        expected: u64,
        /// Height that was offered.
        actual: u64,
    },
}

/// Errors raised by the shard driver.
#[derive(Error, Debug)]
pub enum ShardError {
    /// The world failed to tick.
    #[error(transparent)]
    Tick(#[from] TickError),

    /// State serialization or restore failed.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// The storage backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Publishing to the epoch log failed.
    #[error(transparent)]
    EpochLog(#[from] EpochLogError),

    /// A recorded command was rejected during replay.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// A replayed epoch is not the one this shard expects next.
    #[error("expected epoch {expected}, got {actual}")]
    EpochMismatch {
        /// Shard epoch height.
        expected: u64,
        /// Epoch height of the record.
        actual: u64,
    },

    /// A replayed tick is not the one this shard expects next.
    #[error("expected tick {expected}, got {actual}")]
    TickMismatch {
        /// Shard tick height.
        expected: u64,
        /// Tick height of the record.
        actual: u64,
    },

    /// Replay produced a different state than the leader.
    #[error("state hash mismatch at epoch {epoch}: leader {expected}, replica {actual}")]
    HashMismatch {
        /// Epoch that diverged.
        epoch: u64,
        /// Hash published by the leader.
        expected: StateHash,
        /// Hash computed by this replica.
        actual: StateHash,
    },

    /// The epoch ended before reaching the configured length.
    #[error("epoch {0} has fewer ticks than the epoch frequency")]
    IncompleteEpoch(u64),

    /// The operation needs a different mode.
    #[error("operation requires {0} mode")]
    WrongMode(&'static str),

    /// `tick` or `replay_epoch` before `start`.
    #[error("shard not started")]
    NotStarted,

    /// A previous tick failed; the shard must be rebuilt.
    #[error("shard halted after a failed tick")]
    Halted,
}

/// Result type for shard operations.
pub type ShardResult<T> = Result<T, ShardError>;
