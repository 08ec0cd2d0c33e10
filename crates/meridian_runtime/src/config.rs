//! # Shard Configuration
//!
//! Loaded from TOML. Every field has a default, so a file only names what
//! it changes:
//!
//! ```toml
//! shard_id = "arena-eu-1"
//! tick_rate = 20
//! epoch_frequency = 10
//! snapshot_frequency = 6
//! mode = "leader"
//!
//! [snapshot]
//! kind = "file"
//! path = "/var/lib/meridian/arena-eu-1.snap"
//! compress = true
//!
//! [world]
//! worker_threads = 4
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use meridian_core::WorldConfig;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::storage::{FileStorage, MemoryStorage, NopStorage, SnapshotStorage};

/// Smallest accepted epoch length, in ticks.
pub const MIN_EPOCH_FREQUENCY: u32 = 10;

/// Default tick rate (Hz).
pub const DEFAULT_TICK_RATE: u32 = 20;

/// Whether a shard produces epochs or replays them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardMode {
    /// Ticks on its own clock and publishes epochs.
    #[default]
    Leader,
    /// Replays epochs published by a leader.
    Follower,
}

impl fmt::Display for ShardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Leader => "leader",
            Self::Follower => "follower",
        })
    }
}

/// Snapshot storage backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Snapshots are discarded.
    #[default]
    Nop,
    /// Snapshots live in process memory.
    Memory,
    /// Snapshots are written to `path`.
    File,
}

/// The `[snapshot]` section.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Backend.
    pub kind: StorageKind,
    /// Target file for [`StorageKind::File`].
    pub path: Option<PathBuf>,
    /// LZ4-compress snapshot files.
    pub compress: bool,
}

/// Shard driver configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Unique name of this shard instance.
    pub shard_id: String,
    /// Ticks per second.
    pub tick_rate: u32,
    /// Ticks per epoch.
    pub epoch_frequency: u32,
    /// Epochs between snapshots.
    pub snapshot_frequency: u32,
    /// Leader or follower.
    pub mode: ShardMode,
    /// Snapshot storage.
    pub snapshot: SnapshotConfig,
    /// Engine tuning.
    pub world: WorldConfig,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            shard_id: String::new(),
            tick_rate: DEFAULT_TICK_RATE,
            epoch_frequency: MIN_EPOCH_FREQUENCY,
            snapshot_frequency: 1,
            mode: ShardMode::Leader,
            snapshot: SnapshotConfig::default(),
            world: WorldConfig::default(),
        }
    }
}

impl ShardConfig {
    /// Parses a TOML document. The result is not validated.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] on malformed TOML or unknown enum values.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`ShardConfig::from_toml_str`] and [`ShardConfig::validate`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&source)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), shard = %config.shard_id, "loaded shard config");
        Ok(config)
    }

    /// Overrides fields with every field of `other` that differs from the
    /// default.
    pub fn apply(&mut self, other: Self) {
        let defaults = Self::default();
        if other.shard_id != defaults.shard_id {
            self.shard_id = other.shard_id;
        }
        if other.tick_rate != defaults.tick_rate {
            self.tick_rate = other.tick_rate;
        }
        if other.epoch_frequency != defaults.epoch_frequency {
            self.epoch_frequency = other.epoch_frequency;
        }
        if other.snapshot_frequency != defaults.snapshot_frequency {
            self.snapshot_frequency = other.snapshot_frequency;
        }
        if other.mode != defaults.mode {
            self.mode = other.mode;
        }
        if other.snapshot != defaults.snapshot {
            self.snapshot = other.snapshot;
        }
        if other.world != defaults.world {
            self.world = other.world;
        }
    }

    /// Checks every field.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_id.trim().is_empty() {
            return Err(invalid("shard_id", "cannot be empty"));
        }
        if self.tick_rate == 0 {
            return Err(invalid("tick_rate", "must be greater than 0"));
        }
        if self.epoch_frequency < MIN_EPOCH_FREQUENCY {
            return Err(invalid(
                "epoch_frequency",
                format!("must be at least {MIN_EPOCH_FREQUENCY}"),
            ));
        }
        if self.snapshot_frequency == 0 {
            return Err(invalid("snapshot_frequency", "must be greater than 0"));
        }
        if self.snapshot.kind == StorageKind::File && self.snapshot.path.is_none() {
            return Err(invalid("snapshot.path", "required for file storage"));
        }
        if self.world.event_channel_capacity == 0 {
            return Err(invalid("world.event_channel_capacity", "must be greater than 0"));
        }
        Ok(())
    }

    /// Builds the configured snapshot backend.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] for file storage without a path.
    pub fn snapshot_storage(&self) -> Result<Box<dyn SnapshotStorage>, ConfigError> {
        Ok(match self.snapshot.kind {
            StorageKind::Nop => Box::new(NopStorage),
            StorageKind::Memory => Box::new(MemoryStorage::new()),
            StorageKind::File => {
                let path = self
                    .snapshot
                    .path
                    .clone()
                    .ok_or_else(|| invalid("snapshot.path", "required for file storage"))?;
                Box::new(FileStorage::new(path, self.snapshot.compress))
            }
        })
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        shard_id = "arena-1"
        tick_rate = 30
        snapshot_frequency = 4
        mode = "follower"

        [snapshot]
        kind = "file"
        path = "/tmp/arena-1.snap"
        compress = true

        [world]
        worker_threads = 2
    "#;

    #[test]
    fn test_parse_sample() {
        let config = ShardConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.shard_id, "arena-1");
        assert_eq!(config.tick_rate, 30);
        assert_eq!(config.epoch_frequency, MIN_EPOCH_FREQUENCY);
        assert_eq!(config.snapshot_frequency, 4);
        assert_eq!(config.mode, ShardMode::Follower);
        assert_eq!(config.snapshot.kind, StorageKind::File);
        assert!(config.snapshot.compress);
        assert_eq!(config.world.worker_threads, 2);
        assert_eq!(config.world.event_channel_capacity, WorldConfig::default().event_channel_capacity);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let result = ShardConfig::from_toml_str("mode = \"observer\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validate_ranges() {
        let base = ShardConfig {
            shard_id: "s".to_string(),
            ..ShardConfig::default()
        };
        base.validate().unwrap();

        let cases = [
            (ShardConfig { shard_id: " ".to_string(), ..base.clone() }, "shard_id"),
            (ShardConfig { tick_rate: 0, ..base.clone() }, "tick_rate"),
            (ShardConfig { epoch_frequency: 9, ..base.clone() }, "epoch_frequency"),
            (ShardConfig { snapshot_frequency: 0, ..base.clone() }, "snapshot_frequency"),
            (
                ShardConfig {
                    snapshot: SnapshotConfig {
                        kind: StorageKind::File,
                        ..SnapshotConfig::default()
                    },
                    ..base.clone()
                },
                "snapshot.path",
            ),
        ];
        for (config, expected) in cases {
            match config.validate() {
                Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected invalid {expected}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_apply_overrides_non_default_fields() {
        let mut config = ShardConfig::from_toml_str(SAMPLE).unwrap();
        config.apply(ShardConfig {
            tick_rate: 60,
            ..ShardConfig::default()
        });
        assert_eq!(config.tick_rate, 60);
        assert_eq!(config.shard_id, "arena-1");
        assert_eq!(config.mode, ShardMode::Follower);
        assert_eq!(config.snapshot_frequency, 4);
    }

    #[test]
    fn test_storage_from_config() {
        let config = ShardConfig {
            shard_id: "s".to_string(),
            snapshot: SnapshotConfig {
                kind: StorageKind::Memory,
                ..SnapshotConfig::default()
            },
            ..ShardConfig::default()
        };
        let storage = config.snapshot_storage().unwrap();
        assert!(!storage.exists());
    }
}
