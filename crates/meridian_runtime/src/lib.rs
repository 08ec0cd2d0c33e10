//! # Meridian Runtime
//!
//! Drives a [`meridian_core::World`] as a replicated game shard.
//!
//! ## Components
//!
//! - **Config**: TOML shard settings ([`ShardConfig`])
//! - **Tick pacing**: fixed timestep with timing statistics ([`TickLoop`])
//! - **Epochs**: batches of recorded ticks published to an [`EpochLog`]
//! - **Snapshots**: periodic state envelopes in a [`SnapshotStorage`]
//! - **Shard**: leader ticking, follower replay and restore ([`Shard`])
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use meridian_runtime::{MemoryEpochLog, Shard, ShardConfig};
//!
//! let config = ShardConfig::load("shard.toml")?;
//! let world = build_world(&config.world)?; // register components and systems
//! let log = MemoryEpochLog::new();
//! let mut shard = Shard::from_config(world, config, Arc::new(log))?;
//! shard.start()?;
//! shard.tick(meridian_runtime::now_ms())?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod epoch;
pub mod error;
pub mod shard;
pub mod storage;
pub mod tick;

pub use config::{ShardConfig, ShardMode, SnapshotConfig, StorageKind, MIN_EPOCH_FREQUENCY};
pub use epoch::{Epoch, EpochLog, MemoryEpochLog, TickRecord};
pub use error::{ConfigError, EpochLogError, ShardError, ShardResult, StorageError};
pub use shard::{now_ms, Shard};
pub use storage::{FileStorage, MemoryStorage, NopStorage, SnapshotStorage};
pub use tick::{TickLoop, TickStats};
