//! # Epochs
//!
//! A leader batches `epoch_frequency` consecutive ticks, with the commands
//! each tick consumed, into an [`Epoch`] stamped with the state hash after
//! its last tick. Followers replay epochs from an [`EpochLog`] and compare
//! hashes.

use std::sync::Arc;

use meridian_core::{RawCommand, StateHash};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::EpochLogError;

/// One tick's input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickRecord {
    /// Tick height at which the tick ran.
    pub tick_height: u64,
    /// Leader wall-clock time, in milliseconds.
    pub timestamp_ms: u64,
    /// Commands drained for the tick, in drain order.
    pub commands: Vec<RawCommand>,
}

/// A published batch of ticks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    /// Position in the log, from 0.
    pub epoch_height: u64,
    /// Consecutive ticks, ascending.
    pub ticks: Vec<TickRecord>,
    /// State hash after the last tick.
    pub state_hash: StateHash,
}

/// Ordered, append-only epoch storage.
pub trait EpochLog: Send + Sync {
    /// Appends an epoch.
    ///
    /// # Errors
    ///
    /// [`EpochLogError::OutOfOrder`] unless `epoch.epoch_height` equals
    /// [`EpochLog::epoch_count`].
    fn publish(&self, epoch: Epoch) -> Result<(), EpochLogError>;

    /// Number of epochs stored.
    fn epoch_count(&self) -> u64;

    /// Every epoch at or above `height`, ascending.
    fn read_from(&self, height: u64) -> Vec<Epoch>;
}

/// In-process epoch log. Clones share the same log, so a leader and its
/// followers can hold one each.
#[derive(Clone, Default)]
pub struct MemoryEpochLog {
    epochs: Arc<RwLock<Vec<Epoch>>>,
}

impl MemoryEpochLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EpochLog for MemoryEpochLog {
    fn publish(&self, epoch: Epoch) -> Result<(), EpochLogError> {
        let mut epochs = self.epochs.write();
        let expected = epochs.len() as u64;
        if epoch.epoch_height != expected {
            return Err(EpochLogError::OutOfOrder {
                expected,
                actual: epoch.epoch_height,
            });
        }
        epochs.push(epoch);
        Ok(())
    }

    fn epoch_count(&self) -> u64 {
        self.epochs.read().len() as u64
    }

    fn read_from(&self, height: u64) -> Vec<Epoch> {
        let epochs = self.epochs.read();
        let start = usize::try_from(height).unwrap_or(usize::MAX).min(epochs.len());
        epochs[start..].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch(height: u64) -> Epoch {
        Epoch {
            epoch_height: height,
            ticks: vec![TickRecord {
                tick_height: height * 10,
                timestamp_ms: 1_700_000_000_000,
                commands: Vec::new(),
            }],
            state_hash: StateHash::of(&height.to_le_bytes()),
        }
    }

    #[test]
    fn test_publish_in_order() {
        let log = MemoryEpochLog::new();
        let reader = log.clone();
        log.publish(epoch(0)).unwrap();
        log.publish(epoch(1)).unwrap();
        assert_eq!(reader.epoch_count(), 2);
        assert_eq!(
            log.publish(epoch(5)),
            Err(EpochLogError::OutOfOrder { expected: 2, actual: 5 })
        );
    }

    #[test]
    fn test_read_from() {
        let log = MemoryEpochLog::new();
        for height in 0..4 {
            log.publish(epoch(height)).unwrap();
        }
        let heights: Vec<u64> = log.read_from(2).iter().map(|e| e.epoch_height).collect();
        assert_eq!(heights, vec![2, 3]);
        assert!(log.read_from(9).is_empty());
    }

    #[test]
    fn test_epoch_json_keeps_command_bytes() {
        let mut epoch = epoch(3);
        epoch.ticks[0].commands.push(RawCommand {
            name: "move".to_string(),
            address: "0x1".to_string(),
            persona: "p".to_string(),
            payload: br#"{"dx":1}"#.to_vec(),
        });
        let json = serde_json::to_string(&epoch).unwrap();
        let decoded: Epoch = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, epoch);
    }
}
