//! # Shard Driver
//!
//! Owns a [`World`] and moves it forward one tick at a time, recording
//! every tick's commands so that followers can reproduce the leader's
//! state exactly.
//!
//! ## Lifecycle
//!
//! ```text
//! start ─► init schedules ─► restore snapshot ──ok──► sync epoch log
//!                                 │                        ▲
//!                                 └─none/failed─► genesis ─┘
//!
//! leader:   tick ─► drain ─► record ─► world.tick ─► dispatch ─► [epoch full] ─► publish + snapshot
//! follower: sync ─► replay_epoch ─► per tick: enqueue ─► drain ─► record ─► world.tick ─► compare hash
//! ```
//!
//! Heights count completed work: after `n` ticks the tick height is `n`.
//! Genesis is the world's init tick, recorded as tick 0 of epoch 0.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use meridian_core::{RawCommand, Snapshot, StateHash, World};

use crate::config::{ShardConfig, ShardMode};
use crate::epoch::{Epoch, EpochLog, TickRecord};
use crate::error::{ConfigError, ShardError, ShardResult};
use crate::storage::SnapshotStorage;
use crate::tick::{TickLoop, TickStats};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// A world plus the bookkeeping that makes it replicable.
pub struct Shard {
    world: World,
    config: ShardConfig,
    mode: ShardMode,
    started: bool,
    halted: bool,
    tick_height: u64,
    epoch_height: u64,
    ticks: Vec<TickRecord>,
    last_epoch_hash: Option<StateHash>,
    epoch_log: Arc<dyn EpochLog>,
    storage: Box<dyn SnapshotStorage>,
}

impl Shard {
    /// Wraps a world whose components, commands and systems are already
    /// registered.
    #[must_use]
    pub fn new(
        world: World,
        config: ShardConfig,
        epoch_log: Arc<dyn EpochLog>,
        storage: Box<dyn SnapshotStorage>,
    ) -> Self {
        let epoch_frequency = config.epoch_frequency as usize;
        Self {
            world,
            mode: config.mode,
            config,
            started: false,
            halted: false,
            tick_height: 0,
            epoch_height: 0,
            ticks: Vec::with_capacity(epoch_frequency),
            last_epoch_hash: None,
            epoch_log,
            storage,
        }
    }

    /// Validates `config` and builds its snapshot storage.
    ///
    /// # Errors
    ///
    /// Any [`ShardConfig::validate`] failure.
    pub fn from_config(world: World, config: ShardConfig, epoch_log: Arc<dyn EpochLog>) -> Result<Self, ConfigError> {
        config.validate()?;
        let storage = config.snapshot_storage()?;
        Ok(Self::new(world, config, epoch_log, storage))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// The simulated world.
    #[must_use]
    pub fn world(&self) -> &World {
        &self.world
    }

    /// Mutable world access, e.g. to install event handlers.
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// The configuration this shard was built with.
    #[must_use]
    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> ShardMode {
        self.mode
    }

    /// Completed ticks.
    #[must_use]
    pub fn tick_height(&self) -> u64 {
        self.tick_height
    }

    /// Completed epochs.
    #[must_use]
    pub fn epoch_height(&self) -> u64 {
        self.epoch_height
    }

    /// Ticks of the epoch in progress.
    #[must_use]
    pub fn pending_ticks(&self) -> &[TickRecord] {
        &self.ticks
    }

    /// State hash at the end of the last completed epoch.
    #[must_use]
    pub fn last_epoch_hash(&self) -> Option<StateHash> {
        self.last_epoch_hash
    }

    /// True after a tick failed. A halted shard must be rebuilt.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Initializes the world and brings it to the newest known state:
    /// the stored snapshot if one loads, genesis otherwise, then every
    /// epoch in the log from there. Calling it again does nothing.
    ///
    /// # Errors
    ///
    /// Failure of the genesis tick or of epoch replay.
    pub fn start(&mut self) -> ShardResult<()> {
        if self.started {
            return Ok(());
        }
        tracing::info!(shard = %self.config.shard_id, mode = %self.mode, "starting shard");
        self.world.init();
        self.started = true;
        if !self.restore() {
            self.genesis()?;
        }
        self.sync()?;
        Ok(())
    }

    fn restore(&mut self) -> bool {
        if !self.storage.exists() {
            tracing::debug!("no snapshot found");
            return false;
        }
        let snapshot = match self.storage.load() {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::warn!(%error, "failed to load snapshot, starting from genesis");
                self.world.reset();
                return false;
            }
        };
        if let Err(error) = self.world.deserialize(&snapshot.state) {
            tracing::warn!(%error, "failed to restore snapshot, starting from genesis");
            self.world.reset();
            return false;
        }
        self.tick_height = snapshot.tick_height;
        self.epoch_height = snapshot.epoch_height;
        self.ticks.clear();
        self.last_epoch_hash = Some(snapshot.state_hash);
        tracing::info!(
            tick_height = self.tick_height,
            epoch_height = self.epoch_height,
            hash = %snapshot.state_hash,
            "restored from snapshot"
        );
        true
    }

    fn genesis(&mut self) -> ShardResult<()> {
        // Tick 0 runs init systems only and is never replayed
        let discarded = self.world.commands().pending_len();
        if discarded > 0 {
            tracing::warn!(discarded, "dropping commands submitted before genesis");
            self.world.commands().clear();
        }
        self.tick_height = 0;
        self.epoch_height = 0;
        self.ticks.clear();
        self.last_epoch_hash = None;
        self.advance(now_ms())
    }

    /// Queues a command for the next leader tick.
    ///
    /// # Errors
    ///
    /// Any [`meridian_core::CommandManager::enqueue`] failure.
    pub fn submit(&self, command: RawCommand) -> ShardResult<()> {
        self.world.commands().enqueue(command)?;
        Ok(())
    }

    /// Runs one leader tick stamped with `timestamp_ms`.
    ///
    /// # Errors
    ///
    /// - [`ShardError::WrongMode`] on a follower
    /// - [`ShardError::NotStarted`] before [`Shard::start`]
    /// - [`ShardError::Halted`] after an earlier failure
    /// - any world tick, serialization or epoch log failure, which halts
    ///   the shard
    pub fn tick(&mut self, timestamp_ms: u64) -> ShardResult<()> {
        if self.mode != ShardMode::Leader {
            return Err(ShardError::WrongMode("leader"));
        }
        self.advance(timestamp_ms)
    }

    fn advance(&mut self, timestamp_ms: u64) -> ShardResult<()> {
        if !self.started {
            return Err(ShardError::NotStarted);
        }
        if self.halted {
            return Err(ShardError::Halted);
        }
        let result = self.advance_inner(timestamp_ms);
        if let Err(error) = &result {
            tracing::error!(%error, tick_height = self.tick_height, "tick failed, halting shard");
            self.halted = true;
        }
        result
    }

    fn advance_inner(&mut self, timestamp_ms: u64) -> ShardResult<()> {
        debug_assert!(
            self.ticks.len() < self.config.epoch_frequency as usize,
            "previous epoch was not closed"
        );
        let commands = self.world.commands().drain();
        self.ticks.push(TickRecord {
            tick_height: self.tick_height,
            timestamp_ms,
            commands,
        });

        self.world.tick()?;
        self.tick_height += 1;

        match self.mode {
            ShardMode::Leader => {
                if let Err(error) = self.world.events().dispatch() {
                    tracing::warn!(%error, "errors dispatching events");
                }
            }
            // The leader already delivered these
            ShardMode::Follower => self.world.events().clear(),
        }

        if self.ticks.len() == self.config.epoch_frequency as usize {
            self.close_epoch(timestamp_ms)?;
        }
        Ok(())
    }

    fn close_epoch(&mut self, timestamp_ms: u64) -> ShardResult<()> {
        let state = self.world.serialize()?;
        let state_hash = StateHash::of(&state);
        let ticks = std::mem::take(&mut self.ticks);

        if self.mode == ShardMode::Leader {
            let tick_count = ticks.len();
            self.epoch_log.publish(Epoch {
                epoch_height: self.epoch_height,
                ticks,
                state_hash,
            })?;
            tracing::info!(
                epoch_height = self.epoch_height,
                ticks = tick_count,
                hash = %state_hash,
                "published epoch"
            );

            if self.epoch_height % u64::from(self.config.snapshot_frequency) == 0 {
                let snapshot = Snapshot::new(self.tick_height, self.epoch_height + 1, timestamp_ms, state);
                match self.storage.store(&snapshot) {
                    Ok(()) => tracing::debug!(epoch_height = snapshot.epoch_height, "stored snapshot"),
                    Err(error) => tracing::warn!(%error, "failed to store snapshot"),
                }
            }
        }

        self.last_epoch_hash = Some(state_hash);
        self.epoch_height += 1;
        self.ticks = Vec::with_capacity(self.config.epoch_frequency as usize);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    /// Replays a published epoch and checks the resulting state hash.
    ///
    /// Ticks this shard already ran for the current epoch (genesis) are
    /// skipped.
    ///
    /// # Errors
    ///
    /// - [`ShardError::WrongMode`] outside follower mode
    /// - [`ShardError::EpochMismatch`] / [`ShardError::TickMismatch`] if
    ///   the epoch does not continue this shard's history
    /// - [`ShardError::HashMismatch`] if replay diverged
    /// - any enqueue or tick failure
    pub fn replay_epoch(&mut self, epoch: &Epoch) -> ShardResult<()> {
        if self.mode != ShardMode::Follower {
            return Err(ShardError::WrongMode("follower"));
        }
        if epoch.epoch_height != self.epoch_height {
            return Err(ShardError::EpochMismatch {
                expected: self.epoch_height,
                actual: epoch.epoch_height,
            });
        }

        for record in &epoch.ticks {
            if self.ticks.iter().any(|t| t.tick_height == record.tick_height) {
                continue;
            }
            if record.tick_height != self.tick_height {
                return Err(ShardError::TickMismatch {
                    expected: self.tick_height,
                    actual: record.tick_height,
                });
            }
            for command in &record.commands {
                self.world.commands().enqueue(command.clone())?;
            }
            self.advance(record.timestamp_ms)?;
        }

        if self.epoch_height != epoch.epoch_height + 1 {
            return Err(ShardError::IncompleteEpoch(epoch.epoch_height));
        }
        let actual = self.last_epoch_hash.unwrap_or_default();
        if actual != epoch.state_hash {
            tracing::error!(
                epoch_height = epoch.epoch_height,
                expected = %epoch.state_hash,
                actual = %actual,
                "replica diverged from leader"
            );
            return Err(ShardError::HashMismatch {
                epoch: epoch.epoch_height,
                expected: epoch.state_hash,
                actual,
            });
        }
        tracing::debug!(epoch_height = epoch.epoch_height, "replayed epoch");
        Ok(())
    }

    /// Replays every logged epoch at or above the current epoch height,
    /// in follower mode for the duration. Returns the number replayed.
    ///
    /// # Errors
    ///
    /// The first [`Shard::replay_epoch`] failure.
    pub fn sync(&mut self) -> ShardResult<usize> {
        if !self.started {
            return Err(ShardError::NotStarted);
        }
        let pending = self.epoch_log.read_from(self.epoch_height);
        if pending.is_empty() {
            return Ok(0);
        }
        tracing::info!(from_epoch = self.epoch_height, pending = pending.len(), "syncing from epoch log");

        let original = std::mem::replace(&mut self.mode, ShardMode::Follower);
        let result = pending.iter().try_for_each(|epoch| self.replay_epoch(epoch));
        self.mode = original;
        result.map(|()| pending.len())
    }

    /// Runs until `stop` is raised, starting the shard first if needed.
    /// A leader ticks at the configured rate; a follower syncs at it.
    ///
    /// # Errors
    ///
    /// The first start, tick or sync failure.
    pub fn run(&mut self, stop: &AtomicBool) -> ShardResult<TickStats> {
        self.start()?;
        let mut pacer = TickLoop::new(self.config.tick_rate);
        tracing::info!(
            shard = %self.config.shard_id,
            tick_rate = self.config.tick_rate,
            "entering shard loop"
        );

        while !stop.load(Ordering::Acquire) {
            if !pacer.should_tick() {
                pacer.wait_for_next_tick();
                continue;
            }
            let start = pacer.begin_tick();
            match self.mode {
                ShardMode::Leader => self.tick(now_ms())?,
                ShardMode::Follower => {
                    self.sync()?;
                }
            }
            pacer.end_tick(start);
        }

        let stats = *pacer.stats();
        tracing::info!(
            total_ticks = stats.total_ticks,
            late_ticks = stats.late_ticks,
            avg_tick_us = stats.avg_tick_us,
            "shard loop stopped"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::MemoryEpochLog;
    use crate::storage::NopStorage;
    use meridian_core::WorldConfig;

    fn config(mode: ShardMode) -> ShardConfig {
        ShardConfig {
            shard_id: "unit".to_string(),
            mode,
            world: WorldConfig::serial(),
            ..ShardConfig::default()
        }
    }

    fn shard(mode: ShardMode, log: &MemoryEpochLog) -> Shard {
        let world = World::with_config(WorldConfig::serial());
        Shard::new(world, config(mode), Arc::new(log.clone()), Box::new(NopStorage))
    }

    #[test]
    fn test_tick_before_start() {
        let mut leader = shard(ShardMode::Leader, &MemoryEpochLog::new());
        assert!(matches!(leader.tick(1), Err(ShardError::NotStarted)));
    }

    #[test]
    fn test_genesis_is_tick_zero() {
        let mut leader = shard(ShardMode::Leader, &MemoryEpochLog::new());
        leader.start().unwrap();
        assert_eq!(leader.tick_height(), 1);
        assert_eq!(leader.epoch_height(), 0);
        assert_eq!(leader.pending_ticks().len(), 1);
        assert_eq!(leader.pending_ticks()[0].tick_height, 0);
        assert!(leader.world().is_init_done());
    }

    #[test]
    fn test_mode_guards() {
        let log = MemoryEpochLog::new();
        let mut follower = shard(ShardMode::Follower, &log);
        follower.start().unwrap();
        assert!(matches!(follower.tick(1), Err(ShardError::WrongMode("leader"))));

        let mut leader = shard(ShardMode::Leader, &log);
        leader.start().unwrap();
        let epoch = Epoch {
            epoch_height: 0,
            ticks: Vec::new(),
            state_hash: StateHash::default(),
        };
        assert!(matches!(leader.replay_epoch(&epoch), Err(ShardError::WrongMode("follower"))));
    }

    #[test]
    fn test_epoch_closes_after_frequency() {
        let log = MemoryEpochLog::new();
        let mut leader = shard(ShardMode::Leader, &log);
        leader.start().unwrap();
        for ts in 1..10 {
            leader.tick(ts).unwrap();
        }
        assert_eq!(leader.tick_height(), 10);
        assert_eq!(leader.epoch_height(), 1);
        assert!(leader.pending_ticks().is_empty());
        assert_eq!(log.epoch_count(), 1);
        let published = &log.read_from(0)[0];
        let heights: Vec<u64> = published.ticks.iter().map(|t| t.tick_height).collect();
        assert_eq!(heights, (0..10).collect::<Vec<_>>());
        assert_eq!(Some(published.state_hash), leader.last_epoch_hash());
    }
}
