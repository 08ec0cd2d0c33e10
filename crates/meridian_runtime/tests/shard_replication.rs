//! Leader/follower scenarios: epoch publication, replay, snapshots and
//! recovery.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use meridian_core::{
    Command, Component, EntityId, Event, EventKind, QueryParams, RawCommand, Snapshot, SystemError, SystemHook,
    World, WorldConfig,
};
use meridian_runtime::{
    Epoch, EpochLog, MemoryEpochLog, MemoryStorage, NopStorage, Shard, ShardConfig, ShardError, ShardMode,
    SnapshotStorage, StorageError,
};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};

// =============================================================================
// GAME FIXTURE
// =============================================================================

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct Position {
    x: i64,
}
impl Component for Position {
    const NAME: &'static str = "position";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct Treasury(u64);
impl Component for Treasury {
    const NAME: &'static str = "treasury";
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Spawn {
    x: i64,
}
impl Command for Spawn {
    const NAME: &'static str = "spawn";
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Push {
    entity: u32,
    dx: i64,
}
impl Command for Push {
    const NAME: &'static str = "push";
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Sabotage {
    reason: String,
}
impl Command for Sabotage {
    const NAME: &'static str = "sabotage";
}

#[derive(Clone, Debug, Serialize)]
struct Spawned {
    id: u32,
}
impl Event for Spawned {
    const NAME: &'static str = "spawned";
}

fn game_world(workers: usize) -> World {
    let mut world = World::with_config(WorldConfig {
        worker_threads: workers,
        ..WorldConfig::default()
    });
    world
        .register_system("found-treasury", SystemHook::Init, |init| {
            let treasury = init.exact::<(Treasury,)>()?;
            Ok(move || {
                treasury.create_with((Treasury(1_000),))?;
                Ok(())
            })
        })
        .unwrap();
    world
        .register_system("spawner", SystemHook::Update, |init| {
            let spawns = init.commands::<Spawn>()?;
            let bodies = init.exact::<(Position,)>()?;
            let announce = init.event_emitter::<Spawned>()?;
            init.structural();
            Ok(move || {
                for command in spawns.iter() {
                    let entity = bodies.create_with((Position { x: command.payload.x },))?;
                    announce.emit(&Spawned { id: entity.get() })?;
                }
                Ok(())
            })
        })
        .unwrap();
    world
        .register_system("mover", SystemHook::Update, |init| {
            let pushes = init.commands::<Push>()?;
            let bodies = init.exact::<(Position,)>()?;
            Ok(move || {
                for command in pushes.iter() {
                    if let Ok((position,)) = bodies.get_by_id(EntityId::new(command.payload.entity)) {
                        position.update(|p| p.x += command.payload.dx)?;
                    }
                }
                Ok(())
            })
        })
        .unwrap();
    world
        .register_system("interest", SystemHook::PostUpdate, |init| {
            let treasury = init.exact::<(Treasury,)>()?;
            Ok(move || {
                for (_, (funds,)) in treasury.iter() {
                    funds.update(|t| t.0 = t.0.saturating_mul(3) / 2 + 1)?;
                }
                Ok(())
            })
        })
        .unwrap();
    world
        .register_system("saboteur", SystemHook::PreUpdate, |init| {
            let sabotage = init.commands::<Sabotage>()?;
            Ok(move || match sabotage.iter().next() {
                Some(command) => Err(SystemError::failed(command.payload.reason.clone())),
                None => Ok(()),
            })
        })
        .unwrap();
    world
}

fn config(mode: ShardMode, snapshot_frequency: u32) -> ShardConfig {
    ShardConfig {
        shard_id: "arena".to_string(),
        mode,
        snapshot_frequency,
        ..ShardConfig::default()
    }
}

fn leader(log: &MemoryEpochLog, storage: Box<dyn SnapshotStorage>, snapshot_frequency: u32) -> Shard {
    let mut shard = Shard::new(
        game_world(4),
        config(ShardMode::Leader, snapshot_frequency),
        Arc::new(log.clone()),
        storage,
    );
    shard.start().unwrap();
    shard
}

fn follower(log: &MemoryEpochLog) -> Shard {
    Shard::new(
        game_world(1),
        config(ShardMode::Follower, 1),
        Arc::new(log.clone()),
        Box::new(NopStorage),
    )
}

fn command<C: Command>(payload: &C) -> RawCommand {
    RawCommand::new("player", "0xfeed", payload).unwrap()
}

/// Ticks the leader until `epochs` more epochs are published, feeding a
/// deterministic mix of commands.
fn play_epochs(shard: &mut Shard, epochs: u64) {
    let target = shard.epoch_height() + epochs;
    while shard.epoch_height() < target {
        let height = shard.tick_height();
        if height % 3 == 0 {
            shard.submit(command(&Spawn { x: i64::try_from(height).unwrap() })).unwrap();
        }
        if height % 4 == 1 {
            let entity = u32::try_from(height % 5).unwrap();
            shard.submit(command(&Push { entity, dx: -2 })).unwrap();
        }
        shard.tick(1_700_000_000_000 + height * 50).unwrap();
    }
}

fn hash(shard: &Shard) -> meridian_core::StateHash {
    shard.world().state_hash().unwrap()
}

// =============================================================================
// LEADER
// =============================================================================

#[test]
fn test_leader_publishes_epochs_with_commands() {
    let log = MemoryEpochLog::new();
    let mut shard = leader(&log, Box::new(NopStorage), 1);
    play_epochs(&mut shard, 3);

    assert_eq!(shard.tick_height(), 30);
    assert_eq!(shard.epoch_height(), 3);
    assert_eq!(log.epoch_count(), 3);

    let epochs = log.read_from(0);
    let tick_heights: Vec<u64> = epochs.iter().flat_map(|e| e.ticks.iter().map(|t| t.tick_height)).collect();
    assert_eq!(tick_heights, (0..30).collect::<Vec<_>>());
    assert!(epochs[0].ticks[0].commands.is_empty(), "genesis carries no commands");
    let spawns = epochs
        .iter()
        .flat_map(|e| &e.ticks)
        .flat_map(|t| &t.commands)
        .filter(|c| c.name == "spawn")
        .count();
    assert_eq!(spawns, 9);
    assert_eq!(epochs[2].state_hash, hash(&shard));
}

#[test]
fn test_events_dispatch_on_leader() {
    let log = MemoryEpochLog::new();
    let mut shard = leader(&log, Box::new(NopStorage), 1);
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    shard.world().events().set_handler(
        EventKind::Default,
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );
    shard.submit(command(&Spawn { x: 1 })).unwrap();
    shard.submit(command(&Spawn { x: 2 })).unwrap();
    shard.tick(1).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[test]
fn test_event_handler_failure_is_not_fatal() {
    let log = MemoryEpochLog::new();
    let mut shard = leader(&log, Box::new(NopStorage), 1);
    shard
        .world()
        .events()
        .set_handler(EventKind::Default, Box::new(|_| Err("sink offline".to_string())));
    shard.submit(command(&Spawn { x: 1 })).unwrap();
    shard.tick(1).unwrap();
    shard.tick(2).unwrap();
    assert_eq!(shard.tick_height(), 3);
}

#[test]
fn test_failed_tick_halts_shard() {
    let log = MemoryEpochLog::new();
    let mut shard = leader(&log, Box::new(NopStorage), 1);
    shard
        .submit(command(&Sabotage {
            reason: "boom".to_string(),
        }))
        .unwrap();
    assert!(matches!(shard.tick(1), Err(ShardError::Tick(_))));
    assert!(shard.is_halted());
    assert!(matches!(shard.tick(2), Err(ShardError::Halted)));
}

#[test]
fn test_submit_rejects_unknown_command() {
    let log = MemoryEpochLog::new();
    let shard = leader(&log, Box::new(NopStorage), 1);
    let raw = RawCommand {
        name: "teleport".to_string(),
        address: "0x1".to_string(),
        persona: "p".to_string(),
        payload: b"{}".to_vec(),
    };
    assert!(matches!(shard.submit(raw), Err(ShardError::Command(_))));
}

// =============================================================================
// FOLLOWER
// =============================================================================

#[test]
fn test_follower_converges_on_leader_state() {
    let log = MemoryEpochLog::new();
    let mut primary = leader(&log, Box::new(NopStorage), 1);
    play_epochs(&mut primary, 4);

    let mut replica = follower(&log);
    replica.start().unwrap();
    assert_eq!(replica.epoch_height(), 4);
    assert_eq!(replica.tick_height(), 40);
    assert_eq!(hash(&replica), hash(&primary));
    assert_eq!(
        replica.world().query(&QueryParams::all()).unwrap(),
        primary.world().query(&QueryParams::all()).unwrap()
    );

    // Later epochs arrive incrementally
    play_epochs(&mut primary, 2);
    assert_eq!(replica.sync().unwrap(), 2);
    assert_eq!(replica.epoch_height(), 6);
    assert_eq!(hash(&replica), hash(&primary));
    assert_eq!(replica.sync().unwrap(), 0);
}

#[test]
fn test_follower_detects_divergence() {
    let log = MemoryEpochLog::new();
    let mut primary = leader(&log, Box::new(NopStorage), 1);
    play_epochs(&mut primary, 2);

    let forged = MemoryEpochLog::new();
    for mut epoch in log.read_from(0) {
        if epoch.epoch_height == 1 {
            epoch.state_hash.0[0] ^= 0x01;
        }
        forged.publish(epoch).unwrap();
    }

    let mut replica = follower(&forged);
    match replica.start() {
        Err(ShardError::HashMismatch { epoch, expected, actual }) => {
            assert_eq!(epoch, 1);
            assert_ne!(expected, actual);
            assert_eq!(actual, hash(&primary));
        }
        other => panic!("expected hash mismatch, got {other:?}"),
    }
}

#[test]
fn test_follower_rejects_out_of_sequence_epochs() {
    let log = MemoryEpochLog::new();
    let mut primary = leader(&log, Box::new(NopStorage), 1);
    play_epochs(&mut primary, 2);
    let epochs = log.read_from(0);

    let mut replica = follower(&MemoryEpochLog::new());
    replica.start().unwrap();
    assert!(matches!(
        replica.replay_epoch(&epochs[1]),
        Err(ShardError::EpochMismatch { expected: 0, actual: 1 })
    ));

    let mut shifted: Epoch = epochs[0].clone();
    shifted.ticks[3].tick_height = 99;
    assert!(matches!(
        replica.replay_epoch(&shifted),
        Err(ShardError::TickMismatch { expected: 3, actual: 99 })
    ));
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

#[test]
fn test_snapshot_schedule() {
    let log = MemoryEpochLog::new();
    let storage = MemoryStorage::new();
    let mut shard = leader(&log, Box::new(storage.clone()), 2);

    play_epochs(&mut shard, 1);
    let first = storage.load().unwrap();
    assert_eq!((first.tick_height, first.epoch_height), (10, 1));
    assert_eq!(first.state_hash, hash(&shard));

    play_epochs(&mut shard, 1);
    assert_eq!(storage.load().unwrap(), first, "epoch 1 is not a snapshot epoch");

    play_epochs(&mut shard, 1);
    let third = storage.load().unwrap();
    assert_eq!((third.tick_height, third.epoch_height), (30, 3));
    assert_eq!(third.state_hash, hash(&shard));
}

#[test]
fn test_restart_restores_snapshot_then_replays_log() {
    let log = MemoryEpochLog::new();
    let storage = MemoryStorage::new();
    let mut primary = leader(&log, Box::new(storage.clone()), 2);
    play_epochs(&mut primary, 4);
    assert_eq!(storage.load().unwrap().epoch_height, 3);

    let restarted = leader(&log, Box::new(storage), 2);
    assert_eq!(restarted.mode(), ShardMode::Leader);
    assert_eq!(restarted.epoch_height(), 4);
    assert_eq!(restarted.tick_height(), 40);
    assert_eq!(hash(&restarted), hash(&primary));
    assert_eq!(log.epoch_count(), 4, "replayed epochs are not republished");
}

#[test]
fn test_unreadable_snapshot_falls_back_to_genesis() {
    let storage = MemoryStorage::new();
    storage.put_raw(b"not a snapshot".to_vec());
    let shard = leader(&MemoryEpochLog::new(), Box::new(storage), 1);
    assert_eq!(shard.tick_height(), 1);
    assert_eq!(shard.epoch_height(), 0);
    assert_eq!(shard.world().state().entity_count(), 1, "genesis founded the treasury");
}

#[test]
fn test_incompatible_snapshot_falls_back_to_genesis() {
    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Relic(u8);
    impl Component for Relic {
        const NAME: &'static str = "relic";
    }

    let foreign = World::new();
    foreign.state_mut().spawn((Relic(1),)).unwrap();
    foreign.state_mut().spawn((Relic(2),)).unwrap();
    let storage = MemoryStorage::new();
    storage
        .store(&Snapshot::new(500, 50, 0, foreign.serialize().unwrap()))
        .unwrap();

    let shard = leader(&MemoryEpochLog::new(), Box::new(storage), 1);
    assert_eq!(shard.tick_height(), 1);
    assert_eq!(shard.epoch_height(), 0);
    assert_eq!(shard.world().state().entity_count(), 1);
}

struct BrokenStorage {
    attempts: Arc<AtomicUsize>,
}

impl SnapshotStorage for BrokenStorage {
    fn store(&self, _snapshot: &Snapshot) -> Result<(), StorageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Io(std::io::Error::other("disk full")))
    }

    fn load(&self) -> Result<Snapshot, StorageError> {
        Err(StorageError::NotFound)
    }

    fn exists(&self) -> bool {
        false
    }
}

#[test]
fn test_snapshot_failure_is_not_fatal() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let log = MemoryEpochLog::new();
    let storage = BrokenStorage {
        attempts: Arc::clone(&attempts),
    };
    let mut shard = leader(&log, Box::new(storage), 1);
    play_epochs(&mut shard, 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(log.epoch_count(), 3);
    assert!(!shard.is_halted());
}

// =============================================================================
// LOOP AND CONFIG
// =============================================================================

#[test]
fn test_run_until_stopped() {
    let log = MemoryEpochLog::new();
    let mut shard = Shard::new(
        game_world(2),
        ShardConfig {
            tick_rate: 200,
            ..config(ShardMode::Leader, 1)
        },
        Arc::new(log.clone()),
        Box::new(NopStorage),
    );
    let stop = Arc::new(AtomicBool::new(false));
    let stopper = Arc::clone(&stop);
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        stopper.store(true, Ordering::Release);
    });

    let stats = shard.run(&stop).unwrap();
    handle.join().unwrap();
    assert!(stats.total_ticks > 0);
    assert_eq!(shard.tick_height(), stats.total_ticks + 1);
}

#[test]
fn test_shard_from_toml_file() {
    let dir = std::env::temp_dir().join(format!("meridian-shard-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let snapshot_path = dir.join("arena.snap");
    let _ = std::fs::remove_file(&snapshot_path);
    let config_path = dir.join("shard.toml");
    std::fs::write(
        &config_path,
        format!(
            "shard_id = \"arena\"\nsnapshot_frequency = 1\n\n[snapshot]\nkind = \"file\"\npath = {:?}\ncompress = true\n",
            snapshot_path.display().to_string()
        ),
    )
    .unwrap();

    let config = ShardConfig::load(&config_path).unwrap();
    let log = MemoryEpochLog::new();
    let mut shard = Shard::from_config(game_world(1), config.clone(), Arc::new(log.clone())).unwrap();
    shard.start().unwrap();
    play_epochs(&mut shard, 2);
    assert!(snapshot_path.is_file());

    let restarted = {
        let mut shard = Shard::from_config(game_world(1), config, Arc::new(log)).unwrap();
        shard.start().unwrap();
        shard
    };
    assert_eq!(restarted.epoch_height(), 2);
    assert_eq!(hash(&restarted), hash(&shard));
    std::fs::remove_file(&snapshot_path).unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_replicas_match_any_command_stream(
        script in prop::collection::vec((0u8..3, -50i64..50, 0u32..8), 10..40),
    ) {
        let log = MemoryEpochLog::new();
        let mut primary = leader(&log, Box::new(NopStorage), 1);
        let mut steps = script.iter().cycle();
        while primary.epoch_height() < 2 {
            if let Some(&(kind, value, entity)) = steps.next() {
                match kind {
                    0 => primary.submit(command(&Spawn { x: value })).unwrap(),
                    1 => primary.submit(command(&Push { entity, dx: value })).unwrap(),
                    _ => {}
                }
            }
            primary.tick(0).unwrap();
        }

        let mut replica = follower(&log);
        prop_assert!(replica.start().is_ok());
        prop_assert_eq!(hash(&replica), hash(&primary));
    }
}
