//! Property tests for storage, scheduling and snapshots.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use meridian_core::ecs::{build_dependency_graph, Bitmap, Column, Dependencies, SystemScheduler};
use meridian_core::{Component, EntityId, World, WorldState};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct Balance {
    amount: u64,
    signed: i64,
}
impl Component for Balance {
    const NAME: &'static str = "balance";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct Label(String);
impl Component for Label {
    const NAME: &'static str = "label";
}

fn dependencies_strategy() -> impl Strategy<Value = Vec<Dependencies>> {
    prop::collection::vec(
        (prop::collection::vec(0u32..12, 0..4), prop::collection::vec(0u32..4, 0..2), any::<bool>()),
        0..16,
    )
    .prop_map(|systems| {
        systems
            .into_iter()
            .map(|(components, events, structural)| Dependencies {
                components: components.into_iter().collect::<Bitmap>(),
                system_events: events.into_iter().collect::<Bitmap>(),
                structural,
            })
            .collect()
    })
}

#[derive(Clone, Debug)]
enum EntityOp {
    Create,
    Remove(usize),
}

fn entity_ops() -> impl Strategy<Value = Vec<EntityOp>> {
    prop::collection::vec(
        prop_oneof![
            3 => Just(EntityOp::Create),
            2 => any::<usize>().prop_map(EntityOp::Remove),
        ],
        0..200,
    )
}

proptest! {
    #[test]
    fn prop_graph_is_forward_and_consistent(deps in dependencies_strategy()) {
        let graph = build_dependency_graph(&deps);
        prop_assert_eq!(&graph, &build_dependency_graph(&deps));

        let mut incoming = vec![0u32; deps.len()];
        for (source, targets) in graph.edges.iter().enumerate() {
            for &target in targets {
                prop_assert!(source < target);
                prop_assert!(deps[source].overlaps(&deps[target]));
                incoming[target] += 1;
            }
        }
        prop_assert_eq!(&incoming, &graph.indegree);

        let first_tier: Vec<usize> = (0..deps.len()).filter(|&i| graph.indegree[i] == 0).collect();
        prop_assert_eq!(graph.first_tier(), first_tier);
    }

    #[test]
    fn prop_scheduler_runs_each_system_once(deps in dependencies_strategy(), workers in 1usize..6) {
        let counters: Vec<Arc<AtomicUsize>> = deps.iter().map(|_| Arc::default()).collect();
        let mut scheduler = SystemScheduler::new(workers);
        for (i, dependencies) in deps.iter().enumerate() {
            let counter = Arc::clone(&counters[i]);
            scheduler.register(
                format!("s{i}"),
                dependencies.clone(),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }
        scheduler.create_schedule();
        for _ in 0..3 {
            prop_assert!(scheduler.run().is_ok());
        }
        for counter in &counters {
            prop_assert_eq!(counter.load(Ordering::SeqCst), 3);
        }
    }

    #[test]
    fn prop_scheduler_respects_every_edge(deps in dependencies_strategy(), workers in 2usize..6) {
        let clock = Arc::new(AtomicU64::new(0));
        let spans: Vec<Arc<[AtomicU64; 2]>> = deps.iter().map(|_| Arc::default()).collect();
        let mut scheduler = SystemScheduler::new(workers);
        for (i, dependencies) in deps.iter().enumerate() {
            let clock = Arc::clone(&clock);
            let span = Arc::clone(&spans[i]);
            scheduler.register(
                format!("s{i}"),
                dependencies.clone(),
                Box::new(move || {
                    span[0].store(clock.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
                    std::thread::yield_now();
                    span[1].store(clock.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
                    Ok(())
                }),
            );
        }
        scheduler.create_schedule();

        let graph = build_dependency_graph(&deps);
        for _ in 0..2 {
            prop_assert!(scheduler.run().is_ok());
            for (source, targets) in graph.edges.iter().enumerate() {
                let end = spans[source][1].load(Ordering::SeqCst);
                for &target in targets {
                    let start = spans[target][0].load(Ordering::SeqCst);
                    prop_assert!(end < start, "s{} ended at {} but s{} started at {}", source, end, target, start);
                }
            }
        }
    }

    #[test]
    fn prop_free_and_live_ids_are_disjoint(ops in entity_ops()) {
        let mut state = WorldState::new();
        let mut live: Vec<EntityId> = Vec::new();
        for op in ops {
            match op {
                EntityOp::Create => live.push(state.new_entity().unwrap()),
                EntityOp::Remove(pick) if !live.is_empty() => {
                    let entity = live.swap_remove(pick % live.len());
                    prop_assert!(state.remove_entity(entity));
                }
                EntityOp::Remove(_) => {}
            }
        }
        let allocator = state.allocator();
        let free: HashSet<EntityId> = allocator.free_ids().collect();
        let live_set: HashSet<EntityId> = live.iter().copied().collect();
        prop_assert!(free.is_disjoint(&live_set));
        prop_assert!(free.iter().chain(live.iter()).all(|id| id.get() < allocator.next_id()));
        prop_assert_eq!(free.len() + live.len(), allocator.next_id() as usize);
        prop_assert_eq!(state.entity_count(), live.len());
    }

    #[test]
    fn prop_column_matches_vec_model(
        values in prop::collection::vec(any::<u64>(), 0..40),
        removals in prop::collection::vec(any::<usize>(), 0..40),
    ) {
        let mut column = Column::new();
        let mut model = Vec::new();
        for amount in values {
            column.push(Balance { amount, signed: 0 });
            model.push(Balance { amount, signed: 0 });
        }
        for pick in removals {
            if model.is_empty() {
                prop_assert_eq!(column.remove(pick), None);
                continue;
            }
            let row = pick % model.len();
            prop_assert_eq!(column.remove(row), Some(model.swap_remove(row)));
        }
        prop_assert_eq!(column.as_slice(), model.as_slice());
    }

    #[test]
    fn prop_snapshot_round_trip(
        rows in prop::collection::vec((any::<u64>(), any::<i64>(), prop::option::of("[a-z]{0,8}")), 0..30),
        removals in prop::collection::vec(any::<usize>(), 0..10),
    ) {
        let world = World::new();
        let mut entities = Vec::new();
        {
            let mut state = world.state_mut();
            for (amount, signed, label) in rows {
                let entity = state.spawn((Balance { amount, signed },)).unwrap();
                if let Some(label) = label {
                    state.set_component(entity, Label(label)).unwrap();
                }
                entities.push(entity);
            }
            for pick in removals {
                if !entities.is_empty() {
                    let entity = entities.swap_remove(pick % entities.len());
                    state.remove_entity(entity);
                }
            }
        }
        let bytes = world.serialize().unwrap();

        let mut restored = World::new();
        restored.register_component::<Balance>().unwrap();
        restored.register_component::<Label>().unwrap();
        restored.deserialize(&bytes).unwrap();
        prop_assert!(restored.state().same_contents(&world.state()));
        prop_assert_eq!(restored.serialize().unwrap(), bytes);
        prop_assert_eq!(restored.state_hash().unwrap(), world.state_hash().unwrap());
    }
}
