//! # System Scheduler
//!
//! Runs one phase's systems per tick, in parallel where their declared
//! dependencies allow.
//!
//! ## Dependency Graph
//!
//! Systems are nodes, numbered by registration order. For every pair
//! `i < j` whose dependencies overlap there is an edge `i -> j`. Edges
//! only point forward, so the graph is acyclic by construction and
//! registration order is always a valid serial order.
//!
//! ```text
//!   A {pos}      B {hp}      C {ai}
//!      \          /
//!       \        /
//!        D {pos, hp}
//!
//! first tier = {A, B, C}; D starts after A and B both finish
//! ```
//!
//! ## Execution
//!
//! Each node has an atomic count of unfinished predecessors. Workers pull
//! ready nodes from a channel, run them, and push every successor whose
//! count drops to zero. Counts are double-buffered: while one buffer is
//! consumed, finished nodes re-arm the other, so the next run starts from
//! a clean set without a reset pass.

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread;

use crossbeam_channel::unbounded;
use parking_lot::Mutex;

use super::system::{Dependencies, SystemFn};
use crate::error::{SystemError, SystemFailure};

/// Adjacency lists plus the indegree of every node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// Successors of each node, ascending.
    pub edges: Vec<Vec<usize>>,
    /// Number of predecessors of each node.
    pub indegree: Vec<u32>,
}

impl DependencyGraph {
    /// Nodes with no predecessor, ascending.
    #[must_use]
    pub fn first_tier(&self) -> Vec<usize> {
        self.indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect()
    }

    /// Total number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.iter().map(Vec::len).sum()
    }
}

/// Builds the dependency graph: edge `i -> j` iff `i < j` and the two
/// systems' dependencies overlap.
#[must_use]
pub fn build_dependency_graph(dependencies: &[Dependencies]) -> DependencyGraph {
    let n = dependencies.len();
    let mut edges = vec![Vec::new(); n];
    let mut indegree = vec![0u32; n];
    for i in 0..n {
        for j in (i + 1)..n {
            if dependencies[i].overlaps(&dependencies[j]) {
                edges[i].push(j);
                indegree[j] += 1;
            }
        }
    }
    DependencyGraph { edges, indegree }
}

struct ScheduledSystem {
    name: String,
    dependencies: Dependencies,
    body: Mutex<SystemFn>,
}

/// Per-phase scheduler.
pub struct SystemScheduler {
    systems: Vec<ScheduledSystem>,
    graph: DependencyGraph,
    tier0: Vec<usize>,
    indegree: [Vec<AtomicU32>; 2],
    active: usize,
    workers: usize,
}

impl SystemScheduler {
    /// Creates an empty scheduler running on up to `workers` threads.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            systems: Vec::new(),
            graph: DependencyGraph::default(),
            tier0: Vec::new(),
            indegree: [Vec::new(), Vec::new()],
            active: 0,
            workers: workers.max(1),
        }
    }

    /// Appends a system. Takes effect at the next [`SystemScheduler::create_schedule`].
    pub fn register(&mut self, name: String, dependencies: Dependencies, body: SystemFn) {
        self.systems.push(ScheduledSystem {
            name,
            dependencies,
            body: Mutex::new(body),
        });
    }

    /// Number of registered systems.
    #[must_use]
    pub fn len(&self) -> usize {
        self.systems.len()
    }

    /// True if no system is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    /// System names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.systems.iter().map(|s| s.name.as_str())
    }

    /// The current graph.
    #[must_use]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Systems that start immediately on every run.
    #[must_use]
    pub fn first_tier(&self) -> &[usize] {
        &self.tier0
    }

    /// Computes the graph and arms both indegree buffers.
    pub fn create_schedule(&mut self) {
        let dependencies: Vec<Dependencies> =
            self.systems.iter().map(|s| s.dependencies.clone()).collect();
        self.graph = build_dependency_graph(&dependencies);
        self.tier0 = self.graph.first_tier();
        let armed = || {
            self.graph
                .indegree
                .iter()
                .map(|&d| AtomicU32::new(d))
                .collect::<Vec<_>>()
        };
        self.indegree = [armed(), armed()];
        self.active = 0;
        tracing::debug!(
            systems = self.systems.len(),
            first_tier = self.tier0.len(),
            edges = self.graph.edge_count(),
            "created schedule"
        );
    }

    /// Runs every system once.
    ///
    /// A failing system does not stop the run: its successors still run,
    /// and every failure is returned. A panicking system is caught so the
    /// workers drain, then the panic resumes on the calling thread.
    ///
    /// # Errors
    ///
    /// Every failed system, in completion order.
    ///
    /// # Panics
    ///
    /// Re-raises the first panic of a system body.
    pub fn run(&mut self) -> Result<(), Vec<SystemFailure>> {
        if self.systems.is_empty() {
            return Ok(());
        }
        assert_eq!(
            self.indegree[0].len(),
            self.systems.len(),
            "run() called before create_schedule()"
        );

        let workers = self.workers.min(self.systems.len());
        let (failures, panic) = if workers <= 1 {
            self.run_serial()
        } else {
            self.run_parallel(workers)
        };
        if let Some(payload) = panic {
            resume_unwind(payload);
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }

    fn run_serial(&self) -> (Vec<SystemFailure>, Option<Panic>) {
        let mut failures = Vec::new();
        let mut first_panic = None;
        // Registration order is a topological order
        for system in &self.systems {
            if let Err(outcome) = run_one(system) {
                record(outcome, &system.name, &mut failures, &mut first_panic);
            }
        }
        (failures, first_panic)
    }

    fn run_parallel(&mut self, workers: usize) -> (Vec<SystemFailure>, Option<Panic>) {
        let current = self.active;
        self.active ^= 1;
        let pending = &self.indegree[current];
        let rearm = &self.indegree[current ^ 1];
        let systems = &self.systems;
        let edges = &self.graph.edges;

        let (ready_tx, ready_rx) = unbounded::<Option<usize>>();
        for &node in &self.tier0 {
            let _ = ready_tx.send(Some(node));
        }
        let remaining = AtomicUsize::new(systems.len());
        let failures = Mutex::new(Vec::new());
        let first_panic = Mutex::new(None);

        thread::scope(|scope| {
            for _ in 0..workers {
                let ready_tx = ready_tx.clone();
                let ready_rx = ready_rx.clone();
                let remaining = &remaining;
                let failures = &failures;
                let first_panic = &first_panic;
                scope.spawn(move || {
                    while let Ok(Some(node)) = ready_rx.recv() {
                        let system = &systems[node];
                        tracing::trace!(system = %system.name, "running system");
                        if let Err(outcome) = run_one(system) {
                            record(outcome, &system.name, &mut failures.lock(), &mut first_panic.lock());
                        }
                        for &next in &edges[node] {
                            rearm[next].fetch_add(1, Ordering::Relaxed);
                            // The last predecessor to finish releases the node
                            if pending[next].fetch_sub(1, Ordering::AcqRel) == 1 {
                                let _ = ready_tx.send(Some(next));
                            }
                        }
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            for _ in 0..workers {
                                let _ = ready_tx.send(None);
                            }
                        }
                    }
                });
            }
        });

        debug_assert!(pending.iter().all(|d| d.load(Ordering::Relaxed) == 0));
        (failures.into_inner(), first_panic.into_inner())
    }
}

type Panic = Box<dyn std::any::Any + Send + 'static>;

enum Outcome {
    Failed(SystemError),
    Panicked(Panic),
}

fn run_one(system: &ScheduledSystem) -> Result<(), Outcome> {
    let mut body = system.body.lock();
    match catch_unwind(AssertUnwindSafe(|| (*body)())) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(Outcome::Failed(error)),
        Err(payload) => Err(Outcome::Panicked(payload)),
    }
}

fn record(
    outcome: Outcome,
    name: &str,
    failures: &mut Vec<SystemFailure>,
    first_panic: &mut Option<Panic>,
) {
    let error = match outcome {
        Outcome::Failed(error) => error,
        Outcome::Panicked(payload) => {
            let message = panic_message(payload.as_ref());
            if first_panic.is_none() {
                *first_panic = Some(payload);
            }
            SystemError::Panicked(message)
        }
    };
    failures.push(SystemFailure {
        system: name.to_string(),
        error,
    });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
