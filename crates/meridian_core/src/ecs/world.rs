//! # World
//!
//! Orchestrates registration, the init tick, phase execution and reset.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized ──init()──► Ready ──tick()──► init tick (Init systems only)
//!                                  ──tick()──► PreUpdate ─► Update ─► PostUpdate
//!                                  ──reset()─► next tick is an init tick again
//! ```
//!
//! A tick is not transactional. If a phase fails, later phases do not run
//! and mutations already applied stay applied.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;

use super::component::{Component, ComponentId, RegisterCallback};
use super::query::{self, QueryParams, QueryRow};
use super::scheduler::SystemScheduler;
use super::search::SharedState;
use super::system::{SystemFn, SystemHook, SystemInit};
use super::system_event::SystemEventManager;
use super::world_state::WorldState;
use crate::command::{Command, CommandId, CommandManager};
use crate::config::WorldConfig;
use crate::error::{EcsError, EcsResult, QueryError, SnapshotError, SystemError, SystemFailure, TickError};
use crate::event::{Event, EventManager};
use crate::snapshot::{self, StateHash};

struct InitSystem {
    name: String,
    body: SystemFn,
}

/// Registered names, for introspection endpoints.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WorldDescription {
    /// Component names in ID order.
    pub components: Vec<&'static str>,
    /// Command names in ID order.
    pub commands: Vec<&'static str>,
    /// Event names, sorted.
    pub events: Vec<&'static str>,
    /// System-event names in ID order.
    pub system_events: Vec<&'static str>,
    /// `(hook, name)` of every system in registration order per hook.
    pub systems: Vec<(SystemHook, String)>,
}

/// The simulation engine for one shard.
pub struct World {
    config: WorldConfig,
    state: SharedState,
    system_events: SystemEventManager,
    commands: Arc<CommandManager>,
    events: Arc<EventManager>,
    init_systems: Vec<InitSystem>,
    phases: [SystemScheduler; 3],
    initialized: bool,
    init_done: bool,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Creates a world with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    /// Creates a world.
    #[must_use]
    pub fn with_config(config: WorldConfig) -> Self {
        let workers = config.resolved_workers();
        Self {
            state: Arc::new(RwLock::new(WorldState::new())),
            system_events: SystemEventManager::new(),
            commands: Arc::new(CommandManager::new()),
            events: Arc::new(EventManager::new(config.event_channel_capacity)),
            init_systems: Vec::new(),
            phases: [
                SystemScheduler::new(workers),
                SystemScheduler::new(workers),
                SystemScheduler::new(workers),
            ],
            initialized: false,
            init_done: false,
            config,
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Registers a component type. Idempotent.
    ///
    /// # Errors
    ///
    /// See [`crate::ecs::ComponentRegistry::register`].
    pub fn register_component<T: Component>(&self) -> EcsResult<ComponentId> {
        self.state.write().register_component::<T>()
    }

    /// Installs a callback run once for every newly registered component.
    pub fn on_component_register(&self, callback: RegisterCallback) {
        self.state.write().on_component_register(callback);
    }

    /// Registers a command type. Idempotent.
    ///
    /// # Errors
    ///
    /// See [`CommandManager::register`].
    pub fn register_command<T: Command>(&self) -> Result<CommandId, crate::error::CommandError> {
        self.commands.register::<T>()
    }

    /// Registers an outbound event type. Idempotent.
    pub fn register_event<E: Event>(&self) {
        self.events.register::<E>();
    }

    /// Registers a system.
    ///
    /// `build` declares the system's fields through [`SystemInit`] and
    /// returns its body. Systems run in registration order within a phase
    /// unless their dependencies allow them to run concurrently.
    ///
    /// # Errors
    ///
    /// - [`EcsError::RegistrationClosed`] after [`World::init`]
    /// - any error returned by `build`
    pub fn register_system<F, S>(&mut self, name: impl Into<String>, hook: SystemHook, build: F) -> EcsResult<()>
    where
        F: FnOnce(&mut SystemInit<'_>) -> EcsResult<S>,
        S: FnMut() -> Result<(), SystemError> + Send + 'static,
    {
        let name = name.into();
        if self.initialized {
            return Err(EcsError::RegistrationClosed(name));
        }

        let mut init = SystemInit::new(
            &name,
            &self.state,
            &mut self.system_events,
            &self.commands,
            &self.events,
        );
        let body: SystemFn = Box::new(build(&mut init)?);
        let dependencies = init.into_dependencies();

        tracing::debug!(system = %name, ?hook, components = dependencies.components.count(), "registered system");
        match hook.phase_index() {
            Some(phase) => self.phases[phase].register(name, dependencies, body),
            None => self.init_systems.push(InitSystem { name, body }),
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Builds every phase schedule. The next tick is the init tick.
    pub fn init(&mut self) {
        for scheduler in &mut self.phases {
            scheduler.create_schedule();
        }
        self.initialized = true;
        self.init_done = false;
        tracing::info!(
            init_systems = self.init_systems.len(),
            pre_update = self.phases[0].len(),
            update = self.phases[1].len(),
            post_update = self.phases[2].len(),
            "world initialised"
        );
    }

    /// True once [`World::init`] has run.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// True once the init tick has run.
    #[must_use]
    pub fn is_init_done(&self) -> bool {
        self.init_done
    }

    /// Advances the simulation by one tick.
    ///
    /// The first tick after [`World::init`] or [`World::reset`] runs only
    /// the init systems, once each, in registration order. Every later tick
    /// runs PreUpdate, Update and PostUpdate in order. System-event buffers
    /// are empty when this returns, whatever the outcome. Outbound events
    /// emitted by a failed tick are discarded; events queued before the tick
    /// stay queued.
    ///
    /// # Errors
    ///
    /// - [`TickError::NotInitialized`] before [`World::init`]
    /// - [`TickError::InitFailed`] if an init system fails
    /// - [`TickError::PhaseFailed`] if any system of a phase fails; later
    ///   phases are skipped and nothing is rolled back
    pub fn tick(&mut self) -> Result<(), TickError> {
        if !self.initialized {
            return Err(TickError::NotInitialized);
        }
        let queued = self.events.pending();
        let result = if self.init_done {
            self.run_phases()
        } else {
            self.run_init_systems()
        };
        self.system_events.clear();
        if result.is_err() {
            let discarded = self.events.truncate(queued);
            if discarded > 0 {
                tracing::debug!(discarded, "dropped events of failed tick");
            }
        }
        result
    }

    fn run_init_systems(&mut self) -> Result<(), TickError> {
        // Marked first: a failed init tick is not retried
        self.init_done = true;
        for system in &mut self.init_systems {
            tracing::trace!(system = %system.name, "running init system");
            if let Err(error) = (system.body)() {
                return Err(TickError::InitFailed(SystemFailure {
                    system: system.name.clone(),
                    error,
                }));
            }
        }
        Ok(())
    }

    fn run_phases(&mut self) -> Result<(), TickError> {
        for (scheduler, hook) in self.phases.iter_mut().zip(SystemHook::PHASES) {
            scheduler
                .run()
                .map_err(|failures| TickError::PhaseFailed { hook, failures })?;
        }
        Ok(())
    }

    /// Drops every entity, archetype, command and event. Registrations and
    /// schedules are kept; the next tick is an init tick.
    pub fn reset(&mut self) {
        self.state.write().reset();
        self.commands.clear();
        self.events.clear();
        self.system_events.clear();
        self.init_done = false;
        tracing::info!("world reset");
    }

    // ------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------

    /// Shared handle to the world state.
    #[must_use]
    pub fn shared_state(&self) -> &SharedState {
        &self.state
    }

    /// Read access to the world state.
    ///
    /// Do not hold the guard across [`World::tick`].
    pub fn state(&self) -> RwLockReadGuard<'_, WorldState> {
        self.state.read()
    }

    /// Write access to the world state.
    pub fn state_mut(&self) -> RwLockWriteGuard<'_, WorldState> {
        self.state.write()
    }

    /// The command manager.
    #[must_use]
    pub fn commands(&self) -> &Arc<CommandManager> {
        &self.commands
    }

    /// The event manager.
    #[must_use]
    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    /// True if no system-event buffer holds an event.
    #[must_use]
    pub fn system_events_empty(&self) -> bool {
        self.system_events.is_empty()
    }

    /// Registered names.
    #[must_use]
    pub fn describe(&self) -> WorldDescription {
        let mut systems: Vec<(SystemHook, String)> = self
            .init_systems
            .iter()
            .map(|s| (SystemHook::Init, s.name.clone()))
            .collect();
        for (scheduler, hook) in self.phases.iter().zip(SystemHook::PHASES) {
            systems.extend(scheduler.names().map(|n| (hook, n.to_string())));
        }
        WorldDescription {
            components: self.state.read().registry().names().collect(),
            commands: self.commands.names(),
            events: self.events.names(),
            system_events: self.system_events.names(),
            systems,
        }
    }

    /// Scheduler for one phase.
    ///
    /// # Panics
    ///
    /// Panics for [`SystemHook::Init`], which has no scheduler.
    #[must_use]
    pub fn scheduler(&self, hook: SystemHook) -> &SystemScheduler {
        let phase = hook.phase_index().unwrap_or_else(|| panic!("init systems are not scheduled"));
        &self.phases[phase]
    }

    // ------------------------------------------------------------------
    // Queries and snapshots
    // ------------------------------------------------------------------

    /// Runs a state query.
    ///
    /// # Errors
    ///
    /// See [`query::execute`].
    pub fn query(&self, params: &QueryParams) -> Result<Vec<QueryRow>, QueryError> {
        query::execute(&self.state.read(), params)
    }

    /// Serializes the world state deterministically.
    ///
    /// # Errors
    ///
    /// Fails if a component value cannot be encoded.
    pub fn serialize(&self) -> Result<Vec<u8>, SnapshotError> {
        snapshot::encode_state(&self.state.read())
    }

    /// Replaces the world state with serialized bytes. On success the
    /// world counts as past its init tick.
    ///
    /// # Errors
    ///
    /// Fails on malformed data; the current state is then left untouched.
    pub fn deserialize(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        snapshot::decode_state(&mut self.state.write(), bytes)?;
        self.init_done = true;
        Ok(())
    }

    /// Hash of the serialized world state.
    ///
    /// # Errors
    ///
    /// Fails if a component value cannot be encoded.
    pub fn state_hash(&self) -> Result<StateHash, SnapshotError> {
        Ok(StateHash::of(&self.serialize()?))
    }
}
