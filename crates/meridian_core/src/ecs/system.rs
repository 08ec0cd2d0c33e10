//! # System Registration
//!
//! A system is registered with a builder closure. The builder receives a
//! [`SystemInit`] collector and asks it for every handle the system needs;
//! each request is a field descriptor that also records what the system
//! touches. The builder then returns the system body.
//!
//! ```rust,ignore
//! world.register_system("movement", SystemHook::Update, |init| {
//!     let movers = init.contains::<(Position, Velocity)>()?;
//!     Ok(move || {
//!         for (_, (pos, vel)) in movers.iter() {
//!             let v = vel.get()?;
//!             pos.update(|p| p.x += v.dx)?;
//!         }
//!         Ok(())
//!     })
//! })?;
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::bitmap::Bitmap;
use super::component::Component;
use super::search::{ComponentSet, Contains, Exact, Search, SharedState, Single};
use super::system_event::{SystemEvent, SystemEventEmitter, SystemEventManager, SystemEventReceiver};
use crate::command::{Command, CommandManager, CommandReader};
use crate::error::{EcsError, EcsResult, SystemError};
use crate::event::{Event, EventEmitter, EventManager};

/// Phase a system runs in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemHook {
    /// Runs first on every tick after the init tick.
    PreUpdate,
    /// Runs after every pre-update system.
    Update,
    /// Runs after every update system.
    PostUpdate,
    /// Runs once, on the first tick, in registration order.
    Init,
}

impl SystemHook {
    /// Tick phases in execution order.
    pub const PHASES: [Self; 3] = [Self::PreUpdate, Self::Update, Self::PostUpdate];

    /// Index into per-phase tables. `None` for [`SystemHook::Init`].
    #[must_use]
    pub const fn phase_index(self) -> Option<usize> {
        match self {
            Self::PreUpdate => Some(0),
            Self::Update => Some(1),
            Self::PostUpdate => Some(2),
            Self::Init => None,
        }
    }
}

/// What a system reads or writes, as seen by the scheduler.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dependencies {
    /// Component IDs of every search and single-component field.
    pub components: Bitmap,
    /// System-event IDs of every emitter and receiver field.
    pub system_events: Bitmap,
    /// The system creates or destroys entities, or adds or removes components.
    pub structural: bool,
}

impl Dependencies {
    /// True if the two systems must not run concurrently.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        (self.structural && other.structural)
            || self.components.intersects(&other.components)
            || self.system_events.intersects(&other.system_events)
    }
}

fn claim(
    seen: &mut HashSet<&'static str>,
    system: &str,
    kind: &'static str,
    name: &'static str,
) -> EcsResult<()> {
    if seen.insert(name) {
        Ok(())
    } else {
        Err(EcsError::DuplicateSystemField {
            system: system.to_string(),
            kind,
            name: name.to_string(),
        })
    }
}

/// Boxed system body.
pub type SystemFn = Box<dyn FnMut() -> Result<(), SystemError> + Send>;

/// Collects a system's field descriptors during registration.
pub struct SystemInit<'w> {
    name: &'w str,
    state: &'w SharedState,
    system_events: &'w mut SystemEventManager,
    commands: &'w Arc<CommandManager>,
    events: &'w Arc<EventManager>,
    dependencies: Dependencies,
    seen_commands: HashSet<&'static str>,
    seen_events: HashSet<&'static str>,
    seen_system_events: HashSet<&'static str>,
}

impl<'w> SystemInit<'w> {
    pub(crate) fn new(
        name: &'w str,
        state: &'w SharedState,
        system_events: &'w mut SystemEventManager,
        commands: &'w Arc<CommandManager>,
        events: &'w Arc<EventManager>,
    ) -> Self {
        Self {
            name,
            state,
            system_events,
            commands,
            events,
            dependencies: Dependencies::default(),
            seen_commands: HashSet::new(),
            seen_events: HashSet::new(),
            seen_system_events: HashSet::new(),
        }
    }

    /// Name of the system being registered.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name
    }

    /// Dependencies collected so far.
    #[must_use]
    pub fn dependencies(&self) -> &Dependencies {
        &self.dependencies
    }

    pub(crate) fn into_dependencies(self) -> Dependencies {
        self.dependencies
    }

    fn add_components(&mut self, components: &Bitmap) {
        self.dependencies.components.union_with(components);
    }

    /// Exact-match search over `Q`.
    ///
    /// # Errors
    ///
    /// Fails if a component cannot be registered.
    pub fn exact<Q: ComponentSet>(&mut self) -> EcsResult<Exact<Q>> {
        let search = Search::new(self.state)?;
        self.add_components(search.components());
        Ok(search)
    }

    /// Contains-match search over `Q`.
    ///
    /// # Errors
    ///
    /// Fails if a component cannot be registered.
    pub fn contains<Q: ComponentSet>(&mut self) -> EcsResult<Contains<Q>> {
        let search = Search::new(self.state)?;
        self.add_components(search.components());
        Ok(search)
    }

    /// Single-component access on arbitrary entities.
    ///
    /// # Errors
    ///
    /// Fails if the component cannot be registered.
    pub fn component<T: Component>(&mut self) -> EcsResult<Single<T>> {
        let single = Single::new(self.state)?;
        let id = self.state.read().registry().id::<T>()?;
        self.dependencies.components.set(id);
        Ok(single)
    }

    /// Emitter for a system-event type.
    ///
    /// # Errors
    ///
    /// [`EcsError::DuplicateSystemField`] if the system already declared `E`.
    pub fn system_event_emitter<E: SystemEvent>(&mut self) -> EcsResult<SystemEventEmitter<E>> {
        claim(&mut self.seen_system_events, self.name, "system event", E::NAME)?;
        let id = self.system_events.register::<E>()?;
        self.dependencies.system_events.set(id);
        self.system_events.emitter::<E>()
    }

    /// Receiver for a system-event type.
    ///
    /// # Errors
    ///
    /// [`EcsError::DuplicateSystemField`] if the system already declared `E`.
    pub fn system_event_receiver<E: SystemEvent>(&mut self) -> EcsResult<SystemEventReceiver<E>> {
        claim(&mut self.seen_system_events, self.name, "system event", E::NAME)?;
        let id = self.system_events.register::<E>()?;
        self.dependencies.system_events.set(id);
        self.system_events.receiver::<E>()
    }

    /// Reader over this tick's commands of type `C`.
    ///
    /// # Errors
    ///
    /// [`EcsError::DuplicateSystemField`] if the system already declared `C`.
    pub fn commands<C: Command>(&mut self) -> EcsResult<CommandReader<C>> {
        claim(&mut self.seen_commands, self.name, "command", C::NAME)?;
        self.commands
            .reader::<C>()
            .map_err(|e| EcsError::RegistrationRejected {
                name: C::NAME.to_string(),
                reason: e.to_string(),
            })
    }

    /// Emitter for outbound events of type `E`.
    ///
    /// # Errors
    ///
    /// [`EcsError::DuplicateSystemField`] if the system already declared `E`.
    pub fn event_emitter<E: Event>(&mut self) -> EcsResult<EventEmitter<E>> {
        claim(&mut self.seen_events, self.name, "event", E::NAME)?;
        Ok(EventEmitter::new(self.events))
    }

    /// Marks the system as creating or destroying entities, or adding or
    /// removing components. Structural systems never run concurrently with
    /// each other, which keeps entity IDs and row order identical on
    /// every replica.
    pub fn structural(&mut self) {
        self.dependencies.structural = true;
    }
}
