//! # Components
//!
//! Components are plain data records attached to entities. Each type is
//! identified by its `NAME`, which is both the registration key and the
//! tag used in snapshots and query rows.
//!
//! ## Registry
//!
//! The registry hands out dense numeric IDs in registration order. The
//! same name always yields the same ID; a different Rust type under an
//! existing name is rejected.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::column::{AnyColumn, Column};
use crate::error::{EcsError, EcsResult};

/// Numeric component ID, dense from 0.
pub type ComponentId = u32;

/// Highest assignable component ID. Registration past it is an engine bug.
pub const MAX_COMPONENT_ID: ComponentId = u32::MAX - 2;

/// Marker trait for component types.
///
/// Components serialize through serde. Map-typed fields should use
/// ordered maps so the snapshot bytes, and therefore the state hash, are
/// identical across replicas.
pub trait Component:
    Serialize + DeserializeOwned + Clone + Default + PartialEq + Debug + Send + Sync + 'static
{
    /// Registration key and wire tag.
    const NAME: &'static str;
}

/// Identity of a registered component, passed to registration callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComponentDescriptor {
    /// Assigned ID.
    pub id: ComponentId,
    /// Registered name.
    pub name: &'static str,
}

/// Callback invoked once per newly registered component.
pub type RegisterCallback = Box<dyn Fn(ComponentDescriptor) -> Result<(), String> + Send + Sync>;

struct ComponentInfo {
    name: &'static str,
    type_id: TypeId,
    new_column: fn() -> Box<dyn AnyColumn>,
}

fn column_factory<T: Component>() -> Box<dyn AnyColumn> {
    Box::new(Column::<T>::new())
}

/// Name to ID bijection plus a column factory per ID.
#[derive(Default)]
pub struct ComponentRegistry {
    catalog: HashMap<&'static str, ComponentId>,
    infos: Vec<ComponentInfo>,
    on_register: Option<RegisterCallback>,
}

impl ComponentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the callback run for every new registration.
    pub fn set_on_register(&mut self, callback: RegisterCallback) {
        self.on_register = Some(callback);
    }

    /// Registers `T`, or returns its existing ID.
    ///
    /// # Errors
    ///
    /// - [`EcsError::ComponentTypeMismatch`] if `T::NAME` belongs to another type
    /// - [`EcsError::RegistrationRejected`] if the callback refuses the component
    ///
    /// # Panics
    ///
    /// Panics when the ID space is exhausted.
    pub fn register<T: Component>(&mut self) -> EcsResult<ComponentId> {
        if let Some(&id) = self.catalog.get(T::NAME) {
            if self.infos[id as usize].type_id != TypeId::of::<T>() {
                return Err(EcsError::ComponentTypeMismatch {
                    name: T::NAME.to_string(),
                });
            }
            return Ok(id);
        }

        let id = ComponentId::try_from(self.infos.len()).unwrap_or(ComponentId::MAX);
        assert!(id <= MAX_COMPONENT_ID, "component registration ceiling exceeded");

        if let Some(callback) = &self.on_register {
            callback(ComponentDescriptor { id, name: T::NAME }).map_err(|reason| {
                EcsError::RegistrationRejected {
                    name: T::NAME.to_string(),
                    reason,
                }
            })?;
        }

        self.catalog.insert(T::NAME, id);
        self.infos.push(ComponentInfo {
            name: T::NAME,
            type_id: TypeId::of::<T>(),
            new_column: column_factory::<T>,
        });
        tracing::debug!(component = T::NAME, id, "registered component");
        Ok(id)
    }

    /// ID of an already registered `T`.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::ComponentNotRegistered`] if `T` was never registered,
    /// or [`EcsError::ComponentTypeMismatch`] if the name belongs to another type.
    pub fn id<T: Component>(&self) -> EcsResult<ComponentId> {
        let id = self
            .id_of(T::NAME)
            .ok_or_else(|| EcsError::ComponentNotRegistered(T::NAME.to_string()))?;
        if self.infos[id as usize].type_id != TypeId::of::<T>() {
            return Err(EcsError::ComponentTypeMismatch {
                name: T::NAME.to_string(),
            });
        }
        Ok(id)
    }

    /// ID registered under a name.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<ComponentId> {
        self.catalog.get(name).copied()
    }

    /// Name registered under an ID.
    #[must_use]
    pub fn name(&self, id: ComponentId) -> Option<&'static str> {
        self.infos.get(id as usize).map(|info| info.name)
    }

    /// Creates an empty column for a registered ID.
    #[must_use]
    pub fn new_column(&self, id: ComponentId) -> Option<Box<dyn AnyColumn>> {
        self.infos.get(id as usize).map(|info| (info.new_column)())
    }

    /// Registered names in ID order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.infos.iter().map(|info| info.name)
    }

    /// Number of registered components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// True if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("components", &self.names().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Health(u32);
    impl Component for Health {
        const NAME: &'static str = "health";
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Mana(u32);
    impl Component for Mana {
        const NAME: &'static str = "mana";
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct FakeHealth(i8);
    impl Component for FakeHealth {
        const NAME: &'static str = "health";
    }

    #[test]
    fn test_registration_is_idempotent() {
        let mut registry = ComponentRegistry::new();
        let health = registry.register::<Health>().unwrap();
        let mana = registry.register::<Mana>().unwrap();
        assert_eq!((health, mana), (0, 1));
        assert_eq!(registry.register::<Health>().unwrap(), health);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.id_of("mana"), Some(1));
        assert_eq!(registry.name(0), Some("health"));
    }

    #[test]
    fn test_name_collision_rejected() {
        let mut registry = ComponentRegistry::new();
        registry.register::<Health>().unwrap();
        assert!(matches!(
            registry.register::<FakeHealth>(),
            Err(EcsError::ComponentTypeMismatch { .. })
        ));
        assert!(registry.id::<FakeHealth>().is_err());
    }

    #[test]
    fn test_callback_runs_once_per_component() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut registry = ComponentRegistry::new();
        registry.set_on_register(Box::new(move |desc| {
            seen.fetch_add(1, Ordering::SeqCst);
            if desc.name == "mana" {
                Err("mana disabled".to_string())
            } else {
                Ok(())
            }
        }));

        registry.register::<Health>().unwrap();
        registry.register::<Health>().unwrap();
        assert!(registry.register::<Mana>().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.id_of("mana"), None);
    }

    #[test]
    fn test_unregistered_lookup() {
        let registry = ComponentRegistry::new();
        assert_eq!(
            registry.id::<Health>(),
            Err(EcsError::ComponentNotRegistered("health".to_string()))
        );
        assert!(registry.new_column(0).is_none());
    }
}
