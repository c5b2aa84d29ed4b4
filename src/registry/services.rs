//! Type-keyed service container handed to scope factories and activators.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::transaction::{ScopeError, ScopeResult};

/// Shared services, one instance per type.
///
/// Cloning is cheap; inserting into a clone does not affect the original.
#[derive(Clone, Default)]
pub struct Services {
    entries: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Services {
    /// Empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the service of type `T`.
    pub fn insert<T: Send + Sync + 'static>(&mut self, service: T) {
        Arc::make_mut(&mut self.entries).insert(TypeId::of::<T>(), Arc::new(service));
    }

    /// Look up the service of type `T`.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|entry| entry.downcast::<T>().ok())
    }

    /// Look up the service of type `T`, failing if it was never inserted.
    pub fn require<T: Send + Sync + 'static>(&self) -> ScopeResult<Arc<T>> {
        self.get::<T>()
            .ok_or(ScopeError::MissingService(type_name::<T>()))
    }

    /// Check whether a service of type `T` is present.
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    /// Number of services.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no services.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").field("len", &self.len()).finish()
    }
}
