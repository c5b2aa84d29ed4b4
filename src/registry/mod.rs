//! Named scope registration.
//!
//! Applications register scope factories once, by name, and hand out a
//! [`ScopeResolver`] per unit of work (a request, a job). A resolver builds
//! each named scope lazily on first use and returns that same instance for
//! every later lookup; separate resolvers never share instances.
//!
//! ```ignore
//! let mut registry = ScopeRegistry::new();
//! registry.insert_service(AppConfig::load()?);
//! registry.register_default(|services| {
//!     let config = services.require::<AppConfig>()?;
//!     TransactionScope::new(
//!         SqliteProvider::new(),
//!         TransactionScopeOptions::new().connection_string(&config.database),
//!     )
//! });
//!
//! let resolver = registry.resolver();
//! let scope = resolver.resolve_default::<SqliteProvider>()?;
//! ```

mod services;

pub use services::Services;

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::provider::StoreProvider;
use crate::transaction::{ScopeError, ScopeResult, TransactionScope};

/// Name used by [`ScopeRegistry::register_default`].
pub const DEFAULT_SCOPE: &str = "default";

type SharedScope = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&Services) -> ScopeResult<SharedScope> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    provider: &'static str,
    factory: Factory,
}

/// Scope factories and the services they are built with.
#[derive(Clone, Default)]
pub struct ScopeRegistry {
    registrations: Arc<HashMap<String, Registration>>,
    services: Services,
}

impl ScopeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scope factory under `name`, replacing an earlier one.
    pub fn register<P, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        P: StoreProvider,
        F: Fn(&Services) -> ScopeResult<TransactionScope<P>> + Send + Sync + 'static,
    {
        let name = name.into();
        let factory: Factory = Arc::new(move |services: &Services| {
            let scope = factory(services)?.with_services(services.clone());
            Ok(Arc::new(scope) as SharedScope)
        });

        debug!(target: "txscope::registry", name = %name, provider = type_name::<P>(), "Scope registered");
        Arc::make_mut(&mut self.registrations).insert(
            name,
            Registration {
                provider: type_name::<P>(),
                factory,
            },
        );
        self
    }

    /// Register the factory of the default scope.
    pub fn register_default<P, F>(&mut self, factory: F) -> &mut Self
    where
        P: StoreProvider,
        F: Fn(&Services) -> ScopeResult<TransactionScope<P>> + Send + Sync + 'static,
    {
        self.register(DEFAULT_SCOPE, factory)
    }

    /// Make a service available to factories and activators.
    pub fn insert_service<T: Send + Sync + 'static>(&mut self, service: T) -> &mut Self {
        self.services.insert(service);
        self
    }

    /// Check whether a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.registrations.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registrations.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered services.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Create a resolver over a snapshot of the current registrations.
    pub fn resolver(&self) -> ScopeResolver {
        ScopeResolver {
            registrations: Arc::clone(&self.registrations),
            services: self.services.clone(),
            instances: Mutex::new(HashMap::new()),
        }
    }
}

impl fmt::Debug for ScopeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeRegistry")
            .field("names", &self.names())
            .field("services", &self.services)
            .finish()
    }
}

/// Lazily built, cached scopes of one unit of work.
///
/// Dropping the resolver drops its scopes; a scope nobody else holds is
/// disposed at that point.
pub struct ScopeResolver {
    registrations: Arc<HashMap<String, Registration>>,
    services: Services,
    instances: Mutex<HashMap<String, SharedScope>>,
}

impl ScopeResolver {
    /// Get the scope registered under `name`, building it on first use.
    pub fn resolve<P: StoreProvider>(&self, name: &str) -> ScopeResult<Arc<TransactionScope<P>>> {
        let mut instances = self.instances.lock();

        let shared = match instances.get(name) {
            Some(existing) => Arc::clone(existing),
            None => {
                let registration = self
                    .registrations
                    .get(name)
                    .ok_or_else(|| ScopeError::UnknownScope(name.to_string()))?;
                if registration.provider != type_name::<P>() {
                    return Err(mismatch::<P>(name));
                }

                let created = (registration.factory)(&self.services)?;
                debug!(target: "txscope::registry", name, "Scope resolved");
                instances.insert(name.to_string(), Arc::clone(&created));
                created
            }
        };

        shared
            .downcast::<TransactionScope<P>>()
            .map_err(|_| mismatch::<P>(name))
    }

    /// Get the default scope.
    pub fn resolve_default<P: StoreProvider>(&self) -> ScopeResult<Arc<TransactionScope<P>>> {
        self.resolve(DEFAULT_SCOPE)
    }

    /// Check whether the scope `name` was already built by this resolver.
    pub fn is_resolved(&self, name: &str) -> bool {
        self.instances.lock().contains_key(name)
    }

    /// Services shared with factories and activators.
    pub fn services(&self) -> &Services {
        &self.services
    }
}

impl fmt::Debug for ScopeResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut resolved: Vec<String> = self.instances.lock().keys().cloned().collect();
        resolved.sort();
        f.debug_struct("ScopeResolver")
            .field("resolved", &resolved)
            .finish()
    }
}

fn mismatch<P: StoreProvider>(name: &str) -> ScopeError {
    ScopeError::ScopeTypeMismatch {
        name: name.to_string(),
        expected: type_name::<P>(),
    }
}
