//! Service Registry
//!
//! Named services that plugins depend on. Lookups are read-mostly; writes only
//! happen at startup and during discovery, so the map sits behind a
//! readers-writer lock.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{ServiceError, ServiceResult};
use crate::outbound::{OutboundSink, OutboundSlot};

// ─────────────────────────────────────────────────────────────────────────────
// Service Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Upcast helper so registered services can be downcast back to their type
pub trait AsAnyArc {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAnyArc for T {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A named dependency that plugins can use
///
/// Native plugins usually downcast to the concrete type with
/// [`PluginContext::get_as`](crate::PluginContext::get_as). Script plugins go
/// through [`Service::call`] with JSON arguments.
pub trait Service: AsAnyArc + Send + Sync + 'static {
    /// Short description used in logs and `/discover` output
    fn kind(&self) -> &str;

    /// Hook called when the transport becomes available
    fn attach_outbound(&self, _sink: Arc<dyn OutboundSink>) {}

    /// Invoke a method with JSON arguments
    fn call(&self, method: &str, args: &[Value]) -> ServiceResult<Value>;
}

/// Downcast a type-erased service
pub fn downcast_service<T: Service>(service: Arc<dyn Service>) -> Option<Arc<T>> {
    service.into_any_arc().downcast::<T>().ok()
}

/// Construction input handed to service factories
#[derive(Clone)]
pub struct ServiceInit {
    /// Name the service is being registered under
    pub name: String,
    /// Transport, if one is attached to the registry
    pub outbound: Option<Arc<dyn OutboundSink>>,
    /// Extra constructor arguments
    pub options: Value,
}

impl ServiceInit {
    /// An outbound slot pre-filled with the registry's transport
    pub fn outbound_slot(&self) -> OutboundSlot {
        let slot = OutboundSlot::new();
        if let Some(sink) = &self.outbound {
            slot.attach(sink.clone());
        }
        slot
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolved Dependencies
// ─────────────────────────────────────────────────────────────────────────────

/// The outcome of resolving a plugin's declared dependency names
///
/// Missing names are left out of `services` rather than mapped to a
/// placeholder.
#[derive(Default, Clone)]
pub struct ResolvedDependencies {
    pub services: HashMap<String, Arc<dyn Service>>,
    pub missing: Vec<String>,
}

impl ResolvedDependencies {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Registry of named services
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<dyn Service>>>,
    outbound: OutboundSlot,
}

impl ServiceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the transport and pass it on to every registered service
    pub fn set_outbound(&self, sink: Arc<dyn OutboundSink>) {
        self.outbound.attach(sink.clone());
        for service in self.services.read().values() {
            service.attach_outbound(sink.clone());
        }
    }

    /// Register an existing instance
    ///
    /// The instance gets the transport through `attach_outbound` if one is
    /// attached. Re-registering a name replaces the previous service.
    pub fn register<S: Service>(&self, name: impl Into<String>, service: Arc<S>) -> Arc<S> {
        let name = name.into();
        if let Some(sink) = self.outbound.get() {
            service.attach_outbound(sink);
        }
        self.insert(name, service.clone());
        service
    }

    /// Register a service built by `factory`, which receives the transport and
    /// `options`
    pub fn register_factory<S, F>(&self, name: impl Into<String>, options: Value, factory: F) -> Arc<S>
    where
        S: Service,
        F: FnOnce(ServiceInit) -> S,
    {
        let name = name.into();
        let init = ServiceInit {
            name: name.clone(),
            outbound: self.outbound.get(),
            options,
        };
        let service = Arc::new(factory(init));
        self.insert(name, service.clone());
        service
    }

    fn insert(&self, name: String, service: Arc<dyn Service>) {
        let kind = service.kind().to_string();
        let previous = self.services.write().insert(name.clone(), service);
        match previous {
            Some(_) => tracing::info!("Replaced service: {} ({})", name, kind),
            None => tracing::info!("Registered service: {} ({})", name, kind),
        }
    }

    /// Look up a service by name
    pub fn get(&self, name: &str) -> ServiceResult<Arc<dyn Service>> {
        self.services
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }

    /// Look up a service and downcast it to its concrete type
    pub fn get_as<T: Service>(&self, name: &str) -> ServiceResult<Arc<T>> {
        let service = self.get(name)?;
        downcast_service::<T>(service).ok_or_else(|| ServiceError::TypeMismatch {
            service: name.to_string(),
        })
    }

    pub fn has(&self, name: &str) -> bool {
        self.services.read().contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }

    /// Call a method on a named service
    pub fn call(&self, name: &str, method: &str, args: &[Value]) -> ServiceResult<Value> {
        self.get(name)?.call(method, args)
    }

    /// Resolve a list of dependency names in one read
    pub fn resolve(&self, names: &[String]) -> ResolvedDependencies {
        let services = self.services.read();
        let mut resolved = ResolvedDependencies::default();

        for name in names {
            match services.get(name) {
                Some(service) => {
                    resolved.services.insert(name.clone(), service.clone());
                }
                None => resolved.missing.push(name.clone()),
            }
        }

        resolved
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .finish()
    }
}
