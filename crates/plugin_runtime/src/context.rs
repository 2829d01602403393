//! Plugin Context
//!
//! What a native handler receives next to the message: its resolved
//! dependencies and a place to register resources it owns.

use std::sync::Arc;

use plugin_types::ExecutionId;

use crate::registry::{ResolvedDependencies, Service, downcast_service};
use crate::resources::{ActiveResources, OwnedResource, ResourceScope};

struct ContextInner {
    plugin_name: String,
    execution_id: ExecutionId,
    dependencies: ResolvedDependencies,
    resources: ResourceScope,
}

/// Per-invocation capabilities handed to a plugin handler
///
/// Cheap to clone; clones share the same resource scope.
#[derive(Clone)]
pub struct PluginContext {
    inner: Arc<ContextInner>,
}

impl PluginContext {
    pub fn new(
        plugin_name: impl Into<String>,
        execution_id: ExecutionId,
        dependencies: ResolvedDependencies,
        active: Arc<ActiveResources>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                plugin_name: plugin_name.into(),
                execution_id,
                dependencies,
                resources: ResourceScope::new(active),
            }),
        }
    }

    pub fn plugin_name(&self) -> &str {
        &self.inner.plugin_name
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.inner.execution_id
    }

    /// A resolved dependency, or `None` if it was not declared or is missing
    pub fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.inner.dependencies.services.get(name).cloned()
    }

    /// A resolved dependency downcast to its concrete type
    pub fn get_as<T: Service>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name).and_then(downcast_service::<T>)
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.dependencies.services.contains_key(name)
    }

    pub fn dependency_names(&self) -> Vec<String> {
        self.inner.dependencies.names()
    }

    /// Declared dependencies that were not registered
    pub fn missing_dependencies(&self) -> &[String] {
        &self.inner.dependencies.missing
    }

    /// Hand a resource to the runtime
    ///
    /// It is cleaned up when the invocation ends, or earlier by a cancel
    /// control command.
    pub fn hold_resource(&self, resource: Arc<dyn OwnedResource>) {
        self.inner.resources.hold(resource);
    }

    pub(crate) fn resources(&self) -> &ResourceScope {
        &self.inner.resources
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_name", &self.inner.plugin_name)
            .field("execution_id", &self.inner.execution_id)
            .field("dependencies", &self.dependency_names())
            .finish()
    }
}
