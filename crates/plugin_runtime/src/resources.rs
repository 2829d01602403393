//! Plugin-Owned Resources
//!
//! A handler that starts something long-lived (an automation session, a
//! subprocess, a remote job) hands it to its context with
//! [`PluginContext::hold_resource`](crate::PluginContext::hold_resource).
//! The executor cleans it up when the invocation ends, and a `cancel` control
//! command can pause, stop and close every held resource early.
//!
//! Whoever removes a resource from [`ActiveResources`] first is the one that
//! closes it, so a resource is never cleaned up twice.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{ResourceError, ResourceResult};

// ─────────────────────────────────────────────────────────────────────────────
// Owned Resource
// ─────────────────────────────────────────────────────────────────────────────

/// A disposable resource held by a running plugin
#[async_trait]
pub trait OwnedResource: Send + Sync {
    /// Name used in logs
    fn label(&self) -> String;

    /// Ask the resource to pause its current work
    async fn pause(&self) -> ResourceResult<()> {
        Ok(())
    }

    /// Ask the resource to stop its current work
    async fn stop(&self) -> ResourceResult<()> {
        Ok(())
    }

    /// Release the resource
    async fn cleanup(&self) -> ResourceResult<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Active Resources
// ─────────────────────────────────────────────────────────────────────────────

/// Timing for the cancellation sequence
#[derive(Debug, Clone, Copy)]
pub struct CancelPolicy {
    /// Delay after pausing and again after stopping
    pub grace: Duration,
    /// Upper bound for each individual pause/stop/cleanup call
    pub step_timeout: Duration,
}

impl Default for CancelPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(500),
            step_timeout: Duration::from_secs(5),
        }
    }
}

/// Summary of a cancellation pass
#[derive(Debug, Default)]
pub struct CancelReport {
    pub resources: usize,
    pub failures: Vec<ResourceError>,
}

/// Every resource currently held by a running plugin
#[derive(Default)]
pub struct ActiveResources {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Arc<dyn OwnedResource>>>,
}

impl ActiveResources {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, resource: Arc<dyn OwnedResource>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(id, resource);
        id
    }

    fn remove(&self, id: u64) -> Option<Arc<dyn OwnedResource>> {
        self.entries.lock().remove(&id)
    }

    fn take_all(&self) -> Vec<Arc<dyn OwnedResource>> {
        let mut entries = self.entries.lock();
        let mut taken: Vec<(u64, Arc<dyn OwnedResource>)> = entries.drain().collect();
        taken.sort_by_key(|(id, _)| *id);
        taken.into_iter().map(|(_, resource)| resource).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Pause, wait, stop, wait, then clean up every held resource
    ///
    /// Each step runs for every resource even if earlier steps failed. With
    /// nothing held this returns immediately.
    pub async fn cancel_all(&self, policy: CancelPolicy) -> CancelReport {
        let resources = self.take_all();
        let mut report = CancelReport {
            resources: resources.len(),
            failures: Vec::new(),
        };

        if resources.is_empty() {
            tracing::debug!("Cancel requested with no active resources");
            return report;
        }

        tracing::info!("Cancelling {} active resource(s)", resources.len());

        for resource in &resources {
            if let Err(e) = bounded(resource.as_ref(), "pause", policy.step_timeout, resource.pause()).await {
                report.failures.push(e);
            }
        }
        tokio::time::sleep(policy.grace).await;

        for resource in &resources {
            if let Err(e) = bounded(resource.as_ref(), "stop", policy.step_timeout, resource.stop()).await {
                report.failures.push(e);
            }
        }
        tokio::time::sleep(policy.grace).await;

        for resource in &resources {
            if let Err(e) = bounded(resource.as_ref(), "cleanup", policy.step_timeout, resource.cleanup()).await {
                report.failures.push(e);
            }
        }

        report
    }
}

/// Run one resource step with a timeout, logging failures
async fn bounded<F>(
    resource: &dyn OwnedResource,
    operation: &'static str,
    limit: Duration,
    step: F,
) -> ResourceResult<()>
where
    F: Future<Output = ResourceResult<()>>,
{
    let result = match tokio::time::timeout(limit, step).await {
        Ok(result) => result,
        Err(_) => Err(ResourceError::Timeout {
            resource: resource.label(),
            operation,
        }),
    };

    if let Err(e) = &result {
        tracing::warn!(resource = %resource.label(), error = %e, "Resource {} failed", operation);
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Resource Scope
// ─────────────────────────────────────────────────────────────────────────────

/// Resources held by one invocation
pub struct ResourceScope {
    active: Arc<ActiveResources>,
    held: Mutex<Vec<u64>>,
}

impl ResourceScope {
    pub fn new(active: Arc<ActiveResources>) -> Self {
        Self {
            active,
            held: Mutex::new(Vec::new()),
        }
    }

    /// Take ownership of a resource for the rest of the invocation
    pub fn hold(&self, resource: Arc<dyn OwnedResource>) {
        tracing::debug!("Holding resource {}", resource.label());
        let id = self.active.insert(resource);
        self.held.lock().push(id);
    }

    pub fn is_empty(&self) -> bool {
        self.held.lock().is_empty()
    }

    /// Clean up everything this invocation still holds
    ///
    /// Resources already taken by a cancellation pass are skipped.
    pub async fn release_all(&self, step_timeout: Duration) -> Vec<ResourceError> {
        let ids: Vec<u64> = std::mem::take(&mut *self.held.lock());
        let mut failures = Vec::new();

        for id in ids {
            let Some(resource) = self.active.remove(id) else {
                continue;
            };
            if let Err(e) = bounded(resource.as_ref(), "cleanup", step_timeout, resource.cleanup()).await {
                failures.push(e);
            }
        }

        failures
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Resource that records the calls made on it
    pub struct TracedResource {
        pub name: String,
        pub calls: Arc<Mutex<Vec<String>>>,
        pub fail_on: Option<&'static str>,
    }

    impl TracedResource {
        pub fn new(name: &str, calls: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                calls,
                fail_on: None,
            }
        }

        fn record(&self, op: &'static str) -> ResourceResult<()> {
            self.calls.lock().push(format!("{}:{}", self.name, op));
            if self.fail_on == Some(op) {
                return Err(ResourceError::Failed {
                    resource: self.name.clone(),
                    operation: op,
                    message: "refused".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl OwnedResource for TracedResource {
        fn label(&self) -> String {
            self.name.clone()
        }

        async fn pause(&self) -> ResourceResult<()> {
            self.record("pause")
        }

        async fn stop(&self) -> ResourceResult<()> {
            self.record("stop")
        }

        async fn cleanup(&self) -> ResourceResult<()> {
            self.record("cleanup")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::TracedResource;
    use super::*;

    fn quick() -> CancelPolicy {
        CancelPolicy {
            grace: Duration::from_millis(5),
            step_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_cancel_with_nothing_active_is_noop() {
        let active = ActiveResources::new();
        let report = active.cancel_all(quick()).await;
        assert_eq!(report.resources, 0);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_runs_steps_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(ActiveResources::new());
        let scope = ResourceScope::new(active.clone());
        scope.hold(Arc::new(TracedResource::new("session", calls.clone())));

        let report = active.cancel_all(quick()).await;
        assert_eq!(report.resources, 1);
        assert!(report.failures.is_empty());
        assert_eq!(
            calls.lock().as_slice(),
            &["session:pause", "session:stop", "session:cleanup"]
        );
        assert!(active.is_empty());

        // The owning invocation finishing later does not clean up twice
        assert!(scope.release_all(Duration::from_millis(200)).await.is_empty());
        assert_eq!(calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_step_does_not_block_later_steps() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(ActiveResources::new());
        let scope = ResourceScope::new(active.clone());

        let mut stubborn = TracedResource::new("stubborn", calls.clone());
        stubborn.fail_on = Some("pause");
        scope.hold(Arc::new(stubborn));

        let report = active.cancel_all(quick()).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(
            calls.lock().as_slice(),
            &["stubborn:pause", "stubborn:stop", "stubborn:cleanup"]
        );
    }

    #[tokio::test]
    async fn test_scope_release_cleans_up_held() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(ActiveResources::new());
        let scope = ResourceScope::new(active.clone());
        scope.hold(Arc::new(TracedResource::new("a", calls.clone())));
        scope.hold(Arc::new(TracedResource::new("b", calls.clone())));
        assert_eq!(active.len(), 2);

        let failures = scope.release_all(Duration::from_millis(200)).await;
        assert!(failures.is_empty());
        assert!(active.is_empty());
        assert!(scope.is_empty());
        assert_eq!(calls.lock().as_slice(), &["a:cleanup", "b:cleanup"]);
    }
}
