//! Service Discovery
//!
//! Scans a directory for `<name>_service.js` files and registers each one as a
//! script service named `<name>`.

use std::path::Path;
use std::sync::Arc;

use crate::registry::ServiceRegistry;
use crate::services::ScriptService;

pub const SERVICE_FILE_SUFFIX: &str = "_service.js";

/// Outcome of one discovery scan
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Newly registered service names
    pub registered: Vec<String>,
    /// Names that were already registered and left alone
    pub skipped: Vec<String>,
    /// Files that failed to load, with the reason
    pub failed: Vec<(String, String)>,
}

impl DiscoveryReport {
    /// Number of newly registered services
    pub fn count(&self) -> usize {
        self.registered.len()
    }
}

/// Service name for a discovery file, if it is one
pub fn service_name_for(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    let name = file_name.strip_suffix(SERVICE_FILE_SUFFIX)?;
    (!name.is_empty()).then(|| name.to_string())
}

/// Register every service file in `dir` whose name is not yet taken
pub fn discover_services(registry: &ServiceRegistry, dir: &Path) -> std::io::Result<DiscoveryReport> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    let mut report = DiscoveryReport::default();

    for path in paths {
        let Some(name) = service_name_for(&path) else {
            continue;
        };

        if registry.has(&name) {
            tracing::debug!("Service {} already registered, skipping {}", name, path.display());
            report.skipped.push(name);
            continue;
        }

        match ScriptService::from_file(name.clone(), &path) {
            Ok(service) => {
                registry.register(name.clone(), Arc::new(service));
                report.registered.push(name);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to load service");
                report.failed.push((name, e.to_string()));
            }
        }
    }

    tracing::info!(
        "Discovered {} services in {} ({} skipped, {} failed)",
        report.count(),
        dir.display(),
        report.skipped.len(),
        report.failed.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn test_service_name_for() {
        assert_eq!(
            service_name_for(&PathBuf::from("services/weather_service.js")),
            Some("weather".to_string())
        );
        assert_eq!(service_name_for(&PathBuf::from("services/_service.js")), None);
        assert_eq!(service_name_for(&PathBuf::from("services/helper.js")), None);
    }

    #[test]
    fn test_discover_registers_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("weather_service.js"),
            "var service = { forecast() { return 'sunny'; } };",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a service").unwrap();

        let registry = ServiceRegistry::new();
        let first = discover_services(&registry, dir.path()).unwrap();
        assert_eq!(first.count(), 1);
        assert_eq!(first.registered, vec!["weather".to_string()]);
        assert_eq!(registry.call("weather", "forecast", &[]).unwrap(), json!("sunny"));

        let second = discover_services(&registry, dir.path()).unwrap();
        assert_eq!(second.count(), 0);
        assert_eq!(second.skipped, vec!["weather".to_string()]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_malformed_service_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken_service.js"), "var nothing = 1;").unwrap();

        let registry = ServiceRegistry::new();
        let report = discover_services(&registry, dir.path()).unwrap();
        assert_eq!(report.count(), 0);
        assert_eq!(report.failed.len(), 1);
        assert!(!registry.has("broken"));
    }

    #[test]
    fn test_endless_service_file_does_not_stall_the_scan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("spin_service.js"), "while (true) {}").unwrap();
        std::fs::write(
            dir.path().join("weather_service.js"),
            "var service = { forecast() { return 'sunny'; } };",
        )
        .unwrap();

        let registry = ServiceRegistry::new();
        let report = discover_services(&registry, dir.path()).unwrap();
        assert_eq!(report.registered, vec!["weather".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "spin");
        assert!(!registry.has("spin"));
    }

    #[test]
    fn test_missing_directory_is_error() {
        let registry = ServiceRegistry::new();
        assert!(discover_services(&registry, Path::new("/definitely/not/here")).is_err());
    }
}
