//! Plugin Loader
//!
//! Resolves a message tag to something runnable:
//! 1. a script file `<plugins_path>/<tag>_handler.js`
//! 2. a native handler registered under `{namespace}.{tag}_handler`,
//!    `{tag}_handler` or `{tag}`, first match wins
//!
//! Script sources are cached by path. In development mode the file's
//! modification time is checked before every dispatch and a newer file is
//! re-read in place. Outside development mode a script is read once.

mod native;
mod watcher;

pub use native::*;
pub use watcher::*;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::{PluginError, RuntimeResult};

pub const SCRIPT_HANDLER_SUFFIX: &str = "_handler.js";

// ─────────────────────────────────────────────────────────────────────────────
// Resolver Interface
// ─────────────────────────────────────────────────────────────────────────────

/// A cached script source
#[derive(Debug, Clone)]
pub struct ScriptSource {
    pub path: PathBuf,
    pub source: Arc<str>,
    pub modified: Option<SystemTime>,
}

/// The runnable unit behind a tag
#[derive(Debug, Clone)]
pub enum PluginUnit {
    Native(NativePlugin),
    Script(ScriptSource),
}

/// A tag resolved to a handler
#[derive(Debug, Clone)]
pub struct ResolvedPlugin {
    /// Name used in execution records, e.g. `echo_handler`
    pub name: String,
    pub unit: PluginUnit,
}

impl ResolvedPlugin {
    /// Dependencies known before running; scripts declare theirs when evaluated
    pub fn declared_dependencies(&self) -> &[String] {
        match &self.unit {
            PluginUnit::Native(plugin) => &plugin.dependencies,
            PluginUnit::Script(_) => &[],
        }
    }
}

/// Result of a forced reload
#[derive(Debug, Default, Clone)]
pub struct ReloadReport {
    pub reloaded: usize,
    pub failed: Vec<(PathBuf, String)>,
}

/// Maps tags to handlers
pub trait PluginResolver: Send + Sync {
    fn resolve(&self, tag: &str) -> RuntimeResult<ResolvedPlugin>;

    /// Switch hot reloading on or off
    fn set_dev_mode(&self, _enabled: bool) {}

    fn is_dev_mode(&self) -> bool {
        false
    }

    /// Re-read every cached unit
    fn reload_all(&self) -> ReloadReport {
        ReloadReport::default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Loader
// ─────────────────────────────────────────────────────────────────────────────

/// File and handler-table backed resolver
pub struct PluginLoader {
    plugins_path: PathBuf,
    namespace: String,
    table: RwLock<HandlerTable>,
    cache: DashMap<PathBuf, ScriptSource>,
    dev_mode: AtomicBool,
}

impl PluginLoader {
    pub fn new(plugins_path: impl Into<PathBuf>) -> Self {
        let plugins_path = plugins_path.into();
        let namespace = plugins_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("plugins")
            .to_string();

        Self {
            plugins_path,
            namespace,
            table: RwLock::new(HandlerTable::new()),
            cache: DashMap::new(),
            dev_mode: AtomicBool::new(false),
        }
    }

    /// Builder: set the native handler table
    pub fn with_table(self, table: HandlerTable) -> Self {
        *self.table.write() = table;
        self
    }

    /// Builder: start in development mode
    pub fn with_dev_mode(self, enabled: bool) -> Self {
        self.dev_mode.store(enabled, Ordering::SeqCst);
        self
    }

    pub fn plugins_path(&self) -> &Path {
        &self.plugins_path
    }

    /// Add or replace a native handler at runtime
    pub fn register_native(&self, module_path: impl Into<String>, plugin: NativePlugin) {
        self.table.write().register(module_path, plugin);
    }

    /// Module-path candidates tried for `tag`, in order
    pub fn module_candidates(&self, tag: &str) -> [String; 3] {
        [
            format!("{}.{}_handler", self.namespace, tag),
            format!("{}_handler", tag),
            tag.to_string(),
        ]
    }

    pub fn script_path(&self, tag: &str) -> PathBuf {
        self.plugins_path.join(format!("{}{}", tag, SCRIPT_HANDLER_SUFFIX))
    }

    /// Drop a cached script so the next dispatch re-reads it
    pub fn evict(&self, path: &Path) -> bool {
        self.cache.remove(path).is_some()
    }

    pub fn cached_scripts(&self) -> usize {
        self.cache.len()
    }

    fn load_script(&self, path: &Path) -> RuntimeResult<ScriptSource> {
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        let cached = self.cache.get(path).map(|entry| entry.value().clone());

        if let Some(cached) = cached {
            if !self.is_dev_mode() || !is_newer(modified, cached.modified) {
                return Ok(cached);
            }
            tracing::info!("Hot reloading plugin {}", path.display());
        }

        let script = read_script(path, modified)?;
        self.cache.insert(path.to_path_buf(), script.clone());
        Ok(script)
    }
}

fn read_script(path: &Path, modified: Option<SystemTime>) -> RuntimeResult<ScriptSource> {
    let source = std::fs::read_to_string(path).map_err(|source| PluginError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!("Loaded plugin source {}", path.display());

    Ok(ScriptSource {
        path: path.to_path_buf(),
        source: Arc::from(source),
        modified,
    })
}

fn is_newer(current: Option<SystemTime>, cached: Option<SystemTime>) -> bool {
    match (current, cached) {
        (Some(current), Some(cached)) => current > cached,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl PluginResolver for PluginLoader {
    fn resolve(&self, tag: &str) -> RuntimeResult<ResolvedPlugin> {
        let candidates = self.module_candidates(tag);
        let script_path = self.script_path(tag);

        if !is_valid_tag(tag) {
            return Err(PluginError::NotFound {
                tag: tag.to_string(),
                tried: Vec::new(),
            });
        }

        if script_path.is_file() {
            let script = self.load_script(&script_path)?;
            return Ok(ResolvedPlugin {
                name: format!("{}_handler", tag),
                unit: PluginUnit::Script(script),
            });
        }

        let table = self.table.read();
        for candidate in &candidates {
            if let Some(plugin) = table.get(candidate) {
                tracing::debug!("Resolved tag {} to native handler {}", tag, candidate);
                return Ok(ResolvedPlugin {
                    name: format!("{}_handler", tag),
                    unit: PluginUnit::Native(plugin.clone()),
                });
            }
        }

        let mut tried = vec![script_path.display().to_string()];
        tried.extend(candidates);
        Err(PluginError::NotFound {
            tag: tag.to_string(),
            tried,
        })
    }

    fn set_dev_mode(&self, enabled: bool) {
        self.dev_mode.store(enabled, Ordering::SeqCst);
        tracing::info!(
            "Plugin loader in {} mode",
            if enabled { "development" } else { "production" }
        );
    }

    fn is_dev_mode(&self) -> bool {
        self.dev_mode.load(Ordering::SeqCst)
    }

    fn reload_all(&self) -> ReloadReport {
        let paths: Vec<PathBuf> = self.cache.iter().map(|entry| entry.key().clone()).collect();
        let mut report = ReloadReport::default();

        for path in paths {
            let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
            match read_script(&path, modified) {
                Ok(script) => {
                    self.cache.insert(path, script);
                    report.reloaded += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to reload plugin");
                    self.cache.remove(&path);
                    report.failed.push((path, e.to_string()));
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn bump_mtime(path: &Path, secs: u64) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(secs))
            .unwrap();
    }

    fn script_text(resolved: &ResolvedPlugin) -> String {
        match &resolved.unit {
            PluginUnit::Script(script) => script.source.to_string(),
            PluginUnit::Native(_) => panic!("expected a script"),
        }
    }

    fn ok_plugin() -> NativePlugin {
        NativePlugin::blocking(|_, _| Ok("native".to_string()))
    }

    #[test]
    fn test_script_file_wins_over_table() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "echo_handler.js", "// v1");

        let loader = PluginLoader::new(dir.path()).with_table(HandlerTable::with_builtins());
        let resolved = loader.resolve("echo").unwrap();
        assert_eq!(resolved.name, "echo_handler");
        assert_eq!(script_text(&resolved), "// v1");
    }

    #[test]
    fn test_candidate_order() {
        let dir = tempfile::tempdir().unwrap();
        let namespace = dir
            .path()
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        let loader = PluginLoader::new(dir.path()).with_table(
            HandlerTable::new()
                .with("weather", ok_plugin().with_dependencies(["bare"]))
                .with("weather_handler", ok_plugin().with_dependencies(["relative"]))
                .with(format!("{}.weather_handler", namespace), ok_plugin().with_dependencies(["namespaced"])),
        );

        let resolved = loader.resolve("weather").unwrap();
        assert_eq!(resolved.declared_dependencies(), &["namespaced".to_string()]);
    }

    #[test]
    fn test_bare_candidate_used_last() {
        let dir = tempfile::tempdir().unwrap();
        let loader = PluginLoader::new(dir.path())
            .with_table(HandlerTable::new().with("ping", ok_plugin()));
        assert!(matches!(loader.resolve("ping").unwrap().unit, PluginUnit::Native(_)));
    }

    #[test]
    fn test_not_found_lists_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let loader = PluginLoader::new(dir.path());

        let err = loader.resolve("nothing").unwrap_err();
        assert!(err.is_not_found());
        match err {
            PluginError::NotFound { tried, .. } => {
                assert_eq!(tried.len(), 4);
                assert!(tried[0].ends_with("nothing_handler.js"));
                assert_eq!(tried[2], "nothing_handler");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_rejects_path_like_tags() {
        let dir = tempfile::tempdir().unwrap();
        let loader = PluginLoader::new(dir.path());
        assert!(loader.resolve("../secret").unwrap_err().is_not_found());
        assert!(loader.resolve("").unwrap_err().is_not_found());
    }

    #[test]
    fn test_production_mode_caches_forever() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "echo_handler.js", "// v1");
        let loader = PluginLoader::new(dir.path());

        assert_eq!(script_text(&loader.resolve("echo").unwrap()), "// v1");

        std::fs::write(&path, "// v2").unwrap();
        bump_mtime(&path, 60);
        assert_eq!(script_text(&loader.resolve("echo").unwrap()), "// v1");
    }

    #[test]
    fn test_dev_mode_reloads_newer_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "echo_handler.js", "// v1");
        let loader = PluginLoader::new(dir.path()).with_dev_mode(true);

        assert_eq!(script_text(&loader.resolve("echo").unwrap()), "// v1");

        std::fs::write(&path, "// v2").unwrap();
        bump_mtime(&path, 60);
        assert_eq!(script_text(&loader.resolve("echo").unwrap()), "// v2");
        assert_eq!(loader.cached_scripts(), 1);
    }

    #[test]
    fn test_reload_all_and_evict() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "echo_handler.js", "// v1");
        write(dir.path(), "gone_handler.js", "// soon deleted");
        let loader = PluginLoader::new(dir.path());

        loader.resolve("echo").unwrap();
        loader.resolve("gone").unwrap();
        std::fs::remove_file(dir.path().join("gone_handler.js")).unwrap();
        std::fs::write(&path, "// v2").unwrap();

        let report = loader.reload_all();
        assert_eq!(report.reloaded, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(script_text(&loader.resolve("echo").unwrap()), "// v2");

        assert!(loader.evict(&path));
        assert_eq!(loader.cached_scripts(), 0);
    }

    #[test]
    fn test_dev_mode_toggle() {
        let loader = PluginLoader::new("plugins");
        assert!(!loader.is_dev_mode());
        loader.set_dev_mode(true);
        assert!(loader.is_dev_mode());
        assert_eq!(
            loader.module_candidates("echo"),
            [
                "plugins.echo_handler".to_string(),
                "echo_handler".to_string(),
                "echo".to_string()
            ]
        );
    }
}
