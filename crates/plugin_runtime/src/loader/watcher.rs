//! Plugin File Watcher
//!
//! Evicts cached script plugins as soon as their file changes, so the next
//! dispatch reads the new source even when the filesystem's mtime
//! resolution would hide the edit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use super::{PluginLoader, SCRIPT_HANDLER_SUFFIX};

/// Watches the plugins directory while alive
pub struct PluginWatcher {
    plugins_path: PathBuf,
    /// The underlying watcher (kept alive)
    _watcher: RecommendedWatcher,
}

impl PluginWatcher {
    pub fn start(loader: Arc<PluginLoader>) -> Result<Self, notify::Error> {
        let plugins_path = loader.plugins_path().to_path_buf();
        let callback_loader = loader.clone();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    for path in changed_scripts(&event) {
                        // Cache keys are the paths the loader joined, not canonical ones
                        let key = callback_loader.plugins_path().join(path.file_name().unwrap_or_default());
                        if callback_loader.evict(&key) {
                            tracing::info!("Plugin changed on disk: {}", key.display());
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Plugin watcher error: {}", e);
                }
            }
        })?;

        watcher.watch(&plugins_path, RecursiveMode::NonRecursive)?;
        tracing::info!("Watching plugin directory: {}", plugins_path.display());

        Ok(Self {
            plugins_path,
            _watcher: watcher,
        })
    }

    pub fn plugins_path(&self) -> &Path {
        &self.plugins_path
    }
}

fn changed_scripts(event: &Event) -> Vec<&Path> {
    match event.kind {
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_) => {}
        _ => return Vec::new(),
    }

    event
        .paths
        .iter()
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(SCRIPT_HANDLER_SUFFIX))
        })
        .map(PathBuf::as_path)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind};

    #[test]
    fn test_changed_scripts_filters_kind_and_suffix() {
        let created = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/p/echo_handler.js"))
            .add_path(PathBuf::from("/p/readme.md"));
        assert_eq!(changed_scripts(&created), vec![Path::new("/p/echo_handler.js")]);

        let accessed = Event::new(EventKind::Access(AccessKind::Any))
            .add_path(PathBuf::from("/p/echo_handler.js"));
        assert!(changed_scripts(&accessed).is_empty());
    }

    #[test]
    fn test_start_on_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(PluginLoader::new(dir.path()));
        let watcher = PluginWatcher::start(loader).unwrap();
        assert_eq!(watcher.plugins_path(), dir.path());
    }
}
