//! Runtime Errors

use std::path::PathBuf;

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised while resolving or running a plugin
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("No plugin found for tag '{tag}' (tried: {})", tried.join(", "))]
    NotFound { tag: String, tried: Vec<String> },

    #[error("Failed to read plugin {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Script error in {name}: {message}")]
    Script { name: String, message: String },

    #[error("Plugin execution failed: {0}")]
    Execution(String),

    #[error("Plugin panicked: {0}")]
    Panicked(String),

    #[error("Failed to start plugin worker: {0}")]
    Spawn(#[source] std::io::Error),
}

impl PluginError {
    pub fn script(name: impl Into<String>, message: impl Into<String>) -> Self {
        PluginError::Script {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Check if this error means the tag has no handler
    pub fn is_not_found(&self) -> bool {
        matches!(self, PluginError::NotFound { .. })
    }
}

pub type RuntimeResult<T> = Result<T, PluginError>;

// ─────────────────────────────────────────────────────────────────────────────
// Service Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by the service registry and by service calls
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("Service not found: {0}")]
    NotFound(String),

    #[error("Service '{service}' has a different type than requested")]
    TypeMismatch { service: String },

    #[error("Service '{service}' does not support method '{method}'")]
    UnsupportedMethod { service: String, method: String },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Service call failed: {0}")]
    Failed(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

// ─────────────────────────────────────────────────────────────────────────────
// Resource Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by plugin-owned resources during pause/stop/cleanup
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResourceError {
    #[error("{operation} failed for {resource}: {message}")]
    Failed {
        resource: String,
        operation: &'static str,
        message: String,
    },

    #[error("{operation} timed out for {resource}")]
    Timeout {
        resource: String,
        operation: &'static str,
    },
}

pub type ResourceResult<T> = Result<T, ResourceError>;
