//! Plugin Results
//!
//! The tuple a finished invocation pushes onto the result channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ExecutionId;

/// How an invocation ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "payload", rename_all = "lowercase")]
pub enum PluginOutcome {
    /// Handler returned normally with this text
    Completed(String),
    /// Handler or its setup failed; the text is the error description
    Failed(String),
}

impl PluginOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PluginOutcome::Completed(_))
    }

    /// The result text or error text
    pub fn payload(&self) -> &str {
        match self {
            PluginOutcome::Completed(text) | PluginOutcome::Failed(text) => text,
        }
    }
}

/// A finished invocation, produced by a worker and consumed by the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginResult {
    pub plugin_name: String,
    pub execution_id: ExecutionId,
    /// Channel of the message that triggered the invocation
    pub channel_id: String,
    pub outcome: PluginOutcome,
    pub finished_at: DateTime<Utc>,
}

impl PluginResult {
    pub fn new(
        plugin_name: impl Into<String>,
        execution_id: ExecutionId,
        channel_id: impl Into<String>,
        outcome: PluginOutcome,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            execution_id,
            channel_id: channel_id.into(),
            outcome,
            finished_at: Utc::now(),
        }
    }

    /// Text to show or forward: the result, or `Error: ...` for failures
    pub fn display_payload(&self) -> String {
        match &self.outcome {
            PluginOutcome::Completed(text) => text.clone(),
            PluginOutcome::Failed(error) => format!("Error: {}", error),
        }
    }
}
