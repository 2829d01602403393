//! Bot State
//!
//! Connection and channel bookkeeping plus the plugin execution records.
//! Owned by the dispatcher and only mutated from its task.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};

use plugin_runtime::plugin_types::{
    ExecutionId, PluginExecutionRecord, PluginOutcome, PluginResult, PluginStats,
};

// ─────────────────────────────────────────────────────────────────────────────
// Connection State
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// What to tell the user after a failed connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAdvice {
    /// Attempts remain
    Retrying { attempt: u32, max: u32 },
    /// The limit is reached; only a manual reconnect helps
    Exhausted { max: u32 },
}

// ─────────────────────────────────────────────────────────────────────────────
// Bot State
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct BotState {
    pub current_channel: Option<String>,
    pub connection: ConnectionState,
    pub connection_attempts: u32,
    pub dev_mode: bool,
    /// Only channels the server told us about
    channel_states: HashMap<String, bool>,
    executions: HashMap<ExecutionId, PluginExecutionRecord>,
}

impl BotState {
    pub fn new(dev_mode: bool) -> Self {
        Self {
            dev_mode,
            ..Default::default()
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    pub fn set_connected(&mut self) {
        self.connection = ConnectionState::Connected;
        self.connection_attempts = 0;
    }

    pub fn set_disconnected(&mut self) {
        self.connection = ConnectionState::Disconnected;
    }

    /// Count a failed attempt against `max`
    pub fn record_connect_error(&mut self, max: u32) -> ReconnectAdvice {
        self.connection_attempts += 1;
        if self.connection_attempts < max {
            ReconnectAdvice::Retrying {
                attempt: self.connection_attempts,
                max,
            }
        } else {
            ReconnectAdvice::Exhausted { max }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Channels
    // ─────────────────────────────────────────────────────────────────────────

    /// Channels without a reported state count as active
    pub fn is_channel_active(&self, channel_id: &str) -> bool {
        self.channel_states.get(channel_id).copied().unwrap_or(true)
    }

    /// Only true for channels explicitly reported inactive
    pub fn is_channel_inactive(&self, channel_id: &str) -> bool {
        !self.is_channel_active(channel_id)
    }

    pub fn set_channel_active(&mut self, channel_id: impl Into<String>, active: bool) {
        self.channel_states.insert(channel_id.into(), active);
    }

    pub fn known_channels(&self) -> usize {
        self.channel_states.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Plugin executions
    // ─────────────────────────────────────────────────────────────────────────

    pub fn begin_execution(&mut self, id: ExecutionId, record: PluginExecutionRecord) {
        self.executions.insert(id, record);
    }

    /// Apply a finished result to its record and return the updated record
    ///
    /// A record moves out of `Running` once; later results for the same id
    /// leave it untouched.
    pub fn finish_execution(&mut self, result: &PluginResult) -> Option<&PluginExecutionRecord> {
        let record = self.executions.get_mut(&result.execution_id)?;
        let changed = match &result.outcome {
            PluginOutcome::Completed(_) => record.complete(result.finished_at),
            PluginOutcome::Failed(error) => record.fail(result.finished_at, error.clone()),
        };
        if !changed {
            tracing::warn!(execution = %result.execution_id, "Execution already finished");
        }
        Some(&*record)
    }

    pub fn execution(&self, id: &ExecutionId) -> Option<&PluginExecutionRecord> {
        self.executions.get(id)
    }

    pub fn plugin_stats(&self) -> PluginStats {
        PluginStats::from_records(self.executions.values())
    }

    /// Running executions with their elapsed seconds, oldest first
    pub fn running_executions(&self, now: DateTime<Utc>) -> Vec<(String, f64)> {
        let mut running: Vec<&PluginExecutionRecord> = self
            .executions
            .values()
            .filter(|record| !record.status.is_terminal())
            .collect();
        running.sort_by_key(|record| record.start_time);
        running
            .into_iter()
            .map(|record| (record.plugin_name.clone(), record.elapsed_secs(now)))
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Prompt
    // ─────────────────────────────────────────────────────────────────────────

    /// `[dev|prod] (name)[channel] [plugins:N] (active|inactive) (connected|disconnected) > `
    pub fn prompt(&self, bot_name: &str) -> String {
        let mut prompt = String::from(if self.dev_mode { "[dev]" } else { "[prod]" });

        match &self.current_channel {
            Some(channel) => prompt.push_str(&format!(" ({})[{}]", bot_name, channel)),
            None => prompt.push_str(" [no channel]"),
        }

        let active = self.plugin_stats().active;
        if active > 0 {
            prompt.push_str(&format!(" [plugins:{}]", active));
        }

        if let Some(channel) = &self.current_channel {
            let status = if self.is_channel_active(channel) { "active" } else { "inactive" };
            prompt.push_str(&format!(" ({})", status));
        }

        let connection = if self.is_connected() { "connected" } else { "disconnected" };
        prompt.push_str(&format!(" ({}) > ", connection));
        prompt
    }
}
