//! Plugin Execution Bookkeeping
//!
//! One `PluginExecutionRecord` exists per dispatched plugin invocation. Records
//! move from `Running` to `Completed` or `Error` exactly once and are kept for
//! introspection.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Execution ID
// ─────────────────────────────────────────────────────────────────────────────

static EXECUTION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Identifier of a single plugin invocation
///
/// Formatted as `{plugin}_{yyyyMMddHHmmssffffff}_{seq}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    /// Generate a fresh id for `plugin_name`
    pub fn generate(plugin_name: &str) -> Self {
        let seq = EXECUTION_SEQ.fetch_add(1, Ordering::Relaxed);
        let stamp = Utc::now().format("%Y%m%d%H%M%S%6f");
        Self(format!("{}_{}_{}", plugin_name, stamp, seq))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ExecutionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ExecutionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Execution Status
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle status of a plugin invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Error,
}

impl ExecutionStatus {
    /// Check if the invocation has finished
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Error => write!(f, "error"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Execution Record
// ─────────────────────────────────────────────────────────────────────────────

/// Bookkeeping entry for one plugin invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginExecutionRecord {
    pub plugin_name: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PluginExecutionRecord {
    /// Create a record in the `Running` state
    pub fn started(plugin_name: impl Into<String>) -> Self {
        Self::started_at(plugin_name, Utc::now())
    }

    pub fn started_at(plugin_name: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            start_time,
            end_time: None,
            status: ExecutionStatus::Running,
            error: None,
        }
    }

    /// Mark the invocation completed
    ///
    /// Returns `false` without changing anything if the record already finished.
    pub fn complete(&mut self, end_time: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = ExecutionStatus::Completed;
        self.end_time = Some(end_time);
        true
    }

    /// Mark the invocation failed
    ///
    /// Returns `false` without changing anything if the record already finished.
    pub fn fail(&mut self, end_time: DateTime<Utc>, error: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = ExecutionStatus::Error;
        self.end_time = Some(end_time);
        self.error = Some(error.into());
        true
    }

    /// Seconds between start and end, or start and `now` while running
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> f64 {
        let end = self.end_time.unwrap_or(now);
        (end - self.start_time).num_milliseconds().max(0) as f64 / 1000.0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Execution Stats
// ─────────────────────────────────────────────────────────────────────────────

/// Counts of invocations by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginStats {
    pub active: usize,
    pub completed: usize,
    pub error: usize,
    pub total: usize,
}

impl PluginStats {
    /// Tally a set of records
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a PluginExecutionRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.total += 1;
            match record.status {
                ExecutionStatus::Running => stats.active += 1,
                ExecutionStatus::Completed => stats.completed += 1,
                ExecutionStatus::Error => stats.error += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_execution_ids_are_unique() {
        let a = ExecutionId::generate("echo");
        let b = ExecutionId::generate("echo");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("echo_"));
    }

    #[test]
    fn test_record_transitions_once() {
        let start = Utc::now();
        let mut record = PluginExecutionRecord::started_at("echo", start);
        assert_eq!(record.status, ExecutionStatus::Running);

        assert!(record.complete(start + Duration::milliseconds(1500)));
        assert_eq!(record.status, ExecutionStatus::Completed);

        // A second transition is refused
        assert!(!record.fail(start + Duration::seconds(5), "late failure"));
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert!(record.error.is_none());
        assert_eq!(record.elapsed_secs(start + Duration::seconds(99)), 1.5);
    }

    #[test]
    fn test_failed_record_keeps_error() {
        let mut record = PluginExecutionRecord::started("broken");
        assert!(record.fail(Utc::now(), "boom"));
        assert_eq!(record.status, ExecutionStatus::Error);
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert!(!record.complete(Utc::now()));
    }

    #[test]
    fn test_stats_from_records() {
        let now = Utc::now();
        let mut done = PluginExecutionRecord::started("a");
        done.complete(now);
        let mut failed = PluginExecutionRecord::started("b");
        failed.fail(now, "x");
        let running = PluginExecutionRecord::started("c");

        let stats = PluginStats::from_records([&done, &failed, &running]);
        assert_eq!(
            stats,
            PluginStats {
                active: 1,
                completed: 1,
                error: 1,
                total: 3
            }
        );
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ExecutionStatus::Running.to_string(), "running");
        assert_eq!(ExecutionStatus::Error.to_string(), "error");
    }
}
