//! Bot Configuration
//!
//! Layered with figment, lowest priority first:
//! built-in defaults, an optional TOML file, environment variables, and
//! explicit overrides (command line flags or builder options).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::value::{Uncased, UncasedStr};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Read-only bot settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub bot_id: String,
    pub bot_name: String,
    pub bot_type: String,
    pub server_url: String,
    pub socket_path: String,
    pub default_channel: String,
    pub max_reconnect_attempts: u32,
    pub plugins_path: PathBuf,
    pub services_path: PathBuf,
    /// Start with plugin hot reloading enabled
    pub dev_mode: bool,
    /// Channel joined once the server confirms registration
    pub autojoin_channel: Option<String>,
    /// Delay before draining results after a dispatch
    pub result_drain_delay_ms: u64,
    /// Bound on tearing down a plugin's scheduler
    pub teardown_timeout_ms: u64,
    /// Pause between the steps of a cancel
    pub cancel_grace_ms: u64,
    /// Bots the queue manager fans tasks out to
    #[serde(deserialize_with = "name_list")]
    pub downstream_bots: Vec<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            bot_id: "pluggable-bot".to_string(),
            bot_name: "Pluggable Bot".to_string(),
            bot_type: "pluggable".to_string(),
            server_url: "http://localhost:3000".to_string(),
            socket_path: "/api/socket".to_string(),
            default_channel: "general".to_string(),
            max_reconnect_attempts: 5,
            plugins_path: PathBuf::from("plugins"),
            services_path: PathBuf::from("services"),
            dev_mode: false,
            autojoin_channel: None,
            result_drain_delay_ms: 100,
            teardown_timeout_ms: 2000,
            cancel_grace_ms: 500,
            downstream_bots: Vec::new(),
        }
    }
}

/// Explicit options; set fields win over every other source
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reconnect_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugins_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autojoin_channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downstream_bots: Option<Vec<String>>,
}

/// Environment variable -> config field
const ENV_KEYS: &[(&str, &str)] = &[
    ("BOT_ID", "bot_id"),
    ("BOT_NAME", "bot_name"),
    ("BOT_TYPE", "bot_type"),
    ("SERVER_URL", "server_url"),
    ("SOCKET_PATH", "socket_path"),
    ("DEFAULT_CHANNEL", "default_channel"),
    ("MAX_RECONNECT_ATTEMPTS", "max_reconnect_attempts"),
    ("PLUGINS_PATH", "plugins_path"),
    ("SERVICES_PATH", "services_path"),
    ("BOT_DEV_MODE", "dev_mode"),
    ("AUTOJOIN_CHANNEL", "autojoin_channel"),
    ("DOWNSTREAM_BOTS", "downstream_bots"),
];

fn env_field(key: &UncasedStr) -> Option<Uncased<'_>> {
    ENV_KEYS
        .iter()
        .find(|(env, _)| key.as_str().eq_ignore_ascii_case(env))
        .map(|(_, field)| Uncased::from(*field))
}

/// Accepts a list or a comma separated string (`bot-b,bot-c`)
fn name_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Names {
        List(Vec<String>),
        Joined(String),
    }

    Ok(match Names::deserialize(deserializer)? {
        Names::List(names) => names,
        Names::Joined(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

impl BotConfig {
    /// The layered figment, before extraction
    pub fn figment(file: Option<&Path>, overrides: &ConfigOverrides) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(BotConfig::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::raw().filter_map(env_field))
            .merge(Serialized::defaults(overrides))
    }

    /// Load the configuration from every source
    pub fn load(file: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let config: BotConfig = Self::figment(file, overrides).extract()?;
        tracing::debug!(?config, "Loaded configuration");
        Ok(config)
    }

    pub fn result_drain_delay(&self) -> Duration {
        Duration::from_millis(self.result_drain_delay_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}
