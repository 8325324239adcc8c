use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use strata_core::ids::AgentKey;
use strata_core::models::DatabaseConnection;
use strata_core::settings::{self, load_layered, read_env_string, SettingsError};
use strata_telemetry::TelemetryConfig;

use crate::database::DatabaseCommands;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectSettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms.max(1))
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms).max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// WebSocket endpoint of the control plane.
    pub server_url: String,
    pub agent_key: String,
    /// Where backups and compressed files are written.
    pub temp_path: PathBuf,
    /// Key file for connection-string password encryption. Created on first start.
    pub key_path: PathBuf,
    /// Used by `TestSqlServer`/`GetDatabaseList` when the caller sends no connection.
    pub default_connection: DatabaseConnection,
    pub database: DatabaseCommands,
    pub reconnect: ReconnectSettings,
    pub logging: TelemetryConfig,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:7070/ws".into(),
            agent_key: String::new(),
            temp_path: std::env::temp_dir().join("strata"),
            key_path: PathBuf::from("strata-agent.key"),
            default_connection: DatabaseConnection::default(),
            database: DatabaseCommands::default(),
            reconnect: ReconnectSettings::default(),
            logging: TelemetryConfig::default(),
        }
    }
}

impl AgentSettings {
    /// File values over defaults, then `STRATA_*` environment overrides.
    pub fn load(path: &Path) -> settings::Result<Self> {
        let mut loaded: Self = load_layered(path)?;
        loaded.apply_env_overrides();
        loaded.validate()?;
        Ok(loaded)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(url) = read_env_string("STRATA_SERVER_URL") {
            self.server_url = url;
        }
        if let Some(key) = read_env_string("STRATA_AGENT_KEY") {
            self.agent_key = key;
        }
        if let Some(path) = read_env_string("STRATA_TEMP_PATH") {
            self.temp_path = PathBuf::from(path);
        }
    }

    pub fn validate(&self) -> settings::Result<()> {
        if self.agent_key.trim().is_empty() {
            return Err(SettingsError::InvalidValue("agentKey must be set".into()));
        }
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(SettingsError::InvalidValue(format!(
                "serverUrl must be a ws:// or wss:// url, got {}",
                self.server_url
            )));
        }
        Ok(())
    }

    pub fn agent_key(&self) -> AgentKey {
        AgentKey::new(self.agent_key.trim())
    }
}
