//! Server configuration module
//!
//! Handles loading and parsing of server configuration from files and environment variables.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::game::ids::MapId;
use crate::game::region::Vector2;
use crate::game::spawner::SpawnLoadPolicy;
use crate::game::world::WorldSettings;
use crate::net::dispatcher::DispatcherSettings;
use crate::net::session::SessionLimits;

/// Environment variable holding the config file path
pub const CONFIG_PATH_VAR: &str = "GORE_CONFIG";

/// Prefix of environment overrides
const ENV_PREFIX: &str = "GORE_";

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" => Some(LogFormat::Pretty),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Server name shown in logs and announcements
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Game port (TCP)
    #[serde(default = "default_game_port")]
    pub game_port: u16,

    /// Path to data files (templates, maps, accounts, characters)
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// World tick interval in milliseconds
    #[serde(default = "default_server_update_rate")]
    pub server_update_rate_ms: u64,

    /// Interval between generic respawn passes in milliseconds
    #[serde(default = "default_respawnables_update_rate")]
    pub respawnables_update_rate_ms: u32,

    /// Maximum logged-in sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum logged-in sessions per address
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,

    /// Disconnect the old session when an account logs in twice
    #[serde(default = "default_true")]
    pub account_drop_existing_connection_when_in_use: bool,

    /// Map used when a character's stored location is unusable
    #[serde(default = "default_invalid_user_load_map")]
    pub invalid_user_load_map: u16,

    /// Position used with `invalid_user_load_map`
    #[serde(default = "default_invalid_user_load_position")]
    pub invalid_user_load_position: Vector2,

    /// Autosave interval in seconds (0 to disable)
    #[serde(default = "default_autosave_interval")]
    pub autosave_interval_secs: u64,

    /// Idle time before a session is disconnected
    #[serde(default = "default_max_idle")]
    pub max_idle_secs: u64,

    /// What to do with spawn rows that cannot be resolved
    #[serde(default)]
    pub spawn_load_policy: SpawnLoadPolicy,

    /// Fixed seed for map random sources
    #[serde(default)]
    pub rng_seed: Option<u64>,

    /// Development mode flag (unknown accounts are created at login)
    #[serde(default)]
    pub dev_mode: bool,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

// Default value functions
fn default_server_name() -> String {
    "Gore".to_string()
}

fn default_game_port() -> u16 {
    7171
}

fn default_data_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_server_update_rate() -> u64 {
    50
}

fn default_respawnables_update_rate() -> u32 {
    500
}

fn default_max_connections() -> usize {
    500
}

fn default_max_connections_per_ip() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_invalid_user_load_map() -> u16 {
    1
}

fn default_invalid_user_load_position() -> Vector2 {
    Vector2::new(32.0, 32.0)
}

fn default_autosave_interval() -> u64 {
    300 // 5 minutes
}

fn default_max_idle() -> u64 {
    600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/server.toml"),
            server_name: default_server_name(),
            game_port: default_game_port(),
            data_path: default_data_path(),
            server_update_rate_ms: default_server_update_rate(),
            respawnables_update_rate_ms: default_respawnables_update_rate(),
            max_connections: default_max_connections(),
            max_connections_per_ip: default_max_connections_per_ip(),
            account_drop_existing_connection_when_in_use: default_true(),
            invalid_user_load_map: default_invalid_user_load_map(),
            invalid_user_load_position: default_invalid_user_load_position(),
            autosave_interval_secs: default_autosave_interval(),
            max_idle_secs: default_max_idle(),
            spawn_load_policy: SpawnLoadPolicy::default(),
            rng_seed: None,
            dev_mode: false,
            log_format: LogFormat::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        // Determine config path from environment or use default
        let config_path = env::var(CONFIG_PATH_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/server.toml"));

        let mut config = if config_path.exists() {
            Self::load_from(&config_path).await?
        } else {
            Self {
                config_path,
                ..Self::default()
            }
        };

        // Override with environment variables
        config.apply_overrides(|key| env::var(key).ok());

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Read and parse a config file without overrides or validation
    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    /// Apply `GORE_*` overrides. `lookup` maps a variable name to its value.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let flag = |val: String| val.to_lowercase() == "true" || val == "1";

        if let Some(val) = var("SERVER_NAME") {
            self.server_name = val;
        }
        if let Some(port) = var("GAME_PORT").and_then(|v| v.parse().ok()) {
            self.game_port = port;
        }
        if let Some(val) = var("DATA_PATH") {
            self.data_path = PathBuf::from(val);
        }
        if let Some(rate) = var("SERVER_UPDATE_RATE_MS").and_then(|v| v.parse().ok()) {
            self.server_update_rate_ms = rate;
        }
        if let Some(rate) = var("RESPAWNABLES_UPDATE_RATE_MS").and_then(|v| v.parse().ok()) {
            self.respawnables_update_rate_ms = rate;
        }
        if let Some(max) = var("MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.max_connections = max;
        }
        if let Some(max) = var("MAX_CONNECTIONS_PER_IP").and_then(|v| v.parse().ok()) {
            self.max_connections_per_ip = max;
        }
        if let Some(val) = var("ACCOUNT_DROP_EXISTING_CONNECTION_WHEN_IN_USE") {
            self.account_drop_existing_connection_when_in_use = flag(val);
        }
        if let Some(secs) = var("AUTOSAVE_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.autosave_interval_secs = secs;
        }
        if let Some(secs) = var("MAX_IDLE_SECS").and_then(|v| v.parse().ok()) {
            self.max_idle_secs = secs;
        }
        if let Some(seed) = var("RNG_SEED").and_then(|v| v.parse().ok()) {
            self.rng_seed = Some(seed);
        }
        if let Some(val) = var("DEV_MODE") {
            self.dev_mode = flag(val);
        }
        if let Some(policy) = var("SPAWN_LOAD_POLICY").and_then(|v| parse_spawn_load_policy(&v)) {
            self.spawn_load_policy = policy;
        }
        if let Some(map) = var("INVALID_USER_LOAD_MAP").and_then(|v| v.parse().ok()) {
            self.invalid_user_load_map = map;
        }
        if let Some(position) = var("INVALID_USER_LOAD_POSITION").and_then(|v| parse_position(&v)) {
            self.invalid_user_load_position = position;
        }
        if let Some(format) = var("LOG_FORMAT").and_then(|v| LogFormat::parse(&v)) {
            self.log_format = format;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server_update_rate_ms < 10 || self.server_update_rate_ms > 1000 {
            anyhow::bail!("Server update rate must be between 10ms and 1000ms");
        }

        if self.respawnables_update_rate_ms == 0 {
            anyhow::bail!("Respawnables update rate must be positive");
        }

        if self.max_connections == 0 || self.max_connections > 10000 {
            anyhow::bail!("Max connections must be between 1 and 10000");
        }

        if self.max_connections_per_ip == 0 || self.max_connections_per_ip > self.max_connections {
            anyhow::bail!("Max connections per IP must be between 1 and max connections");
        }

        if !self.invalid_user_load_position.is_finite() {
            anyhow::bail!("Invalid user load position must be finite");
        }

        if self.max_idle_secs == 0 {
            anyhow::bail!("Max idle time must be positive");
        }

        Ok(())
    }

    /// Address the game listener binds to
    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.game_port))
    }

    /// World settings derived from this config
    pub fn world_settings(&self) -> WorldSettings {
        // Convert autosave from seconds to ticks
        let autosave_interval = if self.autosave_interval_secs > 0 {
            (self.autosave_interval_secs * 1000 / self.server_update_rate_ms.max(1)).max(1)
        } else {
            0 // Disabled
        };

        WorldSettings {
            name: self.server_name.clone(),
            update_rate_ms: self.server_update_rate_ms,
            respawnables_update_rate_ms: self.respawnables_update_rate_ms,
            autosave_interval,
            spawn_load_policy: self.spawn_load_policy,
            rng_seed: self.rng_seed,
            invalid_user_load_map: MapId::new(self.invalid_user_load_map),
            invalid_user_load_position: self.invalid_user_load_position,
        }
    }

    /// Dispatcher settings derived from this config
    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            drop_existing_connection: self.account_drop_existing_connection_when_in_use,
            limits: SessionLimits {
                max_connections: self.max_connections,
                max_connections_per_ip: self.max_connections_per_ip,
                max_idle: Duration::from_secs(self.max_idle_secs),
            },
        }
    }
}

/// `skip` or `abort_map`, ignoring case
fn parse_spawn_load_policy(value: &str) -> Option<SpawnLoadPolicy> {
    match value.trim().to_ascii_lowercase().as_str() {
        "skip" => Some(SpawnLoadPolicy::Skip),
        "abort_map" | "abort" => Some(SpawnLoadPolicy::AbortMap),
        _ => None,
    }
}

/// `x,y` with finite coordinates
fn parse_position(value: &str) -> Option<Vector2> {
    let (x, y) = value.split_once(',')?;
    let position = Vector2::new(x.trim().parse().ok()?, y.trim().parse().ok()?);
    position.is_finite().then_some(position)
}
