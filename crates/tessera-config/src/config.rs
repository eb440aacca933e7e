//! Configuration structs with defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Name of the config file inside the config directory.
const CONFIG_FILE: &str = "config.ron";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Transport and replication settings.
    pub network: NetworkConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// What the authority does with the objects of a client that disconnects.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum DisconnectPolicy {
    /// Destroy every object owned by the departed connection and broadcast the
    /// destroys to the remaining clients.
    #[default]
    Despawn,
    /// Leave the objects alive, still owned by the departed connection id.
    /// Nobody can invoke their requests until the server respawns or destroys
    /// them.
    Retain,
}

/// Network/replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the client connects to, or the server binds to.
    pub server_address: String,
    /// Server port.
    pub server_port: u16,
    /// Maximum concurrent client connections (server only).
    pub max_connections: usize,
    /// Upper bound on TCP connect plus handshake, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Replication tick rate in Hz.
    pub tick_rate_hz: u32,
    /// Largest accepted frame (tag + body) in bytes.
    pub max_frame_size: u32,
    /// Capacity of the queue between connection readers and the simulation
    /// thread, and of each connection's outbound queue. A client that lets its
    /// outbound queue fill up is disconnected.
    pub inbound_queue_capacity: usize,
    /// Fate of a departed client's objects.
    pub disconnect_policy: DisconnectPolicy,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log filter override (e.g. `"debug"`, `"info,tessera_net=trace"`).
    pub log_level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 7000,
            max_connections: 32,
            connect_timeout_ms: 5_000,
            tick_rate_hz: 20,
            max_frame_size: 1_048_576,
            inbound_queue_capacity: 1024,
            disconnect_policy: DisconnectPolicy::Despawn,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl NetworkConfig {
    /// `server_address:server_port` as a string suitable for socket APIs.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.server_address, self.server_port)
    }

    /// Duration of a single replication tick.
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / f64::from(self.tick_rate_hz.max(1)))
    }

    /// Connect timeout as a [`std::time::Duration`].
    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Per-user configuration directory (`<config_dir>/tessera`), if the platform has one.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tessera"))
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Load from `dir` if given, otherwise from [`default_config_dir`].
    pub fn load_from(dir: Option<&Path>) -> Result<Self, ConfigError> {
        match dir {
            Some(dir) => Self::load_or_create(dir),
            None => {
                let dir = default_config_dir().ok_or(ConfigError::NoConfigDir)?;
                Self::load_or_create(&dir)
            }
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(config_dir.join(CONFIG_FILE), serialized).map_err(ConfigError::WriteError)
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let contents =
            std::fs::read_to_string(config_dir.join(CONFIG_FILE)).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
