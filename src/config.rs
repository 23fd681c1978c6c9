use std::{fmt, fs, io, path::Path, time::Duration};

use serde::Deserialize;

pub const CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Default, Deserialize, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Config {
    pub disk: DiskConfig,
    pub network: NetworkConfig,
    pub swarm: SwarmConfig,
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct DiskConfig {
    /// Directory used when no destination file is given on the command line.
    pub download_path: String,
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub connect_timeout_ms: u64,
    pub connection_retries: u32,
    pub handshake_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub keep_alive_interval_secs: u64,
    pub listen_port_min: u16,
    pub listen_port_max: u16,
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct SwarmConfig {
    /// Upper bound on peers we unchoke at the same time.
    pub max_unchoked: usize,
    /// Upper bound on links open or being opened at the same time.
    pub max_connections: usize,
    pub block_size: u32,
    /// Random picks tried before falling back to a linear scan.
    pub random_draws: usize,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            download_path: "./downloads/".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            connection_retries: 1,
            handshake_timeout_secs: 10,
            read_timeout_secs: 120,
            keep_alive_interval_secs: 120,
            listen_port_min: 6881,
            listen_port_max: 6889,
        }
    }
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_unchoked: 4,
            max_connections: 30,
            block_size: 16384,
            random_draws: 5,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }
}

impl Config {
    /// Loads `config.toml` from the working directory.
    pub fn load() -> Result<Config, ConfigError> {
        Self::load_from(CONFIG_PATH)
    }

    /// Loads the given file; a missing file yields the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let toml_str = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(e) => return Err(e.into()),
        };
        let config: Config = toml::de::from_str(&toml_str)?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.network.listen_port_min > self.network.listen_port_max {
            return Err(ConfigError::Invalid("listen_port_min exceeds listen_port_max"));
        }
        if self.swarm.block_size == 0 {
            return Err(ConfigError::Invalid("block_size must be positive"));
        }
        if self.swarm.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(toml::de::Error),
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(reason) => write!(f, "Invalid config: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err)
    }
}
