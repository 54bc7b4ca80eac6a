use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::server::DEFAULT_RESOURCES_PER_ROUND;

pub const DEFAULT_CONFIG_FILE: &str = "resbench.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Ipfs,
    Dat,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub session: SessionConfig,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Rounds a client runs before stopping
    pub tasks: u32,
    /// Size of each generated file in MB
    pub file_size_mb: usize,
    /// Seconds without a heartbeat before a client session times out; 0 disables it
    pub timeout_secs: u64,
    pub resources_per_round: usize,
    /// Connect backends directly once the peer's address is known
    pub connect: bool,
    /// Backend addresses to connect at start-up
    pub peers: Vec<String>,
    /// Run a STUN check before the session
    pub stun_test: bool,
    pub stun_servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: Option<BackendKind>,
    pub ipfs_program: String,
    pub dat_program: String,
    /// Seconds to wait after starting a daemon
    pub daemon_warm_up_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            log_dir: PathBuf::from("logs"),
            tasks: 10,
            file_size_mb: 10,
            timeout_secs: 120,
            resources_per_round: DEFAULT_RESOURCES_PER_ROUND,
            connect: false,
            peers: Vec::new(),
            stun_test: false,
            stun_servers: crate::stun::DEFAULT_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: None,
            ipfs_program: "ipfs".to_string(),
            dat_program: "dat".to_string(),
            daemon_warm_up_secs: 5,
        }
    }
}

impl SessionConfig {
    pub fn file_size_bytes(&self) -> usize {
        self.file_size_mb * 1024 * 1024
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// Values given on the command line, applied over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub output_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub tasks: Option<u32>,
    pub file_size_mb: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub connect: bool,
    pub peers: Vec<String>,
    pub stun_test: bool,
    pub backend: Option<BackendKind>,
}

impl BenchConfig {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration with CLI overrides
    pub fn load_with_overrides(
        config_file: Option<PathBuf>,
        overrides: Overrides,
    ) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = config_file {
            Self::from_file(path)?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(DEFAULT_CONFIG_FILE)?
        } else {
            Self::default()
        };

        // CLI overrides
        if let Some(dir) = overrides.output_dir {
            config.session.output_dir = dir;
        }
        if let Some(dir) = overrides.log_dir {
            config.session.log_dir = dir;
        }
        if let Some(tasks) = overrides.tasks {
            config.session.tasks = tasks;
        }
        if let Some(size) = overrides.file_size_mb {
            config.session.file_size_mb = size;
        }
        if let Some(timeout) = overrides.timeout_secs {
            config.session.timeout_secs = timeout;
        }
        if overrides.connect {
            config.session.connect = true;
        }
        if !overrides.peers.is_empty() {
            config.session.peers = overrides.peers;
        }
        if overrides.stun_test {
            config.session.stun_test = true;
        }
        if overrides.backend.is_some() {
            config.backend.kind = overrides.backend;
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, toml_string)
    }
}
