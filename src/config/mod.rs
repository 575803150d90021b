use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const DEFAULT_MODEL: &str = "llama3";
const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_CONFIG_PATH: &str = "config/dispatch.toml";

const DEFAULT_HANDSHAKE_SECS: u64 = 30;
const DEFAULT_CALL_SECS: u64 = 60;
const DEFAULT_DECIDER_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: String,
    pub ollama_url: String,
    pub servers: Vec<ServerConfig>,
    pub timeouts: Timeouts,
}

/// Transport definition for one tool server. Immutable after load; the
/// registry re-reads it only on process restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub workdir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub handshake: Duration,
    pub call: Duration,
    pub decider: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(DEFAULT_HANDSHAKE_SECS),
            call: Duration::from_secs(DEFAULT_CALL_SECS),
            decider: Duration::from_secs(DEFAULT_DECIDER_SECS),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    model: Option<String>,
    ollama_url: Option<String>,
    #[serde(default)]
    servers: Vec<RawServer>,
    timeouts: Option<RawTimeouts>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    name: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    workdir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawTimeouts {
    handshake_secs: Option<u64>,
    call_secs: Option<u64>,
    decider_secs: Option<u64>,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return read_config(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        match read_config(default_path) {
            Ok(config) => Ok(config),
            Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!("Configuration file not found; using defaults");
                Ok(Self::default())
            }
            Err(other) => Err(other),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            servers: Vec::new(),
            timeouts: Timeouts::default(),
        }
    }
}

fn read_config(path: &Path) -> Result<AppConfig, ConfigError> {
    debug!(path = %path.display(), "Reading dispatch configuration file");
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: RawConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(AppConfig {
        model: parsed.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        ollama_url: parsed
            .ollama_url
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
        servers: parsed.servers.into_iter().map(ServerConfig::from).collect(),
        timeouts: parsed.timeouts.unwrap_or_default().into(),
    })
}

impl From<RawServer> for ServerConfig {
    fn from(value: RawServer) -> Self {
        Self {
            name: value.name,
            command: shellexpand::tilde(&value.command).into_owned(),
            args: value.args,
            env: value.env,
            workdir: value
                .workdir
                .map(|dir| PathBuf::from(shellexpand::tilde(&dir).into_owned())),
        }
    }
}

impl From<RawTimeouts> for Timeouts {
    fn from(value: RawTimeouts) -> Self {
        let defaults = Timeouts::default();
        Self {
            handshake: value
                .handshake_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.handshake),
            call: value
                .call_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.call),
            decider: value
                .decider_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.decider),
        }
    }
}
