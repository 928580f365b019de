use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::Path,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{ConfigError, PassageError, PassageResult},
    listener::ListenAddr,
    remote::Remote,
};

/// Default SSH dial timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
/// Default number of dial retries after the first attempt
pub const DEFAULT_RETRIES: u32 = 3;
/// Default local bind address of a passage
pub const DEFAULT_LOCAL: &str = "127.0.0.1:0";

/// Configuration for the passage server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// SSH servers keyed by their identity
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

/// One SSH server and the passages routed through it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Username for SSH connection (default: current user)
    #[serde(default)]
    pub user: String,
    /// Hostname or IP address, with an optional port (default: 22)
    #[serde(default)]
    pub address: String,
    /// Dial timeout in seconds
    pub timeout: Option<u64>,
    /// Dial retries after the first attempt
    pub retries: Option<u32>,
    /// Path to private key file (optional, ssh-agent is used otherwise)
    pub key: Option<String>,
    /// Passages keyed by name
    #[serde(default)]
    pub passages: BTreeMap<String, PassageConfig>,
}

/// A local listener forwarding to one remote target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PassageEntry", into = "PassageEntry")]
pub struct PassageConfig {
    pub remote: RemoteConfig,
    pub local: String,
}

/// Remote target, either in literal form (`container=web:80/tcp`) or detailed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteConfig {
    Literal(String),
    Detailed(RemoteDetail),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDetail {
    #[serde(rename = "type", default = "default_remote_type")]
    pub kind: String,
    pub address: Option<String>,
    pub container: Option<String>,
    pub port: Option<PortValue>,
    pub network: Option<String>,
}

/// A port given either as a number or as a string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(u16),
    Text(String),
}

impl fmt::Display for PortValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortValue::Number(port) => write!(f, "{port}"),
            PortValue::Text(port) => f.write_str(port),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PassageEntry {
    Literal(String),
    Detailed {
        remote: RemoteConfig,
        #[serde(default = "default_local")]
        local: String,
    },
}

impl From<PassageEntry> for PassageConfig {
    fn from(entry: PassageEntry) -> Self {
        match entry {
            PassageEntry::Literal(remote) => PassageConfig {
                remote: RemoteConfig::Literal(remote),
                local: default_local(),
            },
            PassageEntry::Detailed { remote, local } => PassageConfig { remote, local },
        }
    }
}

impl From<PassageConfig> for PassageEntry {
    fn from(config: PassageConfig) -> Self {
        PassageEntry::Detailed {
            remote: config.remote,
            local: config.local,
        }
    }
}

fn default_remote_type() -> String {
    "tcp".to_string()
}

fn default_local() -> String {
    DEFAULT_LOCAL.to_string()
}

impl PassageConfig {
    pub fn new(remote: RemoteConfig, local: impl Into<String>) -> Self {
        Self {
            remote,
            local: local.into(),
        }
    }

    /// A passage to `remote` (literal form) on an OS-assigned local port
    pub fn literal(remote: &str) -> Self {
        Self::new(RemoteConfig::Literal(remote.to_string()), DEFAULT_LOCAL)
    }

    fn validate(&self, name: &str) -> Vec<String> {
        let mut errors = Vec::new();

        if self.local.is_empty() {
            errors.push(format!("passage {name:?}: local cannot be empty"));
        } else if let Err(e) = self.local.parse::<ListenAddr>() {
            errors.push(format!("passage {name:?}: invalid local address: {e}"));
        }

        if let RemoteConfig::Detailed(detail) = &self.remote
            && !matches!(detail.kind.as_str(), "tcp" | "container")
        {
            errors.push(format!(
                "passage {name:?}: invalid remote type {:?}",
                detail.kind
            ));
        } else if let Err(e) = Remote::from_config(&self.remote) {
            errors.push(format!("passage {name:?}: invalid remote: {e}"));
        }

        errors
    }
}

impl ServerConfig {
    /// Effective dial timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    /// Effective number of dial retries
    pub fn retries(&self) -> u32 {
        self.retries.unwrap_or(DEFAULT_RETRIES)
    }

    fn apply_defaults(&mut self) {
        if self.user.is_empty() {
            self.user = whoami::username();
        }

        if !self.address.is_empty() && !has_port(&self.address) {
            self.address = format!("{}:22", self.address);
        }

        if self.timeout.is_none_or(|t| t == 0) {
            self.timeout = Some(DEFAULT_TIMEOUT_SECS);
        }

        if self.retries.is_none() {
            self.retries = Some(DEFAULT_RETRIES);
        }
    }

    fn validate(&self, name: &str) -> Vec<String> {
        let mut errors = Vec::new();

        if self.user.is_empty() {
            errors.push(format!("ssh server {name:?}: user cannot be empty"));
        }

        if self.address.is_empty() {
            errors.push(format!("ssh server {name:?}: address cannot be empty"));
        }

        if self.passages.is_empty() {
            errors.push(format!("ssh server {name:?}: passages cannot be empty"));
        }

        for (passage, config) in &self.passages {
            errors.extend(config.validate(passage));
        }

        errors
    }
}

impl Config {
    /// Load configuration from a YAML, JSON or TOML file, picked by extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> PassageResult<Self> {
        let source = config::File::from(path.as_ref());
        Self::build(config::Config::builder().add_source(source))
    }

    /// Parse a YAML document
    pub fn from_yaml(content: &str) -> PassageResult<Self> {
        let source = config::File::from_str(content, config::FileFormat::Yaml);
        Self::build(config::Config::builder().add_source(source))
    }

    fn build(builder: config::ConfigBuilder<config::builder::DefaultState>) -> PassageResult<Self> {
        builder
            .build()
            .and_then(|settings| settings.try_deserialize::<Config>())
            .map_err(|e| PassageError::Config(format!("Failed to parse config: {e}")))
    }

    /// Apply defaults, then validate the configuration.
    ///
    /// Every problem found is reported in one [`ConfigError`].
    pub fn validate(&mut self) -> PassageResult<()> {
        if self.servers.is_empty() {
            return Err(ConfigError::new(vec!["invalid empty config".to_string()]).into());
        }

        let mut errors = Vec::new();
        for (name, server) in self.servers.iter_mut() {
            server.apply_defaults();
            errors.extend(server.validate(name));
        }

        errors.extend(self.validate_passage_names());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::new(errors).into())
        }
    }

    /// Passage names must be unique across all servers.
    fn validate_passage_names(&self) -> Vec<String> {
        let mut seen: HashMap<&str, &str> = HashMap::new();
        let mut errors = Vec::new();

        for (server, config) in &self.servers {
            for passage in config.passages.keys() {
                if let Some(first) = seen.insert(passage, server) {
                    errors.push(format!(
                        "ssh server {server:?}: duplicate passage name {passage:?} (already defined by {first:?})"
                    ));
                }
            }
        }

        errors
    }
}

fn has_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => {
            port.parse::<u16>().is_ok() && (!host.contains(':') || host.ends_with(']'))
        }
        None => false,
    }
}
