//! Configuration sections for a cybernetic node.
//!
//! Every section is deserialized from TOML with all fields defaulted, so an
//! empty file (or no file at all) yields a working single-node setup.

use directories::ProjectDirs;
use hostname::get as get_hostname;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::{NoContext, Timestamp, Uuid};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "CYBERNETIC_CONFIG";

/// File name looked up in the platform config directory.
pub const CONFIG_FILE_NAME: &str = "cybernetic.toml";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration for one cluster node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeSection,
    pub graph: GraphSection,
    pub cluster: ClusterSection,
    pub cache: CacheSection,
}

/// Identity of the local replica.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeSection {
    /// Replica identifier; generated from the hostname when absent.
    pub replica_id: Option<String>,
}

/// Replicated graph store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphSection {
    /// Bounded inbox size of the store actor
    pub inbox_capacity: usize,
    /// Timeout for request/response calls (in milliseconds)
    pub call_timeout_ms: u64,
    /// How often deltas are shipped to neighbors (in milliseconds)
    pub sync_interval_ms: u64,
    /// Writes younger than this postpone shipping to the next tick (in milliseconds)
    pub debounce_ms: u64,
}

impl Default for GraphSection {
    fn default() -> Self {
        Self {
            inbox_capacity: 1024,
            call_timeout_ms: 5_000,
            sync_interval_ms: 1_000,
            debounce_ms: 50,
        }
    }
}

/// Cluster discovery and rewiring settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterSection {
    /// Well-known name of the graph store component on every peer
    pub component: String,
    /// Delay before the first discovery pass (in milliseconds)
    pub settle_delay_ms: u64,
    /// Delay between a node-up event and rediscovery (in milliseconds)
    pub rejoin_delay_ms: u64,
    /// Pull and merge the state of newly wired neighbors
    pub bootstrap_on_wire: bool,
    /// Bound on calls to the sync manager (in milliseconds)
    pub call_timeout_ms: u64,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            component: "graph_store".to_string(),
            settle_delay_ms: 1_000,
            rejoin_delay_ms: 2_000,
            bootstrap_on_wire: true,
            call_timeout_ms: 30_000,
        }
    }
}

/// Query cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheSection {
    pub max_size: usize,
    pub ttl_ms: u64,
    pub sweep_interval_ms: u64,
    pub inbox_capacity: usize,
    pub call_timeout_ms: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            ttl_ms: 300_000,
            sweep_interval_ms: 60_000,
            inbox_capacity: 1024,
            call_timeout_ms: 5_000,
        }
    }
}

impl AppConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(contents: &str, origin: &Path) -> Result<Self> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Load a configuration from a specific file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&contents, path)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load configuration, preferring an explicit path, then the
    /// `CYBERNETIC_CONFIG` environment variable, then the platform config
    /// directory. Falls back to defaults when no file exists.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            return Self::from_file(Path::new(&path));
        }

        if let Some(path) = Self::default_path().filter(|p| p.exists()) {
            return Self::from_file(&path);
        }

        debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Platform-specific default config file location.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "cybernetic", "cybernetic")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// The configured replica id, or a freshly generated one.
    pub fn replica_id(&self) -> String {
        self.node
            .replica_id
            .clone()
            .unwrap_or_else(generate_replica_id)
    }
}

/// Generate a unique replica ID of the form `<hostname>-<uuid v7>`.
pub fn generate_replica_id() -> String {
    let hostname = get_hostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let uuid = Uuid::new_v7(Timestamp::now(NoContext));
    format!("{}-{}", hostname, uuid)
}
