use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{TdsError, TdsResult};

/// Top-level configuration (loaded from tds.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TdsConfig {
    pub daemon: DaemonConfig,
    pub storage: StorageConfig,
    pub key_server: KeyServerConfig,
    pub client: ClientConfig,
}

impl TdsConfig {
    /// Parse a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> TdsResult<Self> {
        if !path.exists() {
            tracing::warn!(
                "config file not found: {}  (using defaults)",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: TdsConfig = toml::from_str(&content)
            .map_err(|e| TdsError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the core misbehave rather than fail loudly later.
    pub fn validate(&self) -> TdsResult<()> {
        if self.storage.max_container_size < 2 {
            return Err(TdsError::Config(
                "storage.max_container_size must be at least 2 bytes".into(),
            ));
        }
        if self.storage.read_cache_containers == 0 {
            return Err(TdsError::Config(
                "storage.read_cache_containers must be at least 1".into(),
            ));
        }
        if self.key_server.sketch_width == 0 || self.key_server.sketch_depth == 0 {
            return Err(TdsError::Config(
                "key_server.sketch_width and sketch_depth must be non-zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.key_server.solver_mass) {
            return Err(TdsError::Config(format!(
                "key_server.solver_mass must be within 0.0..=1.0 (got {})",
                self.key_server.solver_mass
            )));
        }
        if self.key_server.initial_threshold == 0 || self.key_server.min_threshold == 0 {
            return Err(TdsError::Config(
                "key_server thresholds must be at least 1".into(),
            ));
        }
        if self.client.key_batch_size == 0 || self.client.store_batch_size == 0 {
            return Err(TdsError::Config(
                "client.key_batch_size and client.store_batch_size must be non-zero".into(),
            ));
        }
        if self.client.key_batch_size > self.key_server.max_batch_keys {
            return Err(TdsError::Config(format!(
                "client.key_batch_size ({}) exceeds key_server.max_batch_keys ({})",
                self.client.key_batch_size, self.key_server.max_batch_keys
            )));
        }
        if self.client.mask_bits > 128 {
            return Err(TdsError::Config(
                "client.mask_bits cannot exceed the 128-bit short hash".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Key server TCP listen address
    pub listen: String,
    /// Prometheus metrics endpoint (default: 127.0.0.1:9101)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `<name>.container` files
    pub container_dir: PathBuf,
    /// Directory holding `<HEX>.recipe` files
    pub recipe_dir: PathBuf,
    /// Sidecar record of the open container (name + used bytes)
    pub state_file: PathBuf,
    /// Container capacity in bytes
    pub max_container_size: u64,
    /// Closed containers kept in memory for restore (default: 1)
    pub read_cache_containers: usize,
    /// Fingerprint index path (`.json` selects the JSON backend)
    pub chunk_index: PathBuf,
    /// Filename index path (`.json` selects the JSON backend)
    pub filename_index: PathBuf,
}

/// How popularity counters age. `None` keeps counts monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SketchDecay {
    #[default]
    None,
    /// Halve every counter after this many observations
    HalveEvery(u64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyServerConfig {
    /// Server private secret for deterministic keys (created if missing)
    pub secret_file: PathBuf,
    /// Counters per sketch row
    pub sketch_width: usize,
    /// Independent rows (hash functions)
    pub sketch_depth: usize,
    /// Popularity cutoff before the solver first runs
    pub initial_threshold: u64,
    /// Recompute the threshold from observations
    pub solver_enabled: bool,
    /// Observation count that triggers an early solver run
    pub solver_trigger_count: usize,
    /// Observations held between solver runs; the oldest are dropped past this
    pub solver_max_pending: usize,
    /// Periodic solver interval in seconds
    pub solver_interval_secs: u64,
    /// Largest share of observed copies allowed to receive deterministic keys
    pub solver_mass: f64,
    /// Solver never lowers the threshold below this
    pub min_threshold: u64,
    pub sketch_decay: SketchDecay,
    /// Upper bound on masked hashes accepted in one batch
    pub max_batch_keys: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Key server address
    pub key_server: String,
    /// Masked hashes per key request
    pub key_batch_size: usize,
    /// Low-order bits zeroed in the masked short hash
    pub mask_bits: u32,
    /// Bounded queue depth between pipeline stages
    pub queue_depth: usize,
    /// Chunks per storage call
    pub store_batch_size: usize,
    pub chunk_min: u32,
    pub chunk_avg: u32,
    pub chunk_max: u32,
    /// Local directory of per-file key recipes
    pub key_recipe_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:6666".into(),
            metrics_addr: Some("127.0.0.1:9101".into()),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            container_dir: PathBuf::from("/var/lib/tds/containers"),
            recipe_dir: PathBuf::from("/var/lib/tds/recipes"),
            state_file: PathBuf::from("/var/lib/tds/storage-state"),
            max_container_size: 8 * 1024 * 1024,
            read_cache_containers: 1,
            chunk_index: PathBuf::from("/var/lib/tds/chunk-index.json"),
            filename_index: PathBuf::from("/var/lib/tds/filename-index.json"),
        }
    }
}

impl Default for KeyServerConfig {
    fn default() -> Self {
        Self {
            secret_file: PathBuf::from("/var/lib/tds/server.key"),
            sketch_width: 1 << 20,
            sketch_depth: 4,
            initial_threshold: 10,
            solver_enabled: true,
            solver_trigger_count: 100_000,
            solver_max_pending: 1_000_000,
            solver_interval_secs: 300,
            solver_mass: 0.5,
            min_threshold: 1,
            sketch_decay: SketchDecay::None,
            max_batch_keys: 65536,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            key_server: "127.0.0.1:6666".into(),
            key_batch_size: 4096,
            mask_bits: 0,
            queue_depth: 8192,
            store_batch_size: 1024,
            chunk_min: 4 * 1024,
            chunk_avg: 8 * 1024,
            chunk_max: 16 * 1024,
            key_recipe_dir: PathBuf::from("~/.local/share/tds/keys"),
        }
    }
}
