//! Runtime configuration for companion-cache.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every section is optional in the file; missing sections and fields take
//! their defaults.

use std::path::{Path, PathBuf};

use anyhow::bail;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::cache::policy::{CachePolicy, PolicyRegistry};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "companion-cache", about = "Multi-tier cache and consistency layer")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Override the data directory from the config file.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the background loops (prefetch, flush, sweep) until Ctrl-C.
    Run,
    /// Print queue status and metrics.
    Stats,
    /// Replay the durable write queue once.
    Flush,
    /// Move items between two containers.
    Migrate {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        /// Item ids to move.
        #[arg(required = true)]
        items: Vec<String>,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,

    /// Cache policies. Empty means the built-in defaults.
    pub policies: Vec<CachePolicy>,

    pub prediction: PredictionConfig,

    pub migration: MigrationConfig,

    pub queue: QueueConfig,

    pub compression: CompressionConfig,

    pub maintenance: MaintenanceConfig,
}

/// Tiered store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root of the durable tier and the write queue.
    pub data_dir: PathBuf,

    /// Policy applied to `get` without an explicit policy.
    pub default_policy: String,

    /// Byte budget across all policies in the memory tier (0 = unbounded).
    pub max_memory_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/tmp/companion-cache"),
            default_policy: "default".to_string(),
            max_memory_bytes: 64 * 1024 * 1024, // 64 MiB
        }
    }
}

/// Access-pattern learning and prefetch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    pub enabled: bool,

    /// How often the prefetcher runs.
    pub interval_ms: u64,

    /// Accesses closer together than this count as co-accesses.
    pub co_access_window_ms: u64,

    pub max_tracked_keys: usize,

    /// Access timestamps kept per key.
    pub history_per_key: usize,

    /// Accesses older than this are forgotten.
    pub retention_ms: u64,

    /// Accesses needed before a key is scored.
    pub min_accesses: usize,

    /// Dependencies reported per prediction.
    pub max_dependencies: usize,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            co_access_window_ms: 5_000,
            max_tracked_keys: 1024,
            history_per_key: 32,
            retention_ms: 24 * 60 * 60 * 1000,
            min_accesses: 3,
            max_dependencies: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// A migration lock older than this is abandoned; also bounds the move.
    pub lock_timeout_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 10_000,
        }
    }
}

/// Durable write queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Pending writes before `enqueue` is rejected.
    pub max_size: usize,

    /// Failed replays tolerated before a write is dropped.
    pub max_retries: u32,

    /// Size cap of the single-file fallback engine.
    pub snapshot_max_bytes: usize,

    pub flush_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            max_retries: 3,
            snapshot_max_bytes: 5 * 1024 * 1024, // 5 MiB
            flush_interval_ms: 15_000,
        }
    }
}

/// Compression at the durable-tier boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Apply zstd compression when writing to the durable tier.
    pub enabled: bool,

    /// Encodings at or above this size are compressed.
    pub threshold_bytes: usize,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: 4096,
            zstd_level: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// How often expired memory entries are swept.
    pub sweep_interval_ms: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 60_000,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Policies to register: the configured ones, or the built-in set.
    pub fn effective_policies(&self) -> Vec<CachePolicy> {
        if self.policies.is_empty() {
            CachePolicy::defaults()
        } else {
            self.policies.clone()
        }
    }

    pub fn registry(&self) -> PolicyRegistry {
        let registry = PolicyRegistry::new();
        for policy in self.effective_policies() {
            registry.register(policy);
        }
        registry
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let policies = self.effective_policies();
        if !policies.iter().any(|p| p.name == self.store.default_policy) {
            bail!(
                "default policy {:?} is not among the configured policies",
                self.store.default_policy
            );
        }
        if let Some(p) = policies.iter().find(|p| p.ttl_ms == 0) {
            bail!("policy {:?} has a zero TTL", p.name);
        }
        if self.queue.max_size == 0 {
            bail!("queue.max_size must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.queue.max_size, 10);
        assert_eq!(cfg.prediction.min_accesses, 3);
        assert_eq!(cfg.store.default_policy, "default");
        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"queue": {"max_size": 25}}"#).unwrap();
        assert_eq!(cfg.queue.max_size, 25);
        assert_eq!(cfg.queue.max_retries, 3);
        assert_eq!(cfg.compression.threshold_bytes, 4096);
        assert_eq!(cfg.registry().len(), 5);
    }

    #[test]
    fn test_unknown_default_policy_rejected() {
        let mut cfg = Config::default();
        cfg.store.default_policy = "missing".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/companion-cache.json")).unwrap();
        assert_eq!(cfg.migration.lock_timeout_ms, 10_000);
    }

    #[test]
    fn test_cli_parses_migrate() {
        let cli = Cli::parse_from(["companion-cache", "migrate", "--from", "a", "--to", "b", "m1", "m2"]);
        assert_eq!(
            cli.command,
            Some(Command::Migrate {
                from: "a".into(),
                to: "b".into(),
                items: vec!["m1".into(), "m2".into()],
            })
        );
    }
}
