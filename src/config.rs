//! Runtime configuration for kv-tier-sim.
//!
//! Configuration is loaded from a JSON file, constructed programmatically, or
//! overridden from the command line. Model dimensions, tier bandwidths and
//! capacity, policy tunables, and the experiment plan all live here.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::initializer::InitializerKind;
use crate::policy::migration::MigrationKind;
use crate::policy::placement::PlacementKind;

const BYTES_PER_GIB: f64 = (1u64 << 30) as f64;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Command-line arguments. Every option overrides the matching config field.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "kv-tier-sim",
    about = "Simulate KV-cache placement and migration policies over a fast/far memory hierarchy"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Trace file to replay.
    #[arg(short, long)]
    pub trace: Option<PathBuf>,

    /// Run log output path.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// JSON summary output path.
    #[arg(long)]
    pub summary: Option<PathBuf>,

    /// Number of decode tokens to simulate.
    #[arg(short = 'n', long)]
    pub tokens: Option<u64>,

    /// Number of prefill tokens placed before decoding starts.
    #[arg(long)]
    pub prefill_tokens: Option<u64>,

    /// Model parameter count.
    #[arg(long)]
    pub param_count: Option<f64>,

    /// Fast-tier capacity in GiB.
    #[arg(long)]
    pub fast_capacity_gib: Option<f64>,

    /// Count fast-tier residency inclusively (the far tier keeps a copy of everything).
    #[arg(long)]
    pub inclusive: bool,

    /// Prefill initializer.
    #[arg(long, value_enum)]
    pub init: Option<InitializerKind>,

    /// Placement policies to evaluate.
    #[arg(long, value_enum, num_args = 1.., value_delimiter = ',')]
    pub placements: Vec<PlacementKind>,

    /// Migration policies to evaluate.
    #[arg(long, value_enum, num_args = 1.., value_delimiter = ',')]
    pub migrations: Vec<MigrationKind>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model dimensions and token counts.
    pub model: ModelConfig,

    /// Memory tier bandwidths and capacity.
    pub tiers: TierConfig,

    /// Policy tunables.
    pub policy: PolicyConfig,

    /// Experiment plan and I/O paths.
    pub run: RunConfig,
}

/// Model architecture and inference shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of transformer layers.
    pub n_layers: usize,

    /// Hidden dimension.
    pub hidden_dim: u64,

    /// Feed-forward dimension.
    pub ffn_dim: u64,

    /// Bytes per element (2 for FP16).
    pub dtype_size: u64,

    /// Total parameter count.
    pub param_count: f64,

    /// Tokens produced by prefill, placed before the replay starts.
    pub prefill_tokens: u64,

    /// Decode tokens replayed by the simulator.
    pub decode_tokens: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_layers: 32,
            hidden_dim: 16384,
            ffn_dim: 8192,
            dtype_size: 2,
            param_count: 0.5e9,
            prefill_tokens: 2048,
            decode_tokens: 10240,
        }
    }
}

/// How fast-tier residency relates to the far tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Accounting {
    /// Each entry lives in exactly one tier.
    #[default]
    Exclusive,
    /// The far tier holds a copy of everything; the fast tier caches a subset.
    Inclusive,
}

/// Tier bandwidths (bytes/ns, numerically GB/s) and fast-tier capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Fast-tier bandwidth.
    pub fast_bandwidth: f64,

    /// Far-tier interface read bandwidth.
    pub far_read_bandwidth: f64,

    /// Far-tier interface write bandwidth.
    pub far_write_bandwidth: f64,

    /// Far-tier internal bandwidth.
    pub far_internal_bandwidth: f64,

    /// Fast-tier capacity in bytes.
    pub fast_capacity: u64,

    /// Occupancy ratio at which threshold-gated migrations start evicting.
    pub high_watermark: f64,

    /// Fraction of model weights resident in the fast tier (defaults to `best_alpha`).
    pub resident_weight_ratio: Option<f64>,

    /// Residency accounting mode.
    pub accounting: Accounting,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            fast_bandwidth: 4915.0,
            far_read_bandwidth: 900.0,
            far_write_bandwidth: 900.0,
            far_internal_bandwidth: 1900.0,
            fast_capacity: 3 * (1 << 30), // 3 GiB
            high_watermark: 0.99,
            resident_weight_ratio: None,
            accounting: Accounting::Exclusive,
        }
    }
}

impl TierConfig {
    /// Effective far-tier read bandwidth: the slower of interface and internal paths.
    pub fn far_effective_read_bandwidth(&self) -> f64 {
        self.far_read_bandwidth.min(self.far_internal_bandwidth)
    }

    /// Bandwidth-optimal fraction of reads served from the fast tier.
    pub fn best_alpha(&self) -> f64 {
        let total = self.fast_bandwidth + self.far_effective_read_bandwidth();
        if total <= 0.0 {
            return 0.0;
        }
        self.fast_bandwidth / total
    }
}

/// Tunables for the individual placement, migration, and initializer variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Tokens evicted per round by prior-token migration.
    pub prior_batch: usize,

    /// Steps of skip history unioned by past-window migration.
    pub past_window: u64,

    /// Steps inspected by the look-ahead-batch placement and migration.
    pub lookahead_batch: u64,

    /// Token batch width for batch-ratio placement.
    pub batch_ratio_batch: u64,

    /// Token batch width for the best-ratio-per-batch initializer.
    pub init_batch: u64,

    /// Not-materialized entries per layer at which layer-importance placement stops using the fast tier.
    pub layer_skip_limit: usize,

    /// Accepted distance from `best_alpha` for alpha migration.
    pub alpha_deviation: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            prior_batch: 32,
            past_window: 16,
            lookahead_batch: 16,
            batch_ratio_batch: 16,
            init_batch: 32,
            layer_skip_limit: 10,
            alpha_deviation: 0.01,
        }
    }
}

/// The experiment plan: which trace, which policies, where to write results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Trace file to replay.
    pub trace_path: PathBuf,

    /// Line-oriented run log.
    pub log_path: PathBuf,

    /// Optional JSON summary.
    pub summary_path: Option<PathBuf>,

    /// Prefill initializer.
    pub initializer: InitializerKind,

    /// Placement policies, crossed with every migration policy.
    pub placements: Vec<PlacementKind>,

    /// Migration policies.
    pub migrations: Vec<MigrationKind>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            trace_path: PathBuf::from("trace.txt"),
            log_path: PathBuf::from("simulation.txt"),
            summary_path: None,
            initializer: InitializerKind::FillFast,
            placements: vec![PlacementKind::PreferFast],
            migrations: vec![MigrationKind::NoMigration],
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(path) = &cli.trace {
            self.run.trace_path = path.clone();
        }
        if let Some(path) = &cli.log_file {
            self.run.log_path = path.clone();
        }
        if let Some(path) = &cli.summary {
            self.run.summary_path = Some(path.clone());
        }
        if let Some(tokens) = cli.tokens {
            self.model.decode_tokens = tokens;
        }
        if let Some(tokens) = cli.prefill_tokens {
            self.model.prefill_tokens = tokens;
        }
        if let Some(count) = cli.param_count {
            self.model.param_count = count;
        }
        if let Some(gib) = cli.fast_capacity_gib {
            self.tiers.fast_capacity = (gib * BYTES_PER_GIB) as u64;
        }
        if cli.inclusive {
            self.tiers.accounting = Accounting::Inclusive;
        }
        if let Some(init) = cli.init {
            self.run.initializer = init;
        }
        if !cli.placements.is_empty() {
            self.run.placements = cli.placements.clone();
        }
        if !cli.migrations.is_empty() {
            self.run.migrations = cli.migrations.clone();
        }
    }

    /// Reject configurations the simulator cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.n_layers == 0 {
            return Err(ConfigError::Invalid("model.n_layers must be at least 1".into()));
        }
        if let Some(ratio) = self.tiers.resident_weight_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ConfigError::Invalid(format!(
                    "tiers.resident_weight_ratio {ratio} is outside [0, 1]"
                )));
            }
        }
        if !(self.tiers.high_watermark > 0.0 && self.tiers.high_watermark <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "tiers.high_watermark {} is outside (0, 1]",
                self.tiers.high_watermark
            )));
        }
        if self.model.param_count < 0.0 {
            return Err(ConfigError::Invalid("model.param_count must not be negative".into()));
        }
        if self.run.placements.is_empty() {
            return Err(ConfigError::Invalid("run.placements is empty".into()));
        }
        if self.run.migrations.is_empty() {
            return Err(ConfigError::Invalid("run.migrations is empty".into()));
        }
        Ok(())
    }

    /// Bandwidth-optimal fraction of reads served from the fast tier.
    pub fn best_alpha(&self) -> f64 {
        self.tiers.best_alpha()
    }

    /// Fraction of model weights resident in the fast tier.
    pub fn resident_weight_ratio(&self) -> f64 {
        self.tiers
            .resident_weight_ratio
            .unwrap_or_else(|| self.best_alpha())
    }

    /// KV cache size of one token at one layer (K and V).
    pub fn kv_layer_bytes(&self) -> u64 {
        2 * self.model.hidden_dim * self.model.dtype_size
    }

    /// Attention weight bytes read per layer (Q, K, V, O projections).
    pub fn attention_weight_bytes(&self) -> u64 {
        4 * self.model.hidden_dim * self.model.hidden_dim * self.model.dtype_size
    }

    /// Feed-forward weight bytes read per layer.
    pub fn ffn_weight_bytes(&self) -> u64 {
        2 * self.model.hidden_dim * self.model.ffn_dim * self.model.dtype_size
    }

    /// Total model weight bytes.
    pub fn model_weight_bytes(&self) -> u64 {
        (self.model.param_count * self.model.dtype_size as f64) as u64
    }

    /// Token range replayed by the simulator: `[prefill, prefill + decode)`.
    pub fn decode_range(&self) -> std::ops::Range<u64> {
        self.model.prefill_tokens..self.model.prefill_tokens + self.model.decode_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.model.n_layers, 32);
        assert_eq!(cfg.tiers.fast_capacity, 3 * 1024 * 1024 * 1024);
        assert_eq!(cfg.tiers.accounting, Accounting::Exclusive);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_best_alpha() {
        let cfg = Config::default();
        // 4915 / (4915 + min(900, 1900))
        let expected = 4915.0 / 5815.0;
        assert!((cfg.best_alpha() - expected).abs() < 1e-12);
        assert!((cfg.resident_weight_ratio() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_derived_sizes() {
        let cfg = Config::default();
        assert_eq!(cfg.kv_layer_bytes(), 2 * 16384 * 2);
        assert_eq!(cfg.attention_weight_bytes(), 4 * 16384 * 16384 * 2);
        assert_eq!(cfg.ffn_weight_bytes(), 2 * 16384 * 8192 * 2);
        assert_eq!(cfg.model_weight_bytes(), 1_000_000_000);
        assert_eq!(cfg.decode_range(), 2048..12288);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "model": { "n_layers": 4 },
            "tiers": { "accounting": "inclusive", "resident_weight_ratio": 0.5 },
            "run": { "placements": ["prefer-fast", "split-token"], "migrations": ["alpha"] }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.model.n_layers, 4);
        assert_eq!(cfg.model.hidden_dim, 16384);
        assert_eq!(cfg.tiers.accounting, Accounting::Inclusive);
        assert_eq!(cfg.resident_weight_ratio(), 0.5);
        assert_eq!(
            cfg.run.placements,
            vec![PlacementKind::PreferFast, PlacementKind::SplitToken]
        );
        assert_eq!(cfg.run.migrations, vec![MigrationKind::Alpha]);
    }

    #[test]
    fn test_unknown_policy_name_rejected() {
        let json = r#"{ "run": { "placements": ["prefer-hbm-always"] } }"#;
        assert!(serde_json::from_str::<Config>(json).is_err());

        let json = r#"{ "run": { "initializer": "random" } }"#;
        assert!(serde_json::from_str::<Config>(json).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.model.n_layers = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.tiers.resident_weight_ratio = Some(1.5);
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.run.migrations.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "kv-tier-sim",
            "--trace",
            "t.txt",
            "-n",
            "64",
            "--fast-capacity-gib",
            "2",
            "--inclusive",
            "--init",
            "best-ratio-per-batch",
            "--placements",
            "prefer-fast,batch-ratio",
            "--migrations",
            "no-migration",
            "past-window",
        ]);
        let mut cfg = Config::default();
        cfg.apply_cli(&cli);
        assert_eq!(cfg.run.trace_path, PathBuf::from("t.txt"));
        assert_eq!(cfg.model.decode_tokens, 64);
        assert_eq!(cfg.tiers.fast_capacity, 2 * 1024 * 1024 * 1024);
        assert_eq!(cfg.tiers.accounting, Accounting::Inclusive);
        assert_eq!(cfg.run.initializer, InitializerKind::BestRatioPerBatch);
        assert_eq!(
            cfg.run.placements,
            vec![PlacementKind::PreferFast, PlacementKind::BatchRatio]
        );
        assert_eq!(
            cfg.run.migrations,
            vec![MigrationKind::NoMigration, MigrationKind::PastWindow]
        );
    }
}
