use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub schedule: Schedule,
    #[serde(default)]
    pub policy: Policy,
    pub dim_time: DimTime,
    pub aggregation: Aggregation,
    pub quality: Quality,
    pub observability: Observability,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    pub path: String,
    /// Checkpoint the WAL after a successful run once it reaches this size.
    #[serde(default = "default_wal_checkpoint_threshold_bytes")]
    pub wal_checkpoint_threshold_bytes: u64,
}

fn default_wal_checkpoint_threshold_bytes() -> u64 {
    64 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct Schedule {
    pub pipeline_interval_secs: u64,
    pub run_immediately: bool,
}

/// Thresholds used by the transforms. These are business policy, not invariants,
/// so every one of them can be overridden in `[policy]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Quality score for a row without a transaction hash.
    pub quality_score_missing_hash: f64,
    /// Quality score for a row missing `from_address` or timestamp.
    pub quality_score_partial: f64,
    pub quality_score_complete: f64,
    /// Staged rows below this score never reach `fact_transactions`.
    pub min_fact_quality_score: f64,
    pub high_value_eth: f64,
    /// Upper bound (exclusive) for `is_micro_transaction`.
    pub micro_transaction_eth: f64,
    pub whale_balance_eth: f64,
    pub value_tiers: ValueTierBounds,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            quality_score_missing_hash: 0.0,
            quality_score_partial: 0.5,
            quality_score_complete: 1.0,
            min_fact_quality_score: 0.5,
            high_value_eth: 10.0,
            micro_transaction_eth: 0.001,
            whale_balance_eth: 1000.0,
            value_tiers: ValueTierBounds::default(),
        }
    }
}

/// Exclusive upper bounds in ETH; anything at or above `very_large_max` is a whale.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValueTierBounds {
    pub micro_max: f64,
    pub small_max: f64,
    pub medium_max: f64,
    pub large_max: f64,
    pub very_large_max: f64,
}

impl Default for ValueTierBounds {
    fn default() -> Self {
        Self {
            micro_max: 0.01,
            small_max: 0.1,
            medium_max: 1.0,
            large_max: 10.0,
            very_large_max: 100.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DimTime {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Aggregation {
    /// 0 = full refresh of every date in the fact table.
    pub lookback_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Quality {
    pub fail_on_check_failure: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("PIPELINE_CONFIG").unwrap_or_else(|_| "config/default.toml".to_string());
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {path}"))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("failed to parse pipeline config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.dim_time.start_date <= self.dim_time.end_date,
            "dim_time.start_date must not be after dim_time.end_date"
        );
        anyhow::ensure!(
            self.schedule.pipeline_interval_secs > 0,
            "schedule.pipeline_interval_secs must be > 0"
        );
        let p = &self.policy;
        anyhow::ensure!(
            (0.0..=1.0).contains(&p.min_fact_quality_score),
            "policy.min_fact_quality_score must be in [0, 1]"
        );
        anyhow::ensure!(
            p.quality_score_missing_hash <= p.quality_score_partial
                && p.quality_score_partial <= p.quality_score_complete,
            "policy quality scores must be non-decreasing (missing_hash <= partial <= complete)"
        );
        let t = &p.value_tiers;
        anyhow::ensure!(
            0.0 < t.micro_max
                && t.micro_max < t.small_max
                && t.small_max < t.medium_max
                && t.medium_max < t.large_max
                && t.large_max < t.very_large_max,
            "policy.value_tiers bounds must be positive and strictly increasing"
        );
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}
