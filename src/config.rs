//! TOML configuration parsing and validation.
//!
//! Only `[db]` is mandatory; every other section falls back to defaults
//! suitable for a hosted enrichment API and a document store with a
//! 500-operation batch limit.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use course_harness_core::validate::ShapeRules;

use crate::retry::RetryConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub validation: ShapeRules,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Value written to `enrichedBy`; also the idempotency key.
    #[serde(default = "default_operation")]
    pub operation: String,
    /// Value written to `enrichmentVersion`. Records below it are redone.
    #[serde(default = "default_version")]
    pub version: i64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: default_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            operation: default_operation(),
            version: default_version(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_operation() -> String {
    "question-enhancement".to_string()
}
fn default_version() -> i64 {
    1
}

impl EnrichmentConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_calls_per_window")]
    pub calls_per_window: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            calls_per_window: default_calls_per_window(),
            window_ms: default_window_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_calls_per_window() -> u32 {
    20
}
fn default_window_ms() -> u64 {
    60_000
}
fn default_poll_interval_ms() -> u64 {
    250
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_safety_margin")]
    pub safety_margin: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            safety_margin: default_safety_margin(),
        }
    }
}

fn default_capacity() -> usize {
    500
}
fn default_safety_margin() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Largest failed/processed ratio a run may have and still complete.
    #[serde(default = "default_failure_tolerance")]
    pub failure_tolerance: f64,
    /// Report progress every N processed records.
    #[serde(default = "default_progress_every")]
    pub progress_every: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            failure_tolerance: default_failure_tolerance(),
            progress_every: default_progress_every(),
        }
    }
}

fn default_failure_tolerance() -> f64 {
    0.1
}
fn default_progress_every() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_admission_limit")]
    pub admission_limit: u32,
    #[serde(default = "default_admission_window_ms")]
    pub admission_window_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            admission_limit: default_admission_limit(),
            admission_window_ms: default_admission_window_ms(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}
fn default_admission_limit() -> u32 {
    10
}
fn default_admission_window_ms() -> u64 {
    60_000
}

impl Config {
    /// In-code defaults for tests and embedding. Uses `./data/courses.sqlite`.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/courses.sqlite"),
            },
            enrichment: EnrichmentConfig::default(),
            retry: RetrySection::default(),
            rate_limit: RateLimitConfig::default(),
            batch: BatchConfig::default(),
            pipeline: PipelineConfig::default(),
            validation: ShapeRules::default(),
            server: ServerConfig::default(),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            backoff_multiplier: self.retry.backoff_multiplier,
        }
    }

    /// Check cross-field constraints. [`load_config`] calls this.
    pub fn validate(&self) -> Result<()> {
        if self.batch.capacity <= self.batch.safety_margin {
            anyhow::bail!(
                "batch.capacity ({}) must be greater than batch.safety_margin ({})",
                self.batch.capacity,
                self.batch.safety_margin
            );
        }

        if !(0.0..=1.0).contains(&self.pipeline.failure_tolerance) {
            anyhow::bail!("pipeline.failure_tolerance must be in [0.0, 1.0]");
        }
        if self.pipeline.progress_every == 0 {
            anyhow::bail!("pipeline.progress_every must be > 0");
        }

        if self.retry.backoff_multiplier < 1.0 {
            anyhow::bail!("retry.backoff_multiplier must be >= 1.0");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!("retry.base_delay_ms must be <= retry.max_delay_ms");
        }

        if self.rate_limit.calls_per_window == 0 {
            anyhow::bail!("rate_limit.calls_per_window must be > 0");
        }
        if self.rate_limit.window_ms == 0 {
            anyhow::bail!("rate_limit.window_ms must be > 0");
        }

        if self.validation.min_options > self.validation.max_options {
            anyhow::bail!("validation.min_options must be <= validation.max_options");
        }

        if self.server.admission_limit == 0 {
            anyhow::bail!("server.admission_limit must be > 0");
        }

        match self.enrichment.provider.as_str() {
            "disabled" | "openai" => {}
            other => anyhow::bail!(
                "Unknown enrichment provider: '{}'. Must be disabled or openai.",
                other
            ),
        }

        if self.enrichment.is_enabled() && self.enrichment.model.is_none() {
            anyhow::bail!(
                "enrichment.model must be specified when provider is '{}'",
                self.enrichment.provider
            );
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Result<Config> {
        let text = format!("[db]\npath = \"/tmp/x.sqlite\"\n{}", extra);
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config = parse("").unwrap();
        assert_eq!(config.batch.capacity, 500);
        assert_eq!(config.batch.safety_margin, 10);
        assert_eq!(config.retry.max_retries, 3);
        assert!((config.pipeline.failure_tolerance - 0.1).abs() < f64::EPSILON);
        assert!(!config.enrichment.is_enabled());
        assert_eq!(config.validation, ShapeRules::default());
    }

    #[test]
    fn rejects_margin_not_below_capacity() {
        let err = parse("[batch]\ncapacity = 10\nsafety_margin = 10\n").unwrap_err();
        assert!(err.to_string().contains("safety_margin"));
    }

    #[test]
    fn rejects_unknown_provider() {
        assert!(parse("[enrichment]\nprovider = \"carrier-pigeon\"\n").is_err());
    }

    #[test]
    fn enabled_provider_needs_model() {
        assert!(parse("[enrichment]\nprovider = \"openai\"\n").is_err());
        assert!(parse("[enrichment]\nprovider = \"openai\"\nmodel = \"gpt-4o-mini\"\n").is_ok());
    }

    #[test]
    fn retry_config_converts_units() {
        let config = parse("[retry]\nbase_delay_ms = 5\nmax_delay_ms = 50\n").unwrap();
        let retry = config.retry_config();
        assert_eq!(retry.base_delay, Duration::from_millis(5));
        assert_eq!(retry.max_delay, Duration::from_millis(50));
    }
}
