use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::{BackoffPolicy, BackoffStrategy, Jitter};
use crate::breaker::BreakerConfig;
use crate::dispatch::DispatchSettings;
use crate::poller::PollerSettings;
use crate::retry::RetrySettings;

/// Jitter applied to backoff delays, as written in config.toml:
/// `jitter = { kind = "multiplicative", factor = 0.25 }`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JitterConfig {
    None,
    Additive { factor: f64 },
    Multiplicative { factor: f64 },
    Bounded { lo: f64, hi: f64 },
}

impl From<JitterConfig> for Jitter {
    fn from(cfg: JitterConfig) -> Self {
        match cfg {
            JitterConfig::None => Jitter::None,
            JitterConfig::Additive { factor } => Jitter::Additive(factor),
            JitterConfig::Multiplicative { factor } => Jitter::Multiplicative(factor),
            JitterConfig::Bounded { lo, hi } => Jitter::Bounded { lo, hi },
        }
    }
}

/// `[retry]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Optional cap on total time spent retrying one call.
    pub max_elapsed_secs: Option<u64>,
    pub jitter: JitterConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            max_elapsed_secs: None,
            jitter: JitterConfig::Multiplicative { factor: 0.25 },
        }
    }
}

/// `[breaker]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

/// `[poller]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub progress_timeout_secs: u64,
    pub long_wait_warning_secs: u64,
    pub max_error_retries: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            progress_timeout_secs: 30 * 60,
            long_wait_warning_secs: 120,
            max_error_retries: 10,
        }
    }
}

/// Configuration loaded from `~/.config/steadfast/config.toml`.
///
/// Every field has a default, so a file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Concurrent in-flight calls per pool (traffic class + destination).
    pub max_connections: usize,
    /// Estimated in-flight payload bytes per destination.
    pub byte_budget: u64,
    /// Rate-limit window after a 429 that carries no `Retry-After`.
    pub rate_limit_fallback_ms: u64,
    /// Idle transport handles kept per pool.
    pub pool_max_idle: usize,
    /// Give up waiting for a connection slot or byte budget after this long
    /// (None = wait until cancelled).
    pub acquire_timeout_ms: Option<u64>,
    pub retry: RetryConfig,
    pub breaker: BreakerSection,
    pub poller: PollerConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            byte_budget: 64 * 1024 * 1024,
            rate_limit_fallback_ms: 1_000,
            pool_max_idle: 8,
            acquire_timeout_ms: None,
            retry: RetryConfig::default(),
            breaker: BreakerSection::default(),
            poller: PollerConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Reject values that would stall every call.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            bail!("max_connections must be at least 1");
        }
        if self.byte_budget == 0 {
            bail!("byte_budget must be at least 1");
        }
        if self.breaker.failure_threshold == 0 {
            bail!("breaker.failure_threshold must be at least 1");
        }
        Ok(())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.retry.strategy,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
        .with_jitter(self.retry.jitter.into())
    }

    pub fn retry_settings(&self) -> RetrySettings {
        let settings = RetrySettings::default()
            .with_max_retries(self.retry.max_retries)
            .with_backoff(self.backoff_policy());
        match self.retry.max_elapsed_secs {
            Some(secs) => settings.with_max_elapsed(Duration::from_secs(secs)),
            None => settings,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            reset_timeout: Duration::from_millis(self.breaker.reset_timeout_ms),
        }
    }

    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            backoff: self.backoff_policy(),
            progress_timeout: Duration::from_secs(self.poller.progress_timeout_secs),
            long_wait_warning: Duration::from_secs(self.poller.long_wait_warning_secs),
            max_error_retries: self.poller.max_error_retries,
            rate_limit_fallback: Duration::from_millis(self.rate_limit_fallback_ms),
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            retry: self.retry_settings(),
            breaker: self.breaker_config(),
            poller: self.poller_settings(),
            max_connections: self.max_connections,
            byte_budget: self.byte_budget,
            rate_limit_fallback: Duration::from_millis(self.rate_limit_fallback_ms),
            acquire_timeout: self.acquire_timeout_ms.map(Duration::from_millis),
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("steadfast")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<CoreConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = CoreConfig::default();
        write_config(&path, &default_cfg)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }
    load_from_path(&path)
}

/// Load configuration from an explicit file.
pub fn load_from_path(path: &Path) -> Result<CoreConfig> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let cfg: CoreConfig =
        toml::from_str(&data).with_context(|| format!("invalid config {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

pub fn write_config(path: &Path, cfg: &CoreConfig) -> Result<()> {
    let toml = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, toml).with_context(|| format!("failed to write config {}", path.display()))?;
    Ok(())
}
