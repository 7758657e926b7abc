//! Engine configuration.
//!
//! Resolved once at startup and passed by reference into the engine and the
//! signing service.

use std::time::Duration;

use anyhow::Context;
use thiserror::Error;

pub const ENV_ORACLE_TIMEOUT_SECS: &str = "PROBLEM_LIST_ORACLE_TIMEOUT_SECS";
pub const ENV_MAX_WRITE_RETRIES: &str = "PROBLEM_LIST_MAX_WRITE_RETRIES";
pub const ENV_MIN_CONFIDENCE: &str = "PROBLEM_LIST_MIN_CONFIDENCE";
pub const ENV_TITLE_MATCH_THRESHOLD: &str = "PROBLEM_LIST_TITLE_MATCH_THRESHOLD";

const DEFAULT_ORACLE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_WRITE_RETRIES: u32 = 3;
const DEFAULT_MIN_CONFIDENCE: f64 = 0.0;
const DEFAULT_TITLE_MATCH_THRESHOLD: f64 = 0.93;

/// Configuration errors.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Oracle timeout must be greater than zero")]
    ZeroTimeout,

    #[error("{name} must be within [0, 1], got {value}")]
    OutOfUnitRange { name: &'static str, value: f64 },
}

/// Tunables for one engine instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    oracle_timeout: Duration,
    max_write_retries: u32,
    min_confidence: f64,
    title_match_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            oracle_timeout: DEFAULT_ORACLE_TIMEOUT,
            max_write_retries: DEFAULT_MAX_WRITE_RETRIES,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            title_match_threshold: DEFAULT_TITLE_MATCH_THRESHOLD,
        }
    }
}

impl EngineConfig {
    /// Build a validated configuration.
    pub fn new(
        oracle_timeout: Duration,
        max_write_retries: u32,
        min_confidence: f64,
        title_match_threshold: f64,
    ) -> Result<Self, ConfigError> {
        if oracle_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        check_unit("min_confidence", min_confidence)?;
        check_unit("title_match_threshold", title_match_threshold)?;

        Ok(Self {
            oracle_timeout,
            max_write_retries,
            min_confidence,
            title_match_threshold,
        })
    }

    /// Read overrides from the process environment, falling back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`EngineConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let oracle_timeout = match lookup(ENV_ORACLE_TIMEOUT_SECS) {
            Some(raw) => Duration::from_secs(
                raw.trim()
                    .parse()
                    .with_context(|| format!("{ENV_ORACLE_TIMEOUT_SECS}={raw:?}"))?,
            ),
            None => defaults.oracle_timeout,
        };
        let max_write_retries = match lookup(ENV_MAX_WRITE_RETRIES) {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_MAX_WRITE_RETRIES}={raw:?}"))?,
            None => defaults.max_write_retries,
        };
        let min_confidence = match lookup(ENV_MIN_CONFIDENCE) {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_MIN_CONFIDENCE}={raw:?}"))?,
            None => defaults.min_confidence,
        };
        let title_match_threshold = match lookup(ENV_TITLE_MATCH_THRESHOLD) {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_TITLE_MATCH_THRESHOLD}={raw:?}"))?,
            None => defaults.title_match_threshold,
        };

        Ok(Self::new(
            oracle_timeout,
            max_write_retries,
            min_confidence,
            title_match_threshold,
        )?)
    }

    pub fn oracle_timeout(&self) -> Duration {
        self.oracle_timeout
    }

    pub fn max_write_retries(&self) -> u32 {
        self.max_write_retries
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    pub fn title_match_threshold(&self) -> f64 {
        self.title_match_threshold
    }

    /// Same configuration with a different oracle timeout.
    pub fn with_oracle_timeout(mut self, timeout: Duration) -> Result<Self, ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        self.oracle_timeout = timeout;
        Ok(self)
    }

    /// Same configuration with a different confidence floor.
    pub fn with_min_confidence(mut self, min_confidence: f64) -> Result<Self, ConfigError> {
        check_unit("min_confidence", min_confidence)?;
        self.min_confidence = min_confidence;
        Ok(self)
    }
}

fn check_unit(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfUnitRange { name, value })
    }
}
