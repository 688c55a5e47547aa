//! `roll.toml`: optional per-data-directory settings.
//!
//! Every field has a default, so a missing file or a partial file is fine.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use roll_core::{DEFAULT_DIMENSION, DEFAULT_LOCK_WAIT, DEFAULT_THRESHOLD, MatcherConfig};
use serde::Deserialize;

use crate::error::{Result, StoreError};
use crate::store::DEFAULT_CONNECTIONS;

const DEFAULT_EXTRACTOR_TIMEOUT_MS: u64 = 10_000;

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RollConfig {
    pub matcher: MatcherSection,
    pub extractor: ExtractorSection,
    pub storage: StorageSection,
    pub clock: ClockSection,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MatcherSection {
    pub dimension: usize,
    pub threshold: f32,
    pub min_margin: f32,
}

impl Default for MatcherSection {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_DIMENSION,
            threshold: DEFAULT_THRESHOLD,
            min_margin: 0.0,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractorSection {
    /// argv of the external extractor; empty means none configured.
    pub command: Vec<String>,
    pub timeout_ms: u64,
}

impl Default for ExtractorSection {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_ms: DEFAULT_EXTRACTOR_TIMEOUT_MS,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    pub lock_wait_ms: u64,
    /// Pooled SQLite connections per process.
    pub connections: usize,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            lock_wait_ms: DEFAULT_LOCK_WAIT.as_millis() as u64,
            connections: DEFAULT_CONNECTIONS,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ClockSection {
    pub utc_offset_minutes: i32,
}

impl RollConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let m = &self.matcher;
        if m.dimension == 0 {
            return Err(StoreError::InvalidData(
                "matcher.dimension must be positive".into(),
            ));
        }
        if !m.threshold.is_finite() || m.threshold < 0.0 {
            return Err(StoreError::InvalidData(format!(
                "matcher.threshold must be a non-negative number, got {}",
                m.threshold
            )));
        }
        if !m.min_margin.is_finite() || m.min_margin < 0.0 {
            return Err(StoreError::InvalidData(format!(
                "matcher.min_margin must be a non-negative number, got {}",
                m.min_margin
            )));
        }
        if self.storage.connections == 0 {
            return Err(StoreError::InvalidData(
                "storage.connections must be positive".into(),
            ));
        }
        if self.extractor.timeout_ms == 0 {
            return Err(StoreError::InvalidData(
                "extractor.timeout_ms must be positive".into(),
            ));
        }
        // More than a day either way is not a real timezone.
        if self.clock.utc_offset_minutes.abs() > 24 * 60 {
            return Err(StoreError::InvalidData(format!(
                "clock.utc_offset_minutes out of range: {}",
                self.clock.utc_offset_minutes
            )));
        }
        Ok(())
    }

    pub fn matcher_config(&self) -> MatcherConfig {
        MatcherConfig {
            dimension: self.matcher.dimension,
            threshold: self.matcher.threshold,
            min_margin: self.matcher.min_margin,
        }
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.storage.lock_wait_ms)
    }

    pub fn extractor_timeout(&self) -> Duration {
        Duration::from_millis(self.extractor.timeout_ms)
    }

    pub fn utc_offset_secs(&self) -> i64 {
        i64::from(self.clock.utc_offset_minutes) * 60
    }
}
