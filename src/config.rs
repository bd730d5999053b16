//! Analysis configuration
//!
//! Defaults: 60-unit buckets, a 5-bucket
//! search radius, 5000 pairs per batch, 0.7/0.3 CPU/memory load weighting and
//! quartile call-rate tiers. Any field may be overridden from a TOML file.
//!
//! # Example TOML
//! ```toml
//! bucket_width = 60
//! max_radius = 5
//! batch_size = 2000
//! lookup = "linear-scan"
//!
//! [load_thresholds]
//! low_cut = 0.25
//! high_cut = 0.8
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// How context lookups find the nearest metric record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LookupStrategy {
    /// Time-bucket index with expanding radius search
    #[default]
    Indexed,
    /// Linear closest-bucket scan (same results, no index)
    LinearScan,
}

/// Low/high cut points for three-way tiering
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierThresholds {
    pub low_cut: f64,
    pub high_cut: f64,
}

impl TierThresholds {
    pub fn new(low_cut: f64, high_cut: f64) -> Self {
        Self { low_cut, high_cut }
    }
}

/// Percentile pair used to derive call-rate thresholds from the data
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileCuts {
    pub low: f64,
    pub high: f64,
}

/// Configuration for one analysis run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Width of one time bucket (time units of the metric timestamps)
    pub bucket_width: i64,

    /// Maximum number of buckets searched on either side of the query bucket
    pub max_radius: u32,

    /// Sibling pairs per aggregation batch. Bounds peak memory of the
    /// per-batch timing map.
    pub batch_size: usize,

    /// Worker threads for batch processing (0 = available parallelism)
    pub workers: usize,

    /// Duration substituted for a response time of exactly zero.
    ///
    /// Heuristic: the magnitude is not derived from the data and may be
    /// tuned.
    pub zero_response_epsilon: f64,

    pub cpu_weight: f64,
    pub memory_weight: f64,

    /// Fixed system-load tier cut points
    pub load_thresholds: TierThresholds,

    /// Percentiles of the call-rate column used as tier cut points
    pub call_rate_percentiles: PercentileCuts,

    /// Minimum p_concurrent spread for a pair to count as context-specific
    pub divergence_threshold: f64,

    pub lookup: LookupStrategy,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            bucket_width: 60,
            max_radius: 5,
            batch_size: 5000,
            workers: 0,
            zero_response_epsilon: 0.001,
            cpu_weight: 0.7,
            memory_weight: 0.3,
            load_thresholds: TierThresholds::new(0.3, 0.7),
            call_rate_percentiles: PercentileCuts {
                low: 25.0,
                high: 75.0,
            },
            divergence_threshold: 0.4,
            lookup: LookupStrategy::Indexed,
        }
    }
}

impl AnalysisConfig {
    /// Load configuration from a TOML file; unspecified fields keep defaults
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read config file: {}", path.as_ref().display())
        })?;
        let config: AnalysisConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML analysis config")?;
        Ok(config)
    }

    /// Number of worker threads to actually use
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.bucket_width <= 0 {
            return Err(format!(
                "bucket_width must be positive, got {}",
                self.bucket_width
            ));
        }

        if self.batch_size == 0 {
            return Err("batch_size must be >= 1".to_string());
        }

        if !(self.zero_response_epsilon > 0.0 && self.zero_response_epsilon.is_finite()) {
            return Err(format!(
                "zero_response_epsilon must be a positive finite number, got {}",
                self.zero_response_epsilon
            ));
        }

        if self.load_thresholds.low_cut > self.load_thresholds.high_cut {
            return Err(format!(
                "load_thresholds.low_cut ({}) must not exceed high_cut ({})",
                self.load_thresholds.low_cut, self.load_thresholds.high_cut
            ));
        }

        let p = self.call_rate_percentiles;
        if !(0.0..=100.0).contains(&p.low) || !(0.0..=100.0).contains(&p.high) || p.low > p.high {
            return Err(format!(
                "call_rate_percentiles must satisfy 0 <= low <= high <= 100, got {} / {}",
                p.low, p.high
            ));
        }

        if !(0.0..=1.0).contains(&self.divergence_threshold) {
            return Err(format!(
                "divergence_threshold must be in [0, 1], got {}",
                self.divergence_threshold
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AnalysisConfig::default();
        assert_eq!(config.bucket_width, 60);
        assert_eq!(config.max_radius, 5);
        assert_eq!(config.batch_size, 5000);
        assert_eq!(config.load_thresholds, TierThresholds::new(0.3, 0.7));
        assert_eq!(config.lookup, LookupStrategy::Indexed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "batch_size = 10\nlookup = \"linear-scan\"\n\n[load_thresholds]\nlow_cut = 0.2\nhigh_cut = 0.9"
        )
        .unwrap();

        let config = AnalysisConfig::from_toml(file.path()).unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.lookup, LookupStrategy::LinearScan);
        assert_eq!(config.load_thresholds, TierThresholds::new(0.2, 0.9));
        assert_eq!(config.bucket_width, 60);
        assert_eq!(config.zero_response_epsilon, 0.001);
    }

    #[test]
    fn test_missing_file() {
        assert!(AnalysisConfig::from_toml("/nonexistent/sibscope.toml").is_err());
    }

    #[test]
    #[allow(clippy::field_reassign_with_default)]
    fn test_invalid_bucket_width() {
        let mut config = AnalysisConfig::default();
        config.bucket_width = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[allow(clippy::field_reassign_with_default)]
    fn test_invalid_thresholds() {
        let mut config = AnalysisConfig::default();
        config.load_thresholds = TierThresholds::new(0.8, 0.2);
        assert!(config.validate().is_err());
    }

    #[test]
    #[allow(clippy::field_reassign_with_default)]
    fn test_invalid_percentiles() {
        let mut config = AnalysisConfig::default();
        config.call_rate_percentiles = PercentileCuts {
            low: 75.0,
            high: 25.0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    #[allow(clippy::field_reassign_with_default)]
    fn test_invalid_epsilon() {
        let mut config = AnalysisConfig::default();
        config.zero_response_epsilon = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[allow(clippy::field_reassign_with_default)]
    fn test_effective_workers() {
        let mut config = AnalysisConfig::default();
        assert!(config.effective_workers() >= 1);
        config.workers = 3;
        assert_eq!(config.effective_workers(), 3);
    }
}
