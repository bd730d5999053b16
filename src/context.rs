//! Context enrichment: system load and call-rate tiers per observation
//!
//! Each observation is placed in a low/medium/high tier for two dimensions,
//! looked up for the caller service at the observation timestamp:
//!
//! - **System load**: `0.7·cpu + 0.3·memory` of the nearest sample, cut at
//!   fixed thresholds (0.3, 0.7).
//! - **Call rate**: mean provider call rate at the nearest radius, cut at
//!   the 25th/75th percentile of the whole call-rate column. The percentiles
//!   are computed once, when the call-rate source is attached.
//!
//! An observation without a match is counted as missing for that dimension.
//! It never falls into a tier. Every match records its search radius and its
//! time lag to the query in [`LookupLag`].

use crate::bucket_index::{BucketMatch, LinearScan, NearestLookup, TimeBucketIndex};
use crate::classifier::Observation;
use crate::config::{AnalysisConfig, LookupStrategy, PercentileCuts, TierThresholds};
use crate::record::{CallRateSample, MetricSample, SystemLoadSample};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Three-way context tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Low,
    Medium,
    High,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Low, Tier::Medium, Tier::High];

    /// `value < low_cut` → low, `value < high_cut` → medium, otherwise high
    pub fn classify(value: f64, thresholds: &TierThresholds) -> Tier {
        if value < thresholds.low_cut {
            Tier::Low
        } else if value < thresholds.high_cut {
            Tier::Medium
        } else {
            Tier::High
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Low => "low",
            Tier::Medium => "medium",
            Tier::High => "high",
        }
    }
}

/// Percentile with linear interpolation between closest ranks
///
/// `sorted` must be ascending. Returns `None` for empty input.
pub fn percentile(sorted: &[f64], pct: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    if sorted.len() == 1 {
        return Some(sorted[0]);
    }

    let index = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = index.floor() as usize;
    let upper = index.ceil() as usize;

    if lower == upper {
        Some(sorted[lower])
    } else {
        let weight = index - lower as f64;
        Some(sorted[lower] * (1.0 - weight) + sorted[upper] * weight)
    }
}

/// Call-rate tier thresholds from the full call-rate column
pub fn call_rate_thresholds<'a, I>(samples: I, cuts: PercentileCuts) -> Option<TierThresholds>
where
    I: IntoIterator<Item = &'a CallRateSample>,
{
    let mut values: Vec<f64> = samples
        .into_iter()
        .map(|s| s.provider_call_rate)
        .filter(|v| v.is_finite())
        .collect();
    values.sort_by(f64::total_cmp);

    let low = percentile(&values, cuts.low)?;
    let high = percentile(&values, cuts.high)?;
    tracing::info!(
        low_cut = low,
        high_cut = high,
        samples = values.len(),
        "Call rate thresholds calculated"
    );
    Some(TierThresholds::new(low, high))
}

/// Concurrent/sequential tallies for one tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounts {
    pub concurrent: u64,
    pub sequential: u64,
    pub total: u64,
}

impl TierCounts {
    pub fn p_concurrent(&self) -> Option<f64> {
        (self.total > 0).then(|| self.concurrent as f64 / self.total as f64)
    }

    pub fn p_sequential(&self) -> Option<f64> {
        (self.total > 0).then(|| self.sequential as f64 / self.total as f64)
    }
}

/// Radius and time-lag summary of successful lookups
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupLag {
    pub matched: u64,
    /// Matches found in the query's own bucket
    pub exact_bucket: u64,
    pub radius_sum: u64,
    pub max_radius: u32,
    pub lag_sum: u64,
    pub min_lag: Option<u64>,
    pub max_lag: Option<u64>,
}

impl LookupLag {
    pub fn record(&mut self, value: &ContextValue) {
        self.matched += 1;
        if value.radius == 0 {
            self.exact_bucket += 1;
        }
        self.radius_sum += u64::from(value.radius);
        self.max_radius = self.max_radius.max(value.radius);
        self.lag_sum = self.lag_sum.saturating_add(value.lag);
        self.min_lag = Some(self.min_lag.map_or(value.lag, |m| m.min(value.lag)));
        self.max_lag = Some(self.max_lag.map_or(value.lag, |m| m.max(value.lag)));
    }

    pub fn merge(&mut self, other: &LookupLag) {
        self.matched += other.matched;
        self.exact_bucket += other.exact_bucket;
        self.radius_sum += other.radius_sum;
        self.max_radius = self.max_radius.max(other.max_radius);
        self.lag_sum = self.lag_sum.saturating_add(other.lag_sum);
        self.min_lag = match (self.min_lag, other.min_lag) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_lag = match (self.max_lag, other.max_lag) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn mean_radius(&self) -> Option<f64> {
        (self.matched > 0).then(|| self.radius_sum as f64 / self.matched as f64)
    }

    pub fn mean_lag(&self) -> Option<f64> {
        (self.matched > 0).then(|| self.lag_sum as f64 / self.matched as f64)
    }
}

impl fmt::Display for LookupLag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.min_lag, self.mean_lag(), self.max_lag) {
            (Some(min), Some(mean), Some(max)) => write!(
                f,
                "{} matched ({} exact, max radius {}), lag min {} / mean {:.1} / max {}",
                self.matched, self.exact_bucket, self.max_radius, min, mean, max
            ),
            _ => write!(f, "no matches"),
        }
    }
}

/// Tier statistics for one context dimension
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStats {
    pub low: TierCounts,
    pub medium: TierCounts,
    pub high: TierCounts,
    /// Observations with no context in this dimension
    pub missing: u64,
    pub lag: LookupLag,
}

impl TierStats {
    pub fn record(&mut self, tier: Option<Tier>, concurrent: bool) {
        let Some(tier) = tier else {
            self.missing += 1;
            return;
        };
        let counts = self.get_mut(tier);
        if concurrent {
            counts.concurrent += 1;
        } else {
            counts.sequential += 1;
        }
        counts.total += 1;
    }

    pub fn get(&self, tier: Tier) -> &TierCounts {
        match tier {
            Tier::Low => &self.low,
            Tier::Medium => &self.medium,
            Tier::High => &self.high,
        }
    }

    fn get_mut(&mut self, tier: Tier) -> &mut TierCounts {
        match tier {
            Tier::Low => &mut self.low,
            Tier::Medium => &mut self.medium,
            Tier::High => &mut self.high,
        }
    }

    /// Observations that landed in some tier
    pub fn classified(&self) -> u64 {
        self.low.total + self.medium.total + self.high.total
    }
}

/// Per-pair context statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextStats {
    pub system_load: TierStats,
    pub call_rate: TierStats,
}

/// Lookup hit/miss counters, merged across batches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentCounters {
    pub load_hits: u64,
    pub load_misses: u64,
    pub rate_hits: u64,
    pub rate_misses: u64,
    pub load_lag: LookupLag,
    pub rate_lag: LookupLag,
}

impl EnrichmentCounters {
    pub fn merge(&mut self, other: &EnrichmentCounters) {
        self.load_hits += other.load_hits;
        self.load_misses += other.load_misses;
        self.rate_hits += other.rate_hits;
        self.rate_misses += other.rate_misses;
        self.load_lag.merge(&other.load_lag);
        self.rate_lag.merge(&other.rate_lag);
    }
}

/// Context value found for one lookup
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextValue {
    pub value: f64,
    pub radius: u32,
    pub lag: u64,
}

/// Metric source behind one context dimension
#[derive(Debug, Clone)]
pub enum MetricSource<T> {
    Indexed(TimeBucketIndex<T>),
    Linear(LinearScan<T>),
}

impl<T: MetricSample> MetricSource<T> {
    pub fn from_samples(samples: Vec<T>, config: &AnalysisConfig) -> Self {
        match config.lookup {
            LookupStrategy::Indexed => MetricSource::Indexed(TimeBucketIndex::build(
                samples,
                config.bucket_width,
                config.max_radius,
            )),
            LookupStrategy::LinearScan => MetricSource::Linear(LinearScan::new(
                samples,
                config.bucket_width,
                config.max_radius,
            )),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            MetricSource::Indexed(index) => index.len(),
            MetricSource::Linear(scan) => scan.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: MetricSample> NearestLookup<T> for MetricSource<T> {
    fn lookup(&self, service_id: &str, timestamp: i64) -> Option<BucketMatch<'_, T>> {
        match self {
            MetricSource::Indexed(index) => index.lookup(service_id, timestamp),
            MetricSource::Linear(scan) => scan.lookup(service_id, timestamp),
        }
    }
}

/// Attaches load and call-rate tiers to observations.
///
/// Immutable after construction; shared by reference across batch workers.
#[derive(Debug, Clone)]
pub struct ContextEnricher {
    system_load: Option<MetricSource<SystemLoadSample>>,
    call_rate: Option<MetricSource<CallRateSample>>,
    load_thresholds: TierThresholds,
    rate_thresholds: Option<TierThresholds>,
    cpu_weight: f64,
    memory_weight: f64,
}

impl ContextEnricher {
    /// Enricher with no metric sources attached
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            system_load: None,
            call_rate: None,
            load_thresholds: config.load_thresholds,
            rate_thresholds: None,
            cpu_weight: config.cpu_weight,
            memory_weight: config.memory_weight,
        }
    }

    pub fn with_system_load(mut self, source: MetricSource<SystemLoadSample>) -> Self {
        self.system_load = Some(source);
        self
    }

    /// Attach call-rate samples. The tier thresholds are derived here from
    /// the complete column, before any observation is classified.
    pub fn with_call_rate(
        mut self,
        samples: Vec<CallRateSample>,
        config: &AnalysisConfig,
    ) -> Self {
        self.rate_thresholds = call_rate_thresholds(&samples, config.call_rate_percentiles);
        self.call_rate = Some(MetricSource::from_samples(samples, config));
        self
    }

    /// Attach a prebuilt call-rate index; thresholds come from its contents
    pub fn with_call_rate_index(
        mut self,
        index: TimeBucketIndex<CallRateSample>,
        config: &AnalysisConfig,
    ) -> Self {
        self.rate_thresholds = call_rate_thresholds(index.iter(), config.call_rate_percentiles);
        self.call_rate = Some(MetricSource::Indexed(index));
        self
    }

    /// True when at least one dimension has a metric source
    pub fn has_context(&self) -> bool {
        self.system_load.is_some() || self.call_rate.is_some()
    }

    pub fn rate_thresholds(&self) -> Option<TierThresholds> {
        self.rate_thresholds
    }

    pub fn load_thresholds(&self) -> TierThresholds {
        self.load_thresholds
    }

    /// Weighted system load of `service_id` nearest to `timestamp`
    pub fn system_load_at(&self, service_id: &str, timestamp: i64) -> Option<ContextValue> {
        let source = self.system_load.as_ref()?;
        let found = source.lookup(service_id, timestamp)?;
        Some(ContextValue {
            value: found
                .first()
                .weighted_load(self.cpu_weight, self.memory_weight),
            radius: found.radius,
            lag: found.lag,
        })
    }

    /// Mean provider call rate of `service_id` at the nearest radius
    pub fn call_rate_at(&self, service_id: &str, timestamp: i64) -> Option<ContextValue> {
        let source = self.call_rate.as_ref()?;
        let found = source.lookup(service_id, timestamp)?;
        Some(ContextValue {
            value: found.mean_by(|s| s.provider_call_rate),
            radius: found.radius,
            lag: found.lag,
        })
    }

    fn load_context(&self, service_id: &str, timestamp: i64) -> Option<(Tier, ContextValue)> {
        self.system_load_at(service_id, timestamp)
            .map(|v| (Tier::classify(v.value, &self.load_thresholds), v))
    }

    fn rate_context(&self, service_id: &str, timestamp: i64) -> Option<(Tier, ContextValue)> {
        let thresholds = self.rate_thresholds?;
        self.call_rate_at(service_id, timestamp)
            .map(|v| (Tier::classify(v.value, &thresholds), v))
    }

    pub fn load_tier(&self, service_id: &str, timestamp: i64) -> Option<Tier> {
        self.load_context(service_id, timestamp).map(|(tier, _)| tier)
    }

    pub fn rate_tier(&self, service_id: &str, timestamp: i64) -> Option<Tier> {
        self.rate_context(service_id, timestamp).map(|(tier, _)| tier)
    }

    /// Tier statistics for a pair's observations, looked up for the caller
    pub fn enrich(
        &self,
        caller_service: &str,
        observations: &[Observation],
    ) -> (ContextStats, EnrichmentCounters) {
        let mut stats = ContextStats::default();
        let mut counters = EnrichmentCounters::default();

        for obs in observations {
            let concurrent = obs.order.is_concurrent();

            if self.system_load.is_some() {
                match self.load_context(caller_service, obs.timestamp) {
                    Some((tier, value)) => {
                        counters.load_hits += 1;
                        counters.load_lag.record(&value);
                        stats.system_load.lag.record(&value);
                        stats.system_load.record(Some(tier), concurrent);
                    }
                    None => {
                        counters.load_misses += 1;
                        stats.system_load.record(None, concurrent);
                    }
                }
            }

            if self.call_rate.is_some() {
                match self.rate_context(caller_service, obs.timestamp) {
                    Some((tier, value)) => {
                        counters.rate_hits += 1;
                        counters.rate_lag.record(&value);
                        stats.call_rate.lag.record(&value);
                        stats.call_rate.record(Some(tier), concurrent);
                    }
                    None => {
                        counters.rate_misses += 1;
                        stats.call_rate.record(None, concurrent);
                    }
                }
            }
        }

        (stats, counters)
    }
}
