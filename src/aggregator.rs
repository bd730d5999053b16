//! Batched pattern aggregation
//!
//! Discovered pairs are split into fixed-size batches. For each batch the
//! full call-graph is scanned once, keeping timing only for the services the
//! batch mentions:
//!
//! ```text
//! service → trace → [(start, interval), ...]
//! ```
//!
//! A pair is then replayed over every trace both services appear in (traces
//! in sorted order). Every combination of one call of each service is one
//! observation. The replay is keyed by trace and service only, so calls of
//! the same services under another parent prefix in that trace also count.
//!
//! Batches run on a small scoped worker pool fed from a lock-free queue of
//! batch indices. Results are order independent; the final list is sorted
//! by pair.

use crate::classifier::{classify, ExecutionOrder, Observation};
use crate::config::AnalysisConfig;
use crate::context::{ContextEnricher, ContextStats, EnrichmentCounters};
use crate::error::{PipelineError, Result};
use crate::record::{CallRecord, TimingInterval};
use crate::sibling::SiblingPair;
use crossbeam::channel;
use crossbeam::queue::ArrayQueue;
use fnv::{FnvHashMap, FnvHashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Aggregated execution pattern of one sibling pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    #[serde(flatten)]
    pub pair: SiblingPair,
    pub total_observations: u64,
    pub concurrent_count: u64,
    pub first_then_second_count: u64,
    pub second_then_first_count: u64,
    pub p_concurrent: f64,
    pub p_first_then_second: f64,
    pub p_second_then_first: f64,
    /// Tier statistics, present when a context source was attached
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub context: Option<ContextStats>,
}

impl PatternRecord {
    fn from_observations(
        pair: SiblingPair,
        observations: &[Observation],
        context: Option<ContextStats>,
    ) -> Option<Self> {
        let mut concurrent = 0u64;
        let mut first_then_second = 0u64;
        let mut second_then_first = 0u64;
        for obs in observations {
            match obs.order {
                ExecutionOrder::Concurrent => concurrent += 1,
                ExecutionOrder::FirstThenSecond => first_then_second += 1,
                ExecutionOrder::SecondThenFirst => second_then_first += 1,
            }
        }

        let total = concurrent + first_then_second + second_then_first;
        if total == 0 {
            return None;
        }
        let ratio = |n: u64| n as f64 / total as f64;

        Some(Self {
            pair,
            total_observations: total,
            concurrent_count: concurrent,
            first_then_second_count: first_then_second,
            second_then_first_count: second_then_first,
            p_concurrent: ratio(concurrent),
            p_first_then_second: ratio(first_then_second),
            p_second_then_first: ratio(second_then_first),
            context,
        })
    }

    /// Combined probability of either sequential order
    pub fn p_sequential(&self) -> f64 {
        self.p_first_then_second + self.p_second_then_first
    }
}

/// Counters accumulated over all batches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationStats {
    pub batches_total: usize,
    pub batches_completed: usize,
    pub pairs_emitted: usize,
    pub pairs_without_common_traces: usize,
    pub pairs_without_observations: usize,
    /// Timing rows kept across all batch scans
    pub timing_rows: u64,
    /// Rows whose zero response time was widened
    pub zero_response_adjusted: u64,
    /// Rows skipped for an unusable response time
    pub invalid_timing_rows: u64,
    pub observations: u64,
    pub enrichment: EnrichmentCounters,
    /// True when the run stopped before every batch completed
    pub cancelled: bool,
}

impl AggregationStats {
    fn merge(&mut self, other: &AggregationStats) {
        self.batches_completed += other.batches_completed;
        self.pairs_emitted += other.pairs_emitted;
        self.pairs_without_common_traces += other.pairs_without_common_traces;
        self.pairs_without_observations += other.pairs_without_observations;
        self.timing_rows += other.timing_rows;
        self.zero_response_adjusted += other.zero_response_adjusted;
        self.invalid_timing_rows += other.invalid_timing_rows;
        self.observations += other.observations;
        self.enrichment.merge(&other.enrichment);
    }
}

/// Result of an aggregation run
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    /// Pattern records sorted by pair
    pub records: Vec<PatternRecord>,
    pub stats: AggregationStats,
}

/// Cooperative cancellation flag, checked between batches
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Receives each batch's records as soon as the batch completes.
///
/// Called from the coordinating thread, one batch at a time, in completion
/// order. A batch may be delivered again if a run is restarted, so sinks
/// should tolerate duplicates.
pub trait BatchSink {
    fn on_batch(&mut self, batch_index: usize, records: &[PatternRecord]) -> Result<()>;
}

/// Sink that discards intermediate batches
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl BatchSink for NoopSink {
    fn on_batch(&mut self, _batch_index: usize, _records: &[PatternRecord]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct CallTiming {
    start_timestamp: i64,
    interval: TimingInterval,
}

/// trace → calls of one service, traces sorted
type TraceTimings<'r> = BTreeMap<&'r str, Vec<CallTiming>>;

struct BatchOutput {
    batch_index: usize,
    records: Vec<PatternRecord>,
    stats: AggregationStats,
}

/// Batch aggregator over a borrowed call-graph
pub struct Aggregator<'a> {
    config: &'a AnalysisConfig,
    enricher: Option<&'a ContextEnricher>,
    cancel: CancellationToken,
}

impl<'a> Aggregator<'a> {
    pub fn new(config: &'a AnalysisConfig) -> Self {
        Self {
            config,
            enricher: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_enricher(mut self, enricher: &'a ContextEnricher) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Aggregate every pair, streaming completed batches to `sink`.
    ///
    /// # Errors
    ///
    /// Returns the first sink error (remaining batches are cancelled) or
    /// `Worker` if a batch thread panicked.
    pub fn run<S>(
        &self,
        records: &[CallRecord],
        pairs: &[SiblingPair],
        sink: &mut S,
    ) -> Result<Aggregation>
    where
        S: BatchSink + ?Sized,
    {
        let batches: Vec<&[SiblingPair]> = pairs.chunks(self.config.batch_size.max(1)).collect();
        let mut stats = AggregationStats {
            batches_total: batches.len(),
            ..AggregationStats::default()
        };
        if batches.is_empty() {
            return Ok(Aggregation {
                records: Vec::new(),
                stats,
            });
        }

        let workers = self.config.effective_workers().clamp(1, batches.len());
        tracing::info!(
            pairs = pairs.len(),
            batches = batches.len(),
            workers,
            "Starting pattern aggregation"
        );

        let queue = ArrayQueue::new(batches.len());
        for index in 0..batches.len() {
            // Capacity equals the batch count
            let _ = queue.push(index);
        }

        let (tx, rx) = channel::unbounded::<BatchOutput>();
        let mut output: Vec<PatternRecord> = Vec::new();
        let mut sink_error: Option<PipelineError> = None;

        crossbeam::thread::scope(|scope| {
            for worker in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let batches = &batches;
                scope.spawn(move |_| {
                    while let Some(index) = queue.pop() {
                        if self.cancel.is_cancelled() {
                            tracing::debug!(worker, "Worker stopping on cancellation");
                            break;
                        }
                        let batch = self.process_batch(index, batches[index], records);
                        if tx.send(batch).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            for batch in rx.iter() {
                if sink_error.is_none() {
                    if let Err(e) = sink.on_batch(batch.batch_index, &batch.records) {
                        tracing::warn!(batch = batch.batch_index, "Batch sink failed: {}", e);
                        self.cancel.cancel();
                        sink_error = Some(e);
                    }
                }
                stats.merge(&batch.stats);
                tracing::info!(
                    completed = stats.batches_completed,
                    total = stats.batches_total,
                    "Batch complete"
                );
                output.extend(batch.records);
            }
        })
        .map_err(|_| PipelineError::Worker("aggregation worker panicked".to_string()))?;

        if let Some(e) = sink_error {
            return Err(e);
        }

        stats.cancelled = stats.batches_completed < stats.batches_total;
        if stats.cancelled {
            tracing::warn!(
                completed = stats.batches_completed,
                total = stats.batches_total,
                "Aggregation cancelled"
            );
        }

        output.sort_by(|a, b| a.pair.cmp(&b.pair));
        Ok(Aggregation {
            records: output,
            stats,
        })
    }

    fn process_batch(
        &self,
        batch_index: usize,
        pairs: &[SiblingPair],
        records: &[CallRecord],
    ) -> BatchOutput {
        let mut stats = AggregationStats {
            batches_completed: 1,
            ..AggregationStats::default()
        };

        let services: FnvHashSet<&str> = pairs
            .iter()
            .flat_map(|p| [p.first.as_str(), p.second.as_str()])
            .collect();
        let timings = self.collect_timings(records, &services, &mut stats);

        tracing::debug!(
            batch = batch_index,
            pairs = pairs.len(),
            services = services.len(),
            timing_rows = stats.timing_rows,
            "Processing batch"
        );

        let mut output = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let (Some(first), Some(second)) = (
                timings.get(pair.first.as_str()),
                timings.get(pair.second.as_str()),
            ) else {
                stats.pairs_without_common_traces += 1;
                continue;
            };

            let observations = replay(first, second);
            if observations.is_empty() {
                if has_common_trace(first, second) {
                    stats.pairs_without_observations += 1;
                } else {
                    stats.pairs_without_common_traces += 1;
                }
                continue;
            }
            stats.observations += observations.len() as u64;

            let context = match self.enricher {
                Some(enricher) if enricher.has_context() => {
                    let (context, counters) = enricher.enrich(&pair.caller_service, &observations);
                    stats.enrichment.merge(&counters);
                    Some(context)
                }
                _ => None,
            };

            if let Some(record) =
                PatternRecord::from_observations(pair.clone(), &observations, context)
            {
                stats.pairs_emitted += 1;
                output.push(record);
            }
        }

        BatchOutput {
            batch_index,
            records: output,
            stats,
        }
    }

    /// One pass over the call-graph, keeping calls to the batch's services
    fn collect_timings<'r>(
        &self,
        records: &'r [CallRecord],
        services: &FnvHashSet<&str>,
        stats: &mut AggregationStats,
    ) -> FnvHashMap<&'r str, TraceTimings<'r>> {
        let mut timings: FnvHashMap<&'r str, TraceTimings<'r>> = FnvHashMap::default();

        for record in records {
            let service = record.callee_service.as_str();
            if !services.contains(service) {
                continue;
            }
            let Some(interval) = record.interval(self.config.zero_response_epsilon) else {
                stats.invalid_timing_rows += 1;
                continue;
            };
            if record.response_time == 0.0 {
                stats.zero_response_adjusted += 1;
            }
            stats.timing_rows += 1;

            timings
                .entry(service)
                .or_default()
                .entry(record.trace_id.as_str())
                .or_default()
                .push(CallTiming {
                    start_timestamp: record.start_timestamp,
                    interval,
                });
        }

        timings
    }
}

fn has_common_trace(first: &TraceTimings<'_>, second: &TraceTimings<'_>) -> bool {
    first.keys().any(|trace| second.contains_key(trace))
}

/// All call combinations of two services over their common traces
fn replay(first: &TraceTimings<'_>, second: &TraceTimings<'_>) -> Vec<Observation> {
    let mut observations = Vec::new();

    for (trace, first_calls) in first {
        let Some(second_calls) = second.get(trace) else {
            continue;
        };
        for a in first_calls {
            for b in second_calls {
                observations.push(Observation {
                    trace_id: (*trace).to_string(),
                    timestamp: a.start_timestamp.min(b.start_timestamp),
                    order: classify(&a.interval, &b.interval),
                });
            }
        }
    }

    observations
}

/// Aggregate all pairs without an intermediate sink
pub fn aggregate(
    records: &[CallRecord],
    pairs: &[SiblingPair],
    config: &AnalysisConfig,
    enricher: Option<&ContextEnricher>,
) -> Result<Aggregation> {
    let mut aggregator = Aggregator::new(config);
    if let Some(enricher) = enricher {
        aggregator = aggregator.with_enricher(enricher);
    }
    aggregator.run(records, pairs, &mut NoopSink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MetricSource;
    use crate::record::SystemLoadSample;

    fn call(trace: &str, rpc: &str, dm: &str, ts: i64, rt: f64) -> CallRecord {
        CallRecord::new(trace, rpc, "UM", dm, ts, rt)
    }

    fn pair(a: &str, b: &str) -> SiblingPair {
        SiblingPair::new(a, b, "0", "UM").unwrap()
    }

    fn single_worker() -> AnalysisConfig {
        AnalysisConfig {
            workers: 1,
            ..AnalysisConfig::default()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        batches: Vec<(usize, usize)>,
    }

    impl BatchSink for RecordingSink {
        fn on_batch(&mut self, batch_index: usize, records: &[PatternRecord]) -> Result<()> {
            self.batches.push((batch_index, records.len()));
            Ok(())
        }
    }

    struct FailingSink;

    impl BatchSink for FailingSink {
        fn on_batch(&mut self, _batch_index: usize, _records: &[PatternRecord]) -> Result<()> {
            Err(PipelineError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only",
            )))
        }
    }

    #[test]
    fn test_all_combinations_observed() {
        // X: [0,5) and [20,25); Y: [2,7)
        let records = vec![
            call("t1", "0.1", "X", 0, 5.0),
            call("t1", "0.2", "Y", 2, 5.0),
            call("t1", "0.3", "X", 20, 5.0),
        ];
        let result = aggregate(&records, &[pair("X", "Y")], &single_worker(), None).unwrap();
        let record = &result.records[0];
        assert_eq!(record.total_observations, 2);
        assert_eq!(record.concurrent_count, 1);
        assert_eq!(record.second_then_first_count, 1);
        assert_eq!(record.first_then_second_count, 0);
        assert!((record.p_concurrent - 0.5).abs() < 1e-12);
        assert!((record.p_second_then_first - 0.5).abs() < 1e-12);
        assert!(record.context.is_none());
    }

    #[test]
    fn test_ratios_sum_to_one() {
        let records = vec![
            call("t1", "0.1", "A", 0, 10.0),
            call("t1", "0.2", "B", 10, 10.0),
            call("t2", "0.1", "A", 0, 10.0),
            call("t2", "0.2", "B", 5, 10.0),
            call("t3", "0.1", "A", 30, 10.0),
            call("t3", "0.2", "B", 0, 10.0),
        ];
        let result = aggregate(&records, &[pair("A", "B")], &single_worker(), None).unwrap();
        let r = &result.records[0];
        assert_eq!(r.total_observations, 3);
        assert_eq!(r.first_then_second_count, 1);
        assert_eq!(r.concurrent_count, 1);
        assert_eq!(r.second_then_first_count, 1);
        let sum = r.p_concurrent + r.p_first_then_second + r.p_second_then_first;
        assert!((sum - 1.0).abs() < 1e-12);
        assert!((r.p_sequential() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_pair_without_common_trace_dropped() {
        let records = vec![call("t1", "0.1", "A", 0, 1.0), call("t2", "0.1", "B", 0, 1.0)];
        let result = aggregate(&records, &[pair("A", "B")], &single_worker(), None).unwrap();
        assert!(result.records.is_empty());
        assert_eq!(result.stats.pairs_without_common_traces, 1);
    }

    #[test]
    fn test_invalid_response_times_skipped() {
        let records = vec![
            call("t1", "0.1", "A", 0, f64::NAN),
            call("t1", "0.2", "B", 0, 1.0),
            call("t1", "0.3", "A", 5, 0.0),
        ];
        let result = aggregate(&records, &[pair("A", "B")], &single_worker(), None).unwrap();
        assert_eq!(result.stats.invalid_timing_rows, 1);
        assert_eq!(result.stats.zero_response_adjusted, 1);
        let r = &result.records[0];
        assert_eq!(r.total_observations, 1);
        assert_eq!(r.second_then_first_count, 1);
    }

    #[test]
    fn test_batches_stream_to_sink() {
        let records = vec![
            call("t1", "0.1", "A", 0, 1.0),
            call("t1", "0.2", "B", 0, 1.0),
            call("t1", "0.3", "C", 0, 1.0),
        ];
        let pairs = vec![pair("A", "B"), pair("A", "C"), pair("B", "C")];
        let config = AnalysisConfig {
            batch_size: 2,
            workers: 2,
            ..AnalysisConfig::default()
        };
        let mut sink = RecordingSink::default();
        let result = Aggregator::new(&config)
            .run(&records, &pairs, &mut sink)
            .unwrap();

        assert_eq!(result.stats.batches_total, 2);
        assert_eq!(result.stats.batches_completed, 2);
        let mut seen = sink.batches.clone();
        seen.sort();
        assert_eq!(seen, vec![(0, 2), (1, 1)]);
        let order: Vec<&SiblingPair> = result.records.iter().map(|r| &r.pair).collect();
        assert_eq!(order, pairs.iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_worker_count_does_not_change_result() {
        let mut records = Vec::new();
        for t in 0..20 {
            let trace = format!("t{}", t);
            for (i, svc) in ["A", "B", "C", "D"].iter().enumerate() {
                records.push(call(&trace, &format!("0.{}", i), svc, t * 3 + i as i64, 4.0));
            }
        }
        let discovery = crate::sibling::discover(&records);
        let pairs = discovery.pair_list();

        let serial = AnalysisConfig {
            batch_size: 1,
            workers: 1,
            ..AnalysisConfig::default()
        };
        let parallel = AnalysisConfig {
            batch_size: 2,
            workers: 4,
            ..AnalysisConfig::default()
        };
        let a = aggregate(&records, &pairs, &serial, None).unwrap();
        let b = aggregate(&records, &pairs, &parallel, None).unwrap();
        assert_eq!(a.records, b.records);
        assert_eq!(a.stats.observations, b.stats.observations);
    }

    #[test]
    fn test_cancelled_before_start() {
        let records = vec![call("t1", "0.1", "A", 0, 1.0), call("t1", "0.2", "B", 0, 1.0)];
        let config = single_worker();
        let token = CancellationToken::new();
        token.cancel();
        let result = Aggregator::new(&config)
            .with_cancellation(token)
            .run(&records, &[pair("A", "B")], &mut NoopSink)
            .unwrap();
        assert!(result.stats.cancelled);
        assert!(result.records.is_empty());
    }

    #[test]
    fn test_sink_error_propagates() {
        let records = vec![call("t1", "0.1", "A", 0, 1.0), call("t1", "0.2", "B", 0, 1.0)];
        let config = single_worker();
        let err = Aggregator::new(&config)
            .run(&records, &[pair("A", "B")], &mut FailingSink)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Io(_)));
    }

    #[test]
    fn test_empty_pairs() {
        let result = aggregate(&[], &[], &single_worker(), None).unwrap();
        assert!(result.records.is_empty());
        assert_eq!(result.stats.batches_total, 0);
        assert!(!result.stats.cancelled);
    }

    #[test]
    fn test_context_attached_when_enricher_present() {
        let config = single_worker();
        let enricher = ContextEnricher::new(&config).with_system_load(MetricSource::from_samples(
            vec![SystemLoadSample::new(0, "UM", 0.9, 0.9)],
            &config,
        ));
        let records = vec![
            call("t1", "0.1", "A", 10, 5.0),
            call("t1", "0.2", "B", 12, 5.0),
            call("t2", "0.1", "A", 100_000, 5.0),
            call("t2", "0.2", "B", 100_000, 5.0),
        ];
        let result = aggregate(&records, &[pair("A", "B")], &config, Some(&enricher)).unwrap();
        let context = result.records[0].context.as_ref().unwrap();
        assert_eq!(context.system_load.high.total, 1);
        assert_eq!(context.system_load.high.concurrent, 1);
        assert_eq!(context.system_load.missing, 1);
        assert_eq!(result.stats.enrichment.load_hits, 1);
        assert_eq!(result.stats.enrichment.load_misses, 1);
    }
}
