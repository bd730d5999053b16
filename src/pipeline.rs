//! Run orchestration: ingest, discover, enrich, aggregate, write
//!
//! Stage failures follow one rule: a missing or unreadable call-graph stops
//! the run, while a broken metric source only removes that context dimension
//! (logged and recorded in the report).

use crate::aggregator::{
    AggregationStats, Aggregator, BatchSink, CancellationToken, PatternRecord,
};
use crate::bucket_index::TimeBucketIndex;
use crate::cli::{MetricKind, OutputFormat};
use crate::config::AnalysisConfig;
use crate::context::{ContextEnricher, MetricSource};
use crate::csv_output::{dependencies_to_csv, pairs_to_csv, PatternCsv};
use crate::dependencies::{context_specific_dependencies, PatternDistribution};
use crate::error::{PipelineError, Result};
use crate::ingest::{self, IngestStats};
use crate::json_output::JsonOutput;
use crate::record::{CallRateSample, CallRecord, MetricSample, SystemLoadSample};
use crate::sibling::{self, Discovery, DiscoveryStats};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const RESULTS_STEM: &str = "sibling_analysis_results";
pub const DEPENDENCIES_FILE: &str = "context_specific_dependencies.csv";
pub const REPORT_FILE: &str = "run_report.json";

/// Where a run reads its inputs and writes its outputs
#[derive(Debug, Clone)]
pub struct AnalyzeInputs {
    pub call_graph: PathBuf,
    pub system_load: Option<PathBuf>,
    pub call_rate: Option<PathBuf>,
    /// Prebuilt index used instead of `system_load`
    pub system_load_index: Option<PathBuf>,
    /// Prebuilt index used instead of `call_rate`
    pub call_rate_index: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub format: OutputFormat,
}

/// Counts from every stage of one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub call_graph: IngestStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_load: Option<IngestStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_rate: Option<IngestStats>,
    pub discovery: DiscoveryStats,
    pub aggregation: AggregationStats,
    pub distribution: PatternDistribution,
    pub context_specific_pairs: usize,
    /// Context dimensions dropped because their source was unusable
    pub degraded: Vec<String>,
    pub outputs: Vec<PathBuf>,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.aggregation;
        writeln!(f, "=== Sibling Analysis Report ===")?;
        writeln!(f, "Call graph: {}", self.call_graph)?;
        if let Some(stats) = &self.system_load {
            writeln!(f, "System load: {}", stats)?;
        }
        if let Some(stats) = &self.call_rate {
            writeln!(f, "Call rate: {}", stats)?;
        }
        writeln!(f, "Discovery: {}", self.discovery)?;
        writeln!(
            f,
            "Aggregation: {}/{} batches, {} pairs emitted, {} without common traces, {} observations",
            a.batches_completed,
            a.batches_total,
            a.pairs_emitted,
            a.pairs_without_common_traces,
            a.observations
        )?;
        writeln!(
            f,
            "Timing: {} rows, {} zero response times widened, {} invalid",
            a.timing_rows, a.zero_response_adjusted, a.invalid_timing_rows
        )?;
        writeln!(
            f,
            "Context: load {} hit / {} missed, rate {} hit / {} missed",
            a.enrichment.load_hits,
            a.enrichment.load_misses,
            a.enrichment.rate_hits,
            a.enrichment.rate_misses
        )?;
        if a.enrichment.load_hits + a.enrichment.load_misses > 0 {
            writeln!(f, "Load lookup: {}", a.enrichment.load_lag)?;
        }
        if a.enrichment.rate_hits + a.enrichment.rate_misses > 0 {
            writeln!(f, "Rate lookup: {}", a.enrichment.rate_lag)?;
        }
        let dist = &self.distribution;
        writeln!(
            f,
            "Patterns: {} always concurrent, {} mostly concurrent, {} mixed, {} mostly sequential",
            dist.always_concurrent, dist.mostly_concurrent, dist.mixed, dist.mostly_sequential
        )?;
        writeln!(f, "Context-specific pairs: {}", self.context_specific_pairs)?;
        for reason in &self.degraded {
            writeln!(f, "Degraded: {}", reason)?;
        }
        if a.cancelled {
            writeln!(f, "Run cancelled before all batches completed")?;
        }
        Ok(())
    }
}

/// Writes each completed batch as `sibling_analysis_batch_<n>.csv`
#[derive(Debug)]
pub struct FileBatchSink {
    dir: PathBuf,
    csv: PatternCsv,
    written: Vec<PathBuf>,
}

impl FileBatchSink {
    pub fn new(dir: impl Into<PathBuf>, include_context: bool) -> Self {
        Self {
            dir: dir.into(),
            csv: PatternCsv::new(include_context),
            written: Vec::new(),
        }
    }

    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

impl BatchSink for FileBatchSink {
    fn on_batch(&mut self, batch_index: usize, records: &[PatternRecord]) -> Result<()> {
        let path = self
            .dir
            .join(format!("sibling_analysis_batch_{}.csv", batch_index + 1));
        self.csv.write_to(&path, records)?;
        self.written.push(path);
        Ok(())
    }
}

/// Read the call-graph, failing when it yields no usable rows
pub fn load_call_graph(path: &Path) -> Result<(Vec<CallRecord>, IngestStats)> {
    let ingested = ingest::read_call_graph(path)?;
    if ingested.records.is_empty() {
        return Err(PipelineError::NoData(format!(
            "no call-graph rows read from {}",
            path.display()
        )));
    }
    Ok((ingested.records, ingested.stats))
}

/// Discover sibling pairs in a call-graph file or directory
pub fn discover(path: &Path) -> Result<(Discovery, IngestStats)> {
    let (records, stats) = load_call_graph(path)?;
    Ok((sibling::discover(&records), stats))
}

fn load_system_load(
    inputs: &AnalyzeInputs,
    config: &AnalysisConfig,
    report: &mut RunReport,
) -> Result<Option<MetricSource<SystemLoadSample>>> {
    if let Some(index_path) = &inputs.system_load_index {
        let index = TimeBucketIndex::load(index_path, config.bucket_width)?
            .with_max_radius(config.max_radius);
        return Ok(Some(MetricSource::Indexed(index)));
    }
    let Some(path) = &inputs.system_load else {
        return Ok(None);
    };
    let ingested = ingest::read_system_load(path)?;
    report.system_load = Some(ingested.stats);
    if ingested.records.is_empty() {
        return Err(PipelineError::IndexBuild(format!(
            "no system load samples in {}",
            path.display()
        )));
    }
    Ok(Some(MetricSource::from_samples(ingested.records, config)))
}

enum CallRateInput {
    Samples(Vec<CallRateSample>),
    Index(TimeBucketIndex<CallRateSample>),
}

fn load_call_rate(
    inputs: &AnalyzeInputs,
    config: &AnalysisConfig,
    report: &mut RunReport,
) -> Result<Option<CallRateInput>> {
    if let Some(index_path) = &inputs.call_rate_index {
        let index = TimeBucketIndex::load(index_path, config.bucket_width)?
            .with_max_radius(config.max_radius);
        return Ok(Some(CallRateInput::Index(index)));
    }
    let Some(path) = &inputs.call_rate else {
        return Ok(None);
    };
    let ingested = ingest::read_call_rate(path)?;
    report.call_rate = Some(ingested.stats);
    if ingested.records.is_empty() {
        return Err(PipelineError::IndexBuild(format!(
            "no call rate samples in {}",
            path.display()
        )));
    }
    Ok(Some(CallRateInput::Samples(ingested.records)))
}

/// Build the context enricher; unusable sources are dropped, not fatal
pub fn build_enricher(
    inputs: &AnalyzeInputs,
    config: &AnalysisConfig,
    report: &mut RunReport,
) -> ContextEnricher {
    let mut enricher = ContextEnricher::new(config);

    match load_system_load(inputs, config, report) {
        Ok(Some(source)) => {
            tracing::info!(samples = source.len(), "System load context ready");
            enricher = enricher.with_system_load(source);
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!("System load context unavailable: {}", e);
            report.degraded.push(format!("system load: {}", e));
        }
    }

    match load_call_rate(inputs, config, report) {
        Ok(Some(CallRateInput::Samples(samples))) => {
            tracing::info!(samples = samples.len(), "Call rate context ready");
            enricher = enricher.with_call_rate(samples, config);
        }
        Ok(Some(CallRateInput::Index(index))) => {
            tracing::info!(samples = index.len(), "Call rate index loaded");
            enricher = enricher.with_call_rate_index(index, config);
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!("Call rate context unavailable: {}", e);
            report.degraded.push(format!("call rate: {}", e));
        }
    }

    enricher
}

/// Run the complete analysis and write all outputs to `inputs.output_dir`
pub fn analyze(
    inputs: &AnalyzeInputs,
    config: &AnalysisConfig,
    cancel: CancellationToken,
) -> Result<RunReport> {
    config.validate().map_err(PipelineError::Config)?;
    fs::create_dir_all(&inputs.output_dir)?;

    let mut report = RunReport::default();

    let (records, call_graph_stats) = load_call_graph(&inputs.call_graph)?;
    report.call_graph = call_graph_stats;

    let discovery = sibling::discover(&records);
    report.discovery = discovery.stats.clone();
    let pairs = discovery.pair_list();

    let enricher = build_enricher(inputs, config, &mut report);
    let include_context = enricher.has_context();

    let mut sink = FileBatchSink::new(&inputs.output_dir, include_context);
    let mut aggregator = Aggregator::new(config).with_cancellation(cancel);
    if include_context {
        aggregator = aggregator.with_enricher(&enricher);
    }
    let aggregation = aggregator.run(&records, &pairs, &mut sink)?;
    report.outputs.extend(sink.written().iter().cloned());
    report.aggregation = aggregation.stats;

    let patterns = aggregation.records;
    report.distribution = PatternDistribution::from_records(&patterns);
    let dependencies = context_specific_dependencies(&patterns, config.divergence_threshold);
    report.context_specific_pairs = dependencies.dependencies.len();

    if !dependencies.dependencies.is_empty() {
        let path = inputs.output_dir.join(DEPENDENCIES_FILE);
        fs::write(&path, dependencies_to_csv(&dependencies))?;
        report.outputs.push(path);
    }

    let results_path = match inputs.format {
        OutputFormat::Csv => {
            let path = inputs.output_dir.join(format!("{}.csv", RESULTS_STEM));
            PatternCsv::new(include_context).write_to(&path, &patterns)?;
            path
        }
        OutputFormat::Json => {
            let path = inputs.output_dir.join(format!("{}.json", RESULTS_STEM));
            let output = JsonOutput::new(patterns).with_dependencies(dependencies);
            fs::write(&path, output.to_json()?)?;
            path
        }
    };
    report.outputs.push(results_path);

    let report_path = inputs.output_dir.join(REPORT_FILE);
    report.outputs.push(report_path.clone());
    fs::write(&report_path, serde_json::to_string_pretty(&report)?)?;

    tracing::info!(
        pairs = report.aggregation.pairs_emitted,
        output_dir = %inputs.output_dir.display(),
        "Analysis complete"
    );

    Ok(report)
}

/// Build a time-bucket index from raw metric CSV and save it
///
/// Returns the number of indexed samples.
pub fn build_index(
    kind: MetricKind,
    input: &Path,
    output: &Path,
    config: &AnalysisConfig,
) -> Result<usize> {
    config.validate().map_err(PipelineError::Config)?;

    match kind {
        MetricKind::SystemLoad => {
            let ingested = ingest::read_system_load(input)?;
            save_index(ingested.records, output, config)
        }
        MetricKind::CallRate => {
            let ingested = ingest::read_call_rate(input)?;
            save_index(ingested.records, output, config)
        }
    }
}

fn save_index<T>(samples: Vec<T>, output: &Path, config: &AnalysisConfig) -> Result<usize>
where
    T: MetricSample + Serialize + serde::de::DeserializeOwned,
{
    if samples.is_empty() {
        return Err(PipelineError::IndexBuild(format!(
            "no {} samples to index",
            T::KIND
        )));
    }
    let index = TimeBucketIndex::build(samples, config.bucket_width, config.max_radius);
    index.save(output)?;
    Ok(index.len())
}

/// Write discovered pairs as CSV to `path`
pub fn write_pairs(discovery: &Discovery, path: &Path) -> Result<()> {
    fs::write(path, pairs_to_csv(&discovery.pair_list()))?;
    Ok(())
}
