//! CLI argument parsing for sibscope

use crate::config::{AnalysisConfig, LookupStrategy};
use crate::pipeline::AnalyzeInputs;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for analysis results
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Flat CSV, one row per sibling pair (default)
    Csv,
    /// JSON document with summary and distribution
    Json,
}

/// Metric kind stored in a time-bucket index
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MetricKind {
    /// CPU/memory utilization (`msname,cpu_utilization,memory_utilization`)
    SystemLoad,
    /// Provider call rate (`msname,providerrpc_mcr`)
    CallRate,
}

#[derive(Parser, Debug)]
#[command(name = "sibscope")]
#[command(version)]
#[command(
    about = "Sibling-call concurrency analysis for microservice call graphs",
    long_about = None
)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long, global = true)]
    pub debug: bool,

    /// TOML analysis configuration (unset fields keep their defaults)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List sibling pairs found in a call-graph
    Discover {
        /// Call-graph CSV file or directory of CSV files
        #[arg(value_name = "CALL_GRAPH")]
        call_graph: PathBuf,

        /// Write pairs to this file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Classify execution order of every sibling pair
    Analyze(AnalyzeArgs),

    /// Build and save a time-bucket index from metric CSV
    BuildIndex {
        #[arg(value_enum)]
        kind: MetricKind,

        /// Metric CSV file or directory of CSV files
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Index file to write
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// Call-graph CSV file or directory of CSV files
    #[arg(value_name = "CALL_GRAPH")]
    pub call_graph: PathBuf,

    /// System load (node/microservice resource) CSV file or directory
    #[arg(long, value_name = "PATH")]
    pub system_load: Option<PathBuf>,

    /// Call rate (MCR) CSV file or directory
    #[arg(long, value_name = "PATH")]
    pub call_rate: Option<PathBuf>,

    /// Prebuilt system load index (overrides --system-load)
    #[arg(long, value_name = "FILE")]
    pub system_load_index: Option<PathBuf>,

    /// Prebuilt call rate index (overrides --call-rate)
    #[arg(long, value_name = "FILE")]
    pub call_rate_index: Option<PathBuf>,

    /// Directory for batch files, results and the run report
    #[arg(short, long, value_name = "DIR", default_value = "sibling_analysis")]
    pub output_dir: PathBuf,

    /// Output format for the merged results
    #[arg(long = "format", value_enum, default_value = "csv")]
    pub format: OutputFormat,

    /// Sibling pairs per batch
    #[arg(long, value_name = "N")]
    pub batch_size: Option<usize>,

    /// Worker threads (0 = available parallelism)
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Use a linear closest-bucket scan instead of the time-bucket index
    #[arg(long)]
    pub linear_scan: bool,
}

impl AnalyzeArgs {
    /// Apply command-line overrides on top of file/default configuration
    pub fn apply(&self, config: &mut AnalysisConfig) {
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if self.linear_scan {
            config.lookup = LookupStrategy::LinearScan;
        }
    }

    pub fn inputs(&self) -> AnalyzeInputs {
        AnalyzeInputs {
            call_graph: self.call_graph.clone(),
            system_load: self.system_load.clone(),
            call_rate: self.call_rate.clone(),
            system_load_index: self.system_load_index.clone(),
            call_rate_index: self.call_rate_index.clone(),
            output_dir: self.output_dir.clone(),
            format: self.format,
        }
    }
}
