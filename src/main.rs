use anyhow::{Context, Result};
use clap::Parser;
use sibscope::aggregator::CancellationToken;
use sibscope::cli::{Cli, Command};
use sibscope::config::AnalysisConfig;
use sibscope::pipeline;
use std::io::Write;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber; `--debug` raises everything to TRACE
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<AnalysisConfig> {
    match &cli.config {
        Some(path) => AnalysisConfig::from_toml(path),
        None => Ok(AnalysisConfig::default()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.debug);

    let mut config = load_config(&cli)?;

    match &cli.command {
        Command::Discover { call_graph, output } => {
            let (discovery, ingest) = pipeline::discover(call_graph)
                .with_context(|| format!("Failed to read call graph {}", call_graph.display()))?;
            match output {
                Some(path) => pipeline::write_pairs(&discovery, path)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => {
                    let csv = sibscope::csv_output::pairs_to_csv(&discovery.pair_list());
                    std::io::stdout().lock().write_all(csv.as_bytes())?;
                }
            }
            eprintln!("Call graph: {}", ingest);
            eprintln!("Discovery: {}", discovery.stats);
            eprintln!(
                "Found {} sibling pairs in {} traces",
                discovery.stats.pairs, discovery.stats.traces
            );
        }
        Command::Analyze(args) => {
            args.apply(&mut config);
            let report = pipeline::analyze(&args.inputs(), &config, CancellationToken::new())
                .context("Analysis failed")?;
            eprint!("{}", report);
        }
        Command::BuildIndex {
            kind,
            input,
            output,
        } => {
            let count = pipeline::build_index(*kind, input, output, &config)
                .with_context(|| format!("Failed to build index from {}", input.display()))?;
            eprintln!("Indexed {} samples into {}", count, output.display());
        }
    }

    Ok(())
}
