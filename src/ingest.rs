//! CSV ingestion for call-graph and metric files
//!
//! Each reader accepts either a single `.csv` file or a directory, in which
//! case every `*.csv` file directly inside it is read in name order. Header
//! names are matched case-insensitively against a small alias list, so both
//! `rpcid` and `rpc_id` resolve to the rpc path column.
//!
//! A file missing a required column is skipped as a whole and counted in
//! [`IngestStats::files_failed`]. Rows with the wrong field count or an
//! unparseable required value are skipped and counted. Neither aborts the
//! run.

use crate::error::{PipelineError, Result};
use crate::record::{CallRateSample, CallRecord, SystemLoadSample};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Counters reported by one ingestion call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub files_read: usize,
    pub files_failed: usize,
    pub rows_valid: usize,
    pub rows_skipped: usize,
}

impl fmt::Display for IngestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files ({} failed), {} rows ({} skipped)",
            self.files_read, self.files_failed, self.rows_valid, self.rows_skipped
        )
    }
}

/// Records read from one file or directory
#[derive(Debug, Clone)]
pub struct Ingested<T> {
    pub records: Vec<T>,
    pub stats: IngestStats,
}

/// A logical column and the header names it may appear under
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub required: bool,
}

const fn required(name: &'static str, aliases: &'static [&'static str]) -> Column {
    Column {
        name,
        aliases,
        required: true,
    }
}

const fn optional(name: &'static str, aliases: &'static [&'static str]) -> Column {
    Column {
        name,
        aliases,
        required: false,
    }
}

/// A row type that can be parsed from a CSV file
pub trait CsvRecord: Sized {
    const COLUMNS: &'static [Column];

    /// Parse a row. `cols[i]` is the field position of `COLUMNS[i]`;
    /// required columns are always `Some`.
    fn from_row(fields: &[String], cols: &[Option<usize>]) -> Option<Self>;
}

fn field<'f>(fields: &'f [String], col: Option<usize>) -> Option<&'f str> {
    col.and_then(|i| fields.get(i)).map(|s| s.trim())
}

/// Like [`field`], but a blank cell counts as missing
fn text<'f>(fields: &'f [String], col: Option<usize>) -> Option<&'f str> {
    field(fields, col).filter(|s| !s.is_empty())
}

/// Integer timestamp; integral floats (`1200.0`) are accepted too
fn parse_timestamp(value: &str) -> Option<i64> {
    value.parse::<i64>().ok().or_else(|| {
        let v = value.parse::<f64>().ok()?;
        (v.is_finite() && v.fract() == 0.0).then_some(v as i64)
    })
}

fn parse_f64(value: &str) -> Option<f64> {
    value.parse::<f64>().ok()
}

impl CsvRecord for CallRecord {
    const COLUMNS: &'static [Column] = &[
        required("traceid", &["traceid", "trace_id"]),
        required("rpcid", &["rpcid", "rpc_id"]),
        required("um", &["um"]),
        required("dm", &["dm"]),
        required("timestamp", &["timestamp"]),
        required("rt", &["rt"]),
        optional("uminstanceid", &["uminstanceid", "um_instance_id"]),
        optional("dminstanceid", &["dminstanceid", "dm_instance_id"]),
    ];

    fn from_row(fields: &[String], cols: &[Option<usize>]) -> Option<Self> {
        let start_timestamp = parse_timestamp(field(fields, cols[4])?)?;
        // Unusable response times still take part in discovery; the
        // aggregator skips and counts them when replaying timing.
        let response_time = parse_f64(field(fields, cols[5])?).unwrap_or(f64::NAN);

        // A blank rpc path is kept: discovery counts it as invalid
        Some(CallRecord {
            trace_id: text(fields, cols[0])?.to_string(),
            rpc_path: field(fields, cols[1])?.to_string(),
            caller_service: text(fields, cols[2])?.to_string(),
            callee_service: text(fields, cols[3])?.to_string(),
            caller_instance_id: field(fields, cols[6]).unwrap_or_default().to_string(),
            callee_instance_id: field(fields, cols[7]).unwrap_or_default().to_string(),
            start_timestamp,
            response_time,
        })
    }
}

impl CsvRecord for SystemLoadSample {
    const COLUMNS: &'static [Column] = &[
        required("timestamp", &["timestamp"]),
        required("msname", &["msname", "service_id"]),
        required("cpu_utilization", &["cpu_utilization"]),
        required("memory_utilization", &["memory_utilization"]),
    ];

    fn from_row(fields: &[String], cols: &[Option<usize>]) -> Option<Self> {
        let cpu = parse_f64(field(fields, cols[2])?)?;
        let memory = parse_f64(field(fields, cols[3])?)?;
        if !cpu.is_finite() || !memory.is_finite() {
            return None;
        }
        Some(SystemLoadSample {
            timestamp: parse_timestamp(field(fields, cols[0])?)?,
            service_id: text(fields, cols[1])?.to_string(),
            cpu_utilization: cpu,
            memory_utilization: memory,
        })
    }
}

impl CsvRecord for CallRateSample {
    const COLUMNS: &'static [Column] = &[
        required("timestamp", &["timestamp"]),
        required("msname", &["msname", "service_id"]),
        required("providerrpc_mcr", &["providerrpc_mcr"]),
    ];

    fn from_row(fields: &[String], cols: &[Option<usize>]) -> Option<Self> {
        let rate = parse_f64(field(fields, cols[2])?)?;
        if !rate.is_finite() {
            return None;
        }
        Some(CallRateSample {
            timestamp: parse_timestamp(field(fields, cols[0])?)?,
            service_id: text(fields, cols[1])?.to_string(),
            provider_call_rate: rate,
        })
    }
}

/// Split one CSV line into fields.
///
/// Handles double-quoted fields with `""` escapes. Quoted fields spanning
/// several lines are not supported.
pub fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Resolve column positions from a header row
///
/// # Errors
///
/// `MissingColumn` for the first required column with no matching header.
pub fn resolve_columns(
    header: &[String],
    columns: &[Column],
    source_name: &str,
) -> Result<Vec<Option<usize>>> {
    let normalized: Vec<String> = header
        .iter()
        .map(|h| h.trim().trim_start_matches('\u{feff}').to_ascii_lowercase())
        .collect();

    columns
        .iter()
        .map(|column| {
            let position = normalized
                .iter()
                .position(|h| column.aliases.iter().any(|alias| h == alias));
            match position {
                None if column.required => Err(PipelineError::MissingColumn {
                    source_name: source_name.to_string(),
                    column: column.name.to_string(),
                }),
                other => Ok(other),
            }
        })
        .collect()
}

/// CSV files under `path`: the file itself, or the `*.csv` files of a
/// directory sorted by name
pub fn csv_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files: Vec<PathBuf> = fs::read_dir(path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
        })
        .collect();
    files.sort();
    Ok(files)
}

fn read_file<T: CsvRecord>(path: &Path, stats: &mut IngestStats) -> Result<Vec<T>> {
    let source_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let reader = BufReader::new(File::open(path)?);
    let mut lines = reader.lines();

    let header = match lines.next() {
        Some(line) => split_csv_line(&line?),
        None => return Err(PipelineError::NoData(format!("{} is empty", source_name))),
    };
    let cols = resolve_columns(&header, T::COLUMNS, &source_name)?;

    let mut records = Vec::new();
    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields = split_csv_line(&line);
        if fields.len() != header.len() {
            stats.rows_skipped += 1;
            continue;
        }
        match T::from_row(&fields, &cols) {
            Some(record) => records.push(record),
            None => stats.rows_skipped += 1,
        }
    }

    stats.rows_valid += records.len();
    Ok(records)
}

/// Read every row of type `T` under `path`
///
/// # Errors
///
/// `Io` when `path` cannot be listed or a file cannot be read, `NoData`
/// when it holds no CSV files. A file that is empty or lacks a required
/// column is logged, counted in `files_failed` and skipped.
pub fn read_csv<T: CsvRecord>(path: &Path) -> Result<Ingested<T>> {
    let files = csv_files(path)?;
    if files.is_empty() {
        return Err(PipelineError::NoData(format!(
            "no CSV files found at {}",
            path.display()
        )));
    }

    let mut stats = IngestStats::default();
    let mut records = Vec::new();

    for file in &files {
        match read_file::<T>(file, &mut stats) {
            Ok(mut rows) => {
                stats.files_read += 1;
                tracing::debug!(file = %file.display(), rows = rows.len(), "Loaded CSV file");
                records.append(&mut rows);
            }
            Err(e) if e.is_recoverable() => {
                stats.files_failed += 1;
                tracing::warn!(file = %file.display(), "Skipping file: {}", e);
            }
            Err(e) => return Err(e),
        }
    }

    tracing::info!(
        path = %path.display(),
        files = stats.files_read,
        failed = stats.files_failed,
        rows = stats.rows_valid,
        skipped = stats.rows_skipped,
        "Ingestion complete"
    );

    Ok(Ingested { records, stats })
}

pub fn read_call_graph(path: &Path) -> Result<Ingested<CallRecord>> {
    read_csv(path)
}

pub fn read_system_load(path: &Path) -> Result<Ingested<SystemLoadSample>> {
    read_csv(path)
}

pub fn read_call_rate(path: &Path) -> Result<Ingested<CallRateSample>> {
    read_csv(path)
}
