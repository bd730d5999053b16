//! CSV output for pattern records and context-specific dependencies
//!
//! Pattern rows are flat: the pair, the three counts and ratios, and when
//! context was attached, one column per dimension/tier/field
//! (`system_load_stats_low_p_concurrent`, ...), a `<dimension>_missing`
//! column and the lookup radius/lag summary of the matched observations.

use crate::aggregator::PatternRecord;
use crate::context::{ContextStats, Tier, TierStats};
use crate::dependencies::DependencyReport;
use crate::error::Result;
use crate::sibling::SiblingPair;
use std::fs;
use std::path::Path;

const TIER_FIELDS: [&str; 5] = ["concurrent", "sequential", "total", "p_concurrent", "p_sequential"];
const LAG_FIELDS: [&str; 5] = ["exact_bucket", "mean_radius", "min_lag", "mean_lag", "max_lag"];

/// Escape CSV field (handle commas, quotes, newlines)
fn escape_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// CSV formatter for [`PatternRecord`]s
#[derive(Debug, Clone, Copy)]
pub struct PatternCsv {
    include_context: bool,
}

impl PatternCsv {
    pub fn new(include_context: bool) -> Self {
        Self { include_context }
    }

    /// Header row matching [`PatternCsv::format_record`]
    pub fn header(&self) -> String {
        let mut headers: Vec<String> = [
            "Service1",
            "Service2",
            "parent_prefix",
            "um",
            "total_observations",
            "concurrent_count",
            "sequential_s1_s2_count",
            "sequential_s2_s1_count",
            "p_concurrent",
            "p_sequential_s1_s2",
            "p_sequential_s2_s1",
        ]
        .iter()
        .map(|h| h.to_string())
        .collect();

        if self.include_context {
            for dimension in ["system_load_stats", "call_rate_stats"] {
                for tier in Tier::ALL {
                    for field in TIER_FIELDS {
                        headers.push(format!("{}_{}_{}", dimension, tier.as_str(), field));
                    }
                }
                headers.push(format!("{}_missing", dimension));
                for field in LAG_FIELDS {
                    headers.push(format!("{}_{}", dimension, field));
                }
            }
        }

        headers.join(",")
    }

    fn tier_fields(stats: &TierStats, fields: &mut Vec<String>) {
        for tier in Tier::ALL {
            let counts = stats.get(tier);
            fields.push(counts.concurrent.to_string());
            fields.push(counts.sequential.to_string());
            fields.push(counts.total.to_string());
            fields.push(optional(counts.p_concurrent()));
            fields.push(optional(counts.p_sequential()));
        }
        fields.push(stats.missing.to_string());

        let lag = &stats.lag;
        fields.push(lag.exact_bucket.to_string());
        fields.push(optional(lag.mean_radius()));
        fields.push(lag.min_lag.map(|v| v.to_string()).unwrap_or_default());
        fields.push(optional(lag.mean_lag()));
        fields.push(lag.max_lag.map(|v| v.to_string()).unwrap_or_default());
    }

    /// Format one record as a CSV row
    pub fn format_record(&self, record: &PatternRecord) -> String {
        let pair = &record.pair;
        let mut fields = vec![
            escape_field(&pair.first),
            escape_field(&pair.second),
            escape_field(&pair.parent_prefix),
            escape_field(&pair.caller_service),
            record.total_observations.to_string(),
            record.concurrent_count.to_string(),
            record.first_then_second_count.to_string(),
            record.second_then_first_count.to_string(),
            record.p_concurrent.to_string(),
            record.p_first_then_second.to_string(),
            record.p_second_then_first.to_string(),
        ];

        if self.include_context {
            let empty = ContextStats::default();
            let context = record.context.as_ref().unwrap_or(&empty);
            Self::tier_fields(&context.system_load, &mut fields);
            Self::tier_fields(&context.call_rate, &mut fields);
        }

        fields.join(",")
    }

    /// Generate CSV output as string
    pub fn to_csv(&self, records: &[PatternRecord]) -> String {
        let mut output = String::new();
        output.push_str(&self.header());
        output.push('\n');
        for record in records {
            output.push_str(&self.format_record(record));
            output.push('\n');
        }
        output
    }

    pub fn write_to(&self, path: &Path, records: &[PatternRecord]) -> Result<()> {
        fs::write(path, self.to_csv(records))?;
        tracing::debug!(path = %path.display(), rows = records.len(), "Wrote pattern CSV");
        Ok(())
    }
}

/// Discovered pairs, one row each: `dm1,dm2,parent_prefix,um`
pub fn pairs_to_csv(pairs: &[SiblingPair]) -> String {
    let mut output = String::from("dm1,dm2,parent_prefix,um\n");
    for pair in pairs {
        let fields = [
            escape_field(&pair.first),
            escape_field(&pair.second),
            escape_field(&pair.parent_prefix),
            escape_field(&pair.caller_service),
        ];
        output.push_str(&fields.join(","));
        output.push('\n');
    }
    output
}

/// Header of the context-specific dependency CSV
pub const DEPENDENCY_HEADER: &str = "Service1,Service2,Context,ParentService,P_Concurrent,\
P_Sequential_S1_S2,P_Sequential_S2_S1,Observations,Max_Difference";

/// One row per (dependency, context), dependencies in report order
pub fn dependencies_to_csv(report: &DependencyReport) -> String {
    let mut output = String::from(DEPENDENCY_HEADER);
    output.push('\n');

    for dep in &report.dependencies {
        for ctx in &dep.contexts {
            let fields = [
                escape_field(&dep.first),
                escape_field(&dep.second),
                escape_field(&ctx.parent_prefix),
                escape_field(&ctx.caller_service),
                ctx.p_concurrent.to_string(),
                ctx.p_first_then_second.to_string(),
                ctx.p_second_then_first.to_string(),
                ctx.total_observations.to_string(),
                dep.max_difference.to_string(),
            ];
            output.push_str(&fields.join(","));
            output.push('\n');
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextValue, TierCounts};
    use crate::dependencies::{ContextDependency, ContextPattern};

    fn record(context: Option<ContextStats>) -> PatternRecord {
        PatternRecord {
            pair: SiblingPair::new("MS_2", "MS_1", "0.1", "UM").unwrap(),
            total_observations: 4,
            concurrent_count: 2,
            first_then_second_count: 1,
            second_then_first_count: 1,
            p_concurrent: 0.5,
            p_first_then_second: 0.25,
            p_second_then_first: 0.25,
            context,
        }
    }

    #[test]
    fn test_escape_field() {
        assert_eq!(escape_field("hello"), "hello");
        assert_eq!(escape_field("a,b"), "\"a,b\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_basic_row() {
        let csv = PatternCsv::new(false);
        assert_eq!(
            csv.format_record(&record(None)),
            "MS_1,MS_2,0.1,UM,4,2,1,1,0.5,0.25,0.25"
        );
    }

    #[test]
    fn test_context_columns_match_header() {
        let csv = PatternCsv::new(true);
        let mut stats = ContextStats::default();
        stats.system_load.high = TierCounts {
            concurrent: 1,
            sequential: 1,
            total: 2,
        };
        stats.call_rate.missing = 4;

        let header = csv.header();
        let row = csv.format_record(&record(Some(stats)));
        let names: Vec<&str> = header.split(',').collect();
        let values: Vec<&str> = row.split(',').collect();
        assert_eq!(names.len(), values.len());

        let value_of = |name: &str| values[names.iter().position(|n| *n == name).unwrap()];
        assert_eq!(value_of("system_load_stats_high_p_concurrent"), "0.5");
        assert_eq!(value_of("system_load_stats_low_p_concurrent"), "");
        assert_eq!(value_of("system_load_stats_low_total"), "0");
        assert_eq!(value_of("call_rate_stats_missing"), "4");
    }

    #[test]
    fn test_lag_columns() {
        let csv = PatternCsv::new(true);
        let mut stats = ContextStats::default();
        for (radius, lag) in [(0, 10), (2, 120), (2, 130)] {
            stats.system_load.lag.record(&ContextValue {
                value: 0.5,
                radius,
                lag,
            });
        }

        let header = csv.header();
        let row = csv.format_record(&record(Some(stats)));
        let names: Vec<&str> = header.split(',').collect();
        let values: Vec<&str> = row.split(',').collect();
        let value_of = |name: &str| values[names.iter().position(|n| *n == name).unwrap()];

        assert_eq!(value_of("system_load_stats_exact_bucket"), "1");
        assert_eq!(value_of("system_load_stats_min_lag"), "10");
        assert_eq!(value_of("system_load_stats_max_lag"), "130");
        let mean_lag: f64 = value_of("system_load_stats_mean_lag").parse().unwrap();
        assert!((mean_lag - 260.0 / 3.0).abs() < 1e-9);
        let mean_radius: f64 = value_of("system_load_stats_mean_radius").parse().unwrap();
        assert!((mean_radius - 4.0 / 3.0).abs() < 1e-9);

        assert_eq!(value_of("call_rate_stats_exact_bucket"), "0");
        assert_eq!(value_of("call_rate_stats_min_lag"), "");
        assert_eq!(value_of("call_rate_stats_mean_lag"), "");
    }

    #[test]
    fn test_context_columns_empty_record_context() {
        let csv = PatternCsv::new(true);
        let row = csv.format_record(&record(None));
        assert_eq!(row.split(',').count(), csv.header().split(',').count());
    }

    #[test]
    fn test_to_csv_has_header_and_rows() {
        let out = PatternCsv::new(false).to_csv(&[record(None), record(None)]);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Service1,Service2,parent_prefix,um"));
    }

    #[test]
    fn test_pairs_csv() {
        let pairs = vec![
            SiblingPair::new("A", "B", "", "UM").unwrap(),
            SiblingPair::new("A", "C", "0.1", "UM").unwrap(),
        ];
        assert_eq!(
            pairs_to_csv(&pairs),
            "dm1,dm2,parent_prefix,um\nA,B,,UM\nA,C,0.1,UM\n"
        );
    }

    #[test]
    fn test_dependency_rows() {
        let report = DependencyReport {
            service_pairs: 1,
            multi_context_pairs: 1,
            dependencies: vec![ContextDependency {
                first: "A".to_string(),
                second: "B".to_string(),
                max_difference: 0.5,
                contexts: vec![
                    ContextPattern {
                        parent_prefix: String::new(),
                        caller_service: "UM".to_string(),
                        p_concurrent: 1.0,
                        p_first_then_second: 0.0,
                        p_second_then_first: 0.0,
                        total_observations: 3,
                    },
                    ContextPattern {
                        parent_prefix: "0.1".to_string(),
                        caller_service: "UM".to_string(),
                        p_concurrent: 0.5,
                        p_first_then_second: 0.5,
                        p_second_then_first: 0.0,
                        total_observations: 2,
                    },
                ],
            }],
        };
        let out = dependencies_to_csv(&report);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], DEPENDENCY_HEADER);
        assert_eq!(lines[1], "A,B,,UM,1,0,0,3,0.5");
        assert_eq!(lines[2], "A,B,0.1,UM,0.5,0.5,0,2,0.5");
    }
}
