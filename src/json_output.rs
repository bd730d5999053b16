//! JSON output format for analysis results

use crate::aggregator::PatternRecord;
use crate::dependencies::{DependencyReport, PatternDistribution};
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Summary totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonSummary {
    pub pairs: usize,
    pub observations: u64,
    /// Pairs sometimes observed sequentially
    pub context_dependent_pairs: usize,
}

/// Root JSON output structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonOutput {
    /// Crate version that produced the file
    pub version: String,
    /// Format name
    pub format: String,
    pub summary: JsonSummary,
    pub distribution: PatternDistribution,
    pub patterns: Vec<PatternRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_specific: Option<DependencyReport>,
}

impl JsonOutput {
    pub fn new(patterns: Vec<PatternRecord>) -> Self {
        let distribution = PatternDistribution::from_records(&patterns);
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            format: "sibscope-json-v1".to_string(),
            summary: JsonSummary {
                pairs: patterns.len(),
                observations: patterns.iter().map(|p| p.total_observations).sum(),
                context_dependent_pairs: distribution.context_dependent(),
            },
            distribution,
            patterns,
            context_specific: None,
        }
    }

    pub fn with_dependencies(mut self, report: DependencyReport) -> Self {
        self.context_specific = Some(report);
        self
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
