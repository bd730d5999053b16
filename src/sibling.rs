//! Sibling-relationship discovery
//!
//! Two calls are siblings when they share a trace, a parent rpc prefix and a
//! caller service. The parent prefix is the rpc path with its last dot
//! segment removed:
//!
//! ```text
//! trace t1, caller UM
//!   0.1      → prefix "0"     ┐
//!   0.2      → prefix "0"     ├─ siblings under ("t1", "0", UM)
//!   0.3      → prefix "0"     ┘
//!   0.2.1    → prefix "0.2"   ── different parent context
//!   0        → prefix ""      ── root level, still a valid context
//! ```
//!
//! Discovery only establishes *which* pairs exist. Counting observations is
//! the aggregator's job, which replays timing for each discovered pair.

use crate::error::PipelineError;
use crate::record::CallRecord;
use fnv::{FnvHashMap, FnvHashSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// Key grouping calls made by one caller under one parent invocation.
///
/// Borrows from the call record it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParentContext<'r> {
    pub trace_id: &'r str,
    pub parent_prefix: &'r str,
    pub caller_service: &'r str,
}

impl<'r> ParentContext<'r> {
    /// Derive the parent context of a call record
    pub fn of(record: &'r CallRecord, row: usize) -> Result<Self, PipelineError> {
        Ok(Self {
            trace_id: &record.trace_id,
            parent_prefix: parent_prefix(&record.rpc_path, row)?,
            caller_service: &record.caller_service,
        })
    }
}

/// Parent prefix of an rpc path (`"0.1.2"` → `"0.1"`, `"0"` → `""`)
///
/// # Errors
///
/// `InvalidKey` when the path is empty or whitespace only.
pub fn parent_prefix(rpc_path: &str, row: usize) -> Result<&str, PipelineError> {
    let trimmed = rpc_path.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::InvalidKey {
            row,
            reason: "empty rpc path".to_string(),
        });
    }
    Ok(match trimmed.rsplit_once('.') {
        Some((prefix, _)) => prefix,
        None => "",
    })
}

/// Unordered pair of distinct sibling services under one parent context.
///
/// The two services are stored in lexicographic order, so `(A, B)` and
/// `(B, A)` are the same key. The same two services under a different
/// parent prefix or caller are a different pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SiblingPair {
    /// Lexicographically smaller service ("dm1")
    pub first: String,
    /// Lexicographically larger service ("dm2")
    pub second: String,
    pub parent_prefix: String,
    pub caller_service: String,
}

impl SiblingPair {
    /// Canonicalize a pair; `None` when both services are the same
    pub fn new(
        a: impl Into<String>,
        b: impl Into<String>,
        parent_prefix: impl Into<String>,
        caller_service: impl Into<String>,
    ) -> Option<Self> {
        let (a, b) = (a.into(), b.into());
        if a == b {
            return None;
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        Some(Self {
            first,
            second,
            parent_prefix: parent_prefix.into(),
            caller_service: caller_service.into(),
        })
    }

    /// The two services, ignoring parent prefix and caller
    pub fn services(&self) -> (&str, &str) {
        (&self.first, &self.second)
    }
}

/// Counters reported by discovery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryStats {
    pub rows_total: usize,
    pub valid_rpc_paths: usize,
    pub invalid_rpc_paths: usize,
    pub traces: usize,
    pub parent_contexts: usize,
    /// Parent contexts with at least two distinct callee services
    pub sibling_contexts: usize,
    pub pairs: usize,
}

impl fmt::Display for DiscoveryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} valid / {} invalid rpc paths, {} traces, {} of {} parent contexts with siblings, {} pairs",
            self.valid_rpc_paths,
            self.invalid_rpc_paths,
            self.traces,
            self.sibling_contexts,
            self.parent_contexts,
            self.pairs
        )
    }
}

/// Result of sibling discovery
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub pairs: BTreeSet<SiblingPair>,
    pub stats: DiscoveryStats,
}

impl Discovery {
    /// Pairs as a vector in canonical order, ready for batching
    pub fn pair_list(&self) -> Vec<SiblingPair> {
        self.pairs.iter().cloned().collect()
    }

    /// Distinct services appearing in any pair
    pub fn services(&self) -> HashSet<&str> {
        self.pairs
            .iter()
            .flat_map(|p| [p.first.as_str(), p.second.as_str()])
            .collect()
    }
}

/// Discover sibling pairs in a set of call-graph rows.
///
/// Rows with an empty rpc path are skipped and counted as invalid.
pub fn discover(records: &[CallRecord]) -> Discovery {
    // parent context → distinct callees
    let mut contexts: FnvHashMap<ParentContext<'_>, BTreeSet<&str>> = FnvHashMap::default();
    let mut traces: FnvHashSet<&str> = FnvHashSet::default();
    let mut stats = DiscoveryStats {
        rows_total: records.len(),
        ..DiscoveryStats::default()
    };

    for (row, record) in records.iter().enumerate() {
        let context = match ParentContext::of(record, row) {
            Ok(context) => context,
            Err(e) => {
                tracing::trace!("Skipping row: {}", e);
                stats.invalid_rpc_paths += 1;
                continue;
            }
        };
        stats.valid_rpc_paths += 1;
        traces.insert(context.trace_id);

        contexts
            .entry(context)
            .or_default()
            .insert(record.callee_service.as_str());
    }

    stats.traces = traces.len();
    stats.parent_contexts = contexts.len();

    let mut pairs = BTreeSet::new();
    for (context, callees) in &contexts {
        if callees.len() < 2 {
            continue;
        }
        stats.sibling_contexts += 1;

        let callees: Vec<&str> = callees.iter().copied().collect();
        for i in 0..callees.len() {
            for j in (i + 1)..callees.len() {
                if let Some(pair) = SiblingPair::new(
                    callees[i],
                    callees[j],
                    context.parent_prefix,
                    context.caller_service,
                ) {
                    pairs.insert(pair);
                }
            }
        }
    }

    stats.pairs = pairs.len();

    tracing::info!(
        valid = stats.valid_rpc_paths,
        invalid = stats.invalid_rpc_paths,
        traces = stats.traces,
        pairs = stats.pairs,
        "Sibling discovery complete"
    );

    Discovery { pairs, stats }
}
