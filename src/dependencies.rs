//! Cross-context comparison of sibling pairs
//!
//! The same two services often run as siblings under several parents. A
//! pair whose concurrency differs strongly between those parents is a
//! context-specific dependency: whether the calls overlap depends on who
//! issued them, not on the two services themselves.

use crate::aggregator::PatternRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pattern of one service pair under one parent context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPattern {
    pub parent_prefix: String,
    pub caller_service: String,
    pub p_concurrent: f64,
    pub p_first_then_second: f64,
    pub p_second_then_first: f64,
    pub total_observations: u64,
}

/// A service pair whose concurrency varies across parent contexts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDependency {
    pub first: String,
    pub second: String,
    /// `max(p_concurrent) - min(p_concurrent)` over all contexts
    pub max_difference: f64,
    pub contexts: Vec<ContextPattern>,
}

/// Summary of the context-specific analysis
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyReport {
    /// Distinct service pairs, ignoring parent context
    pub service_pairs: usize,
    /// Service pairs seen under more than one parent context
    pub multi_context_pairs: usize,
    /// Pairs above the divergence threshold, largest spread first
    pub dependencies: Vec<ContextDependency>,
}

/// Find service pairs whose `p_concurrent` spread across contexts exceeds
/// `divergence_threshold`
pub fn context_specific_dependencies(
    records: &[PatternRecord],
    divergence_threshold: f64,
) -> DependencyReport {
    let mut by_services: BTreeMap<(&str, &str), Vec<&PatternRecord>> = BTreeMap::new();
    for record in records {
        by_services
            .entry(record.pair.services())
            .or_default()
            .push(record);
    }

    let mut report = DependencyReport {
        service_pairs: by_services.len(),
        ..DependencyReport::default()
    };

    for ((first, second), patterns) in by_services {
        if patterns.len() < 2 {
            continue;
        }
        report.multi_context_pairs += 1;

        let (min, max) = patterns
            .iter()
            .map(|p| p.p_concurrent)
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p), hi.max(p))
            });
        let spread = max - min;
        if spread <= divergence_threshold {
            continue;
        }

        report.dependencies.push(ContextDependency {
            first: first.to_string(),
            second: second.to_string(),
            max_difference: spread,
            contexts: patterns
                .iter()
                .map(|p| ContextPattern {
                    parent_prefix: p.pair.parent_prefix.clone(),
                    caller_service: p.pair.caller_service.clone(),
                    p_concurrent: p.p_concurrent,
                    p_first_then_second: p.p_first_then_second,
                    p_second_then_first: p.p_second_then_first,
                    total_observations: p.total_observations,
                })
                .collect(),
        });
    }

    // Stable: ties keep service-pair order
    report
        .dependencies
        .sort_by(|a, b| b.max_difference.total_cmp(&a.max_difference));

    tracing::info!(
        service_pairs = report.service_pairs,
        multi_context = report.multi_context_pairs,
        context_specific = report.dependencies.len(),
        "Context-specific dependency analysis complete"
    );

    report
}

/// Pair counts by concurrency band
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternDistribution {
    /// `p_concurrent == 1.0`
    pub always_concurrent: usize,
    /// `0.7 <= p_concurrent < 1.0`
    pub mostly_concurrent: usize,
    /// `0.3 <= p_concurrent < 0.7`
    pub mixed: usize,
    /// `p_concurrent < 0.3`
    pub mostly_sequential: usize,
}

impl PatternDistribution {
    pub fn from_records(records: &[PatternRecord]) -> Self {
        let mut dist = Self::default();
        for record in records {
            let p = record.p_concurrent;
            if p >= 1.0 {
                dist.always_concurrent += 1;
            } else if p >= 0.7 {
                dist.mostly_concurrent += 1;
            } else if p >= 0.3 {
                dist.mixed += 1;
            } else {
                dist.mostly_sequential += 1;
            }
        }
        dist
    }

    pub fn total(&self) -> usize {
        self.always_concurrent + self.mostly_concurrent + self.mixed + self.mostly_sequential
    }

    /// Pairs that are sometimes sequential
    pub fn context_dependent(&self) -> usize {
        self.total() - self.always_concurrent
    }
}
