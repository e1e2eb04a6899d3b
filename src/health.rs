use std::{collections::BTreeSet, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{cache::CacheStats, profiler::PerformanceProfiler};

pub const STALE_CACHE_ISSUE: &str = "cache data is stale";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    StaleCache,
    SlowOperation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthIssue {
    pub category: IssueCategory,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub metrics_cache: CacheStats,
    pub analysis_cache: CacheStats,
    pub tracked_operations: usize,
    pub slowest_average_ms: f64,
    pub node_count: usize,
    pub edge_count: usize,
    pub dangling_edges: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: HealthState,
    pub issues: Vec<HealthIssue>,
    pub metrics: HealthMetrics,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct GraphCounts {
    pub nodes: usize,
    pub edges: usize,
    pub dangling_edges: usize,
}

/// Healthy with no issue categories, degraded with exactly one, unhealthy
/// once two or more categories show up together.
pub fn classify(issues: &[HealthIssue]) -> HealthState {
    let categories = issues
        .iter()
        .map(|issue| issue.category)
        .collect::<BTreeSet<_>>();
    match categories.len() {
        0 => HealthState::Healthy,
        1 => HealthState::Degraded,
        _ => HealthState::Unhealthy,
    }
}

pub fn evaluate(
    metrics_cache: CacheStats,
    analysis_cache: CacheStats,
    profiler: &PerformanceProfiler,
    slow_threshold: Duration,
    counts: GraphCounts,
) -> HealthStatus {
    let mut issues = Vec::new();

    if metrics_cache.stale_entries + analysis_cache.stale_entries > 0 {
        issues.push(HealthIssue {
            category: IssueCategory::StaleCache,
            message: STALE_CACHE_ISSUE.to_string(),
        });
    }

    for name in profiler.slow_operations(slow_threshold) {
        issues.push(HealthIssue {
            category: IssueCategory::SlowOperation,
            message: format!("slow operation: {name}"),
        });
    }

    let snapshot = profiler.snapshot();
    let slowest_average_ms = snapshot
        .operations
        .values()
        .map(|stats| stats.average_ms)
        .fold(0.0, f64::max);

    HealthStatus {
        status: classify(&issues),
        issues,
        metrics: HealthMetrics {
            metrics_cache,
            analysis_cache,
            tracked_operations: snapshot.operations.len(),
            slowest_average_ms,
            node_count: counts.nodes,
            edge_count: counts.edges,
            dangling_edges: counts.dangling_edges,
        },
        checked_at: Utc::now(),
    }
}
