use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStats {
    pub count: u64,
    pub total_ms: f64,
    pub average_ms: f64,
    pub max_ms: f64,
    pub last_ms: f64,
}

impl OperationStats {
    fn record(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.count += 1;
        self.total_ms += ms;
        self.average_ms = self.total_ms / self.count as f64;
        self.max_ms = self.max_ms.max(ms);
        self.last_ms = ms;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileOperationMetrics {
    pub count: u64,
    pub total_ms: f64,
    pub average_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileReport {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    /// Change of the approximate graph footprint in bytes.
    pub memory_usage: i64,
    pub operation_metrics: BTreeMap<String, ProfileOperationMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSnapshot {
    pub operations: BTreeMap<String, OperationStats>,
    pub active_profiles: Vec<String>,
}

#[derive(Debug)]
struct ActiveProfile {
    operations: Vec<String>,
    started: Instant,
    started_at: DateTime<Utc>,
    start_memory: usize,
    baseline: HashMap<String, OperationStats>,
}

#[derive(Debug, Default)]
pub struct PerformanceProfiler {
    operations: BTreeMap<String, OperationStats>,
    profiles: HashMap<String, ActiveProfile>,
}

impl PerformanceProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_performance(&mut self, name: &str, start: Instant) {
        self.record(name, start.elapsed());
    }

    pub fn record(&mut self, name: &str, elapsed: Duration) {
        self.operations
            .entry(name.to_string())
            .or_default()
            .record(elapsed);
    }

    pub fn stats(&self, name: &str) -> Option<&OperationStats> {
        self.operations.get(name)
    }

    /// Opens (or restarts) a session. An empty operation list follows every
    /// operation.
    pub fn start_profile(&mut self, id: &str, operations: &[String], memory_bytes: usize) {
        let baseline = self
            .operations
            .iter()
            .filter(|(name, _)| operations.is_empty() || operations.contains(name))
            .map(|(name, stats)| (name.clone(), stats.clone()))
            .collect();

        self.profiles.insert(
            id.to_string(),
            ActiveProfile {
                operations: operations.to_vec(),
                started: Instant::now(),
                started_at: Utc::now(),
                start_memory: memory_bytes,
                baseline,
            },
        );
    }

    pub fn end_profile(&mut self, id: &str, memory_bytes: usize) -> Option<ProfileReport> {
        let profile = self.profiles.remove(id)?;

        let names = if profile.operations.is_empty() {
            self.operations.keys().cloned().collect::<Vec<_>>()
        } else {
            profile.operations.clone()
        };

        let mut operation_metrics = BTreeMap::new();
        for name in names {
            let current = self.operations.get(&name).cloned().unwrap_or_default();
            let before = profile.baseline.get(&name).cloned().unwrap_or_default();
            let count = current.count.saturating_sub(before.count);
            let total_ms = (current.total_ms - before.total_ms).max(0.0);
            operation_metrics.insert(
                name,
                ProfileOperationMetrics {
                    count,
                    total_ms,
                    average_ms: if count == 0 { 0.0 } else { total_ms / count as f64 },
                },
            );
        }

        Some(ProfileReport {
            id: id.to_string(),
            started_at: profile.started_at,
            duration_ms: profile.started.elapsed().as_secs_f64() * 1000.0,
            memory_usage: memory_bytes as i64 - profile.start_memory as i64,
            operation_metrics,
        })
    }

    pub fn slow_operations(&self, threshold: Duration) -> Vec<String> {
        let threshold_ms = threshold.as_secs_f64() * 1000.0;
        self.operations
            .iter()
            .filter(|(_, stats)| stats.average_ms > threshold_ms)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let mut active_profiles = self.profiles.keys().cloned().collect::<Vec<_>>();
        active_profiles.sort();
        PerformanceSnapshot {
            operations: self.operations.clone(),
            active_profiles,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_updates_count_and_average() {
        let mut profiler = PerformanceProfiler::new();
        profiler.record("upsertNode", Duration::from_millis(10));
        profiler.record("upsertNode", Duration::from_millis(30));

        let stats = profiler.stats("upsertNode").unwrap();
        assert_eq!(stats.count, 2);
        assert!((stats.average_ms - 20.0).abs() < 1e-6);
        assert!((stats.max_ms - 30.0).abs() < 1e-6);
    }

    #[test]
    fn track_performance_measures_from_start() {
        let mut profiler = PerformanceProfiler::new();
        profiler.track_performance("search", Instant::now());
        assert_eq!(profiler.stats("search").unwrap().count, 1);
    }

    #[test]
    fn end_unknown_profile_returns_none() {
        let mut profiler = PerformanceProfiler::new();
        assert!(profiler.end_profile("never-started", 0).is_none());
    }

    #[test]
    fn profile_closes_once() {
        let mut profiler = PerformanceProfiler::new();
        profiler.start_profile("p", &[], 0);
        assert!(profiler.end_profile("p", 0).is_some());
        assert!(profiler.end_profile("p", 0).is_none());
    }

    #[test]
    fn profile_reports_only_listed_operations_since_start() {
        let mut profiler = PerformanceProfiler::new();
        profiler.record("upsertNode", Duration::from_millis(5));
        profiler.start_profile("p", &["upsertNode".to_string()], 1_000);
        profiler.record("upsertNode", Duration::from_millis(7));
        profiler.record("search", Duration::from_millis(9));

        let report = profiler.end_profile("p", 1_500).unwrap();
        assert_eq!(report.memory_usage, 500);
        assert_eq!(report.operation_metrics.len(), 1);
        let upserts = &report.operation_metrics["upsertNode"];
        assert_eq!(upserts.count, 1);
        assert!((upserts.total_ms - 7.0).abs() < 1e-6);
    }

    #[test]
    fn concurrent_profiles_are_independent() {
        let mut profiler = PerformanceProfiler::new();
        profiler.start_profile("a", &["op".to_string()], 0);
        profiler.record("op", Duration::from_millis(1));
        profiler.start_profile("b", &["op".to_string()], 0);
        profiler.record("op", Duration::from_millis(1));

        let b = profiler.end_profile("b", 0).unwrap();
        assert_eq!(profiler.snapshot().active_profiles, vec!["a".to_string()]);
        let a = profiler.end_profile("a", 0).unwrap();
        assert_eq!(a.operation_metrics["op"].count, 2);
        assert_eq!(b.operation_metrics["op"].count, 1);
    }

    #[test]
    fn slow_operations_use_average_duration() {
        let mut profiler = PerformanceProfiler::new();
        profiler.record("fast", Duration::from_millis(2));
        profiler.record("slow", Duration::from_millis(250));
        assert_eq!(
            profiler.slow_operations(Duration::from_millis(100)),
            vec!["slow".to_string()]
        );
    }
}
