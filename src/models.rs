use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_NODE_TYPE: &str = "file";
pub const IMPORTS_EDGE: &str = "imports";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeMetrics {
    pub complexity: f64,
    pub lines: f64,
    pub coverage: f64,
    pub maintainability: f64,
    pub cognitive_complexity: f64,
    pub cyclomatic_complexity: f64,
    pub halstead_volume: f64,
    pub halstead_difficulty: f64,
    pub halstead_effort: f64,
}

impl NodeMetrics {
    pub const NAMES: [&'static str; 9] = [
        "complexity",
        "lines",
        "coverage",
        "maintainability",
        "cognitiveComplexity",
        "cyclomaticComplexity",
        "halsteadVolume",
        "halsteadDifficulty",
        "halsteadEffort",
    ];

    pub fn get(&self, name: &str) -> Option<f64> {
        let value = match name {
            "complexity" => self.complexity,
            "lines" => self.lines,
            "coverage" => self.coverage,
            "maintainability" => self.maintainability,
            "cognitiveComplexity" => self.cognitive_complexity,
            "cyclomaticComplexity" => self.cyclomatic_complexity,
            "halsteadVolume" => self.halstead_volume,
            "halsteadDifficulty" => self.halstead_difficulty,
            "halsteadEffort" => self.halstead_effort,
            _ => return None,
        };
        Some(value)
    }

    /// Stores `value` clamped into the metric's valid range. Returns `false`
    /// for names that are not metrics.
    pub fn set(&mut self, name: &str, value: f64) -> bool {
        let value = clamp_metric(name, value);
        let slot = match name {
            "complexity" => &mut self.complexity,
            "lines" => &mut self.lines,
            "coverage" => &mut self.coverage,
            "maintainability" => &mut self.maintainability,
            "cognitiveComplexity" => &mut self.cognitive_complexity,
            "cyclomaticComplexity" => &mut self.cyclomatic_complexity,
            "halsteadVolume" => &mut self.halstead_volume,
            "halsteadDifficulty" => &mut self.halstead_difficulty,
            "halsteadEffort" => &mut self.halstead_effort,
            _ => return false,
        };
        *slot = value;
        true
    }
}

/// Coverage and maintainability are ratios in `[0, 1]`; everything else is a
/// non-negative magnitude.
pub fn clamp_metric(name: &str, value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    match name {
        "coverage" | "maintainability" => value.clamp(0.0, 1.0),
        _ => value.max(0.0),
    }
}

pub fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Relationships {
    pub imports: BTreeSet<String>,
    pub exports: BTreeSet<String>,
    pub extends: BTreeSet<String>,
    pub implements: BTreeSet<String>,
    pub uses: BTreeSet<String>,
    pub used_by: BTreeSet<String>,
}

impl Relationships {
    pub const NAMES: [&'static str; 6] =
        ["imports", "exports", "extends", "implements", "uses", "usedBy"];

    pub fn set_mut(&mut self, name: &str) -> Option<&mut BTreeSet<String>> {
        match name {
            "imports" => Some(&mut self.imports),
            "exports" => Some(&mut self.exports),
            "extends" => Some(&mut self.extends),
            "implements" => Some(&mut self.implements),
            "uses" => Some(&mut self.uses),
            "usedBy" => Some(&mut self.used_by),
            _ => None,
        }
    }

    pub fn forget(&mut self, id: &str) -> bool {
        let mut changed = false;
        for set in [
            &mut self.imports,
            &mut self.exports,
            &mut self.extends,
            &mut self.implements,
            &mut self.uses,
            &mut self.used_by,
        ] {
            changed |= set.remove(id);
        }
        changed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeContext {
    pub namespace: Option<String>,
    pub module: Option<String>,
    pub scope: Option<String>,
    pub visibility: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHistoryEntry {
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeAnalysis {
    pub patterns: BTreeSet<String>,
    pub smells: BTreeSet<String>,
    pub vulnerabilities: BTreeSet<String>,
    pub suggestions: BTreeSet<String>,
    pub documentation: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub contributors: Vec<String>,
    pub git_history: Vec<GitHistoryEntry>,
}

impl NodeAnalysis {
    pub fn add_contributor(&mut self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() || self.contributors.iter().any(|c| c == name) {
            return false;
        }
        self.contributors.push(name.to_string());
        true
    }

    pub fn add_history(&mut self, entry: GitHistoryEntry) -> bool {
        if self.git_history.contains(&entry) {
            return false;
        }
        self.git_history.push(entry);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub metrics: NodeMetrics,
    #[serde(default)]
    pub relationships: Relationships,
    #[serde(default)]
    pub context: NodeContext,
    #[serde(default)]
    pub analysis: NodeAnalysis,
}

impl CodeNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: display_name(&id),
            path: id.clone(),
            id,
            node_type: node_type.into(),
            dependencies: BTreeSet::new(),
            metrics: NodeMetrics::default(),
            relationships: Relationships::default(),
            context: NodeContext::default(),
            analysis: NodeAnalysis::default(),
        }
    }

    /// A node keyed by its file path, as created by ingestion traffic.
    pub fn for_path(path: &str) -> Self {
        Self::new(path, DEFAULT_NODE_TYPE)
    }

    pub fn approx_size_bytes(&self) -> usize {
        let strings = self.id.len() + self.node_type.len() + self.name.len() + self.path.len();
        let sets = [
            &self.dependencies,
            &self.relationships.imports,
            &self.relationships.exports,
            &self.relationships.extends,
            &self.relationships.implements,
            &self.relationships.uses,
            &self.relationships.used_by,
            &self.analysis.patterns,
            &self.analysis.smells,
            &self.analysis.vulnerabilities,
            &self.analysis.suggestions,
        ]
        .iter()
        .flat_map(|set| set.iter())
        .map(|s| s.len() + 24)
        .sum::<usize>();
        let documentation = self
            .analysis
            .documentation
            .as_ref()
            .map(String::len)
            .unwrap_or(0);
        std::mem::size_of::<Self>() + strings + sets + documentation + self.analysis.git_history.len() * 96
    }
}

/// Last path segment, used as the default display name.
pub fn display_name(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .find(|segment| !segment.is_empty())
        .unwrap_or(path)
        .to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EdgeMetadata {
    pub line_number: Option<u32>,
    pub context: Option<String>,
    pub strength: Option<f64>,
    pub bidirectional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeEdge {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub edge_type: String,
    pub weight: f64,
    #[serde(default)]
    pub metadata: EdgeMetadata,
}

impl CodeEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>, edge_type: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            edge_type: edge_type.into(),
            weight: 1.0,
            metadata: EdgeMetadata::default(),
        }
    }

    pub fn touches(&self, id: &str) -> bool {
        self.from == id || self.to == id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    File,
    Dependency,
    Analysis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeHistoryEntry {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub path: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedMetrics {
    pub in_degree: usize,
    pub out_degree: usize,
    pub dependency_count: usize,
    pub dependent_count: usize,
    pub risk_score: f64,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node: CodeNode,
    pub edges: Vec<CodeEdge>,
    pub derived: DerivedMetrics,
}

/// What the content analyzer last reported for a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSnapshot {
    pub path: String,
    pub metrics: NodeMetrics,
    pub analysis: NodeAnalysis,
    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisSnapshot {
    pub fn of(node: &CodeNode) -> Self {
        Self {
            path: node.path.clone(),
            metrics: node.metrics.clone(),
            analysis: node.analysis.clone(),
            analyzed_at: Utc::now(),
        }
    }
}

/// Weighted blend of complexity, untested code and low maintainability,
/// amplified by how many nodes depend on this one.
pub fn risk_score(metrics: &NodeMetrics, dependent_count: usize) -> f64 {
    let complexity = metrics.cyclomatic_complexity.max(metrics.complexity);
    let complexity_term = (complexity / 20.0).min(1.0);
    let coverage_gap = 1.0 - metrics.coverage;
    let maintainability_gap = 1.0 - metrics.maintainability;
    let base = complexity_term * 0.5 + coverage_gap * 0.3 + maintainability_gap * 0.2;
    let fan_in = 1.0 + (dependent_count as f64 / 10.0).min(1.0);
    clamp_unit(base * fan_in / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_metrics_clamp_to_unit_interval() {
        let mut metrics = NodeMetrics::default();
        assert!(metrics.set("coverage", 1.7));
        assert!(metrics.set("maintainability", -3.0));
        assert!(metrics.set("lines", -12.0));
        assert_eq!(metrics.coverage, 1.0);
        assert_eq!(metrics.maintainability, 0.0);
        assert_eq!(metrics.lines, 0.0);
        assert!(!metrics.set("velocity", 1.0));
    }

    #[test]
    fn display_name_uses_last_segment() {
        assert_eq!(display_name("src/lib/graph.ts"), "graph.ts");
        assert_eq!(display_name("graph.ts"), "graph.ts");
        assert_eq!(display_name("src/dir/"), "dir");
    }

    #[test]
    fn node_serializes_type_field() {
        let node = CodeNode::for_path("src/a.ts");
        let value = serde_json::to_value(&node).expect("serialize");
        assert_eq!(value["type"], "file");
        assert_eq!(value["name"], "a.ts");
        assert!(value["relationships"]["usedBy"].is_array());
    }

    #[test]
    fn git_history_deduplicates_equal_entries() {
        let mut analysis = NodeAnalysis::default();
        let entry = GitHistoryEntry {
            hash: Some("abc123".into()),
            author: Some("dev".into()),
            message: Some("fix".into()),
            timestamp: None,
        };
        assert!(analysis.add_history(entry.clone()));
        assert!(!analysis.add_history(entry));
        assert_eq!(analysis.git_history.len(), 1);
    }

    #[test]
    fn risk_score_stays_in_range() {
        let metrics = NodeMetrics {
            complexity: 500.0,
            ..NodeMetrics::default()
        };
        let score = risk_score(&metrics, 1_000);
        assert!((0.0..=1.0).contains(&score));
        assert!(score > 0.9);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn every_metric_is_stored_in_range(value in proptest::num::f64::ANY, idx in 0usize..9) {
                let name = NodeMetrics::NAMES[idx];
                let mut metrics = NodeMetrics::default();
                metrics.set(name, value);
                let stored = metrics.get(name).unwrap();
                prop_assert!(stored >= 0.0);
                prop_assert!(stored.is_finite());
                if name == "coverage" || name == "maintainability" {
                    prop_assert!(stored <= 1.0);
                }
            }
        }
    }
}
