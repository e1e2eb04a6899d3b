use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Component, Path},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::Lenient;
use crate::{
    ingest::{apply_dependency_change, DependencyChange},
    models::{clamp_unit, ChangeKind, DEFAULT_NODE_TYPE},
    store::GraphStore,
};

const HOTSPOT_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectMetrics {
    pub complexity: f64,
    pub maintainability: f64,
    pub test_coverage: f64,
    pub documentation: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInsights {
    pub project_id: Option<String>,
    pub metrics: ProjectMetrics,
    pub architecture: Vec<String>,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub directories: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Normalized outbound `projectUpdate`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectUpdate {
    pub project_id: Option<String>,
    pub files: Vec<String>,
    pub rejected_files: Vec<String>,
    pub directories: Vec<String>,
    pub dependencies: BTreeMap<String, Vec<String>>,
    pub metrics: ProjectMetrics,
    pub insights: ProjectInsights,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hotspot {
    pub id: String,
    pub complexity: f64,
    pub risk_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInsightsReport {
    #[serde(flatten)]
    pub insights: ProjectInsights,
    pub node_count: usize,
    pub edge_count: usize,
    pub average_complexity: f64,
    pub hotspots: Vec<Hotspot>,
    pub recent_errors: usize,
}

/// Maps a reported path to a root-relative key, or explains why it lies
/// outside the project.
pub fn normalize_project_path(raw: &str, root: &Path) -> Result<String, String> {
    let cleaned = raw.trim().replace('\\', "/");
    if cleaned.is_empty() {
        return Err("empty path".to_string());
    }

    let mut candidate = Path::new(&cleaned);
    if candidate.is_absolute() {
        match candidate.strip_prefix(root) {
            Ok(relative) if root.is_absolute() => candidate = relative,
            _ => return Err(format!("{raw}: absolute path outside the project root")),
        }
    }
    if cleaned.len() > 1 && cleaned.as_bytes()[1] == b':' {
        return Err(format!("{raw}: absolute path outside the project root"));
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => return Err(format!("{raw}: not valid UTF-8")),
            },
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(format!("{raw}: escapes the project root"));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("{raw}: absolute path outside the project root"));
            }
        }
    }

    if parts.is_empty() {
        return Err(format!("{raw}: names the project root itself"));
    }
    Ok(parts.join("/"))
}

pub fn parse_project_update(payload: &Value, root: &Path) -> ProjectUpdate {
    let mut lenient = Lenient::default();
    let object = lenient.object(payload);
    let project_id = lenient.required(object, "projectId");

    let structure = lenient.nested(object, "structure");
    let mut files = Vec::new();
    let mut rejected_files = Vec::new();
    let mut seen = BTreeSet::new();
    for raw in lenient.strings(structure, "files") {
        match normalize_project_path(&raw, root) {
            Ok(path) => {
                if seen.insert(path.clone()) {
                    files.push(path);
                }
            }
            Err(reason) => {
                lenient.anomalies.push(format!("rejected file {reason}"));
                rejected_files.push(raw);
            }
        }
    }

    let directories = lenient
        .strings(structure, "directories")
        .into_iter()
        .filter_map(|raw| match normalize_project_path(&raw, root) {
            Ok(path) => Some(path),
            Err(reason) => {
                lenient.anomalies.push(format!("rejected directory {reason}"));
                None
            }
        })
        .collect::<Vec<_>>();

    let mut dependencies = BTreeMap::new();
    if let Some(map) = lenient.nested(structure, "dependencies") {
        for key in map.keys() {
            let Ok(path) = normalize_project_path(key, root) else {
                lenient
                    .anomalies
                    .push(format!("rejected dependency source {key}"));
                continue;
            };
            let targets = lenient
                .strings(Some(map), key)
                .into_iter()
                .filter_map(|target| match normalize_project_path(&target, root) {
                    Ok(target) => Some(target),
                    Err(reason) => {
                        lenient.anomalies.push(format!("rejected dependency {reason}"));
                        None
                    }
                })
                .collect::<Vec<_>>();
            dependencies.insert(path, targets);
        }
    }

    let metrics_object = lenient.nested(object, "metrics");
    let mut metric = |name: &str| lenient.number(metrics_object, name).map(clamp_unit).unwrap_or(0.0);
    let metrics = ProjectMetrics {
        complexity: metric("complexity"),
        maintainability: metric("maintainability"),
        test_coverage: metric("testCoverage"),
        documentation: metric("documentation"),
    };

    let patterns = lenient.nested(object, "patterns");
    let insights = ProjectInsights {
        project_id: project_id.clone(),
        metrics,
        architecture: lenient.strings(patterns, "architecture"),
        issues: lenient.strings(patterns, "antiPatterns"),
        recommendations: lenient.strings(patterns, "suggestions"),
        directories: directories.clone(),
        updated_at: Some(Utc::now()),
    };

    ProjectUpdate {
        project_id,
        files,
        rejected_files,
        directories,
        dependencies,
        metrics,
        insights,
        anomalies: lenient.anomalies,
    }
}

/// Creates nodes for accepted files and replaces the dependencies of every
/// file listed in the dependency map. Returns the ids that changed.
pub fn apply_project_update(store: &mut GraphStore, update: &ProjectUpdate) -> BTreeSet<String> {
    let mut changed = BTreeSet::new();
    for path in &update.files {
        if store.ensure_node(path, DEFAULT_NODE_TYPE, ChangeKind::File) {
            changed.insert(path.clone());
        }
    }

    for (path, targets) in &update.dependencies {
        let change = DependencyChange {
            path: path.clone(),
            dependencies: targets.clone(),
        };
        let payload = json!({
            "projectId": update.project_id,
            "path": path,
            "dependencies": targets,
        });
        changed.extend(apply_dependency_change(store, &change, &payload));
    }
    changed
}

pub fn summarize(store: &GraphStore, insights: &ProjectInsights, recent_errors: usize) -> ProjectInsightsReport {
    let node_count = store.node_count();
    let total_complexity = store.nodes().map(|node| node.metrics.complexity).sum::<f64>();
    let average_complexity = if node_count == 0 {
        0.0
    } else {
        total_complexity / node_count as f64
    };

    let mut hotspots = store
        .nodes()
        .filter(|node| node.metrics.complexity > 0.0)
        .map(|node| Hotspot {
            id: node.id.clone(),
            complexity: node.metrics.complexity,
            risk_score: crate::models::risk_score(
                &node.metrics,
                node.relationships.used_by.len().max(store.in_degree(&node.id)),
            ),
        })
        .collect::<Vec<_>>();
    hotspots.sort_by(|a, b| {
        b.complexity
            .total_cmp(&a.complexity)
            .then_with(|| a.id.cmp(&b.id))
    });
    hotspots.truncate(HOTSPOT_LIMIT);

    ProjectInsightsReport {
        insights: insights.clone(),
        node_count,
        edge_count: store.edge_count(),
        average_complexity,
        hotspots,
        recent_errors,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn root() -> PathBuf {
        PathBuf::from("/work/project")
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let root = root();
        for raw in ["../invalid.ts", "src/../../x.ts", "/etc/passwd", "..", "C:/x.ts", "   "] {
            assert!(normalize_project_path(raw, &root).is_err(), "{raw} accepted");
        }
    }

    #[test]
    fn inside_paths_are_normalized() {
        let root = root();
        assert_eq!(normalize_project_path("./src/a.ts", &root).unwrap(), "src/a.ts");
        assert_eq!(normalize_project_path("src/x/../a.ts", &root).unwrap(), "src/a.ts");
        assert_eq!(normalize_project_path(r"src\b.ts", &root).unwrap(), "src/b.ts");
        assert_eq!(
            normalize_project_path("/work/project/lib/c.ts", &root).unwrap(),
            "lib/c.ts"
        );
    }

    #[test]
    fn project_update_skips_invalid_files() {
        let mut store = GraphStore::default();
        let update = parse_project_update(
            &json!({
                "projectId": "p-1",
                "structure": {
                    "files": ["src/a.ts", "../invalid.ts", "src/b.ts"],
                    "directories": ["src"],
                    "dependencies": { "src/a.ts": ["src/b.ts", "../outside.ts"] }
                },
                "metrics": { "complexity": 3.5, "maintainability": 0.7, "testCoverage": -1, "documentation": 0.4 },
                "patterns": {
                    "architecture": ["layered"],
                    "antiPatterns": ["god-object"],
                    "suggestions": ["split services"]
                }
            }),
            &root(),
        );

        assert_eq!(update.files, vec!["src/a.ts", "src/b.ts"]);
        assert_eq!(update.rejected_files, vec!["../invalid.ts"]);
        assert_eq!(update.anomalies.len(), 2);
        assert_eq!(update.metrics.complexity, 1.0);
        assert_eq!(update.metrics.test_coverage, 0.0);
        assert_eq!(update.insights.issues, vec!["god-object"]);
        assert_eq!(update.insights.recommendations, vec!["split services"]);
        assert_eq!(update.dependencies["src/a.ts"], vec!["src/b.ts"]);

        apply_project_update(&mut store, &update);
        assert!(store.get_node("../invalid.ts").is_none());
        assert!(store.get_node("invalid.ts").is_none());
        assert_eq!(store.node_count(), 2);
        assert!(store
            .get_node("src/b.ts")
            .unwrap()
            .relationships
            .used_by
            .contains("src/a.ts"));
    }

    #[test]
    fn reapplying_a_project_update_changes_nothing() {
        let mut store = GraphStore::default();
        let update = parse_project_update(
            &json!({ "projectId": "p", "structure": { "files": ["a.ts"], "dependencies": { "a.ts": ["b.ts"] } } }),
            &root(),
        );
        assert!(!apply_project_update(&mut store, &update).is_empty());
        assert!(apply_project_update(&mut store, &update).is_empty());
    }

    #[test]
    fn summary_ranks_hotspots() {
        let mut store = GraphStore::default();
        for (id, complexity) in [("a", 2.0), ("b", 9.0), ("c", 0.0)] {
            store
                .upsert_node(&json!({ "id": id, "type": "file", "metrics": { "complexity": complexity } }))
                .unwrap();
        }
        let report = summarize(&store, &ProjectInsights::default(), 4);
        assert_eq!(report.node_count, 3);
        assert_eq!(report.hotspots[0].id, "b");
        assert_eq!(report.hotspots.len(), 2);
        assert!((report.average_complexity - 11.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.recent_errors, 4);
    }
}
