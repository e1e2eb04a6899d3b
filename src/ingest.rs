use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    error::{AnalysisError, ValidationError},
    models::{ChangeKind, CodeEdge, GitHistoryEntry, DEFAULT_NODE_TYPE, IMPORTS_EDGE},
    store::{parse_metrics, GraphStore},
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContentChange {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DependencyChange {
    pub path: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AnalysisBody {
    patterns: Vec<String>,
    smells: Vec<String>,
    vulnerabilities: Vec<String>,
    suggestions: Vec<String>,
    documentation: Option<String>,
    last_modified: Option<DateTime<Utc>>,
    contributors: Vec<String>,
    contributor: Option<String>,
    commit: Option<GitHistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisUpdate {
    pub path: String,
    pub patterns: Vec<String>,
    pub smells: Vec<String>,
    pub vulnerabilities: Vec<String>,
    pub suggestions: Vec<String>,
    pub documentation: Option<String>,
    pub last_modified: DateTime<Utc>,
    pub contributors: Vec<String>,
    pub commit: Option<GitHistoryEntry>,
}

/// Metrics and annotations returned by the content analyzer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyzerResult {
    pub metrics: Vec<(String, f64)>,
    pub patterns: Vec<String>,
    pub smells: Vec<String>,
    pub vulnerabilities: Vec<String>,
    pub suggestions: Vec<String>,
    pub documentation: Option<String>,
}

fn required_path(data: &Value) -> Result<String, ValidationError> {
    data.get("path")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(ToString::to_string)
        .ok_or(ValidationError::MissingField {
            kind: "event",
            field: "path",
        })
}

fn invalid(field: &str, err: serde_json::Error) -> ValidationError {
    ValidationError::InvalidField {
        field: field.to_string(),
        message: err.to_string(),
    }
}

pub fn parse_content_change(data: &Value) -> Result<ContentChange, ValidationError> {
    let path = required_path(data)?;
    let content = data
        .get("content")
        .and_then(Value::as_str)
        .ok_or(ValidationError::MissingField {
            kind: "event",
            field: "content",
        })?;
    Ok(ContentChange {
        path,
        content: content.to_string(),
    })
}

pub fn parse_dependency_change(data: &Value) -> Result<DependencyChange, ValidationError> {
    let path = required_path(data)?;
    let mut change: DependencyChange =
        serde_json::from_value(data.clone()).map_err(|err| invalid("dependencies", err))?;
    change.path = path;
    change.dependencies.retain(|dep| !dep.trim().is_empty());
    Ok(change)
}

/// Accepts the analysis either nested under `analysis` or inline. The
/// modification time falls back to the commit timestamp, then to now.
pub fn parse_analysis_update(data: &Value) -> Result<AnalysisUpdate, ValidationError> {
    let path = required_path(data)?;
    let body_value = data.get("analysis").unwrap_or(data);
    let body: AnalysisBody =
        serde_json::from_value(body_value.clone()).map_err(|err| invalid("analysis", err))?;

    let mut contributors = body.contributors;
    if let Some(contributor) = body.contributor {
        contributors.push(contributor);
    }
    if let Some(author) = body.commit.as_ref().and_then(|commit| commit.author.clone()) {
        contributors.push(author);
    }

    let last_modified = body
        .last_modified
        .or_else(|| body.commit.as_ref().and_then(|commit| commit.timestamp))
        .unwrap_or_else(Utc::now);

    Ok(AnalysisUpdate {
        path,
        patterns: body.patterns,
        smells: body.smells,
        vulnerabilities: body.vulnerabilities,
        suggestions: body.suggestions,
        documentation: body.documentation,
        last_modified,
        contributors,
        commit: body.commit,
    })
}

pub fn parse_analyzer_response(path: &str, response: &Value) -> Result<AnalyzerResult, AnalysisError> {
    let failure = |message: String| AnalysisError {
        path: path.to_string(),
        message,
    };

    if let Some(error) = response.get("error").filter(|error| !error.is_null()) {
        let message = error
            .as_str()
            .map(ToString::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(failure(message));
    }

    let metrics = match response.get("metrics").filter(|m| !m.is_null()) {
        Some(value) => parse_metrics(value).map_err(|err| failure(err.to_string()))?,
        None => Vec::new(),
    };

    let analysis = response.get("analysis").unwrap_or(response);
    let body: AnalysisBody = serde_json::from_value(analysis.clone())
        .map_err(|err| failure(format!("malformed analysis: {err}")))?;

    Ok(AnalyzerResult {
        metrics,
        patterns: body.patterns,
        smells: body.smells,
        vulnerabilities: body.vulnerabilities,
        suggestions: body.suggestions,
        documentation: body.documentation,
    })
}

/// Replaces the node's outgoing dependencies and keeps the reverse `usedBy`
/// sets and `imports` edges in step. Returns the ids whose state changed.
pub fn apply_dependency_change(
    store: &mut GraphStore,
    change: &DependencyChange,
    payload: &Value,
) -> BTreeSet<String> {
    let path = change.path.as_str();
    let wanted = change
        .dependencies
        .iter()
        .filter(|dep| dep.as_str() != path)
        .cloned()
        .collect::<BTreeSet<_>>();
    let previous = store
        .get_node(path)
        .map(|node| node.relationships.imports.clone())
        .unwrap_or_default();

    let mut changed = BTreeSet::new();
    if store.modify_node(path, DEFAULT_NODE_TYPE, ChangeKind::Dependency, payload, |node| {
        node.relationships.imports = wanted.clone();
        node.relationships.uses = wanted.clone();
        node.dependencies = wanted.clone();
    }) {
        changed.insert(path.to_string());
    }

    for dep in &wanted {
        let owner = path.to_string();
        if store.modify_node(dep, DEFAULT_NODE_TYPE, ChangeKind::Dependency, payload, |node| {
            node.relationships.used_by.insert(owner);
        }) {
            changed.insert(dep.clone());
        }
        // An existing edge keeps whatever upsertEdge recorded on it.
        if store.edge(path, dep).is_none() {
            store.put_edge(CodeEdge::new(path, dep.as_str(), IMPORTS_EDGE), payload);
        }
    }

    for dropped in previous.difference(&wanted) {
        if store.contains(dropped)
            && store.modify_node(dropped, DEFAULT_NODE_TYPE, ChangeKind::Dependency, payload, |node| {
                node.relationships.used_by.remove(path);
            })
        {
            changed.insert(dropped.clone());
        }
        let is_import = store
            .edge(path, dropped)
            .is_some_and(|edge| edge.edge_type == IMPORTS_EDGE);
        if is_import {
            // Present by the check above.
            let _ = store.remove_edge(path, dropped);
        }
    }

    changed
}

pub fn apply_analysis_update(store: &mut GraphStore, update: &AnalysisUpdate, payload: &Value) -> bool {
    store.modify_node(&update.path, DEFAULT_NODE_TYPE, ChangeKind::Analysis, payload, |node| {
        let analysis = &mut node.analysis;
        analysis.patterns.extend(update.patterns.iter().cloned());
        analysis.smells.extend(update.smells.iter().cloned());
        analysis.vulnerabilities.extend(update.vulnerabilities.iter().cloned());
        analysis.suggestions.extend(update.suggestions.iter().cloned());
        if let Some(documentation) = &update.documentation {
            analysis.documentation = Some(documentation.clone());
        }
        analysis.last_modified = Some(update.last_modified);
        for contributor in &update.contributors {
            analysis.add_contributor(contributor);
        }
        if let Some(commit) = &update.commit {
            analysis.add_history(commit.clone());
        }
    })
}

pub fn apply_analyzer_result(
    store: &mut GraphStore,
    path: &str,
    result: &AnalyzerResult,
    payload: &Value,
) -> bool {
    store.modify_node(path, DEFAULT_NODE_TYPE, ChangeKind::File, payload, |node| {
        for (name, value) in &result.metrics {
            node.metrics.set(name, *value);
        }
        let analysis = &mut node.analysis;
        analysis.patterns.extend(result.patterns.iter().cloned());
        analysis.smells.extend(result.smells.iter().cloned());
        analysis.vulnerabilities.extend(result.vulnerabilities.iter().cloned());
        analysis.suggestions.extend(result.suggestions.iter().cloned());
        if let Some(documentation) = &result.documentation {
            analysis.documentation = Some(documentation.clone());
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn deps(path: &str, list: &[&str]) -> (DependencyChange, Value) {
        let payload = json!({ "path": path, "dependencies": list });
        (parse_dependency_change(&payload).unwrap(), payload)
    }

    #[test]
    fn dependency_change_links_both_directions() {
        let mut store = GraphStore::default();
        let (change, payload) = deps("src/app.ts", &["src/a.ts", "src/b.ts"]);
        apply_dependency_change(&mut store, &change, &payload);

        let app = store.get_node("src/app.ts").unwrap();
        assert_eq!(app.relationships.imports.len(), 2);
        assert_eq!(app.relationships.uses, app.relationships.imports);
        for dep in ["src/a.ts", "src/b.ts"] {
            let node = store.get_node(dep).expect("created on first reference");
            assert!(node.relationships.used_by.contains("src/app.ts"));
        }
        assert_eq!(store.edges_of("src/app.ts").len(), 2);
    }

    #[test]
    fn dependency_change_drops_stale_links() {
        let mut store = GraphStore::default();
        let (first, payload) = deps("src/app.ts", &["src/a.ts", "src/b.ts"]);
        apply_dependency_change(&mut store, &first, &payload);
        let (second, payload) = deps("src/app.ts", &["src/b.ts"]);
        let changed = apply_dependency_change(&mut store, &second, &payload);

        assert!(changed.contains("src/a.ts"));
        assert!(store
            .get_node("src/a.ts")
            .unwrap()
            .relationships
            .used_by
            .is_empty());
        assert!(store.edge("src/app.ts", "src/a.ts").is_none());
        assert!(store.edge("src/app.ts", "src/b.ts").is_some());
    }

    #[test]
    fn dependency_change_keeps_existing_edge_details() {
        let mut store = GraphStore::default();
        store
            .upsert_edge(&json!({
                "from": "src/app.ts",
                "to": "src/a.ts",
                "type": "calls",
                "weight": 0.4,
                "metadata": { "lineNumber": 12, "strength": 0.9 }
            }))
            .unwrap();
        let before = store.edge("src/app.ts", "src/a.ts").cloned().unwrap();

        let (change, payload) = deps("src/app.ts", &["src/a.ts", "src/b.ts"]);
        apply_dependency_change(&mut store, &change, &payload);

        assert_eq!(store.edge("src/app.ts", "src/a.ts"), Some(&before));
        assert_eq!(before.metadata.line_number, Some(12));
        assert_eq!(store.edge("src/app.ts", "src/b.ts").unwrap().edge_type, IMPORTS_EDGE);
    }

    #[test]
    fn dependency_change_is_idempotent() {
        let mut store = GraphStore::default();
        let (change, payload) = deps("src/app.ts", &["src/a.ts"]);
        apply_dependency_change(&mut store, &change, &payload);
        let history = store.history().len();

        let changed = apply_dependency_change(&mut store, &change, &payload);
        assert!(changed.is_empty());
        assert_eq!(store.history().len(), history);
    }

    #[test]
    fn analysis_update_merges_and_deduplicates() {
        let mut store = GraphStore::default();
        let payload = json!({
            "path": "src/a.ts",
            "analysis": {
                "patterns": ["factory"],
                "smells": ["long-method"],
                "contributors": ["ana", "ana"],
                "commit": {
                    "hash": "c0ffee",
                    "author": "bo",
                    "message": "refactor",
                    "timestamp": "2026-01-02T03:04:05Z"
                }
            }
        });
        let update = parse_analysis_update(&payload).unwrap();
        assert!(apply_analysis_update(&mut store, &update, &payload));
        assert!(!apply_analysis_update(&mut store, &update, &payload));

        let analysis = &store.get_node("src/a.ts").unwrap().analysis;
        assert_eq!(analysis.contributors, vec!["ana".to_string(), "bo".to_string()]);
        assert_eq!(analysis.git_history.len(), 1);
        assert_eq!(
            analysis.last_modified.unwrap().to_rfc3339(),
            "2026-01-02T03:04:05+00:00"
        );
    }

    #[test]
    fn events_without_path_are_rejected() {
        assert!(parse_content_change(&json!({ "content": "x" })).is_err());
        assert!(parse_dependency_change(&json!({ "dependencies": [] })).is_err());
        assert!(parse_analysis_update(&json!({ "analysis": {} })).is_err());
        assert!(parse_dependency_change(&json!({ "path": "a", "dependencies": [1] })).is_err());
    }

    #[test]
    fn analyzer_failure_is_an_analysis_error() {
        let err = parse_analyzer_response("src/a.ts", &json!({ "error": "parser crashed" })).unwrap_err();
        assert_eq!(err.path, "src/a.ts");
        assert_eq!(err.message, "parser crashed");

        let err = parse_analyzer_response("src/a.ts", &json!({ "metrics": { "lines": "many" } })).unwrap_err();
        assert!(err.message.contains("lines"));
    }

    #[test]
    fn analyzer_result_merges_metrics_into_new_node() {
        let mut store = GraphStore::default();
        let response = json!({
            "metrics": { "lines": 40, "coverage": 2.5 },
            "analysis": { "smells": ["todo-comment"], "documentation": "Entry point" }
        });
        let result = parse_analyzer_response("src/a.ts", &response).unwrap();
        apply_analyzer_result(&mut store, "src/a.ts", &result, &response);

        let node = store.get_node("src/a.ts").unwrap();
        assert_eq!(node.metrics.lines, 40.0);
        assert_eq!(node.metrics.coverage, 1.0);
        assert_eq!(node.analysis.documentation.as_deref(), Some("Entry point"));
    }
}
