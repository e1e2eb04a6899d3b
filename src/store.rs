use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::{
    error::ValidationError,
    models::{
        ChangeHistoryEntry, ChangeKind, CodeEdge, CodeNode, EdgeMetadata, NodeAnalysis,
        NodeContext, NodeMetrics, Relationships,
    },
};

const DEFAULT_EDGE_TYPE: &str = "uses";

/// Validated node payload. Absent fields leave the stored node untouched.
#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    pub id: String,
    pub node_type: String,
    pub name: Option<String>,
    pub path: Option<String>,
    pub dependencies: Option<BTreeSet<String>>,
    pub metrics: Vec<(String, f64)>,
    pub relationships: Vec<(String, BTreeSet<String>)>,
    pub context: Option<NodeContext>,
    pub analysis: Option<NodeAnalysis>,
}

impl NodePatch {
    pub fn parse(data: &Value) -> Result<Self, ValidationError> {
        let object = data
            .as_object()
            .ok_or(ValidationError::NotAnObject { kind: "node" })?;

        let id = required_str(object, "node", "id")?;
        let node_type = required_str(object, "node", "type")?;

        let mut patch = NodePatch {
            id,
            node_type,
            name: optional_str(object, "name")?,
            path: optional_str(object, "path")?,
            ..NodePatch::default()
        };

        if let Some(value) = present(object, "dependencies") {
            patch.dependencies = Some(string_set(value, "dependencies")?);
        }

        if let Some(value) = present(object, "metrics") {
            patch.metrics = parse_metrics(value)?;
        }

        if let Some(value) = present(object, "relationships") {
            let relationships = value.as_object().ok_or_else(|| ValidationError::InvalidField {
                field: "relationships".to_string(),
                message: "expected an object".to_string(),
            })?;
            for name in Relationships::NAMES {
                if let Some(set) = present(relationships, name) {
                    let field = format!("relationships.{name}");
                    patch
                        .relationships
                        .push((name.to_string(), string_set(set, &field)?));
                }
            }
        }

        if let Some(value) = present(object, "context") {
            patch.context = Some(serde_json::from_value(value.clone()).map_err(|err| {
                ValidationError::InvalidField {
                    field: "context".to_string(),
                    message: err.to_string(),
                }
            })?);
        }

        if let Some(value) = present(object, "analysis") {
            patch.analysis = Some(serde_json::from_value(value.clone()).map_err(|err| {
                ValidationError::InvalidField {
                    field: "analysis".to_string(),
                    message: err.to_string(),
                }
            })?);
        }

        Ok(patch)
    }

    fn apply(self, node: &mut CodeNode) {
        node.node_type = self.node_type;
        if let Some(name) = self.name {
            node.name = name;
        }
        if let Some(path) = self.path {
            node.path = path;
        }
        if let Some(dependencies) = self.dependencies {
            node.dependencies = dependencies;
        }
        for (name, value) in self.metrics {
            node.metrics.set(&name, value);
        }
        for (name, set) in self.relationships {
            if let Some(slot) = node.relationships.set_mut(&name) {
                *slot = set;
            }
        }
        if let Some(context) = self.context {
            node.context = context;
        }
        if let Some(analysis) = self.analysis {
            node.analysis = analysis;
        }
    }
}

/// Parses a metrics object. Every value must be numeric; names that are not
/// known metrics are ignored.
pub fn parse_metrics(value: &Value) -> Result<Vec<(String, f64)>, ValidationError> {
    let object = value.as_object().ok_or_else(|| ValidationError::InvalidField {
        field: "metrics".to_string(),
        message: "expected an object".to_string(),
    })?;

    let mut parsed = Vec::new();
    for (name, raw) in object {
        let Some(number) = raw.as_f64() else {
            return Err(ValidationError::NonNumericMetric { name: name.clone() });
        };
        if NodeMetrics::NAMES.contains(&name.as_str()) {
            parsed.push((name.clone(), number));
        }
    }
    Ok(parsed)
}

pub fn parse_edge(data: &Value) -> Result<CodeEdge, ValidationError> {
    let object = data
        .as_object()
        .ok_or(ValidationError::NotAnObject { kind: "edge" })?;

    let from = required_str(object, "edge", "from")?;
    let to = required_str(object, "edge", "to")?;
    let edge_type = optional_str(object, "type")?.unwrap_or_else(|| DEFAULT_EDGE_TYPE.to_string());

    let weight = match present(object, "weight") {
        Some(value) => value.as_f64().ok_or_else(|| ValidationError::InvalidField {
            field: "weight".to_string(),
            message: "expected a number".to_string(),
        })?,
        None => 1.0,
    };
    if !weight.is_finite() || weight < 0.0 {
        return Err(ValidationError::InvalidField {
            field: "weight".to_string(),
            message: "must be a non-negative number".to_string(),
        });
    }

    let metadata = match present(object, "metadata") {
        Some(value) => serde_json::from_value::<EdgeMetadata>(value.clone()).map_err(|err| {
            ValidationError::InvalidField {
                field: "metadata".to_string(),
                message: err.to_string(),
            }
        })?,
        None => EdgeMetadata::default(),
    };

    Ok(CodeEdge {
        from,
        to,
        edge_type,
        weight,
        metadata,
    })
}

fn present<'a>(object: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    object.get(field).filter(|value| !value.is_null())
}

fn required_str(
    object: &Map<String, Value>,
    kind: &'static str,
    field: &'static str,
) -> Result<String, ValidationError> {
    object
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or(ValidationError::MissingField { kind, field })
}

fn optional_str(object: &Map<String, Value>, field: &str) -> Result<Option<String>, ValidationError> {
    match present(object, field) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ValidationError::InvalidField {
            field: field.to_string(),
            message: "expected a string".to_string(),
        }),
    }
}

pub fn string_set(value: &Value, field: &str) -> Result<BTreeSet<String>, ValidationError> {
    let items = value.as_array().ok_or_else(|| ValidationError::InvalidField {
        field: field.to_string(),
        message: "expected an array of strings".to_string(),
    })?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(ToString::to_string)
                .ok_or_else(|| ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "expected an array of strings".to_string(),
                })
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct GraphStore {
    nodes: HashMap<String, CodeNode>,
    edges: HashMap<(String, String), CodeEdge>,
    history: Vec<ChangeHistoryEntry>,
    history_limit: Option<usize>,
    dirty: BTreeSet<String>,
}

impl GraphStore {
    pub fn new(history_limit: Option<usize>) -> Self {
        Self {
            history_limit,
            ..Self::default()
        }
    }

    pub fn get_node(&self, id: &str) -> Option<&CodeNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &CodeNode> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &CodeEdge> {
        self.edges.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn dangling_edge_count(&self) -> usize {
        self.edges
            .values()
            .filter(|edge| !self.nodes.contains_key(&edge.from) || !self.nodes.contains_key(&edge.to))
            .count()
    }

    pub fn history(&self) -> &[ChangeHistoryEntry] {
        &self.history
    }

    /// Ids whose stored state changed since the last call.
    pub fn take_dirty(&mut self) -> BTreeSet<String> {
        std::mem::take(&mut self.dirty)
    }

    pub fn approx_memory_bytes(&self) -> usize {
        let nodes = self
            .nodes
            .values()
            .map(CodeNode::approx_size_bytes)
            .sum::<usize>();
        let edges = self
            .edges
            .values()
            .map(|edge| std::mem::size_of::<CodeEdge>() + edge.from.len() * 2 + edge.to.len() * 2)
            .sum::<usize>();
        let history = self.history.len() * std::mem::size_of::<ChangeHistoryEntry>();
        nodes + edges + history
    }

    pub fn upsert_node(&mut self, data: &Value) -> Result<String, ValidationError> {
        let patch = NodePatch::parse(data)?;
        let id = patch.id.clone();
        let node_type = patch.node_type.clone();
        self.modify_node(&id, &node_type, ChangeKind::File, data, |node| patch.apply(node));
        Ok(id)
    }

    /// Gets or creates `id`, runs `apply`, and records a change only when the
    /// stored node actually differs afterwards. Returns whether it changed.
    pub fn modify_node<F>(
        &mut self,
        id: &str,
        default_type: &str,
        kind: ChangeKind,
        payload: &Value,
        apply: F,
    ) -> bool
    where
        F: FnOnce(&mut CodeNode),
    {
        let before = self.nodes.get(id).cloned();
        let node = self
            .nodes
            .entry(id.to_string())
            .or_insert_with(|| CodeNode::new(id, default_type));
        apply(node);

        let changed = before.as_ref() != Some(&*node);
        if changed {
            let path = node.path.clone();
            self.dirty.insert(id.to_string());
            self.record(kind, path, payload.clone());
        }
        changed
    }

    /// Creates a node on first reference; existing nodes are left alone.
    pub fn ensure_node(&mut self, id: &str, node_type: &str, kind: ChangeKind) -> bool {
        if self.nodes.contains_key(id) {
            return false;
        }
        self.modify_node(id, node_type, kind, &json!({ "created": id }), |_| {})
    }

    pub fn remove_node(&mut self, id: &str) -> Result<CodeNode, ValidationError> {
        let Some(node) = self.nodes.remove(id) else {
            return Err(ValidationError::UnknownNode(id.to_string()));
        };

        let before = self.edges.len();
        self.edges.retain(|_, edge| !edge.touches(id));
        let removed_edges = before - self.edges.len();

        for other in self.nodes.values_mut() {
            let mut changed = other.relationships.forget(id);
            changed |= other.dependencies.remove(id);
            if changed {
                self.dirty.insert(other.id.clone());
            }
        }

        self.dirty.insert(id.to_string());
        self.record(
            ChangeKind::File,
            node.path.clone(),
            json!({ "removed": id, "edgesRemoved": removed_edges }),
        );
        Ok(node)
    }

    pub fn upsert_edge(&mut self, data: &Value) -> Result<(String, String), ValidationError> {
        let edge = parse_edge(data)?;
        let key = (edge.from.clone(), edge.to.clone());
        self.put_edge(edge, data);
        Ok(key)
    }

    pub fn put_edge(&mut self, edge: CodeEdge, payload: &Value) -> bool {
        let key = (edge.from.clone(), edge.to.clone());
        if self.edges.get(&key) == Some(&edge) {
            return false;
        }
        self.dirty.insert(edge.from.clone());
        self.dirty.insert(edge.to.clone());
        let path = edge.from.clone();
        self.edges.insert(key, edge);
        self.record(ChangeKind::Dependency, path, payload.clone());
        true
    }

    pub fn remove_edge(&mut self, from: &str, to: &str) -> Result<CodeEdge, ValidationError> {
        let key = (from.to_string(), to.to_string());
        let Some(edge) = self.edges.remove(&key) else {
            return Err(ValidationError::UnknownEdge {
                from: from.to_string(),
                to: to.to_string(),
            });
        };
        self.dirty.insert(from.to_string());
        self.dirty.insert(to.to_string());
        self.record(
            ChangeKind::Dependency,
            from.to_string(),
            json!({ "removedEdge": { "from": from, "to": to } }),
        );
        Ok(edge)
    }

    pub fn edge(&self, from: &str, to: &str) -> Option<&CodeEdge> {
        self.edges.get(&(from.to_string(), to.to_string()))
    }

    pub fn edges_of(&self, id: &str) -> Vec<CodeEdge> {
        let mut edges = self
            .edges
            .values()
            .filter(|edge| edge.touches(id))
            .cloned()
            .collect::<Vec<_>>();
        edges.sort_by(|a, b| a.from.cmp(&b.from).then(a.to.cmp(&b.to)));
        edges
    }

    pub fn in_degree(&self, id: &str) -> usize {
        self.edges.values().filter(|edge| edge.to == id).count()
    }

    pub fn out_degree(&self, id: &str) -> usize {
        self.edges.values().filter(|edge| edge.from == id).count()
    }

    fn record(&mut self, kind: ChangeKind, path: String, payload: Value) {
        self.history.push(ChangeHistoryEntry {
            kind,
            path,
            payload,
            timestamp: Utc::now(),
        });
        if let Some(limit) = self.history_limit {
            if self.history.len() > limit {
                let overflow = self.history.len() - limit;
                self.history.drain(..overflow);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_node() -> Value {
        json!({
            "id": "src/graph.ts",
            "type": "module",
            "name": "graph",
            "path": "src/graph.ts",
            "dependencies": ["src/util.ts"],
            "metrics": { "complexity": 7, "coverage": 0.8, "lines": 120 },
            "relationships": { "imports": ["src/util.ts"] },
            "context": { "namespace": "core", "visibility": "public" },
            "analysis": { "patterns": ["observer"], "contributors": ["ana"] }
        })
    }

    #[test]
    fn upsert_then_get_returns_payload_fields() {
        let mut store = GraphStore::default();
        let id = store.upsert_node(&sample_node()).expect("valid node");

        let node = store.get_node(&id).expect("stored");
        assert_eq!(node.node_type, "module");
        assert_eq!(node.name, "graph");
        assert_eq!(node.metrics.complexity, 7.0);
        assert_eq!(node.metrics.coverage, 0.8);
        assert!(node.dependencies.contains("src/util.ts"));
        assert!(node.relationships.imports.contains("src/util.ts"));
        assert_eq!(node.context.namespace.as_deref(), Some("core"));
        assert!(node.analysis.patterns.contains("observer"));
    }

    #[test]
    fn repeated_upsert_is_idempotent() {
        let mut store = GraphStore::default();
        store.upsert_node(&sample_node()).unwrap();
        let first = store.get_node("src/graph.ts").cloned();
        let history_len = store.history().len();

        store.upsert_node(&sample_node()).unwrap();
        assert_eq!(store.get_node("src/graph.ts").cloned(), first);
        assert_eq!(store.history().len(), history_len);
        assert_eq!(store.node_count(), 1);
    }

    #[test]
    fn missing_id_or_type_is_rejected_without_mutation() {
        let mut store = GraphStore::default();
        let missing_id = store.upsert_node(&json!({ "type": "file" }));
        let missing_type = store.upsert_node(&json!({ "id": "a" }));
        let blank_id = store.upsert_node(&json!({ "id": "  ", "type": "file" }));

        assert!(matches!(
            missing_id,
            Err(ValidationError::MissingField { field: "id", .. })
        ));
        assert!(matches!(
            missing_type,
            Err(ValidationError::MissingField { field: "type", .. })
        ));
        assert!(blank_id.is_err());
        assert_eq!(store.node_count(), 0);
        assert!(store.history().is_empty());
    }

    #[test]
    fn non_numeric_metric_is_rejected() {
        let mut store = GraphStore::default();
        let result = store.upsert_node(&json!({
            "id": "a", "type": "file", "metrics": { "complexity": "high" }
        }));
        assert_eq!(
            result,
            Err(ValidationError::NonNumericMetric {
                name: "complexity".into()
            })
        );
        assert_eq!(store.node_count(), 0);
    }

    #[test]
    fn out_of_range_metrics_are_clamped() {
        let mut store = GraphStore::default();
        store
            .upsert_node(&json!({
                "id": "a", "type": "file",
                "metrics": { "coverage": 140, "maintainability": -1, "lines": -4 }
            }))
            .unwrap();
        let metrics = &store.get_node("a").unwrap().metrics;
        assert_eq!(metrics.coverage, 1.0);
        assert_eq!(metrics.maintainability, 0.0);
        assert_eq!(metrics.lines, 0.0);
    }

    #[test]
    fn upsert_merges_with_existing_fields() {
        let mut store = GraphStore::default();
        store.upsert_node(&sample_node()).unwrap();
        store
            .upsert_node(&json!({ "id": "src/graph.ts", "type": "module", "metrics": { "lines": 10 } }))
            .unwrap();
        let node = store.get_node("src/graph.ts").unwrap();
        assert_eq!(node.metrics.lines, 10.0);
        assert_eq!(node.metrics.complexity, 7.0);
        assert_eq!(node.name, "graph");
    }

    #[test]
    fn edges_tolerate_missing_targets() {
        let mut store = GraphStore::default();
        store
            .upsert_edge(&json!({ "from": "a", "to": "b", "type": "imports", "weight": 2 }))
            .unwrap();
        assert_eq!(store.edge_count(), 1);
        assert_eq!(store.dangling_edge_count(), 1);
        assert_eq!(store.edges_of("b").len(), 1);

        store.ensure_node("a", "file", ChangeKind::Dependency);
        store.ensure_node("b", "file", ChangeKind::Dependency);
        assert_eq!(store.dangling_edge_count(), 0);
    }

    #[test]
    fn edge_without_endpoints_is_rejected() {
        let mut store = GraphStore::default();
        assert!(store.upsert_edge(&json!({ "from": "a" })).is_err());
        assert!(store.upsert_edge(&json!({ "from": "", "to": "b" })).is_err());
        assert!(store
            .upsert_edge(&json!({ "from": "a", "to": "b", "weight": "heavy" }))
            .is_err());
        assert_eq!(store.edge_count(), 0);
    }

    #[test]
    fn remove_node_cleans_up_references() {
        let mut store = GraphStore::default();
        store.upsert_node(&sample_node()).unwrap();
        store
            .upsert_node(&json!({
                "id": "src/util.ts", "type": "file",
                "relationships": { "usedBy": ["src/graph.ts"] }
            }))
            .unwrap();
        store
            .upsert_edge(&json!({ "from": "src/graph.ts", "to": "src/util.ts" }))
            .unwrap();
        store.take_dirty();

        store.remove_node("src/graph.ts").expect("known node");

        assert!(store.get_node("src/graph.ts").is_none());
        assert_eq!(store.edge_count(), 0);
        let util = store.get_node("src/util.ts").unwrap();
        assert!(util.relationships.used_by.is_empty());
        let dirty = store.take_dirty();
        assert!(dirty.contains("src/util.ts"));
        assert!(dirty.contains("src/graph.ts"));
    }

    #[test]
    fn removing_unknown_ids_is_a_validation_error() {
        let mut store = GraphStore::default();
        assert!(matches!(
            store.remove_node("ghost"),
            Err(ValidationError::UnknownNode(_))
        ));
        assert!(matches!(
            store.remove_edge("a", "b"),
            Err(ValidationError::UnknownEdge { .. })
        ));
    }

    #[test]
    fn history_limit_drops_oldest_entries() {
        let mut store = GraphStore::new(Some(2));
        for i in 0..5 {
            store
                .upsert_node(&json!({ "id": format!("n{i}"), "type": "file" }))
                .unwrap();
        }
        let paths = store
            .history()
            .iter()
            .map(|entry| entry.path.as_str())
            .collect::<Vec<_>>();
        assert_eq!(paths, vec!["n3", "n4"]);
    }
}
