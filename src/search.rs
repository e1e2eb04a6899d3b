use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::models::CodeNode;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NumericRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl NumericRange {
    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

/// All present predicates must hold. Set predicates match when the node
/// carries at least one of the listed values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeFilter {
    pub types: Vec<String>,
    pub complexity: Option<NumericRange>,
    pub coverage: Option<NumericRange>,
    pub maintainability: Option<NumericRange>,
    pub patterns: Vec<String>,
    pub smells: Vec<String>,
    pub vulnerabilities: Vec<String>,
}

impl NodeFilter {
    pub fn matches(&self, node: &CodeNode) -> bool {
        if !self.types.is_empty() && !self.types.iter().any(|t| t == &node.node_type) {
            return false;
        }

        let ranges = [
            (&self.complexity, node.metrics.complexity),
            (&self.coverage, node.metrics.coverage),
            (&self.maintainability, node.metrics.maintainability),
        ];
        for (range, value) in ranges {
            if let Some(range) = range {
                if !range.contains(value) {
                    return false;
                }
            }
        }

        intersects(&self.patterns, &node.analysis.patterns)
            && intersects(&self.smells, &node.analysis.smells)
            && intersects(&self.vulnerabilities, &node.analysis.vulnerabilities)
    }
}

fn intersects(wanted: &[String], present: &BTreeSet<String>) -> bool {
    wanted.is_empty() || wanted.iter().any(|value| present.contains(value))
}

pub fn matches_term(node: &CodeNode, term: &str) -> bool {
    let needle = term.trim().to_lowercase();
    if needle.is_empty() {
        return false;
    }

    let hit = |text: &str| text.to_lowercase().contains(&needle);
    hit(&node.name)
        || hit(&node.path)
        || node.analysis.documentation.as_deref().is_some_and(hit)
        || node.analysis.patterns.iter().any(|pattern| hit(pattern))
}

pub fn search_nodes<'a>(nodes: impl Iterator<Item = &'a CodeNode>, term: &str) -> BTreeSet<String> {
    nodes
        .filter(|node| matches_term(node, term))
        .map(|node| node.id.clone())
        .collect()
}

pub fn filter_nodes<'a>(nodes: impl Iterator<Item = &'a CodeNode>, filter: &NodeFilter) -> Vec<CodeNode> {
    let mut matched = nodes
        .filter(|node| filter.matches(node))
        .cloned()
        .collect::<Vec<_>>();
    matched.sort_by(|a, b| a.id.cmp(&b.id));
    matched
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, node_type: &str, complexity: f64, coverage: f64) -> CodeNode {
        let mut node = CodeNode::new(id, node_type);
        node.metrics.complexity = complexity;
        node.metrics.coverage = coverage;
        node
    }

    #[test]
    fn search_matches_name_path_docs_and_patterns() {
        let mut documented = node("src/a.ts", "file", 1.0, 0.5);
        documented.analysis.documentation = Some("Renders the Dependency Graph".into());
        let mut patterned = node("src/b.ts", "file", 1.0, 0.5);
        patterned.analysis.patterns.insert("singleton".into());
        let plain = node("lib/graph_view.ts", "file", 1.0, 0.5);
        let unrelated = node("src/c.ts", "file", 1.0, 0.5);

        let nodes = [documented, patterned, plain, unrelated];
        let graph_hits = search_nodes(nodes.iter(), "GRAPH");
        assert_eq!(
            graph_hits.into_iter().collect::<Vec<_>>(),
            vec!["lib/graph_view.ts".to_string(), "src/a.ts".to_string()]
        );
        assert_eq!(search_nodes(nodes.iter(), "single").len(), 1);
        assert!(search_nodes(nodes.iter(), "   ").is_empty());
    }

    #[test]
    fn filter_combines_predicates_with_and() {
        let mut risky = node("a", "module", 15.0, 0.2);
        risky.analysis.smells.insert("long-method".into());
        let simple = node("b", "module", 2.0, 0.9);
        let component = node("c", "component", 15.0, 0.2);

        let filter = NodeFilter {
            types: vec!["module".into()],
            complexity: Some(NumericRange {
                min: Some(10.0),
                max: None,
            }),
            coverage: Some(NumericRange {
                min: None,
                max: Some(0.5),
            }),
            smells: vec!["long-method".into(), "god-object".into()],
            ..NodeFilter::default()
        };

        let nodes = [risky, simple, component];
        let matched = filter_nodes(nodes.iter(), &filter);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "a");
    }

    #[test]
    fn empty_filter_matches_everything() {
        let nodes = [node("a", "file", 0.0, 0.0), node("b", "file", 0.0, 0.0)];
        assert_eq!(filter_nodes(nodes.iter(), &NodeFilter::default()).len(), 2);
    }

    #[test]
    fn filter_deserializes_from_camel_case() {
        let filter: NodeFilter = serde_json::from_value(serde_json::json!({
            "types": ["file"],
            "maintainability": { "min": 0.5 },
            "vulnerabilities": ["xss"]
        }))
        .unwrap();
        assert_eq!(filter.maintainability.unwrap().min, Some(0.5));
        assert_eq!(filter.vulnerabilities, vec!["xss".to_string()]);
    }
}
