use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Lenient;
use crate::{
    models::{CodeEdge, CodeNode, NodeMetrics},
    store::GraphStore,
};

pub const SECURITY_CAPABILITY: &str = "security";
pub const REFACTORING_CAPABILITY: &str = "refactoring";
const DEPENDENCY_CAPABILITIES: [&str; 2] = ["dependencies", "dependency-analysis"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTask {
    pub id: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
}

/// Last known state of an agent, as reported by `agentUpdate`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub agent_id: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub current_task: Option<AgentTask>,
    pub relevant_files: Vec<String>,
    pub dependencies: Vec<String>,
    pub metrics: BTreeMap<String, f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl AgentState {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c.eq_ignore_ascii_case(capability))
    }

    pub fn task_id(&self) -> Option<&str> {
        self.current_task.as_ref().and_then(|task| task.id.as_deref())
    }
}

/// Normalized outbound `agentUpdate`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentUpdate {
    pub agent_id: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub task_id: Option<String>,
    pub task_status: Option<String>,
    pub current_task: Option<AgentTask>,
    pub relevant_files: Vec<String>,
    pub tracked_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<String>,
}

pub fn parse_agent_update(payload: &Value) -> (AgentState, Vec<String>) {
    let mut lenient = Lenient::default();
    let object = lenient.object(payload);

    let agent_id = lenient.required(object, "agentId").unwrap_or_default();
    let agent_type = lenient
        .string(object, "agentType")
        .unwrap_or_else(|| "unknown".to_string());
    let capabilities = lenient.strings(object, "capabilities");

    let task_object = lenient.nested(object, "currentTask");
    let current_task = task_object.map(|_| AgentTask {
        id: lenient.string(task_object, "id"),
        description: lenient.string(task_object, "description"),
        status: lenient.string(task_object, "status"),
        priority: lenient.string(task_object, "priority"),
    });

    let context = lenient.nested(object, "context");
    let relevant_files = lenient.strings(context, "relevantFiles");
    let dependencies = lenient.strings(context, "dependencies");
    let mut metrics = BTreeMap::new();
    if let Some(metrics_object) = lenient.nested(context, "metrics") {
        for name in metrics_object.keys() {
            if let Some(value) = lenient.number(Some(metrics_object), name) {
                metrics.insert(name.clone(), value);
            }
        }
    }

    let state = AgentState {
        agent_id,
        agent_type,
        capabilities,
        current_task,
        relevant_files,
        dependencies,
        metrics,
        updated_at: Some(Utc::now()),
    };
    (state, lenient.anomalies)
}

pub fn normalize_update(state: &AgentState, store: &GraphStore, anomalies: Vec<String>) -> AgentUpdate {
    AgentUpdate {
        agent_id: state.agent_id.clone(),
        agent_type: state.agent_type.clone(),
        capabilities: state.capabilities.clone(),
        task_id: state.task_id().map(ToString::to_string),
        task_status: state.current_task.as_ref().and_then(|task| task.status.clone()),
        current_task: state.current_task.clone(),
        relevant_files: state.relevant_files.clone(),
        tracked_files: state
            .relevant_files
            .iter()
            .filter(|path| store.contains(path))
            .cloned()
            .collect(),
        anomalies,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentContextRequest {
    pub agent_id: Option<String>,
    pub task_id: Option<String>,
    pub capabilities: Vec<String>,
    pub required_context: Vec<String>,
    pub relevant_files: Vec<String>,
}

impl AgentContextRequest {
    fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c.eq_ignore_ascii_case(capability))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContextSlice {
    pub agent_id: Option<String>,
    pub task_id: Option<String>,
    pub nodes: Vec<CodeNode>,
    pub relationships: Vec<CodeEdge>,
    pub metrics: BTreeMap<String, NodeMetrics>,
    pub suggestions: Vec<String>,
}

impl AgentContextSlice {
    pub fn empty(agent_id: Option<String>, task_id: Option<String>) -> Self {
        Self {
            agent_id,
            task_id,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.relationships.is_empty()
    }
}

/// Merges what the caller asked for with what the tracked agent already
/// declared. Capabilities and files from both sides are kept.
pub fn merge_request(request: &AgentContextRequest, known: Option<&AgentState>) -> AgentContextRequest {
    let mut merged = request.clone();
    if let Some(agent) = known {
        merged.capabilities.extend(agent.capabilities.iter().cloned());
        merged.relevant_files.extend(agent.relevant_files.iter().cloned());
        merged.required_context.extend(agent.dependencies.iter().cloned());
        if merged.task_id.is_none() {
            merged.task_id = agent.task_id().map(ToString::to_string);
        }
    }
    merged
}

/// The part of the graph an agent may see. Vulnerabilities are only
/// exposed to security agents and smells only to refactoring agents;
/// dependency agents get one extra hop of neighbours.
pub fn build_context(store: &GraphStore, request: &AgentContextRequest) -> AgentContextSlice {
    let security = request.has_capability(SECURITY_CAPABILITY);
    let refactoring = request.has_capability(REFACTORING_CAPABILITY);
    let expand = DEPENDENCY_CAPABILITIES
        .iter()
        .any(|capability| request.has_capability(capability));

    let mut ids = request
        .required_context
        .iter()
        .chain(&request.relevant_files)
        .filter(|id| store.contains(id))
        .cloned()
        .collect::<BTreeSet<_>>();

    if expand {
        let seeds = ids.iter().cloned().collect::<Vec<_>>();
        for id in seeds {
            if let Some(node) = store.get_node(&id) {
                let relationships = &node.relationships;
                let neighbours = node
                    .dependencies
                    .iter()
                    .chain(&relationships.imports)
                    .chain(&relationships.uses)
                    .chain(&relationships.used_by)
                    .filter(|neighbour| store.contains(neighbour))
                    .cloned()
                    .collect::<Vec<_>>();
                ids.extend(neighbours);
            }
            for edge in store.edges_of(&id) {
                for end in [edge.from, edge.to] {
                    if store.contains(&end) {
                        ids.insert(end);
                    }
                }
            }
        }
    }

    let mut slice = AgentContextSlice::empty(request.agent_id.clone(), request.task_id.clone());
    let mut suggestions = BTreeSet::new();

    for id in &ids {
        let Some(stored) = store.get_node(id) else {
            continue;
        };
        let mut node = stored.clone();
        suggestions.extend(node.analysis.suggestions.iter().cloned());
        if security {
            for vulnerability in &node.analysis.vulnerabilities {
                suggestions.insert(format!("Address {vulnerability} in {}", node.path));
            }
        } else {
            node.analysis.vulnerabilities.clear();
        }
        if refactoring {
            for smell in &node.analysis.smells {
                suggestions.insert(format!("Refactor {smell} in {}", node.path));
            }
        } else {
            node.analysis.smells.clear();
        }
        slice.metrics.insert(id.clone(), node.metrics.clone());
        slice.nodes.push(node);
    }

    let mut seen_edges = BTreeSet::new();
    for id in &ids {
        for edge in store.edges_of(id) {
            if ids.contains(&edge.from)
                && ids.contains(&edge.to)
                && seen_edges.insert((edge.from.clone(), edge.to.clone()))
            {
                slice.relationships.push(edge);
            }
        }
    }

    slice.suggestions = suggestions.into_iter().collect();
    slice
}

/// Reads the reply to `requestAgentContext`. The reply names files and
/// context ids; the slice itself is always cut from the local graph.
pub fn parse_context_reply(reply: &Value) -> Option<AgentContextRequest> {
    let body = reply.get("context").filter(|c| c.is_object()).unwrap_or(reply);
    serde_json::from_value(body.clone()).ok()
}
