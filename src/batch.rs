use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{
    error::{GraphError, ValidationError},
    store::GraphStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchTarget {
    Node,
    Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchAction {
    Add,
    Modify,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOperation {
    #[serde(rename = "type")]
    pub target: BatchTarget,
    pub operation: BatchAction,
    #[serde(default)]
    pub data: Value,
}

impl BatchOperation {
    pub fn parse(item: &Value) -> Result<Self, ValidationError> {
        serde_json::from_value(item.clone())
            .map_err(|err| ValidationError::UnsupportedOperation(err.to_string()))
    }

    pub fn apply(&self, store: &mut GraphStore) -> Result<(), ValidationError> {
        match (self.target, self.operation) {
            (BatchTarget::Node, BatchAction::Add) => store.upsert_node(&self.data).map(|_| ()),
            (BatchTarget::Node, BatchAction::Modify) => {
                let id = field(&self.data, "id")?;
                if !store.contains(id) {
                    return Err(ValidationError::UnknownNode(id.to_string()));
                }
                store.upsert_node(&self.data).map(|_| ())
            }
            (BatchTarget::Node, BatchAction::Remove) => {
                let id = field(&self.data, "id")?;
                store.remove_node(id).map(|_| ())
            }
            (BatchTarget::Edge, BatchAction::Add) => store.upsert_edge(&self.data).map(|_| ()),
            (BatchTarget::Edge, BatchAction::Modify) => {
                let from = field(&self.data, "from")?;
                let to = field(&self.data, "to")?;
                if store.edge(from, to).is_none() {
                    return Err(ValidationError::UnknownEdge {
                        from: from.to_string(),
                        to: to.to_string(),
                    });
                }
                store.upsert_edge(&self.data).map(|_| ())
            }
            (BatchTarget::Edge, BatchAction::Remove) => {
                let from = field(&self.data, "from")?;
                let to = field(&self.data, "to")?;
                store.remove_edge(from, to).map(|_| ())
            }
        }
    }

    /// Node id this operation removes, if it is a node removal.
    pub fn removed_node(&self) -> Option<&str> {
        match (self.target, self.operation) {
            (BatchTarget::Node, BatchAction::Remove) => field(&self.data, "id").ok(),
            _ => None,
        }
    }
}

fn field<'a>(data: &'a Value, name: &'static str) -> Result<&'a str, ValidationError> {
    data.get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(ValidationError::MissingField {
            kind: "batch item",
            field: name,
        })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub batch_id: String,
    pub total: usize,
    pub applied: usize,
    pub failed: Vec<BatchFailure>,
    pub deferred: bool,
    pub duration_ms: f64,
}

/// Result of submitting a batch. Large batches are applied by the worker
/// after the call returns; `wait` resolves once the last chunk landed.
#[derive(Debug)]
pub enum BatchHandle {
    Completed(BatchReport),
    Deferred {
        batch_id: String,
        total: usize,
        done: oneshot::Receiver<BatchReport>,
    },
}

impl BatchHandle {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred { .. })
    }

    pub async fn wait(self) -> Result<BatchReport, GraphError> {
        match self {
            Self::Completed(report) => Ok(report),
            Self::Deferred { done, .. } => done.await.map_err(|_| GraphError::ServiceClosed),
        }
    }
}

/// A batch in progress. Items are applied in order, one chunk at a time.
#[derive(Debug)]
pub struct BatchRun {
    operations: Vec<Value>,
    next: usize,
    report: BatchReport,
    started: Instant,
    removed: Vec<String>,
    done: Option<oneshot::Sender<BatchReport>>,
}

impl BatchRun {
    pub fn new(operations: Vec<Value>, deferred: bool) -> Self {
        let total = operations.len();
        Self {
            operations,
            next: 0,
            report: BatchReport {
                batch_id: Uuid::new_v4().to_string(),
                total,
                applied: 0,
                failed: Vec::new(),
                deferred,
                duration_ms: 0.0,
            },
            started: Instant::now(),
            removed: Vec::new(),
            done: None,
        }
    }

    pub fn batch_id(&self) -> &str {
        &self.report.batch_id
    }

    pub fn total(&self) -> usize {
        self.report.total
    }

    pub fn notify_on_completion(&mut self, done: oneshot::Sender<BatchReport>) {
        self.done = Some(done);
    }

    fn is_finished(&self) -> bool {
        self.next >= self.operations.len()
    }

    /// Applies up to `chunk` items. Returns true once every item was tried.
    pub fn run_chunk(&mut self, store: &mut GraphStore, chunk: usize) -> bool {
        let end = (self.next + chunk.max(1)).min(self.operations.len());
        for index in self.next..end {
            let outcome = BatchOperation::parse(&self.operations[index])
                .and_then(|operation| operation.apply(store).map(|()| operation));
            match outcome {
                Ok(operation) => {
                    if let Some(id) = operation.removed_node() {
                        self.removed.push(id.to_string());
                    }
                    self.report.applied += 1;
                }
                Err(err) => self.report.failed.push(BatchFailure {
                    index,
                    error: err.to_string(),
                }),
            }
        }
        self.next = end;
        self.is_finished()
    }

    /// Node ids removed since the last call.
    pub fn take_removed(&mut self) -> Vec<String> {
        std::mem::take(&mut self.removed)
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// Closes the run, handing the report to whoever waits on it.
    pub fn finish(mut self) -> BatchReport {
        self.report.duration_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let report = self.report;
        if let Some(done) = self.done.take() {
            let _ = done.send(report.clone());
        }
        report
    }
}
