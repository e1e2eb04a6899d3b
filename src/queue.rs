use std::time::Duration;

use serde_json::Value;
use tokio::{
    sync::{
        mpsc::{UnboundedReceiver, WeakUnboundedSender},
        oneshot,
    },
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, info};

use crate::{
    batch::{BatchHandle, BatchReport},
    engine::GraphEngine,
    error::{TransportError, ValidationError},
    health::HealthStatus,
    integration::{
        agent::{AgentContextRequest, AgentContextSlice, AgentUpdate},
        error_analysis::ErrorAnalysis,
        project::{ProjectInsightsReport, ProjectUpdate},
        Subscriber,
    },
    models::{AnalysisSnapshot, ChangeHistoryEntry, CodeEdge, CodeNode, NodeInfo},
    profiler::{PerformanceSnapshot, ProfileReport},
    search::NodeFilter,
};

pub type Reply<T> = oneshot::Sender<T>;

/// Everything the graph worker does arrives as one of these, in order.
pub enum Command {
    Initialize,
    Inbound {
        event: String,
        payload: Value,
    },
    ContentChanged {
        path: String,
        content: String,
    },
    AnalysisDue {
        path: String,
        seq: u64,
        content: String,
    },
    AnalysisFinished {
        path: String,
        seq: u64,
        result: Result<Value, TransportError>,
    },
    UpsertNode {
        data: Value,
        reply: Reply<Result<String, ValidationError>>,
    },
    UpsertEdge {
        data: Value,
        reply: Reply<Result<(String, String), ValidationError>>,
    },
    RemoveNode {
        id: String,
        reply: Reply<Result<(), ValidationError>>,
    },
    RemoveEdge {
        from: String,
        to: String,
        reply: Reply<Result<(), ValidationError>>,
    },
    EdgesOf {
        id: String,
        reply: Reply<Vec<CodeEdge>>,
    },
    Batch {
        operations: Vec<Value>,
        reply: Reply<BatchHandle>,
    },
    NodeInfo {
        id: String,
        reply: Reply<Option<NodeInfo>>,
    },
    ProjectInsights {
        reply: Reply<ProjectInsightsReport>,
    },
    HealthStatus {
        reply: Reply<HealthStatus>,
    },
    PerformanceMetrics {
        reply: Reply<PerformanceSnapshot>,
    },
    ChangeHistory {
        reply: Reply<Vec<ChangeHistoryEntry>>,
    },
    AnalysisCache {
        path: String,
        reply: Reply<Option<AnalysisSnapshot>>,
    },
    Search {
        term: String,
        reply: Reply<usize>,
    },
    SearchResults {
        reply: Reply<Vec<String>>,
    },
    Filter {
        filter: NodeFilter,
        reply: Reply<Vec<CodeNode>>,
    },
    StartProfile {
        id: String,
        operations: Vec<String>,
    },
    EndProfile {
        id: String,
        reply: Reply<Option<ProfileReport>>,
    },
    OnErrorAnalysis(Subscriber<ErrorAnalysis>),
    OnAgentUpdate(Subscriber<AgentUpdate>),
    OnProjectUpdate(Subscriber<ProjectUpdate>),
    ReportError {
        message: String,
        stack: Option<String>,
    },
    ProvideAgentContext {
        request: AgentContextRequest,
        reply: Reply<AgentContextSlice>,
    },
    UpdateAgentContext {
        agent_id: String,
        task_id: String,
        reply: Reply<AgentContextSlice>,
    },
    AgentContextArrived {
        request: AgentContextRequest,
        result: Result<Value, TransportError>,
        reply: Reply<AgentContextSlice>,
    },
    RequestProjectUpdate,
    ProjectPullFinished {
        result: Result<Value, TransportError>,
    },
    OptimizeCaches,
    Shutdown,
}

impl Command {
    /// Name the profiler files this command under.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Inbound { .. } => "handleEvent",
            Self::ContentChanged { .. } => "contentChanged",
            Self::AnalysisDue { .. } => "requestAnalysis",
            Self::AnalysisFinished { .. } => "applyAnalysis",
            Self::UpsertNode { .. } => "upsertNode",
            Self::UpsertEdge { .. } => "upsertEdge",
            Self::RemoveNode { .. } => "removeNode",
            Self::RemoveEdge { .. } => "removeEdge",
            Self::EdgesOf { .. } => "edgesOf",
            Self::Batch { .. } => "batchUpdate",
            Self::NodeInfo { .. } => "getNodeInfo",
            Self::ProjectInsights { .. } => "getProjectInsights",
            Self::HealthStatus { .. } => "getHealthStatus",
            Self::PerformanceMetrics { .. } => "getPerformanceMetrics",
            Self::ChangeHistory { .. } => "getChangeHistory",
            Self::AnalysisCache { .. } => "getAnalysisCache",
            Self::Search { .. } => "searchNodes",
            Self::SearchResults { .. } => "searchResults",
            Self::Filter { .. } => "filterNodes",
            Self::StartProfile { .. } => "startProfile",
            Self::EndProfile { .. } => "endProfile",
            Self::OnErrorAnalysis(_) | Self::OnAgentUpdate(_) | Self::OnProjectUpdate(_) => "subscribe",
            Self::ReportError { .. } => "reportError",
            Self::ProvideAgentContext { .. } => "provideAgentContext",
            Self::UpdateAgentContext { .. } => "updateAgentContext",
            Self::AgentContextArrived { .. } => "applyAgentContext",
            Self::RequestProjectUpdate => "requestProjectUpdate",
            Self::ProjectPullFinished { .. } => "applyProjectPull",
            Self::OptimizeCaches => "optimizeCache",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Runs the engine until shutdown or until every sender is gone. A deferred
/// batch is worked off chunk by chunk before the next command is taken, so
/// later mutations never overtake it.
pub fn spawn_graph_worker(
    mut engine: GraphEngine,
    mut commands: UnboundedReceiver<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Graph worker started");
        while let Some(command) = commands.recv().await {
            if matches!(command, Command::Shutdown) {
                info!("Graph worker shutting down");
                break;
            }

            let Some(mut run) = engine.handle(command) else {
                continue;
            };
            while !engine.run_batch_chunk(&mut run) {
                tokio::task::yield_now().await;
            }
            let report: BatchReport = engine.finish_batch(run);
            debug!(batch_id = %report.batch_id, "Deferred batch drained");
        }
        info!("Graph worker stopped");
    })
}

pub fn spawn_cache_sweeper(commands: WeakUnboundedSender<Command>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let every = every.max(Duration::from_millis(10));
        let mut interval = time::interval_at(Instant::now() + every, every);
        loop {
            interval.tick().await;
            let Some(sender) = commands.upgrade() else {
                break;
            };
            if sender.send(Command::OptimizeCaches).is_err() {
                break;
            }
        }
        debug!("Cache sweeper stopped");
    })
}
