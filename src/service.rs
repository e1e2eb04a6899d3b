use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::{
    batch::BatchHandle,
    config::Config,
    editor::EditorSurface,
    engine::GraphEngine,
    error::GraphError,
    health::HealthStatus,
    integration::{
        agent::{AgentContextRequest, AgentContextSlice, AgentUpdate},
        error_analysis::ErrorAnalysis,
        project::{ProjectInsightsReport, ProjectUpdate},
    },
    models::{AnalysisSnapshot, ChangeHistoryEntry, CodeEdge, CodeNode, NodeInfo},
    profiler::{PerformanceSnapshot, ProfileReport},
    queue::{self, Command, Reply},
    search::NodeFilter,
    transport::{events, Transport},
};

struct ServiceInner {
    commands: mpsc::UnboundedSender<Command>,
    transport: Arc<dyn Transport>,
    disposed: AtomicBool,
}

/// Cloneable handle to the running graph worker. Every call is a command on
/// the worker's queue, so reads observe all earlier writes.
#[derive(Clone)]
pub struct GraphService {
    inner: Arc<ServiceInner>,
}

impl GraphService {
    /// Spawns the worker and cache sweeper, then wires the transport and
    /// editor into the command queue. Must run inside a tokio runtime.
    pub fn start(config: Config, transport: Arc<dyn Transport>, editor: Arc<dyn EditorSurface>) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let sweep_every = config.cache_sweep_interval;
        let engine = GraphEngine::new(config, transport.clone(), commands.downgrade());
        queue::spawn_graph_worker(engine, receiver);
        queue::spawn_cache_sweeper(commands.downgrade(), sweep_every);

        for event in events::INBOUND {
            let weak = commands.downgrade();
            transport.subscribe(
                event,
                Arc::new(move |payload: Value| {
                    if let Some(commands) = weak.upgrade() {
                        let _ = commands.send(Command::Inbound {
                            event: event.to_string(),
                            payload,
                        });
                    }
                }),
            );
        }

        let weak = commands.downgrade();
        editor.on_content_changed(Arc::new(move |path: String, content: String| {
            if let Some(commands) = weak.upgrade() {
                let _ = commands.send(Command::ContentChanged { path, content });
            }
        }));

        let _ = commands.send(Command::Initialize);
        if let Some(document) = editor.current_document() {
            let _ = commands.send(Command::ContentChanged {
                path: document.path,
                content: document.content,
            });
        }

        info!("Graph service started");
        Self {
            inner: Arc::new(ServiceInner {
                commands,
                transport,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Unsubscribes every inbound event and stops the worker. Safe to call
    /// more than once.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        for event in events::INBOUND {
            self.inner.transport.unsubscribe(event);
        }
        let _ = self.inner.commands.send(Command::Shutdown);
        info!("Graph service disposed");
    }

    fn post(&self, command: Command) {
        if self.is_disposed() || self.inner.commands.send(command).is_err() {
            warn!("Graph service is closed; command dropped");
        }
    }

    async fn ask<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, GraphError> {
        if self.is_disposed() {
            return Err(GraphError::ServiceClosed);
        }
        let (reply, response) = oneshot::channel();
        self.inner
            .commands
            .send(command(reply))
            .map_err(|_| GraphError::ServiceClosed)?;
        response.await.map_err(|_| GraphError::ServiceClosed)
    }

    pub async fn get_node_info(&self, id: &str) -> Result<Option<NodeInfo>, GraphError> {
        let id = id.to_string();
        self.ask(|reply| Command::NodeInfo { id, reply }).await
    }

    pub async fn get_project_insights(&self) -> Result<ProjectInsightsReport, GraphError> {
        self.ask(|reply| Command::ProjectInsights { reply }).await
    }

    pub async fn get_health_status(&self) -> Result<HealthStatus, GraphError> {
        self.ask(|reply| Command::HealthStatus { reply }).await
    }

    pub async fn get_performance_metrics(&self) -> Result<PerformanceSnapshot, GraphError> {
        self.ask(|reply| Command::PerformanceMetrics { reply }).await
    }

    pub async fn get_change_history(&self) -> Result<Vec<ChangeHistoryEntry>, GraphError> {
        self.ask(|reply| Command::ChangeHistory { reply }).await
    }

    pub async fn get_analysis_cache(&self, path: &str) -> Result<Option<AnalysisSnapshot>, GraphError> {
        let path = path.to_string();
        self.ask(|reply| Command::AnalysisCache { path, reply }).await
    }

    /// Records the matching ids for `search_results` and returns how many
    /// nodes matched.
    pub async fn search_nodes(&self, term: &str) -> Result<usize, GraphError> {
        let term = term.to_string();
        self.ask(|reply| Command::Search { term, reply }).await
    }

    pub async fn search_results(&self) -> Result<Vec<String>, GraphError> {
        self.ask(|reply| Command::SearchResults { reply }).await
    }

    pub async fn filter_nodes(&self, filter: NodeFilter) -> Result<Vec<CodeNode>, GraphError> {
        self.ask(|reply| Command::Filter { filter, reply }).await
    }

    pub async fn batch_update(&self, operations: Vec<Value>) -> Result<BatchHandle, GraphError> {
        self.ask(|reply| Command::Batch { operations, reply }).await
    }

    pub async fn upsert_node(&self, data: Value) -> Result<String, GraphError> {
        Ok(self.ask(|reply| Command::UpsertNode { data, reply }).await??)
    }

    pub async fn upsert_edge(&self, data: Value) -> Result<(String, String), GraphError> {
        Ok(self.ask(|reply| Command::UpsertEdge { data, reply }).await??)
    }

    pub async fn remove_node(&self, id: &str) -> Result<(), GraphError> {
        let id = id.to_string();
        Ok(self.ask(|reply| Command::RemoveNode { id, reply }).await??)
    }

    pub async fn remove_edge(&self, from: &str, to: &str) -> Result<(), GraphError> {
        let (from, to) = (from.to_string(), to.to_string());
        Ok(self.ask(|reply| Command::RemoveEdge { from, to, reply }).await??)
    }

    pub async fn edges_of(&self, id: &str) -> Result<Vec<CodeEdge>, GraphError> {
        let id = id.to_string();
        self.ask(|reply| Command::EdgesOf { id, reply }).await
    }

    pub fn start_profile(&self, id: &str, operations: Vec<String>) {
        self.post(Command::StartProfile {
            id: id.to_string(),
            operations,
        });
    }

    pub async fn end_profile(&self, id: &str) -> Result<Option<ProfileReport>, GraphError> {
        let id = id.to_string();
        self.ask(|reply| Command::EndProfile { id, reply }).await
    }

    pub fn on_error_analysis<F>(&self, callback: F)
    where
        F: Fn(&ErrorAnalysis) + Send + Sync + 'static,
    {
        self.post(Command::OnErrorAnalysis(Arc::new(callback)));
    }

    pub fn on_agent_update<F>(&self, callback: F)
    where
        F: Fn(&AgentUpdate) + Send + Sync + 'static,
    {
        self.post(Command::OnAgentUpdate(Arc::new(callback)));
    }

    pub fn on_project_update<F>(&self, callback: F)
    where
        F: Fn(&ProjectUpdate) + Send + Sync + 'static,
    {
        self.post(Command::OnProjectUpdate(Arc::new(callback)));
    }

    pub fn report_error(&self, message: &str, stack: Option<&str>) {
        self.post(Command::ReportError {
            message: message.to_string(),
            stack: stack.map(ToString::to_string),
        });
    }

    pub async fn provide_agent_context(&self, request: AgentContextRequest) -> Result<AgentContextSlice, GraphError> {
        self.ask(|reply| Command::ProvideAgentContext { request, reply }).await
    }

    /// Asks the agent system for the task's context pointers and resolves
    /// them against the graph. Any failure yields an empty slice.
    pub async fn update_agent_context(&self, agent_id: &str, task_id: &str) -> AgentContextSlice {
        let (agent, task) = (agent_id.to_string(), task_id.to_string());
        let result = self
            .ask(|reply| Command::UpdateAgentContext {
                agent_id: agent,
                task_id: task,
                reply,
            })
            .await;
        match result {
            Ok(slice) => slice,
            Err(err) => {
                warn!(agent_id, task_id, "Agent context refresh failed: {err}");
                AgentContextSlice::empty(Some(agent_id.to_string()), Some(task_id.to_string()))
            }
        }
    }

    pub fn request_project_update(&self) {
        self.post(Command::RequestProjectUpdate);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicUsize,
        time::Duration,
    };

    use serde_json::json;

    use super::*;
    use crate::{editor::LocalEditor, transport::InMemoryTransport};

    fn start() -> (GraphService, Arc<InMemoryTransport>, Arc<LocalEditor>) {
        let transport = Arc::new(InMemoryTransport::default());
        let editor = Arc::new(LocalEditor::new());
        let service = GraphService::start(Config::default(), transport.clone(), editor.clone());
        (service, transport, editor)
    }

    #[tokio::test]
    async fn start_announces_integrations_and_subscribes() {
        let (service, transport, _editor) = start();
        service.get_health_status().await.unwrap();

        assert_eq!(transport.emitted(events::INITIALIZE_INTEGRATIONS).len(), 1);
        for event in events::INBOUND {
            assert_eq!(transport.subscriber_count(event), 1, "{event}");
        }
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_closes_queries() {
        let (service, transport, _editor) = start();
        service.dispose();
        service.dispose();

        for event in events::INBOUND {
            assert_eq!(transport.subscriber_count(event), 0);
        }
        assert_eq!(transport.deliver(events::FILE_CHANGED, json!({ "path": "a" })), 0);
        assert!(matches!(
            service.get_node_info("a").await,
            Err(GraphError::ServiceClosed)
        ));
    }

    #[tokio::test]
    async fn subscribers_see_inbound_integration_events() {
        let (service, transport, _editor) = start();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        service.on_error_analysis(move |analysis| {
            assert_eq!(analysis.error_type, "TypeError");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        transport.deliver(events::ERROR_DETECTED, json!({ "errorId": "e", "errorType": "TypeError" }));
        service.get_health_status().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn validation_errors_are_returned_and_reported() {
        let (service, transport, _editor) = start();
        let err = service.upsert_node(json!({ "id": "a" })).await.unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
        assert!(matches!(
            service.remove_node("missing").await,
            Err(GraphError::Validation(_))
        ));
        assert_eq!(transport.emitted(events::ERROR).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn editor_changes_are_debounced_per_path() {
        let (service, transport, editor) = start();
        transport.register_responder(events::REQUEST_CODE_ANALYSIS, |payload| {
            let content = payload["content"].as_str().unwrap_or_default();
            Ok(json!({ "metrics": { "lines": content.lines().count() } }))
        });

        editor.set_content("src/a.ts", "one");
        tokio::time::sleep(Duration::from_millis(100)).await;
        editor.set_content("src/a.ts", "one\ntwo");
        tokio::time::sleep(Duration::from_millis(400)).await;

        let requests = transport.emitted(events::REQUEST_CODE_ANALYSIS);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["content"], "one\ntwo");

        let info = service.get_node_info("src/a.ts").await.unwrap().unwrap();
        assert_eq!(info.node.metrics.lines, 2.0);
        assert!(service.get_analysis_cache("src/a.ts").await.unwrap().is_some());
        assert_eq!(transport.emitted(events::ANALYZE_CODE).len(), 1);
    }

    #[tokio::test]
    async fn missing_agent_context_resolves_to_empty_slice() {
        let (service, transport, _editor) = start();
        transport.register_responder(events::REQUEST_AGENT_CONTEXT, |_| Err("unknown task".to_string()));

        let slice = service.update_agent_context("agent-1", "t-9").await;
        assert!(slice.is_empty());
        assert_eq!(slice.agent_id.as_deref(), Some("agent-1"));

        service.dispose();
        let slice = service.update_agent_context("agent-1", "t-9").await;
        assert!(slice.is_empty());
    }
}
