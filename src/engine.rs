use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::Arc,
    time::Instant,
};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::{
    sync::{mpsc::WeakUnboundedSender, oneshot},
    time,
};
use tracing::{debug, error, info, warn};

use crate::{
    batch::{BatchHandle, BatchReport, BatchRun},
    cache::MetricsCache,
    config::Config,
    error::{ErrorEvent, ErrorKind, GraphError, IntegrationError, TransportError, ValidationError},
    health::{self, GraphCounts, HealthStatus},
    ingest::{
        apply_analysis_update, apply_analyzer_result, apply_dependency_change, parse_analysis_update,
        parse_analyzer_response, parse_content_change, parse_dependency_change,
    },
    integration::{
        agent::{
            build_context, merge_request, normalize_update, parse_agent_update, parse_context_reply,
            AgentContextRequest, AgentContextSlice, AgentState,
        },
        error_analysis::{analyze, parse_error_report, report_from_native, ErrorAnalysis},
        project::{apply_project_update, parse_project_update, summarize, ProjectInsights},
        Subscribers,
    },
    models::{risk_score, AnalysisSnapshot, CodeNode, DerivedMetrics, NodeInfo},
    profiler::PerformanceProfiler,
    queue::{Command, Reply},
    search::{filter_nodes, search_nodes},
    store::GraphStore,
    transport::{events, request_with_timeout, Transport},
};

const RECENT_ERROR_LIMIT: usize = 100;

/// Sole owner of graph state. Only the worker task calls into it.
pub struct GraphEngine {
    config: Config,
    transport: Arc<dyn Transport>,
    commands: WeakUnboundedSender<Command>,
    store: GraphStore,
    metrics_cache: MetricsCache<DerivedMetrics>,
    analysis_cache: MetricsCache<AnalysisSnapshot>,
    profiler: PerformanceProfiler,
    search_results: BTreeSet<String>,
    pending_analysis: HashMap<String, u64>,
    analysis_seq: u64,
    agents: BTreeMap<String, AgentState>,
    project: ProjectInsights,
    recent_errors: VecDeque<ErrorAnalysis>,
    subscribers: Subscribers,
}

impl GraphEngine {
    pub fn new(config: Config, transport: Arc<dyn Transport>, commands: WeakUnboundedSender<Command>) -> Self {
        Self {
            store: GraphStore::new(config.change_history_limit),
            metrics_cache: MetricsCache::new(config.cache_capacity, config.cache_max_age),
            analysis_cache: MetricsCache::new(config.cache_capacity, config.cache_max_age),
            profiler: PerformanceProfiler::new(),
            search_results: BTreeSet::new(),
            pending_analysis: HashMap::new(),
            analysis_seq: 0,
            agents: BTreeMap::new(),
            project: ProjectInsights::default(),
            recent_errors: VecDeque::new(),
            subscribers: Subscribers::default(),
            config,
            transport,
            commands,
        }
    }

    /// Applies one command. A batch too large to apply inline comes back as a
    /// run for the worker to drain.
    pub fn handle(&mut self, command: Command) -> Option<BatchRun> {
        let operation = command.operation();
        let started = Instant::now();
        let deferred = self.dispatch(command);
        if deferred.is_none() {
            self.profiler.track_performance(operation, started);
        }
        self.invalidate_dirty();
        deferred
    }

    pub fn run_batch_chunk(&mut self, run: &mut BatchRun) -> bool {
        let finished = run.run_chunk(&mut self.store, self.config.batch_chunk_size);
        for id in run.take_removed() {
            self.forget_node(&id);
        }
        self.invalidate_dirty();
        finished
    }

    pub fn finish_batch(&mut self, run: BatchRun) -> BatchReport {
        let elapsed = run.elapsed();
        if elapsed > self.config.batch_window {
            warn!(
                batch_id = %run.batch_id(),
                total = run.total(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Deferred batch overran its window"
            );
        }
        self.profiler.record("batchUpdate", elapsed);
        self.close_batch(run)
    }

    fn dispatch(&mut self, command: Command) -> Option<BatchRun> {
        match command {
            Command::Initialize => self.initialize(),
            Command::Inbound { event, payload } => self.inbound(&event, &payload),
            Command::ContentChanged { path, content } => self.content_changed(path, content),
            Command::AnalysisDue { path, seq, content } => self.analysis_due(path, seq, content),
            Command::AnalysisFinished { path, seq, result } => self.analysis_finished(path, seq, result),
            Command::UpsertNode { data, reply } => {
                let result = self.store.upsert_node(&data);
                self.reply_validated(reply, result);
            }
            Command::UpsertEdge { data, reply } => {
                let result = self.store.upsert_edge(&data);
                self.reply_validated(reply, result);
            }
            Command::RemoveNode { id, reply } => {
                let result = self.remove_node(&id);
                self.reply_validated(reply, result);
            }
            Command::RemoveEdge { from, to, reply } => {
                let result = self.store.remove_edge(&from, &to).map(|_| ());
                self.reply_validated(reply, result);
            }
            Command::EdgesOf { id, reply } => {
                let _ = reply.send(self.store.edges_of(&id));
            }
            Command::Batch { operations, reply } => return self.batch(operations, reply),
            Command::NodeInfo { id, reply } => {
                let _ = reply.send(self.node_info(&id));
            }
            Command::ProjectInsights { reply } => {
                let report = summarize(&self.store, &self.project, self.recent_errors.len());
                let _ = reply.send(report);
            }
            Command::HealthStatus { reply } => {
                let _ = reply.send(self.health_status());
            }
            Command::PerformanceMetrics { reply } => {
                let _ = reply.send(self.profiler.snapshot());
            }
            Command::ChangeHistory { reply } => {
                let _ = reply.send(self.store.history().to_vec());
            }
            Command::AnalysisCache { path, reply } => {
                let _ = reply.send(self.analysis_cache.get(&path));
            }
            Command::Search { term, reply } => {
                self.search_results = search_nodes(self.store.nodes(), &term);
                debug!(term = %term, matches = self.search_results.len(), "Search recorded");
                let _ = reply.send(self.search_results.len());
            }
            Command::SearchResults { reply } => {
                let _ = reply.send(self.search_results.iter().cloned().collect());
            }
            Command::Filter { filter, reply } => {
                let _ = reply.send(filter_nodes(self.store.nodes(), &filter));
            }
            Command::StartProfile { id, operations } => {
                let memory = self.store.approx_memory_bytes();
                self.profiler.start_profile(&id, &operations, memory);
            }
            Command::EndProfile { id, reply } => {
                let memory = self.store.approx_memory_bytes();
                let _ = reply.send(self.profiler.end_profile(&id, memory));
            }
            Command::OnErrorAnalysis(callback) => self.subscribers.error_analysis.register(callback),
            Command::OnAgentUpdate(callback) => self.subscribers.agent_update.register(callback),
            Command::OnProjectUpdate(callback) => self.subscribers.project_update.register(callback),
            Command::ReportError { message, stack } => self.report_error(&message, stack.as_deref()),
            Command::ProvideAgentContext { request, reply } => {
                let known = request.agent_id.as_ref().and_then(|id| self.agents.get(id));
                let merged = merge_request(&request, known);
                let _ = reply.send(build_context(&self.store, &merged));
            }
            Command::UpdateAgentContext {
                agent_id,
                task_id,
                reply,
            } => self.update_agent_context(agent_id, task_id, reply),
            Command::AgentContextArrived { request, result, reply } => {
                let slice = self.agent_context_arrived(request, result);
                let _ = reply.send(slice);
            }
            Command::RequestProjectUpdate => self.request_project_update(),
            Command::ProjectPullFinished { result } => self.project_pull_finished(result),
            Command::OptimizeCaches => {
                let evicted = self.metrics_cache.optimize() + self.analysis_cache.optimize();
                if evicted > 0 {
                    debug!(evicted, "Cache sweep evicted entries");
                }
            }
            Command::Shutdown => {}
        }
        None
    }

    fn initialize(&self) {
        self.emit(
            events::INITIALIZE_INTEGRATIONS,
            &json!({
                "integrations": ["errorAnalysis", "agentSystem", "projectAwareness"],
                "subscribedEvents": events::INBOUND,
                "projectRoot": self.config.project_root.display().to_string(),
                "startedAt": Utc::now(),
            }),
        );
        info!("Integrations initialized");
    }

    fn inbound(&mut self, event: &str, payload: &Value) {
        match event {
            events::FILE_CHANGED => match parse_content_change(payload) {
                Ok(change) => self.content_changed(change.path, change.content),
                Err(err) => self.emit_error(err.into()),
            },
            events::DEPENDENCIES_CHANGED => match parse_dependency_change(payload) {
                Ok(change) => {
                    let changed = apply_dependency_change(&mut self.store, &change, payload);
                    if !changed.is_empty() {
                        info!(path = %change.path, changed = changed.len(), "Dependencies updated");
                        self.notify_agents(&change.path, "dependencies", json!({ "dependencies": change.dependencies }));
                    }
                }
                Err(err) => self.emit_error(err.into()),
            },
            events::ANALYSIS_UPDATED => match parse_analysis_update(payload) {
                Ok(update) => {
                    if apply_analysis_update(&mut self.store, &update, payload) {
                        debug!(path = %update.path, "Analysis merged");
                    }
                }
                Err(err) => self.emit_error(err.into()),
            },
            events::ERROR_DETECTED => self.error_detected(payload),
            events::AGENT_UPDATE => self.agent_update(payload),
            events::PROJECT_UPDATE => self.project_update(payload),
            other => debug!(event = other, "Ignoring unknown inbound event"),
        }
    }

    fn content_changed(&mut self, path: String, content: String) {
        self.analysis_seq += 1;
        let seq = self.analysis_seq;
        self.pending_analysis.insert(path.clone(), seq);

        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let delay = self.config.analysis_debounce;
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = commands.send(Command::AnalysisDue { path, seq, content });
        });
    }

    fn analysis_due(&mut self, path: String, seq: u64, content: String) {
        if self.pending_analysis.get(&path) != Some(&seq) {
            debug!(path = %path, seq, "Skipping superseded analysis request");
            return;
        }
        let Some(commands) = self.commands.upgrade() else {
            return;
        };

        info!(path = %path, seq, bytes = content.len(), "Requesting code analysis");
        let transport = self.transport.clone();
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            let payload = json!({ "path": path, "content": content, "seq": seq });
            let result =
                request_with_timeout(transport.as_ref(), events::REQUEST_CODE_ANALYSIS, payload, timeout).await;
            let _ = commands.send(Command::AnalysisFinished { path, seq, result });
        });
    }

    fn analysis_finished(&mut self, path: String, seq: u64, result: Result<Value, TransportError>) {
        if self.pending_analysis.get(&path) != Some(&seq) {
            debug!(path = %path, seq, "Dropping stale analysis result");
            return;
        }
        self.pending_analysis.remove(&path);

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                self.emit_error(err.into());
                return;
            }
        };
        let parsed = match parse_analyzer_response(&path, &response) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.emit_error(err.into());
                return;
            }
        };

        apply_analyzer_result(&mut self.store, &path, &parsed, &response);
        let Some(node) = self.store.get_node(&path) else {
            return;
        };
        let snapshot = AnalysisSnapshot::of(node);
        self.analysis_cache.set(path.clone(), snapshot.clone());
        info!(path = %path, lines = snapshot.metrics.lines, "Code analysis applied");

        self.emit(events::ANALYZE_CODE, &snapshot);
        self.notify_agents(
            &path,
            "analysis",
            json!({ "metrics": snapshot.metrics, "smells": snapshot.analysis.smells }),
        );
    }

    fn remove_node(&mut self, id: &str) -> Result<(), ValidationError> {
        self.store.remove_node(id)?;
        self.forget_node(id);
        Ok(())
    }

    /// Drops engine-side state for a node the store no longer has, so an
    /// in-flight analysis for it completes as a no-op.
    fn forget_node(&mut self, id: &str) {
        self.pending_analysis.remove(id);
        self.analysis_cache.invalidate(id);
        self.search_results.remove(id);
        info!(id = %id, "Node removed");
    }

    fn reply_validated<T>(&self, reply: Reply<Result<T, ValidationError>>, result: Result<T, ValidationError>) {
        if let Err(err) = &result {
            self.emit_error(err.clone().into());
        }
        let _ = reply.send(result);
    }

    fn batch(&mut self, operations: Vec<Value>, reply: Reply<BatchHandle>) -> Option<BatchRun> {
        let total = operations.len();
        if total > self.config.batch_defer_threshold {
            let mut run = BatchRun::new(operations, true);
            let (done_tx, done_rx) = oneshot::channel();
            run.notify_on_completion(done_tx);
            info!(batch_id = %run.batch_id(), total, "Deferring batch");
            let _ = reply.send(BatchHandle::Deferred {
                batch_id: run.batch_id().to_string(),
                total,
                done: done_rx,
            });
            return Some(run);
        }

        let mut run = BatchRun::new(operations, false);
        run.run_chunk(&mut self.store, total);
        for id in run.take_removed() {
            self.forget_node(&id);
        }
        let report = self.close_batch(run);
        let _ = reply.send(BatchHandle::Completed(report));
        None
    }

    fn close_batch(&self, run: BatchRun) -> BatchReport {
        let report = run.finish();
        for failure in &report.failed {
            self.emit(
                events::ERROR,
                &ErrorEvent {
                    kind: ErrorKind::Validation,
                    error: format!("batch {} item {}: {}", report.batch_id, failure.index, failure.error),
                },
            );
        }
        info!(
            batch_id = %report.batch_id,
            applied = report.applied,
            failed = report.failed.len(),
            deferred = report.deferred,
            "Batch applied"
        );
        report
    }

    fn node_info(&mut self, id: &str) -> Option<NodeInfo> {
        let node = self.store.get_node(id)?.clone();
        let derived = match self.metrics_cache.get(id) {
            Some(derived) => derived,
            None => {
                let derived = self.derive(&node);
                self.metrics_cache.set(id, derived.clone());
                derived
            }
        };
        Some(NodeInfo {
            edges: self.store.edges_of(id),
            node,
            derived,
        })
    }

    fn derive(&self, node: &CodeNode) -> DerivedMetrics {
        let in_degree = self.store.in_degree(&node.id);
        let dependent_count = node.relationships.used_by.len().max(in_degree);
        DerivedMetrics {
            in_degree,
            out_degree: self.store.out_degree(&node.id),
            dependency_count: node.dependencies.union(&node.relationships.imports).count(),
            dependent_count,
            risk_score: risk_score(&node.metrics, dependent_count),
            computed_at: Utc::now(),
        }
    }

    fn health_status(&self) -> HealthStatus {
        let now = Utc::now();
        health::evaluate(
            self.metrics_cache.stats_at(now),
            self.analysis_cache.stats_at(now),
            &self.profiler,
            self.config.slow_operation_threshold,
            GraphCounts {
                nodes: self.store.node_count(),
                edges: self.store.edge_count(),
                dangling_edges: self.store.dangling_edge_count(),
            },
        )
    }

    fn error_detected(&mut self, payload: &Value) {
        let (report, anomalies) = parse_error_report(payload);
        let analysis = analyze(&report, &self.store, anomalies.clone());
        info!(
            error_id = %analysis.error_id,
            affected = analysis.affected_nodes.len(),
            "Error analysed"
        );
        self.emit(events::ERROR_ANALYSIS, &analysis);
        let panicked = self.subscribers.error_analysis.notify(&analysis);
        self.flag_subscriber_panics(events::ERROR_ANALYSIS, panicked);
        self.remember_error(analysis);
        self.flag_anomalies(events::ERROR_DETECTED, anomalies);
    }

    fn report_error(&mut self, message: &str, stack: Option<&str>) {
        let report = report_from_native(message, stack);
        let mut analysis = analyze(&report, &self.store, Vec::new());
        analysis.message = Some(message.to_string());
        self.emit(events::REPORT_ERROR, &analysis);
        let panicked = self.subscribers.error_analysis.notify(&analysis);
        self.flag_subscriber_panics(events::ERROR_ANALYSIS, panicked);
        self.remember_error(analysis);
    }

    fn remember_error(&mut self, analysis: ErrorAnalysis) {
        self.recent_errors.push_back(analysis);
        while self.recent_errors.len() > RECENT_ERROR_LIMIT {
            self.recent_errors.pop_front();
        }
    }

    fn agent_update(&mut self, payload: &Value) {
        let (state, anomalies) = parse_agent_update(payload);
        let update = normalize_update(&state, &self.store, anomalies.clone());
        if !state.agent_id.is_empty() {
            debug!(agent_id = %state.agent_id, status = ?update.task_status, "Agent tracked");
            self.agents.insert(state.agent_id.clone(), state);
        }
        self.emit(events::AGENT_UPDATE, &update);
        let panicked = self.subscribers.agent_update.notify(&update);
        self.flag_subscriber_panics(events::AGENT_UPDATE, panicked);
        self.flag_anomalies(events::AGENT_UPDATE, anomalies);
    }

    fn update_agent_context(&mut self, agent_id: String, task_id: String, reply: Reply<AgentContextSlice>) {
        let request = AgentContextRequest {
            agent_id: Some(agent_id.clone()),
            task_id: Some(task_id.clone()),
            ..AgentContextRequest::default()
        };
        let Some(commands) = self.commands.upgrade() else {
            let _ = reply.send(AgentContextSlice::empty(request.agent_id, request.task_id));
            return;
        };

        let transport = self.transport.clone();
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            let payload = json!({ "agentId": agent_id, "taskId": task_id });
            let result =
                request_with_timeout(transport.as_ref(), events::REQUEST_AGENT_CONTEXT, payload, timeout).await;
            let _ = commands.send(Command::AgentContextArrived { request, result, reply });
        });
    }

    fn agent_context_arrived(
        &mut self,
        request: AgentContextRequest,
        result: Result<Value, TransportError>,
    ) -> AgentContextSlice {
        let empty = AgentContextSlice::empty(request.agent_id.clone(), request.task_id.clone());
        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                self.emit_error(err.into());
                return empty;
            }
        };
        let Some(mut pointers) = parse_context_reply(&reply) else {
            self.emit_error(
                IntegrationError {
                    event: events::REQUEST_AGENT_CONTEXT.to_string(),
                    anomalies: vec!["context reply is malformed".to_string()],
                }
                .into(),
            );
            return empty;
        };

        pointers.agent_id = request.agent_id;
        pointers.task_id = request.task_id;
        let known = pointers.agent_id.as_ref().and_then(|id| self.agents.get(id));
        let merged = merge_request(&pointers, known);
        build_context(&self.store, &merged)
    }

    fn project_update(&mut self, payload: &Value) {
        let update = parse_project_update(payload, &self.config.project_root);
        let changed = apply_project_update(&mut self.store, &update);
        info!(
            project_id = ?update.project_id,
            files = update.files.len(),
            rejected = update.rejected_files.len(),
            changed = changed.len(),
            "Project structure applied"
        );
        self.project = update.insights.clone();
        self.emit(events::PROJECT_UPDATE, &update);
        let panicked = self.subscribers.project_update.notify(&update);
        self.flag_subscriber_panics(events::PROJECT_UPDATE, panicked);
        self.flag_anomalies(events::PROJECT_UPDATE, update.anomalies);
    }

    fn request_project_update(&mut self) {
        let payload = json!({
            "projectId": self.project.project_id,
            "requestedAt": Utc::now(),
        });
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let transport = self.transport.clone();
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            let result =
                request_with_timeout(transport.as_ref(), events::REQUEST_PROJECT_UPDATE, payload, timeout).await;
            let _ = commands.send(Command::ProjectPullFinished { result });
        });
    }

    fn project_pull_finished(&mut self, result: Result<Value, TransportError>) {
        match result {
            Ok(payload) if payload.get("structure").is_some() => self.project_update(&payload),
            Ok(_) => debug!("Project update pull acknowledged without payload"),
            // Nobody serves pulls; the outbound request is the whole effect.
            Err(TransportError::NoResponder(_)) => debug!("Project update pull has no responder"),
            Err(err) => self.emit_error(err.into()),
        }
    }

    fn notify_agents(&self, path: &str, reason: &str, details: Value) {
        for agent in self.agents.values() {
            if !agent.relevant_files.iter().any(|file| file == path) {
                continue;
            }
            self.emit(
                events::AGENT_NOTIFICATION,
                &json!({
                    "agentId": agent.agent_id,
                    "taskId": agent.task_id(),
                    "path": path,
                    "reason": reason,
                    "details": details,
                }),
            );
        }
    }

    fn flag_anomalies(&self, event: &str, anomalies: Vec<String>) {
        if anomalies.is_empty() {
            return;
        }
        self.emit_error(
            IntegrationError {
                event: event.to_string(),
                anomalies,
            }
            .into(),
        );
    }

    fn flag_subscriber_panics(&self, event: &str, panicked: usize) {
        if panicked > 0 {
            self.flag_anomalies(event, vec![format!("{panicked} subscriber callback(s) panicked")]);
        }
    }

    fn invalidate_dirty(&mut self) {
        for id in self.store.take_dirty() {
            self.metrics_cache.invalidate(&id);
        }
    }

    fn emit<T: Serialize>(&self, event: &str, payload: &T) {
        let value = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(err) => {
                error!(event, "Failed to serialize outbound payload: {err}");
                return;
            }
        };
        if let Err(err) = self.transport.emit(event, value) {
            warn!(event, "Outbound emit failed: {err}");
            if event != events::ERROR {
                self.emit_error(err.into());
            }
        }
    }

    fn emit_error(&self, err: GraphError) {
        warn!("Graph error: {err}");
        if let Some(event) = err.to_event() {
            self.emit(events::ERROR, &event);
        }
    }
}
