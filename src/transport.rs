use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::TransportError;

pub mod events {
    // inbound
    pub const FILE_CHANGED: &str = "fileChanged";
    pub const DEPENDENCIES_CHANGED: &str = "dependenciesChanged";
    pub const ANALYSIS_UPDATED: &str = "analysisUpdated";
    pub const ERROR_DETECTED: &str = "errorDetected";
    pub const AGENT_UPDATE: &str = "agentUpdate";
    pub const PROJECT_UPDATE: &str = "projectUpdate";

    // outbound
    pub const REQUEST_CODE_ANALYSIS: &str = "requestCodeAnalysis";
    pub const ANALYZE_CODE: &str = "analyzeCode";
    pub const AGENT_NOTIFICATION: &str = "agentNotification";
    pub const ERROR_ANALYSIS: &str = "errorAnalysis";
    pub const REPORT_ERROR: &str = "reportError";
    pub const REQUEST_AGENT_CONTEXT: &str = "requestAgentContext";
    pub const REQUEST_PROJECT_UPDATE: &str = "requestProjectUpdate";
    pub const INITIALIZE_INTEGRATIONS: &str = "initializeIntegrations";
    pub const ERROR: &str = "error";

    pub const INBOUND: [&str; 6] = [
        FILE_CHANGED,
        DEPENDENCIES_CHANGED,
        ANALYSIS_UPDATED,
        ERROR_DETECTED,
        AGENT_UPDATE,
        PROJECT_UPDATE,
    ];
}

pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;
pub type Responder = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync {
    fn subscribe(&self, event: &str, handler: EventHandler);

    fn unsubscribe(&self, event: &str);

    fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError>;

    /// Emit that expects a reply from whoever serves `event`.
    async fn request(&self, event: &str, payload: Value) -> Result<Value, TransportError>;
}

/// `request` bounded by `timeout`; an elapsed deadline becomes
/// `TransportError::Timeout`.
pub async fn request_with_timeout(
    transport: &dyn Transport,
    event: &str,
    payload: Value,
    timeout: Duration,
) -> Result<Value, TransportError> {
    match tokio::time::timeout(timeout, transport.request(event, payload)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            event: event.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEvent {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub event: String,
    pub payload: Value,
}

struct TransportState {
    handlers: HashMap<String, Vec<EventHandler>>,
    responders: HashMap<String, Responder>,
    outbound: VecDeque<OutboundEvent>,
    next_seq: u64,
    capacity: usize,
}

/// Process-local transport: inbound events are delivered to subscribers,
/// outbound events land in a bounded, sequence-numbered log.
pub struct InMemoryTransport {
    state: Mutex<TransportState>,
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("InMemoryTransport")
            .field("subscribed", &state.handlers.keys().collect::<Vec<_>>())
            .field("responders", &state.responders.keys().collect::<Vec<_>>())
            .field("outbound", &state.outbound.len())
            .finish()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryTransport {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(TransportState {
                handlers: HashMap::new(),
                responders: HashMap::new(),
                outbound: VecDeque::new(),
                next_seq: 1,
                capacity: capacity.max(1),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feeds an inbound event to every subscriber. Returns how many handlers
    /// ran.
    pub fn deliver(&self, event: &str, payload: Value) -> usize {
        let handlers = self
            .state()
            .handlers
            .get(event)
            .cloned()
            .unwrap_or_default();
        for handler in &handlers {
            handler(payload.clone());
        }
        handlers.len()
    }

    pub fn register_responder<F>(&self, event: &str, responder: F)
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.state()
            .responders
            .insert(event.to_string(), Arc::new(responder));
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.state().handlers.get(event).map(Vec::len).unwrap_or(0)
    }

    pub fn outbound_since(&self, since: u64) -> Vec<OutboundEvent> {
        self.state()
            .outbound
            .iter()
            .filter(|event| event.seq > since)
            .cloned()
            .collect()
    }

    pub fn next_seq(&self) -> u64 {
        self.state().next_seq
    }

    /// Payloads of every logged outbound event with this name, oldest first.
    pub fn emitted(&self, event: &str) -> Vec<Value> {
        self.state()
            .outbound
            .iter()
            .filter(|logged| logged.event == event)
            .map(|logged| logged.payload.clone())
            .collect()
    }

    fn log(&self, event: &str, payload: Value) {
        let mut state = self.state();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.outbound.push_back(OutboundEvent {
            seq,
            ts: Utc::now(),
            event: event.to_string(),
            payload,
        });
        while state.outbound.len() > state.capacity {
            state.outbound.pop_front();
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn subscribe(&self, event: &str, handler: EventHandler) {
        self.state()
            .handlers
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    fn unsubscribe(&self, event: &str) {
        self.state().handlers.remove(event);
    }

    fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        debug!(event, "Outbound event");
        self.log(event, payload);
        Ok(())
    }

    async fn request(&self, event: &str, payload: Value) -> Result<Value, TransportError> {
        self.log(event, payload.clone());
        let responder = self.state().responders.get(event).cloned();
        let Some(responder) = responder else {
            return Err(TransportError::NoResponder(event.to_string()));
        };
        responder(payload).map_err(|message| TransportError::Remote {
            event: event.to_string(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    #[test]
    fn delivery_reaches_subscribers_until_unsubscribed() {
        let transport = InMemoryTransport::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        transport.subscribe(
            events::FILE_CHANGED,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(transport.deliver(events::FILE_CHANGED, json!({})), 1);
        transport.unsubscribe(events::FILE_CHANGED);
        assert_eq!(transport.deliver(events::FILE_CHANGED, json!({})), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn outbound_log_is_sequenced_and_bounded() {
        let transport = InMemoryTransport::new(2);
        for i in 0..3 {
            transport.emit("analyzeCode", json!({ "i": i })).unwrap();
        }
        let logged = transport.outbound_since(0);
        assert_eq!(logged.len(), 2);
        assert_eq!(logged[0].seq, 2);
        assert_eq!(logged[1].seq, 3);
        assert_eq!(transport.outbound_since(2).len(), 1);
    }

    #[tokio::test]
    async fn request_without_responder_fails() {
        let transport = InMemoryTransport::default();
        let result = transport.request("requestCodeAnalysis", json!({})).await;
        assert_eq!(
            result,
            Err(TransportError::NoResponder("requestCodeAnalysis".into()))
        );
    }

    struct SilentTransport;

    #[async_trait]
    impl Transport for SilentTransport {
        fn subscribe(&self, _event: &str, _handler: EventHandler) {}

        fn unsubscribe(&self, _event: &str) {}

        fn emit(&self, _event: &str, _payload: Value) -> Result<(), TransportError> {
            Ok(())
        }

        async fn request(&self, _event: &str, _payload: Value) -> Result<Value, TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let result = request_with_timeout(
            &SilentTransport,
            "requestAgentContext",
            json!({}),
            Duration::from_millis(250),
        )
        .await;
        assert_eq!(
            result,
            Err(TransportError::Timeout {
                event: "requestAgentContext".into(),
                timeout_ms: 250
            })
        );
    }

    #[tokio::test]
    async fn request_uses_registered_responder() {
        let transport = InMemoryTransport::default();
        transport.register_responder("requestAgentContext", |payload| {
            Ok(json!({ "echo": payload["taskId"] }))
        });
        let reply = transport
            .request("requestAgentContext", json!({ "taskId": "t1" }))
            .await
            .unwrap();
        assert_eq!(reply["echo"], "t1");
        assert_eq!(transport.emitted("requestAgentContext").len(), 1);
    }
}
