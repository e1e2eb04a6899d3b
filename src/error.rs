use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{kind} payload must be a JSON object")]
    NotAnObject { kind: &'static str },

    #[error("{kind} payload is missing required field `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("metric `{name}` must be numeric")]
    NonNumericMetric { name: String },

    #[error("field `{field}` has an invalid value: {message}")]
    InvalidField { field: String, message: String },

    #[error("node not found: {0}")]
    UnknownNode(String),

    #[error("edge not found: {from} -> {to}")]
    UnknownEdge { from: String, to: String },

    #[error("unsupported batch item: {0}")]
    UnsupportedOperation(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no responder registered for `{0}`")]
    NoResponder(String),

    #[error("request `{event}` timed out after {timeout_ms}ms")]
    Timeout { event: String, timeout_ms: u64 },

    #[error("emit `{event}` failed: {message}")]
    Emit { event: String, message: String },

    #[error("request `{event}` failed: {message}")]
    Remote { event: String, message: String },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("analysis of {path} failed: {message}")]
pub struct AnalysisError {
    pub path: String,
    pub message: String,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed `{event}` payload: {}", anomalies.join("; "))]
pub struct IntegrationError {
    pub event: String,
    pub anomalies: Vec<String>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Integration error: {0}")]
    Integration(#[from] IntegrationError),

    #[error("graph service is shut down")]
    ServiceClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Validation,
    Integration,
    Analysis,
}

/// Payload of the outbound `error` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub error: String,
}

impl GraphError {
    pub fn to_event(&self) -> Option<ErrorEvent> {
        // Transport failures and malformed inbound payloads both belong to
        // the integration boundary.
        let (kind, error) = match self {
            Self::Validation(err) => (ErrorKind::Validation, err.to_string()),
            Self::Transport(err) => (ErrorKind::Integration, err.to_string()),
            Self::Integration(err) => (ErrorKind::Integration, err.to_string()),
            Self::Analysis(err) => (ErrorKind::Analysis, err.to_string()),
            Self::ServiceClosed => return None,
        };

        Some(ErrorEvent { kind, error })
    }
}
