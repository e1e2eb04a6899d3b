pub mod agent;
pub mod error_analysis;
pub mod project;

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use serde_json::{Map, Value};
use tracing::warn;

use self::{agent::AgentUpdate, error_analysis::ErrorAnalysis, project::ProjectUpdate};

pub type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered callbacks for one outbound event.
pub struct SubscriberList<T> {
    event: &'static str,
    callbacks: Vec<Subscriber<T>>,
}

impl<T> SubscriberList<T> {
    pub fn new(event: &'static str) -> Self {
        Self {
            event,
            callbacks: Vec::new(),
        }
    }

    pub fn register(&mut self, callback: Subscriber<T>) {
        self.callbacks.push(callback);
    }

    /// Runs every callback in order. A panicking callback is contained and
    /// the rest still run; returns how many panicked.
    pub fn notify(&self, value: &T) -> usize {
        let mut panicked = 0;
        for (index, callback) in self.callbacks.iter().enumerate() {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                warn!(event = self.event, index, "Subscriber callback panicked");
                panicked += 1;
            }
        }
        panicked
    }
}

pub struct Subscribers {
    pub error_analysis: SubscriberList<ErrorAnalysis>,
    pub agent_update: SubscriberList<AgentUpdate>,
    pub project_update: SubscriberList<ProjectUpdate>,
}

impl Default for Subscribers {
    fn default() -> Self {
        use crate::transport::events;
        Self {
            error_analysis: SubscriberList::new(events::ERROR_ANALYSIS),
            agent_update: SubscriberList::new(events::AGENT_UPDATE),
            project_update: SubscriberList::new(events::PROJECT_UPDATE),
        }
    }
}

/// Collects what was wrong with an inbound payload while the usable parts are
/// still read out of it.
#[derive(Debug, Default)]
pub struct Lenient {
    pub anomalies: Vec<String>,
}

impl Lenient {
    pub fn object<'a>(&mut self, payload: &'a Value) -> Option<&'a Map<String, Value>> {
        let object = payload.as_object();
        if object.is_none() {
            self.anomalies.push("payload is not an object".to_string());
        }
        object
    }

    pub fn nested<'a>(&mut self, parent: Option<&'a Map<String, Value>>, field: &str) -> Option<&'a Map<String, Value>> {
        match parent?.get(field) {
            None | Some(Value::Null) => None,
            Some(Value::Object(object)) => Some(object),
            Some(_) => {
                self.anomalies.push(format!("`{field}` is not an object"));
                None
            }
        }
    }

    pub fn string(&mut self, object: Option<&Map<String, Value>>, field: &str) -> Option<String> {
        match object?.get(field) {
            None | Some(Value::Null) => None,
            Some(Value::String(value)) => {
                let value = value.trim();
                (!value.is_empty()).then(|| value.to_string())
            }
            Some(Value::Number(number)) => Some(number.to_string()),
            Some(_) => {
                self.anomalies.push(format!("`{field}` is not a string"));
                None
            }
        }
    }

    pub fn required(&mut self, object: Option<&Map<String, Value>>, field: &str) -> Option<String> {
        let value = self.string(object, field);
        if value.is_none() {
            self.anomalies.push(format!("missing `{field}`"));
        }
        value
    }

    pub fn number(&mut self, object: Option<&Map<String, Value>>, field: &str) -> Option<f64> {
        match object?.get(field) {
            None | Some(Value::Null) => None,
            Some(value) => {
                let number = value.as_f64();
                if number.is_none() {
                    self.anomalies.push(format!("`{field}` is not numeric"));
                }
                number
            }
        }
    }

    /// String items of an array field. A bare string is read as one item per
    /// line; non-string items are dropped.
    pub fn strings(&mut self, object: Option<&Map<String, Value>>, field: &str) -> Vec<String> {
        let Some(value) = object.and_then(|object| object.get(field)) else {
            return Vec::new();
        };
        match value {
            Value::Null => Vec::new(),
            Value::String(text) => text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(ToString::to_string)
                .collect(),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                let mut dropped = 0;
                for item in items {
                    match item.as_str().map(str::trim) {
                        Some(text) if !text.is_empty() => out.push(text.to_string()),
                        _ => dropped += 1,
                    }
                }
                if dropped > 0 {
                    self.anomalies
                        .push(format!("dropped {dropped} invalid item(s) from `{field}`"));
                }
                out
            }
            _ => {
                self.anomalies.push(format!("`{field}` is not an array"));
                Vec::new()
            }
        }
    }
}
