use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

pub type ContentHandler = Arc<dyn Fn(String, String) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorDocument {
    pub path: String,
    pub content: String,
}

/// The text-editing surface the graph follows.
pub trait EditorSurface: Send + Sync {
    fn current_document(&self) -> Option<EditorDocument>;

    /// Registers `handler(path, content)` for every content change.
    fn on_content_changed(&self, handler: ContentHandler);
}

#[derive(Default)]
struct EditorState {
    current: Option<EditorDocument>,
    handlers: Vec<ContentHandler>,
}

/// Editor surface driven programmatically, e.g. by an HTTP bridge or tests.
#[derive(Default)]
pub struct LocalEditor {
    state: Mutex<EditorState>,
}

impl std::fmt::Debug for LocalEditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("LocalEditor")
            .field("current", &state.current.as_ref().map(|doc| doc.path.clone()))
            .field("handlers", &state.handlers.len())
            .finish()
    }
}

impl LocalEditor {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, EditorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_content(&self, path: impl Into<String>, content: impl Into<String>) {
        let document = EditorDocument {
            path: path.into(),
            content: content.into(),
        };
        let handlers = {
            let mut state = self.state();
            state.current = Some(document.clone());
            state.handlers.clone()
        };
        for handler in handlers {
            handler(document.path.clone(), document.content.clone());
        }
    }
}

impl EditorSurface for LocalEditor {
    fn current_document(&self) -> Option<EditorDocument> {
        self.state().current.clone()
    }

    fn on_content_changed(&self, handler: ContentHandler) {
        self.state().handlers.push(handler);
    }
}
