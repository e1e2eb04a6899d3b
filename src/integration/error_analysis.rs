use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::Lenient;
use crate::store::GraphStore;

const DEFAULT_SEVERITY: &str = "error";

// `at fn (src/a.ts:10:5)`, `File "app.py", line 3`, `src/main.rs:42:7`
static FILE_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?:File "(?P<quoted>[^"]+)")|(?P<path>(?:[A-Za-z]:)?[\w@.~/\\-]*[\w-]\.[A-Za-z][A-Za-z0-9]*):\d+"#,
    )
    .expect("valid regex")
});

static LOCATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<file>(?:[A-Za-z]:)?[\w@.~/\\-]*[\w-]\.[A-Za-z][A-Za-z0-9]*):(?P<line>\d+)(?::(?P<column>\d+))?")
        .expect("valid regex")
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLocation {
    pub file: Option<String>,
    pub line: Option<u64>,
    pub column: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorReport {
    pub error_id: String,
    pub error_type: String,
    pub stack_trace: Vec<String>,
    pub context: ErrorLocation,
    pub severity: String,
    pub related_nodes: Vec<String>,
    pub suggested_fixes: Vec<String>,
}

/// Normalized outbound `errorAnalysis` / `reportError` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorAnalysis {
    pub error_id: String,
    pub error_type: String,
    pub severity: String,
    pub affected_nodes: Vec<String>,
    pub suggested_fixes: Vec<String>,
    pub context: ErrorLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<String>,
    pub analyzed_at: Option<DateTime<Utc>>,
}

pub fn parse_error_report(payload: &Value) -> (ErrorReport, Vec<String>) {
    let mut lenient = Lenient::default();
    let object = lenient.object(payload);

    let error_id = lenient
        .required(object, "errorId")
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let error_type = lenient
        .required(object, "errorType")
        .unwrap_or_else(|| "unknown".to_string());
    let severity = lenient
        .string(object, "severity")
        .unwrap_or_else(|| DEFAULT_SEVERITY.to_string());
    let stack_trace = lenient.strings(object, "stackTrace");
    let related_nodes = lenient.strings(object, "relatedNodes");
    let suggested_fixes = lenient.strings(object, "suggestedFixes");

    let context_object = lenient.nested(object, "context");
    let line = lenient.number(context_object, "line");
    let column = lenient.number(context_object, "column");
    let context = ErrorLocation {
        file: lenient.string(context_object, "file"),
        line: line.filter(|n| *n >= 0.0).map(|n| n as u64),
        column: column.filter(|n| *n >= 0.0).map(|n| n as u64),
    };

    let report = ErrorReport {
        error_id,
        error_type,
        stack_trace,
        context,
        severity,
        related_nodes,
        suggested_fixes,
    };
    (report, lenient.anomalies)
}

/// Builds a report from a native error: the message's `Type: text` prefix
/// becomes the error type and the first stack frame the location.
pub fn report_from_native(message: &str, stack: Option<&str>) -> ErrorReport {
    let stack_trace = stack
        .unwrap_or_default()
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect::<Vec<_>>();

    let error_type = message
        .split_once(':')
        .map(|(kind, _)| kind.trim())
        .filter(|kind| !kind.is_empty() && !kind.contains(char::is_whitespace))
        .unwrap_or("Error")
        .to_string();

    let context = stack_trace
        .iter()
        .find_map(|line| first_location(line))
        .unwrap_or_default();

    ErrorReport {
        error_id: Uuid::new_v4().to_string(),
        error_type,
        stack_trace,
        context,
        severity: DEFAULT_SEVERITY.to_string(),
        related_nodes: Vec::new(),
        suggested_fixes: Vec::new(),
    }
}

fn first_location(line: &str) -> Option<ErrorLocation> {
    let captures = LOCATION.captures(line)?;
    Some(ErrorLocation {
        file: captures.name("file").map(|m| m.as_str().to_string()),
        line: captures.name("line").and_then(|m| m.as_str().parse().ok()),
        column: captures.name("column").and_then(|m| m.as_str().parse().ok()),
    })
}

pub fn stack_file_references(stack_trace: &[String]) -> Vec<String> {
    let regex = &*FILE_REFERENCE;
    let mut seen = BTreeSet::new();
    let mut files = Vec::new();
    for line in stack_trace {
        for captures in regex.captures_iter(line) {
            let Some(found) = captures.name("quoted").or_else(|| captures.name("path")) else {
                continue;
            };
            let file = normalize_separators(found.as_str());
            if seen.insert(file.clone()) {
                files.push(file);
            }
        }
    }
    files
}

fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
        .trim_start_matches("file://")
        .trim_start_matches("./")
        .to_string()
}

/// True when `reference` names the stored path, allowing either side to be
/// the longer, more qualified one.
pub fn path_matches(stored: &str, reference: &str) -> bool {
    let stored = normalize_separators(stored);
    let reference = normalize_separators(reference);
    if stored.is_empty() || reference.is_empty() {
        return false;
    }
    stored == reference
        || reference.ends_with(&format!("/{stored}"))
        || stored.ends_with(&format!("/{reference}"))
}

/// `affectedNodes` is every related node plus each stored node whose path is
/// referenced by the stack trace or the error location.
pub fn analyze(report: &ErrorReport, store: &GraphStore, anomalies: Vec<String>) -> ErrorAnalysis {
    let mut affected = report.related_nodes.clone();
    let mut seen = affected.iter().cloned().collect::<BTreeSet<_>>();

    let mut references = stack_file_references(&report.stack_trace);
    if let Some(file) = &report.context.file {
        references.push(normalize_separators(file));
    }

    let mut inferred = store
        .nodes()
        .filter(|node| {
            references
                .iter()
                .any(|reference| path_matches(&node.path, reference) || path_matches(&node.id, reference))
        })
        .map(|node| node.id.clone())
        .collect::<Vec<_>>();
    inferred.sort();

    for id in inferred {
        if seen.insert(id.clone()) {
            affected.push(id);
        }
    }

    ErrorAnalysis {
        error_id: report.error_id.clone(),
        error_type: report.error_type.clone(),
        severity: report.severity.clone(),
        affected_nodes: affected,
        suggested_fixes: report.suggested_fixes.clone(),
        context: report.context.clone(),
        message: None,
        anomalies,
        analyzed_at: Some(Utc::now()),
    }
}
