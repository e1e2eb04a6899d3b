//! Built-in responder for `requestCodeAnalysis`.
//!
//! Everything here is lexical: branch keywords stand in for control-flow
//! decisions and token classes stand in for Halstead operators/operands, so
//! any curly-brace or indentation language gets usable numbers.

use std::collections::{BTreeSet, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{models::clamp_unit, transport::{events, InMemoryTransport}};

const LONG_FILE_LINES: usize = 500;
const LONG_LINE_CHARS: usize = 120;
const DEEP_NESTING: usize = 4;
const HIGH_CYCLOMATIC: f64 = 10.0;

static DECISION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:if|elif|for|while|case|catch|except|match|loop|when)\b|&&|\|\||\?\?|\?\s").expect("valid regex")
});

static OPERAND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*'|\b\d+(?:\.\d+)?\b|\b[A-Za-z_$][\w$]*\b"#).expect("valid regex")
});

static OPERATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[+\-*/%=<>!&|^~?:]+|[(){}\[\];,.]").expect("valid regex"));

static SECRET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:password|passwd|secret|api[_-]?key|token)\b\s*[:=]\s*["'][^"']{4,}["']"#).expect("valid regex")
});

const KEYWORDS: &[&str] = &[
    "if", "else", "for", "while", "loop", "match", "case", "switch", "return", "break", "continue", "fn",
    "function", "def", "class", "struct", "enum", "impl", "let", "const", "var", "mut", "pub", "use", "import",
    "export", "from", "async", "await", "try", "catch", "except", "finally", "new", "in", "of", "elif", "when",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMetrics {
    pub lines: f64,
    pub complexity: f64,
    pub cyclomatic_complexity: f64,
    pub cognitive_complexity: f64,
    pub halstead_volume: f64,
    pub halstead_difficulty: f64,
    pub halstead_effort: f64,
    pub maintainability: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceFindings {
    pub patterns: Vec<String>,
    pub smells: Vec<String>,
    pub vulnerabilities: Vec<String>,
    pub suggestions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
}

fn count(regex: &Regex, text: &str) -> usize {
    regex.find_iter(text).count()
}

/// Strips string literals and trailing `//` / `#` comments so keyword counting
/// does not see them.
fn code_portion(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' | '`' => {
                quote = Some(c);
                out.push(' ');
            }
            '/' if chars.peek() == Some(&'/') => break,
            '#' if out.trim().is_empty() => break,
            _ => out.push(c),
        }
    }
    out
}

fn is_comment(trimmed: &str) -> bool {
    ["//", "#", "/*", "*", "--", "\"\"\""]
        .iter()
        .any(|marker| trimmed.starts_with(marker))
}

fn halstead(content: &str) -> (f64, f64, f64) {
    let (operand_re, operator_re) = (&*OPERAND, &*OPERATOR);
    let keywords = KEYWORDS.iter().copied().collect::<HashSet<_>>();

    let mut operators = HashSet::new();
    let mut operands = HashSet::new();
    let (mut total_operators, mut total_operands) = (0usize, 0usize);

    for token in operand_re.find_iter(content).map(|m| m.as_str()) {
        if keywords.contains(token) {
            operators.insert(token);
            total_operators += 1;
        } else {
            operands.insert(token);
            total_operands += 1;
        }
    }
    for token in operator_re.find_iter(content).map(|m| m.as_str()) {
        operators.insert(token);
        total_operators += 1;
    }

    let vocabulary = (operators.len() + operands.len()) as f64;
    let length = (total_operators + total_operands) as f64;
    let volume = if vocabulary >= 2.0 {
        length * vocabulary.log2()
    } else {
        0.0
    };
    let difficulty = if operands.is_empty() {
        0.0
    } else {
        (operators.len() as f64 / 2.0) * (total_operands as f64 / operands.len() as f64)
    };
    (volume, difficulty, volume * difficulty)
}

/// Classic maintainability index rescaled from `[0, 171]` to `[0, 1]`.
fn maintainability(volume: f64, cyclomatic: f64, code_lines: usize) -> f64 {
    let index = 171.0 - 5.2 * volume.max(1.0).ln() - 0.23 * cyclomatic - 16.2 * (code_lines.max(1) as f64).ln();
    clamp_unit(index / 171.0)
}

pub fn measure(content: &str) -> (SourceMetrics, usize, usize) {
    let mut decisions = 0usize;
    let mut cognitive = 0usize;
    let mut depth = 0usize;
    let mut max_depth = 0usize;
    let mut code_lines = 0usize;
    let mut long_lines = 0usize;

    for line in content.lines() {
        if line.chars().count() > LONG_LINE_CHARS {
            long_lines += 1;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() || is_comment(trimmed) {
            continue;
        }
        code_lines += 1;

        let code = code_portion(line);
        let branches = count(&DECISION, &code);
        decisions += branches;
        cognitive += branches * (1 + depth);

        for c in code.chars() {
            match c {
                '{' => {
                    depth += 1;
                    max_depth = max_depth.max(depth);
                }
                '}' => depth = depth.saturating_sub(1),
                _ => {}
            }
        }
    }

    let cyclomatic = (decisions + 1) as f64;
    let (volume, difficulty, effort) = halstead(content);
    let metrics = SourceMetrics {
        lines: content.lines().count() as f64,
        complexity: cyclomatic,
        cyclomatic_complexity: cyclomatic,
        cognitive_complexity: cognitive as f64,
        halstead_volume: volume,
        halstead_difficulty: difficulty,
        halstead_effort: effort,
        maintainability: maintainability(volume, cyclomatic, code_lines),
    };
    (metrics, max_depth, long_lines)
}

/// Leading comment block, markers stripped.
fn leading_documentation(content: &str) -> Option<String> {
    let mut lines = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() && lines.is_empty() {
            continue;
        }
        if !is_comment(trimmed) && trimmed != "*/" {
            break;
        }
        let text = trimmed
            .trim_start_matches("//!")
            .trim_start_matches("///")
            .trim_start_matches("//")
            .trim_start_matches("/**")
            .trim_start_matches("/*")
            .trim_end_matches("*/")
            .trim_start_matches('*')
            .trim_start_matches('#')
            .trim_matches('"')
            .trim();
        if !text.is_empty() {
            lines.push(text.to_string());
        }
    }
    (!lines.is_empty()).then(|| lines.join("\n"))
}

fn findings(path: &str, content: &str, metrics: &SourceMetrics, max_depth: usize, long_lines: usize) -> SourceFindings {
    let lower = path.to_ascii_lowercase();
    let mut patterns = BTreeSet::new();
    if lower.contains("test") || lower.contains("spec") {
        patterns.insert("test-suite");
    }
    if content.contains("async ") || content.contains("await") {
        patterns.insert("async");
    }
    if content.contains("export ") || content.contains("pub ") || content.contains("module.exports") {
        patterns.insert("public-api");
    }
    if content.contains("class ") || content.contains("struct ") {
        patterns.insert("type-definitions");
    }

    let mut smells = BTreeSet::new();
    let mut suggestions = BTreeSet::new();
    if ["TODO", "FIXME", "XXX"].iter().any(|marker| content.contains(marker)) {
        smells.insert("todo-comment");
        suggestions.insert("resolve outstanding TODO/FIXME comments");
    }
    if metrics.lines > LONG_FILE_LINES as f64 {
        smells.insert("long-file");
        suggestions.insert("split the file into smaller modules");
    }
    if max_depth > DEEP_NESTING {
        smells.insert("deep-nesting");
        suggestions.insert("flatten nested blocks with early returns");
    }
    if long_lines > 0 {
        smells.insert("long-lines");
    }
    if metrics.cyclomatic_complexity > HIGH_CYCLOMATIC {
        smells.insert("high-complexity");
        suggestions.insert("reduce branching in the most complex functions");
    }

    let mut vulnerabilities = BTreeSet::new();
    if content.contains("eval(") {
        vulnerabilities.insert("dynamic-eval");
    }
    if content.contains("innerHTML") || content.contains("dangerouslySetInnerHTML") {
        vulnerabilities.insert("unsafe-html");
    }
    if count(&SECRET, content) > 0 {
        vulnerabilities.insert("hardcoded-secret");
        suggestions.insert("move credentials into configuration");
    }

    let owned = |set: BTreeSet<&str>| set.into_iter().map(ToString::to_string).collect::<Vec<_>>();
    SourceFindings {
        patterns: owned(patterns),
        smells: owned(smells),
        vulnerabilities: owned(vulnerabilities),
        suggestions: owned(suggestions),
        documentation: leading_documentation(content),
    }
}

/// Analyzer reply in the shape ingestion expects: `{metrics, analysis}`.
pub fn analyze_source(path: &str, content: &str) -> Value {
    let (metrics, max_depth, long_lines) = measure(content);
    let found = findings(path, content, &metrics, max_depth, long_lines);
    json!({ "path": path, "metrics": metrics, "analysis": found })
}

pub fn install(transport: &InMemoryTransport) {
    transport.register_responder(events::REQUEST_CODE_ANALYSIS, |payload| {
        let path = payload
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| "analysis request is missing `path`".to_string())?;
        let content = payload.get("content").and_then(Value::as_str).unwrap_or_default();
        debug!(path, bytes = content.len(), "Running built-in analyzer");
        Ok(analyze_source(path, content))
    });
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::transport::Transport;

    #[test]
    fn patterns_compile() {
        Lazy::force(&DECISION);
        Lazy::force(&OPERAND);
        Lazy::force(&OPERATOR);
        Lazy::force(&SECRET);
    }

    const SAMPLE: &str = r#"/// Formats a user record.
/// Used by the profile page.
export function format(user) {
  // TODO: locale support
  if (user && user.name) {
    for (const part of user.parts) {
      if (part === "if") { return part; }
    }
  }
  return user.name || "anonymous";
}
"#;

    #[test]
    fn branch_keywords_drive_cyclomatic_complexity() {
        let (metrics, _, _) = measure(SAMPLE);
        // if, &&, for, if, ||  (the quoted "if" and the comment do not count)
        assert_eq!(metrics.cyclomatic_complexity, 6.0);
        assert_eq!(metrics.lines, 11.0);
        assert!(metrics.cognitive_complexity > metrics.cyclomatic_complexity);
        assert!(metrics.halstead_volume > 0.0);
        assert!(metrics.halstead_effort >= metrics.halstead_volume);
    }

    #[test]
    fn straight_line_code_has_complexity_one() {
        let (metrics, depth, _) = measure("let a = 1;\nlet b = a + 2;\n");
        assert_eq!(metrics.cyclomatic_complexity, 1.0);
        assert_eq!(metrics.cognitive_complexity, 0.0);
        assert_eq!(depth, 0);
    }

    #[test]
    fn findings_cover_smells_docs_and_vulnerabilities() {
        let value = analyze_source("src/format.ts", SAMPLE);
        let analysis = &value["analysis"];
        assert_eq!(analysis["documentation"], "Formats a user record.\nUsed by the profile page.");
        assert!(analysis["smells"].as_array().unwrap().contains(&json!("todo-comment")));
        assert!(analysis["patterns"].as_array().unwrap().contains(&json!("public-api")));

        let risky = analyze_source("src/cfg.js", "const apiKey = \"abcd1234\";\neval(input);\n");
        let vulnerabilities = risky["analysis"]["vulnerabilities"].as_array().unwrap();
        assert!(vulnerabilities.contains(&json!("hardcoded-secret")));
        assert!(vulnerabilities.contains(&json!("dynamic-eval")));
    }

    #[tokio::test]
    async fn installed_responder_answers_requests() {
        let transport = InMemoryTransport::default();
        install(&transport);
        let reply = transport
            .request(events::REQUEST_CODE_ANALYSIS, json!({ "path": "a.rs", "content": "fn main() {}\n" }))
            .await
            .unwrap();
        assert_eq!(reply["metrics"]["lines"], 1.0);

        let err = transport
            .request(events::REQUEST_CODE_ANALYSIS, json!({ "content": "x" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("path"));
    }

    proptest! {
        #[test]
        fn maintainability_stays_in_unit_interval(content in "[a-z{}();=+ \n]{0,400}") {
            let (metrics, _, _) = measure(&content);
            prop_assert!((0.0..=1.0).contains(&metrics.maintainability));
            prop_assert!(metrics.cyclomatic_complexity >= 1.0);
        }
    }
}
