//! Decoding of the agent CLI's output.
//!
//! The agent emits newline-delimited JSON events on stdout; the text
//! payload is the concatenation of every `text` field on lines whose
//! `type` is `"text"`. The text itself is expected to be a JSON
//! document, possibly wrapped in markdown fences and possibly
//! containing literal control characters inside string literals
//! (a common model failure mode). Parsing is therefore layered:
//! strip fences, try a standard parse, and only on failure run the
//! scanner-based sanitizer and retry.

use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Error decoding an agent response.
#[derive(Debug, Clone)]
pub enum EnvelopeError {
    /// The response text was not valid JSON even after sanitizing.
    Malformed(String),
    /// The JSON parsed but did not match the expected shape.
    InvalidShape(String),
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeError::Malformed(msg) => write!(f, "agent response malformed: {}", msg),
            EnvelopeError::InvalidShape(msg) => {
                write!(f, "agent response has invalid shape: {}", msg)
            }
        }
    }
}

impl std::error::Error for EnvelopeError {}

#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(rename = "type")]
    line_type: String,
    #[serde(default)]
    text: Option<String>,
}

/// Concatenate the `text` fields of all `type == "text"` NDJSON lines.
///
/// Lines that fail to parse are skipped; the agent interleaves
/// tool-use and progress events we have no interest in.
pub fn extract_agent_text(ndjson: &str) -> String {
    let mut out = String::new();
    for line in ndjson.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(event) = serde_json::from_str::<StreamLine>(line) {
            if event.line_type == "text" {
                if let Some(text) = event.text {
                    out.push_str(&text);
                }
            }
        }
    }
    out
}

/// Strip a leading ```json / ``` fence line and a trailing ``` fence.
fn strip_fences(text: &str) -> &str {
    let mut s = text.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest.trim_start();
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest.trim_start();
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest.trim_end();
    }
    s
}

/// Escape literal control characters inside JSON string literals.
///
/// Walks the text tracking whether we are inside a string literal and
/// whether the previous character was an unconsumed backslash. Inside
/// strings, raw `\n`, `\r`, and `\t` become their two-character escape
/// sequences; everything else passes through unchanged.
pub fn sanitize_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            if escaped {
                out.push(c);
                escaped = false;
                continue;
            }
            match c {
                '\\' => {
                    out.push(c);
                    escaped = true;
                }
                '"' => {
                    out.push(c);
                    in_string = false;
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                _ => out.push(c),
            }
        } else {
            out.push(c);
            if c == '"' {
                in_string = true;
            }
        }
    }
    out
}

/// Parse the agent's final text blob into a typed value.
///
/// Fences are stripped first. A failed standard parse triggers one
/// sanitize-and-retry pass; a second failure is terminal for this
/// attempt.
pub fn parse_agent_json<T: DeserializeOwned>(text: &str) -> Result<T, EnvelopeError> {
    let stripped = strip_fences(text);

    let value: serde_json::Value = match serde_json::from_str(stripped) {
        Ok(v) => v,
        Err(_) => {
            let sanitized = sanitize_json(stripped);
            serde_json::from_str(&sanitized)
                .map_err(|e| EnvelopeError::Malformed(e.to_string()))?
        }
    };

    serde_json::from_value(value).map_err(|e| EnvelopeError::InvalidShape(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReviewComment;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct AgentReview {
        comments: Vec<ReviewComment>,
    }

    #[test]
    fn test_extract_concatenates_text_lines() {
        let ndjson = r#"{"type":"tool_use","name":"read"}
{"type":"text","text":"{\"comments\":"}
not json at all
{"type":"text","text":"[]}"}
{"type":"done"}"#;
        assert_eq!(extract_agent_text(ndjson), r#"{"comments":[]}"#);
    }

    #[test]
    fn test_extract_skips_text_lines_without_text_field() {
        let ndjson = r#"{"type":"text"}
{"type":"text","text":"ok"}"#;
        assert_eq!(extract_agent_text(ndjson), "ok");
    }

    #[test]
    fn test_strip_json_fence() {
        let fenced = "```json\n{\"a\": 1}\n```";
        let parsed: serde_json::Value = parse_agent_json(fenced).unwrap();
        assert_eq!(parsed["a"], 1);
    }

    #[test]
    fn test_strip_bare_fence() {
        let fenced = "```\n{\"a\": 1}\n```";
        let parsed: serde_json::Value = parse_agent_json(fenced).unwrap();
        assert_eq!(parsed["a"], 1);
    }

    #[test]
    fn test_sanitize_is_identity_on_valid_json() {
        let valid = r#"{"message": "already\nescaped", "n": 3}"#;
        assert_eq!(sanitize_json(valid), valid);
    }

    #[test]
    fn test_sanitize_escapes_raw_newline_in_string() {
        let broken = "{\"message\": \"has a\nliteral newline\"}";
        let fixed = sanitize_json(broken);
        let value: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value["message"], "has a\nliteral newline");
    }

    #[test]
    fn test_sanitize_leaves_newlines_outside_strings() {
        let pretty = "{\n  \"a\": 1\n}";
        assert_eq!(sanitize_json(pretty), pretty);
    }

    #[test]
    fn test_sanitize_respects_escaped_quote() {
        let tricky = "{\"a\": \"quote \\\" then\nnewline\"}";
        let fixed = sanitize_json(tricky);
        let value: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value["a"], "quote \" then\nnewline");
    }

    #[test]
    fn test_parse_agent_json_recovers_literal_newline_comment() {
        let text = "{\"comments\": [ { \"file\": \"a.ts\", \"line\": 10, \"severity\": \"critical\", \"category\": \"baseline\", \"message\": \"has a\nliteral newline\" } ]}";
        let review: AgentReview = parse_agent_json(text).unwrap();
        assert_eq!(review.comments.len(), 1);
        assert_eq!(review.comments[0].message, "has a\nliteral newline");
    }

    #[test]
    fn test_parse_agent_json_malformed_after_sanitize() {
        let err = parse_agent_json::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed(_)));
    }

    #[test]
    fn test_parse_agent_json_wrong_shape() {
        let err = parse_agent_json::<AgentReview>(r#"{"comments": "not a list"}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidShape(_)));
    }
}
