//! JSON extraction from LLM output.
//!
//! Agents emit events by embedding JSON objects in their responses, either
//! bare or inside fenced code blocks. Extraction walks the text with a
//! balanced-brace scanner (regex alone cannot handle arbitrary nesting) and
//! collects parse failures with remediation hints that are fed back to the
//! originating agent.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// A candidate object that failed to parse, with a hint for the agent.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExtractionError {
    pub json_str: String,
    pub error: String,
    pub suggestion: String,
}

/// An `{"event": ..., "data": ...}` emission found in response text.
#[derive(Debug, Clone)]
pub struct ExtractedEvent {
    pub event: String,
    pub data: Value,
}

fn code_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.+?\})\s*```").expect("static regex"))
}

/// Extract every valid JSON object from `text`, fenced blocks first, then a
/// balanced-brace sweep over the whole text. Returns objects and errors.
pub fn extract_json_objects(text: &str) -> (Vec<Value>, Vec<ExtractionError>) {
    let mut objects: Vec<Value> = Vec::new();
    let mut errors: Vec<ExtractionError> = Vec::new();
    let mut seen: Vec<String> = Vec::new();

    let mut consider = |candidate: &str, objects: &mut Vec<Value>, errors: &mut Vec<ExtractionError>| {
        let trimmed = candidate.trim();
        if seen.iter().any(|s| s == trimmed) {
            return;
        }
        seen.push(trimmed.to_string());
        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(map)) => {
                let value = Value::Object(map);
                if !objects.contains(&value) {
                    objects.push(value);
                }
            }
            Ok(_) => {}
            Err(e) => errors.push(ExtractionError {
                json_str: truncate(trimmed, 120),
                suggestion: suggest_fix(trimmed, &e),
                error: e.to_string(),
            }),
        }
    };

    for captures in code_block_re().captures_iter(text) {
        if let Some(m) = captures.get(1) {
            consider(m.as_str(), &mut objects, &mut errors);
        }
    }

    for candidate in balanced_json_strings(text) {
        consider(&candidate, &mut objects, &mut errors);
    }

    (objects, errors)
}

/// Extract event emissions: objects with a top-level string `event`.
pub fn extract_events(text: &str) -> (Vec<ExtractedEvent>, Vec<ExtractionError>) {
    let (objects, errors) = extract_json_objects(text);
    let events = objects
        .into_iter()
        .filter_map(|obj| {
            let event = obj.get("event")?.as_str()?.to_string();
            let data = obj.get("data").cloned().unwrap_or(Value::Object(Default::default()));
            Some(ExtractedEvent { event, data })
        })
        .collect();
    (events, errors)
}

/// Scan for top-level `{...}` spans with proper brace/bracket/string
/// balancing.
fn balanced_json_strings(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            match balanced_object_at(bytes, i) {
                Some(end) => {
                    spans.push(text[i..end].to_string());
                    i = end;
                }
                None => i += 1,
            }
        } else {
            i += 1;
        }
    }
    spans
}

/// Returns the exclusive end offset of the balanced object starting at
/// `start`, or `None` when braces never balance.
fn balanced_object_at(bytes: &[u8], start: usize) -> Option<usize> {
    let mut brace = 0i32;
    let mut bracket = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    let mut i = start;
    while i < bytes.len() {
        let c = bytes[i];
        if escaped {
            escaped = false;
            i += 1;
            continue;
        }
        match c {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => brace += 1,
            b'}' if !in_string => {
                brace -= 1;
                if brace == 0 {
                    return Some(i + 1);
                }
                if brace < 0 {
                    return None;
                }
            }
            b'[' if !in_string => bracket += 1,
            b']' if !in_string => {
                bracket -= 1;
                if bracket < 0 {
                    return None;
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Map common LLM JSON mistakes to actionable hints.
fn suggest_fix(json_str: &str, error: &serde_json::Error) -> String {
    let message = error.to_string().to_lowercase();
    if message.contains("key must be a string") || json_str.contains('\'') {
        "Use double quotes for JSON strings, not single quotes".to_string()
    } else if message.contains("trailing comma")
        || trailing_comma_before_close(json_str)
    {
        "Remove trailing comma before closing brace/bracket".to_string()
    } else if message.contains("eof while parsing a string")
        || message.contains("unterminated")
    {
        "Check for missing closing quotes in strings".to_string()
    } else if message.contains("trailing characters") {
        "Multiple JSON objects found - ensure they're in an array or separate them".to_string()
    } else {
        "Ensure valid JSON syntax - use a JSON validator".to_string()
    }
}

fn trailing_comma_before_close(json_str: &str) -> bool {
    let mut last_significant = ' ';
    for c in json_str.chars() {
        if c == '}' || c == ']' {
            if last_significant == ',' {
                return true;
            }
        }
        if !c.is_whitespace() {
            last_significant = c;
        }
    }
    false
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_bare_objects() {
        let text = r#"Working on it. {"event": "agent:done", "data": {"ok": true}} All set."#;
        let (events, errors) = extract_events(text);
        assert!(errors.is_empty());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "agent:done");
        assert_eq!(events[0].data["ok"], true);
    }

    #[test]
    fn extracts_from_fenced_code_blocks() {
        let text = "Here you go:\n```json\n{\"event\": \"metrics:report\", \"data\": {\"cpu\": 12}}\n```\ndone";
        let (events, _) = extract_events(text);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "metrics:report");
    }

    #[test]
    fn handles_deep_nesting() {
        let inner = json!({"event": "e", "data": {"a": {"b": {"c": [1, {"d": "}"}]}}}});
        let text = format!("prefix {inner} suffix");
        let (objects, errors) = extract_json_objects(&text);
        assert!(errors.is_empty());
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["data"]["a"]["b"]["c"][1]["d"], "}");
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scanner() {
        let text = r#"{"note": "a { b } c", "n": 1} trailing { not json"#;
        let (objects, _) = extract_json_objects(text);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["n"], 1);
    }

    #[test]
    fn non_event_objects_are_not_events() {
        let text = r#"{"status": "thinking"} {"event": "real:one", "data": {}}"#;
        let (events, _) = extract_events(text);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "real:one");
    }

    #[test]
    fn single_quotes_get_a_helpful_suggestion() {
        let text = "{'event': 'bad'}";
        let (objects, errors) = extract_json_objects(text);
        assert!(objects.is_empty());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].suggestion.contains("double quotes"));
    }

    #[test]
    fn trailing_comma_gets_a_helpful_suggestion() {
        let text = r#"{"event": "x", "data": {"a": 1,}}"#;
        let (objects, errors) = extract_json_objects(text);
        assert!(objects.is_empty());
        assert!(!errors.is_empty());
        assert!(errors[0].suggestion.contains("trailing comma"));
    }

    #[test]
    fn duplicate_objects_are_reported_once() {
        let obj = r#"{"event": "e", "data": {}}"#;
        let text = format!("```json\n{obj}\n```\nand again {obj}");
        let (objects, _) = extract_json_objects(&text);
        assert_eq!(objects.len(), 1);
    }

    #[test]
    fn missing_event_data_defaults_to_empty_object() {
        let (events, _) = extract_events(r#"{"event": "bare:event"}"#);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, json!({}));
    }
}
