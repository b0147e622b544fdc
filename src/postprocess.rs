//! Extract structured JSON from free-form model output.
//!
//! Even when asked for strict JSON, models wrap replies in markdown fences
//! or prose often enough that we try a short cascade of extraction
//! strategies before declaring a parse failure.

use std::sync::LazyLock;

use regex::Regex;

use crate::{prelude::*, record::fields};

/// A fenced code block, with or without a `json` language tag.
static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*\n(.*?)\n```").expect("fence regex should be valid")
});

/// The span from the first `{` to the last `}`.
static BRACE_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("brace regex should be valid"));

/// Message stored under `parse_error` when every strategy fails.
pub const PARSE_ERROR_MESSAGE: &str = "Failed to extract JSON from LLM output";

/// Try to extract a JSON object from model output. First match wins:
/// a fenced code block, then the first-`{`-to-last-`}` span, then the whole
/// text. Returns `None` when nothing parses as a JSON object.
pub fn extract_json(text: &str) -> Option<JsonObject> {
    if text.is_empty() {
        return None;
    }

    let candidate = if let Some(captures) = FENCED_BLOCK.captures(text) {
        captures.get(1).expect("fence capture").as_str().trim()
    } else if let Some(span) = BRACE_SPAN.find(text) {
        span.as_str()
    } else {
        text.trim()
    };

    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}

/// Transform a result-in-progress whose `result` field holds raw model text.
///
/// On parse success the parsed keys are merged into the root (or nested
/// under `parsed` when `merge` is off) and `result` is dropped unless
/// `include_raw`. On failure, `parse_error` and `_raw_output` are set; the
/// raw text is always preserved there for debugging.
pub fn process_result(result: &mut JsonObject, merge: bool, include_raw: bool) {
    let Some(raw) = result.get(fields::RESULT).and_then(Value::as_str) else {
        return;
    };
    let raw = raw.to_owned();

    match extract_json(&raw) {
        Some(parsed) => {
            if merge {
                for (key, value) in parsed {
                    result.insert(key, value);
                }
            } else {
                result.insert(fields::PARSED.to_owned(), Value::Object(parsed));
            }
        }
        None => {
            result.insert(
                fields::PARSE_ERROR.to_owned(),
                Value::String(PARSE_ERROR_MESSAGE.to_owned()),
            );
            result.insert(fields::RAW_OUTPUT.to_owned(), Value::String(raw));
        }
    }

    if !include_raw {
        result.remove(fields::RESULT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_from_fenced_json_block() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nanything else";
        let parsed = extract_json(text).unwrap();
        assert_eq!(parsed.get("a"), Some(&json!(1)));
    }

    #[test]
    fn extracts_from_fence_without_language_tag() {
        let text = "```\n{\"a\": \"b\"}\n```";
        assert!(extract_json(text).is_some());
    }

    #[test]
    fn extracts_brace_span_from_prose() {
        let text = "The answer is {\"score\": 7} as requested.";
        let parsed = extract_json(text).unwrap();
        assert_eq!(parsed.get("score"), Some(&json!(7)));
    }

    #[test]
    fn parses_bare_json_text() {
        assert!(extract_json("  {\"ok\": true}  ").is_some());
    }

    #[test]
    fn rejects_garbage_and_non_objects() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("").is_none());
        assert!(extract_json("[1, 2, 3]").is_none());
    }

    fn result_with(raw: &str) -> JsonObject {
        json!({"t": "x", "result": raw})
            .as_object()
            .unwrap()
            .clone()
    }

    #[test]
    fn merges_parsed_keys_into_root() {
        let mut result = result_with("{\"r\": \"v\"}");
        process_result(&mut result, true, false);
        assert_eq!(result.get("r"), Some(&json!("v")));
        assert_eq!(result.get("t"), Some(&json!("x")));
        assert!(!result.contains_key("result"));
    }

    #[test]
    fn nests_under_parsed_when_merge_disabled() {
        let mut result = result_with("{\"r\": \"v\"}");
        process_result(&mut result, false, false);
        assert_eq!(result.get("parsed"), Some(&json!({"r": "v"})));
        assert!(!result.contains_key("r"));
    }

    #[test]
    fn include_raw_keeps_the_result_field() {
        let mut result = result_with("{\"r\": 1}");
        process_result(&mut result, true, true);
        assert_eq!(result.get("result"), Some(&json!("{\"r\": 1}")));
    }

    #[test]
    fn parse_failure_records_error_and_raw_output() {
        let mut result = result_with("not json at all");
        process_result(&mut result, true, false);
        assert_eq!(result.get("parse_error"), Some(&json!(PARSE_ERROR_MESSAGE)));
        assert_eq!(result.get("_raw_output"), Some(&json!("not json at all")));
        assert!(!result.contains_key("result"));
    }

    #[test]
    fn missing_result_field_is_a_no_op() {
        let mut result = json!({"t": "x"}).as_object().unwrap().clone();
        let before = result.clone();
        process_result(&mut result, true, false);
        assert_eq!(result, before);
    }
}
