//! The unit of work: a flat JSON record.
//!
//! Input rows are plain JSON objects under the caller's control (our input
//! format may be a CSV file, which is inherently "flat"). The pipeline
//! reserves a handful of underscore-prefixed keys for its own bookkeeping;
//! everything else passes through untouched.

use serde_json::Map;

/// A JSON Object value, without the surrounding [`Value::Object`] wrapper.
pub type JsonObject = Map<String, serde_json::Value>;

/// Reserved field names. Kept in one place so the writer, engine and
/// post-processor agree on what a failure looks like.
pub mod fields {
    /// Position of the record in the input enumeration. Primary key for
    /// ordering, deduplication and resume.
    pub const IDX: &str = "_idx";

    /// Raw model output, present only between the LLM call and
    /// post-processing (or in the final record when `include_raw` is set).
    pub const RESULT: &str = "result";

    /// Parsed model output when merging into the root is disabled.
    pub const PARSED: &str = "parsed";

    /// Terminal error from the LLM call (fatal, or transient after the
    /// client gave up retrying).
    pub const ERROR: &str = "_error";

    /// The model's reply could not be parsed as JSON.
    pub const PARSE_ERROR: &str = "parse_error";

    /// Verbatim model text, kept alongside `parse_error` for debugging.
    pub const RAW_OUTPUT: &str = "_raw_output";

    /// All parse retries were consumed.
    pub const RETRIES_EXHAUSTED: &str = "_retries_exhausted";

    /// Total number of LLM calls made for this record.
    pub const ATTEMPTS: &str = "_attempts";

    /// Token usage accumulated across all calls for this record.
    pub const USAGE: &str = "_usage";
}

/// Assign each record its position in the input enumeration.
pub fn assign_indices(records: &mut [JsonObject]) {
    for (idx, record) in records.iter_mut().enumerate() {
        record.insert(fields::IDX.to_owned(), serde_json::Value::from(idx as u64));
    }
}

/// The `_idx` of a record or result, if it carries one.
pub fn index_of(record: &JsonObject) -> Option<u64> {
    record.get(fields::IDX).and_then(|v| v.as_u64())
}

/// Is this result a terminal failure? Covers LLM errors, parse errors, and
/// exhausted parse retries.
pub fn is_failure(result: &JsonObject) -> bool {
    result.contains_key(fields::ERROR)
        || result.contains_key(fields::PARSE_ERROR)
        || result
            .get(fields::RETRIES_EXHAUSTED)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
}

/// Does this failure specifically involve unparseable model output?
pub fn is_parse_failure(result: &JsonObject) -> bool {
    result.contains_key(fields::PARSE_ERROR)
}

/// The string form of a scalar value, as substituted into templates and
/// written to text-ish outputs. Strings pass through unquoted; compound
/// values fall back to their JSON text.
pub fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
