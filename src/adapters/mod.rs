//! Format adapters: a uniform read/write interface over the supported
//! input and output formats.
//!
//! An adapter owns both paths of a job and writes the output in the same
//! format it read, so a CSV job produces a CSV and a JSONL job produces
//! JSONL. Selection is by URI scheme (`sqlite://`) or file extension.

use crate::prelude::*;

mod csv;
mod json;
mod jsonl;
mod sqlite;
mod text;

pub use self::{
    csv::CsvAdapter, json::JsonAdapter, jsonl::JsonlAdapter, sqlite::SqliteAdapter,
    text::TextAdapter,
};

/// Uniform access to a data source and its paired output.
#[async_trait]
pub trait DataAdapter: std::fmt::Debug + Send + Sync {
    /// Read all records from the source. Finite and single-pass; callers
    /// enumerate the returned list to assign `_idx` values.
    async fn read_records(&mut self) -> Result<Vec<JsonObject>>;

    /// Write the final, ordered result list.
    async fn write_results(&self, results: &[JsonObject]) -> Result<()>;

    /// Descriptive metadata about the source. Purely informational; the
    /// engine never depends on it.
    fn schema(&self) -> Value;
}

/// Pick an adapter for `input`, writing results to `output`.
pub fn for_paths(input: &str, output: &str) -> Result<Box<dyn DataAdapter>> {
    if input.starts_with("sqlite://") {
        return Ok(Box::new(SqliteAdapter::from_uri(input, output)?));
    }

    let extension = Path::new(input)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match extension.as_str() {
        "csv" => Ok(Box::new(CsvAdapter::new(input, output))),
        "json" => Ok(Box::new(JsonAdapter::new(input, output))),
        "jsonl" => Ok(Box::new(JsonlAdapter::new(input, output))),
        "txt" => Ok(Box::new(TextAdapter::new(input, output))),
        _ => bail!(
            "unsupported input format {input:?} \
             (expected .csv, .json, .jsonl, .txt, or a sqlite:// URI)"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_adapters_by_extension_and_scheme() {
        for input in ["data.csv", "data.json", "data.jsonl", "notes.txt"] {
            assert!(for_paths(input, "out.jsonl").is_ok(), "{input}");
        }
        assert!(for_paths("sqlite://db.sqlite?query=SELECT 1", "out.db").is_ok());
    }

    #[test]
    fn rejects_unknown_extensions() {
        let err = for_paths("data.parquet", "out.parquet").unwrap_err();
        assert!(err.to_string().contains("unsupported input format"));
    }
}
