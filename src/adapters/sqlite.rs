//! Relational input via a SQLite query URI:
//! `sqlite://path/to.db?query=SELECT ...`.
//!
//! `rusqlite` is synchronous, so all database work runs on the blocking
//! thread pool.

use rusqlite::{Connection, params_from_iter, types::ValueRef};
use tokio::task;
use url::Url;

use super::DataAdapter;
use crate::{prelude::*, record::scalar_to_string};

const DEFAULT_QUERY: &str = "SELECT * FROM data";

#[derive(Debug)]
pub struct SqliteAdapter {
    db_path: PathBuf,
    query: String,
    output_path: PathBuf,
}

impl SqliteAdapter {
    /// Parse a `sqlite://` URI. The `query` parameter defaults to reading
    /// a table named `data`.
    pub fn from_uri(uri: &str, output_path: impl Into<PathBuf>) -> Result<Self> {
        let url = Url::parse(uri).with_context(|| format!("invalid URI {uri:?}"))?;
        if url.scheme() != "sqlite" {
            bail!("expected a sqlite:// URI, found {uri:?}");
        }
        // `sqlite://relative.db` parses the filename as the host;
        // `sqlite:///abs/path.db` puts everything in the path.
        let mut db_path = String::new();
        if let Some(host) = url.host_str() {
            db_path.push_str(host);
        }
        db_path.push_str(url.path());
        if db_path.is_empty() {
            bail!("no database path in {uri:?}");
        }
        let query = url
            .query_pairs()
            .find(|(key, _)| key == "query")
            .map(|(_, value)| value.into_owned())
            .unwrap_or_else(|| DEFAULT_QUERY.to_owned());
        Ok(Self {
            db_path: PathBuf::from(db_path),
            query,
            output_path: output_path.into(),
        })
    }
}

/// Convert one SQLite cell to JSON.
fn cell_to_value(cell: ValueRef<'_>) -> Value {
    match cell {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

#[async_trait]
impl DataAdapter for SqliteAdapter {
    async fn read_records(&mut self) -> Result<Vec<JsonObject>> {
        let db_path = self.db_path.clone();
        let query = self.query.clone();
        task::spawn_blocking(move || -> Result<Vec<JsonObject>> {
            let conn = Connection::open(&db_path)
                .with_context(|| format!("failed to open database {db_path:?}"))?;
            let mut stmt = conn
                .prepare(&query)
                .with_context(|| format!("failed to prepare query {query:?}"))?;
            let columns: Vec<String> =
                stmt.column_names().iter().map(|c| (*c).to_owned()).collect();
            let mut rows = stmt.query([])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                let mut record = JsonObject::new();
                for (i, column) in columns.iter().enumerate() {
                    record.insert(column.clone(), cell_to_value(row.get_ref(i)?));
                }
                records.push(record);
            }
            Ok(records)
        })
        .await
        .context("sqlite read task failed")?
    }

    /// Write results to a `results` table of TEXT columns in a fresh
    /// database at the output path.
    async fn write_results(&self, results: &[JsonObject]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        let output_path = self.output_path.clone();
        let results = results.to_vec();
        task::spawn_blocking(move || -> Result<()> {
            let conn = Connection::open(&output_path)
                .with_context(|| format!("failed to open database {output_path:?}"))?;
            let columns: Vec<String> = results[0].keys().cloned().collect();
            let column_defs: Vec<String> =
                columns.iter().map(|c| format!("\"{c}\" TEXT")).collect();
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS results ({})",
                    column_defs.join(", ")
                ),
                [],
            )?;
            let placeholders: Vec<String> =
                (1..=columns.len()).map(|i| format!("?{i}")).collect();
            let insert = format!(
                "INSERT INTO results VALUES ({})",
                placeholders.join(", ")
            );
            for result in &results {
                let values: Vec<String> = columns
                    .iter()
                    .map(|column| {
                        result.get(column).map(scalar_to_string).unwrap_or_default()
                    })
                    .collect();
                conn.execute(&insert, params_from_iter(values))?;
            }
            Ok(())
        })
        .await
        .context("sqlite write task failed")?
    }

    fn schema(&self) -> Value {
        json!({ "type": "sqlite", "query": self.query })
    }
}
