//! Delimited (CSV) input and output.
//!
//! Input cells arrive as strings, which matches how templates consume
//! them. On output we keep the original columns first and append any new
//! fields the model extracted, in order of first appearance.

use csv_async::{AsyncReaderBuilder, AsyncWriterBuilder};
use futures::StreamExt as _;
use tokio::fs::File;

use super::DataAdapter;
use crate::{prelude::*, record::scalar_to_string};

#[derive(Debug)]
pub struct CsvAdapter {
    input_path: PathBuf,
    output_path: PathBuf,
    columns: Vec<String>,
}

impl CsvAdapter {
    pub fn new(input_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
            columns: Vec::new(),
        }
    }

    /// The output header: every input column, then every new result field
    /// in order of first appearance.
    fn output_columns(&self, results: &[JsonObject]) -> Vec<String> {
        let mut columns = self.columns.clone();
        for result in results {
            for key in result.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        columns
    }
}

#[async_trait]
impl DataAdapter for CsvAdapter {
    async fn read_records(&mut self) -> Result<Vec<JsonObject>> {
        let file = File::open(&self.input_path)
            .await
            .with_context(|| format!("failed to open {:?}", self.input_path))?;
        let mut reader = AsyncReaderBuilder::new().create_reader(file);
        let headers = reader
            .headers()
            .await
            .with_context(|| format!("failed to read CSV headers from {:?}", self.input_path))?
            .clone();
        self.columns = headers.iter().map(str::to_owned).collect();

        let mut records = Vec::new();
        let mut rows = reader.into_records();
        while let Some(row) = rows.next().await {
            let row = row.with_context(|| {
                format!("failed to read CSV record from {:?}", self.input_path)
            })?;
            let record: JsonObject = headers
                .iter()
                .zip(row.iter())
                .map(|(header, value)| {
                    (header.to_owned(), Value::String(value.to_owned()))
                })
                .collect();
            records.push(record);
        }
        Ok(records)
    }

    async fn write_results(&self, results: &[JsonObject]) -> Result<()> {
        let file = File::create(&self.output_path)
            .await
            .with_context(|| format!("failed to create {:?}", self.output_path))?;
        let mut writer = AsyncWriterBuilder::new().create_writer(file);

        let columns = self.output_columns(results);
        writer
            .write_record(&columns)
            .await
            .context("failed to write CSV header")?;
        for result in results {
            let row: Vec<String> = columns
                .iter()
                .map(|column| {
                    result
                        .get(column)
                        .map(scalar_to_string)
                        .unwrap_or_default()
                })
                .collect();
            writer
                .write_record(&row)
                .await
                .context("failed to write CSV record")?;
        }
        writer.flush().await.context("failed to flush CSV output")?;
        Ok(())
    }

    fn schema(&self) -> Value {
        json!({ "type": "csv", "columns": self.columns })
    }
}
