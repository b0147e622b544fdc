//! Line-delimited JSON input and output.

use tokio::fs;

use super::DataAdapter;
use crate::prelude::*;

#[derive(Debug)]
pub struct JsonlAdapter {
    input_path: PathBuf,
    output_path: PathBuf,
}

impl JsonlAdapter {
    pub fn new(input_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
        }
    }
}

#[async_trait]
impl DataAdapter for JsonlAdapter {
    async fn read_records(&mut self) -> Result<Vec<JsonObject>> {
        let contents = fs::read_to_string(&self.input_path)
            .await
            .with_context(|| format!("failed to read {:?}", self.input_path))?;
        let mut records = Vec::new();
        for (line_number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: JsonObject = serde_json::from_str(line).with_context(|| {
                format!(
                    "failed to parse JSON on line {} of {:?}",
                    line_number + 1,
                    self.input_path
                )
            })?;
            records.push(record);
        }
        Ok(records)
    }

    async fn write_results(&self, results: &[JsonObject]) -> Result<()> {
        let mut contents = String::new();
        for result in results {
            contents.push_str(
                &serde_json::to_string(result).context("failed to serialize result")?,
            );
            contents.push('\n');
        }
        fs::write(&self.output_path, contents)
            .await
            .with_context(|| format!("failed to write {:?}", self.output_path))?;
        Ok(())
    }

    fn schema(&self) -> Value {
        json!({ "type": "jsonl" })
    }
}
