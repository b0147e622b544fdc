//! Plain-text input, one record per line.

use tokio::fs;

use super::DataAdapter;
use crate::{prelude::*, record::scalar_to_string};

#[derive(Debug)]
pub struct TextAdapter {
    input_path: PathBuf,
    output_path: PathBuf,
}

impl TextAdapter {
    pub fn new(input_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
        }
    }
}

#[async_trait]
impl DataAdapter for TextAdapter {
    async fn read_records(&mut self) -> Result<Vec<JsonObject>> {
        let contents = fs::read_to_string(&self.input_path)
            .await
            .with_context(|| format!("failed to read {:?}", self.input_path))?;
        Ok(contents
            .lines()
            .enumerate()
            .map(|(i, line)| {
                let mut record = JsonObject::new();
                record.insert("line_number".to_owned(), Value::from(i as u64 + 1));
                record.insert("content".to_owned(), Value::String(line.to_owned()));
                record
            })
            .collect())
    }

    /// One output line per result: the model's `result` text when present,
    /// otherwise the original content.
    async fn write_results(&self, results: &[JsonObject]) -> Result<()> {
        let mut contents = String::new();
        for result in results {
            let line = result
                .get("result")
                .or_else(|| result.get("content"))
                .map(scalar_to_string)
                .unwrap_or_default();
            contents.push_str(&line);
            contents.push('\n');
        }
        fs::write(&self.output_path, contents)
            .await
            .with_context(|| format!("failed to write {:?}", self.output_path))?;
        Ok(())
    }

    fn schema(&self) -> Value {
        json!({ "type": "text" })
    }
}
