//! JSON input: either an array of objects or a single object.

use tokio::fs;

use super::DataAdapter;
use crate::prelude::*;

#[derive(Debug)]
pub struct JsonAdapter {
    input_path: PathBuf,
    output_path: PathBuf,
    format: Option<&'static str>,
}

impl JsonAdapter {
    pub fn new(input_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
            format: None,
        }
    }
}

#[async_trait]
impl DataAdapter for JsonAdapter {
    async fn read_records(&mut self) -> Result<Vec<JsonObject>> {
        let contents = fs::read_to_string(&self.input_path)
            .await
            .with_context(|| format!("failed to read {:?}", self.input_path))?;
        let data: Value = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse JSON from {:?}", self.input_path))?;
        match data {
            Value::Array(items) => {
                self.format = Some("array");
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| match item {
                        Value::Object(record) => Ok(record),
                        other => Err(anyhow!(
                            "expected a JSON object at position {i} in {:?}, found {other}",
                            self.input_path
                        )),
                    })
                    .collect()
            }
            Value::Object(record) => {
                self.format = Some("object");
                Ok(vec![record])
            }
            other => bail!(
                "unsupported JSON input in {:?}: expected an array or object, found {other}",
                self.input_path
            ),
        }
    }

    async fn write_results(&self, results: &[JsonObject]) -> Result<()> {
        let array: Vec<Value> = results
            .iter()
            .map(|result| Value::Object(result.clone()))
            .collect();
        let contents = serde_json::to_string_pretty(&array)
            .context("failed to serialize JSON results")?;
        fs::write(&self.output_path, contents)
            .await
            .with_context(|| format!("failed to write {:?}", self.output_path))?;
        Ok(())
    }

    fn schema(&self) -> Value {
        json!({ "type": "json", "format": self.format })
    }
}
