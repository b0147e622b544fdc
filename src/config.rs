//! Job configuration files for `--config`, in TOML or JSON.
//!
//! Everything here is optional; explicit command-line flags win over the
//! file, and the file wins over built-in defaults.

use tokio::fs;

use crate::{engine::Mode, prelude::*, rate_limit::RateLimit};

/// The `--config` file shape.
#[derive(Debug, Default, Deserialize)]
pub struct JobConfig {
    /// Prompt template with `{field}` placeholders.
    pub prompt: Option<String>,

    #[serde(default)]
    pub llm: LlmSection,

    #[serde(default)]
    pub processing: ProcessingSection,
}

/// LLM client settings.
#[derive(Debug, Default, Deserialize)]
pub struct LlmSection {
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub max_retries: Option<u8>,
    pub timeout: Option<u64>,
    pub rate_limit: Option<RateLimit>,
}

/// Engine settings.
#[derive(Debug, Default, Deserialize)]
pub struct ProcessingSection {
    pub mode: Option<Mode>,
    pub batch_size: Option<usize>,
    pub parse_retries: Option<u64>,
    pub fail_threshold: Option<u32>,
    pub checkin_interval: Option<u64>,
    #[serde(default)]
    pub no_post_process: bool,
    #[serde(default)]
    pub no_merge: bool,
    #[serde(default)]
    pub include_raw: bool,
}

/// Load a config file, choosing the parser by extension (`.json` is JSON,
/// anything else is TOML).
pub async fn load_job_config(path: &Path) -> Result<JobConfig> {
    let contents = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read config file {path:?}"))?;
    if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse JSON config {path:?}"))
    } else {
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML config {path:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_a_toml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.toml");
        fs::write(
            &path,
            r#"
prompt = "Summarize {text}"

[llm]
model = "gpt-4o"
max_tokens = 800
rate_limit = "10/s"

[processing]
mode = "sequential"
batch_size = 4
no_merge = true
"#,
        )
        .await
        .unwrap();

        let config = load_job_config(&path).await.unwrap();
        assert_eq!(config.prompt.as_deref(), Some("Summarize {text}"));
        assert_eq!(config.llm.model.as_deref(), Some("gpt-4o"));
        assert_eq!(config.llm.max_tokens, Some(800));
        assert_eq!(config.llm.rate_limit.unwrap().max_requests, 10);
        assert_eq!(config.processing.mode, Some(Mode::Sequential));
        assert_eq!(config.processing.batch_size, Some(4));
        assert!(config.processing.no_merge);
        assert!(!config.processing.no_post_process);
    }

    #[tokio::test]
    async fn parses_a_json_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        fs::write(
            &path,
            r#"{"prompt": "X {t}", "processing": {"mode": "concurrent"}}"#,
        )
        .await
        .unwrap();

        let config = load_job_config(&path).await.unwrap();
        assert_eq!(config.prompt.as_deref(), Some("X {t}"));
        assert_eq!(config.processing.mode, Some(Mode::Concurrent));
    }
}
