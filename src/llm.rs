//! Chat-completion clients for OpenAI-compatible endpoints.
//!
//! The engine only sees the [`ChatClient`] trait, so tests can substitute a
//! scripted client. The real implementation wraps [`async_openai`] with the
//! retry policy from [`crate::retry`]: transient failures back off
//! exponentially, fatal ones surface immediately.

use std::{error, fmt, ops::AddAssign, time::Duration};

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
};
use futures::{FutureExt as _, TryFutureExt as _};
use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};
use leaky_bucket::RateLimiter;
use tokio::time;

use crate::{
    prelude::*,
    rate_limit::RateLimit,
    retry::{CallError, ErrorKind, IntoRetryResult as _, retry_fatal, retry_ok, try_retry},
};

/// Model used when neither the CLI nor the environment names one.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Default completion-token ceiling.
pub const DEFAULT_MAX_TOKENS: u32 = 1500;

/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Default number of backoff re-attempts for transient failures.
pub const DEFAULT_MAX_RETRIES: u8 = 3;

/// The system prompt sent before every user prompt unless the operator
/// supplies their own. Downstream parsing depends on the model actually
/// returning bare JSON.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a data processing assistant. Your task is to process the input and \
return ONLY valid JSON output.

CRITICAL RULES:
1. Return ONLY valid JSON - no markdown, no explanations, no extra text
2. Do NOT wrap the response in ```json``` code blocks
3. Do NOT include any text before or after the JSON
4. The JSON must be parseable by a machine

If the task asks for multiple values, return them as a JSON object with \
descriptive keys.";

/// Token usage for one record, accumulated across retries.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Was our token usage zero?
    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }

    /// The JSON shape stored under `_usage`.
    pub fn to_value(self) -> Value {
        json!({
            "input_tokens": self.input_tokens,
            "output_tokens": self.output_tokens,
        })
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// One successful chat completion.
#[derive(Clone, Debug)]
pub struct Completion {
    /// The model's reply text.
    pub text: String,

    /// Token usage reported by the endpoint, or zero if it reported none.
    pub usage: TokenUsage,
}

/// A terminal client error, after the retry layer has done its work.
#[derive(Clone, Debug)]
pub enum LlmError {
    /// Never retried: credentials, permissions, malformed requests. These
    /// count toward the circuit breaker.
    Fatal {
        kind: &'static str,
        message: String,
    },

    /// Retried with backoff until the budget ran out. Reported per record,
    /// but does not trip the breaker.
    Transient {
        kind: &'static str,
        message: String,
    },
}

impl LlmError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, LlmError::Fatal { .. })
    }

    fn fatal(error: CallError) -> Self {
        LlmError::Fatal {
            kind: error.kind.name(),
            message: error.message,
        }
    }

    fn exhausted(error: CallError, retries: usize) -> Self {
        LlmError::Transient {
            kind: error.kind.name(),
            message: format!("{} ({retries} retries exhausted)", error.message),
        }
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Fatal { kind, message }
            | LlmError::Transient { kind, message } => {
                write!(f, "{kind}: {message}")
            }
        }
    }
}

impl error::Error for LlmError {}

/// The LLM seam the engine is written against.
#[async_trait]
pub trait ChatClient: Send + Sync + 'static {
    /// Send one prompt and return the reply text plus token usage.
    /// Transient-failure retries happen inside this call.
    async fn complete(&self, prompt: &str) -> Result<Completion, LlmError>;
}

/// Everything needed to construct an [`OpenAiClient`].
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_retries: u8,
    pub timeout: Option<u64>,
    pub rate_limit: Option<RateLimit>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_owned(),
            api_key: None,
            base_url: None,
            system_prompt: None,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: None,
            rate_limit: None,
        }
    }
}

/// Client for OpenAI-compatible APIs (also LiteLLM, Ollama and similar
/// gateways).
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    options: ClientOptions,
    system_prompt: String,
    limiter: Option<RateLimiter>,
}

impl OpenAiClient {
    /// Create a client. Credentials and base URL fall back to the
    /// `OPENAI_API_KEY` / `OPENAI_API_BASE` environment variables.
    pub fn new(options: ClientOptions) -> Result<Self> {
        let mut client_config = OpenAIConfig::new();
        if let Some(api_key) = options
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        {
            client_config = client_config.with_api_key(api_key);
        }
        if let Some(api_base) = options
            .base_url
            .clone()
            .or_else(|| std::env::var("OPENAI_API_BASE").ok())
        {
            client_config = client_config.with_api_base(api_base);
        }
        let system_prompt = options
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_owned());
        let limiter = options.rate_limit.as_ref().map(RateLimit::to_rate_limiter);
        Ok(Self {
            client: Client::with_config(client_config),
            options,
            system_prompt,
            limiter,
        })
    }

    /// One call attempt, classified for the retry layer.
    #[instrument(level = "trace", skip_all)]
    async fn attempt(&self, prompt: &str) -> RetryResult<(), (), Completion, CallError> {
        let build_err =
            |err: async_openai::error::OpenAIError| CallError::from_openai(err);
        let system = try_retry!(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(self.system_prompt.clone())
                .build()
                .map_err(build_err)
                .into_fatal()
        );
        let user = try_retry!(
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()
                .map_err(build_err)
                .into_fatal()
        );
        let request = try_retry!(
            CreateChatCompletionRequestArgs::default()
                .model(self.options.model.clone())
                .messages(vec![system.into(), user.into()])
                .temperature(self.options.temperature)
                .max_completion_tokens(self.options.max_tokens)
                .build()
                .map_err(build_err)
                .into_fatal()
        );
        trace!(?request, "Chat request");

        let chat = self.client.chat();
        let mut chat_future = chat
            .create(request)
            .map_err(CallError::from_openai)
            .boxed();
        if let Some(timeout) = self.options.timeout {
            // Merge the `Result<Result<_, CallError>, Elapsed>` from the
            // timeout wrapper into a single level.
            chat_future = time::timeout(Duration::from_secs(timeout), chat_future)
                .map(move |result| match result {
                    Ok(inner) => inner,
                    Err(_) => Err(CallError::timeout(timeout)),
                })
                .boxed();
        }
        let response = try_retry!(chat_future.await.into_classified());

        let usage = response
            .usage
            .map(|usage| TokenUsage {
                input_tokens: u64::from(usage.prompt_tokens),
                output_tokens: u64::from(usage.completion_tokens),
            })
            .unwrap_or_default();

        let Some(choice) = response.choices.into_iter().next() else {
            return retry_fatal(
                ErrorKind::InvalidRequest,
                "no choices in chat completion response",
            );
        };
        let text = choice.message.content.unwrap_or_default();
        retry_ok(Completion { text, usage })
    }
}

#[async_trait]
impl ChatClient for OpenAiClient {
    #[instrument(level = "debug", skip_all)]
    async fn complete(&self, prompt: &str) -> Result<Completion, LlmError> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire_one().await;
        }

        // Back off exponentially from 1s towards 60s on transient failures,
        // with jitter so parallel workers don't stampede.
        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 1_000..=60_000,
            re_attempts: self.options.max_retries,
            jitter_ratio: 0.085,
        };

        let resolved = self
            .attempt(prompt)
            .await
            .retry_with_async(|_| self.attempt(prompt))
            .with_exponential_jitter(|| jitter)
            .await;

        match resolved {
            ResolvedResult::Ok { output, .. } => Ok(output),
            ResolvedResult::Recovered {
                output,
                retry_errors,
                ..
            } => {
                warn!(
                    "succeeded after {} retries (failed attempts: [{}])",
                    retry_errors.len(),
                    keen_retry::loggable_retry_errors(&retry_errors),
                );
                Ok(output)
            }
            ResolvedResult::Fatal { error, .. } => {
                error!("LLM call failed fatally: {error}");
                Err(LlmError::fatal(error))
            }
            ResolvedResult::Unrecoverable { fatal_error, .. } => {
                error!("LLM call failed fatally while retrying: {fatal_error}");
                Err(LlmError::fatal(fatal_error))
            }
            ResolvedResult::GivenUp {
                retry_errors,
                fatal_error,
                ..
            } => {
                error!(
                    "LLM call gave up after {} retries: {fatal_error}",
                    retry_errors.len(),
                );
                Err(LlmError::exhausted(fatal_error, retry_errors.len()))
            }
        }
    }
}
