//! The processing engine: drives records through the LLM client and the
//! post-processor under a concurrency bound.
//!
//! Per-record failures never escape as errors; they are folded into the
//! yielded result (`_error`, `parse_error`, ...) so one bad record cannot
//! halt the stream. Only two things end a run early: a template/record
//! mismatch (a caller bug) and a circuit-breaker trip.
//!
//! In concurrent mode results are yielded in completion order. Callers
//! restore input order from `_idx` via the results log.

use std::sync::Arc;

use clap::ValueEnum;
use futures::{StreamExt as _, stream};

use crate::{
    async_utils::BoxedStream,
    breaker::{CircuitBreaker, CircuitBreakerTripped},
    llm::{ChatClient, TokenUsage},
    postprocess,
    prelude::*,
    record::fields,
    template::PromptTemplate,
};

/// How records are scheduled.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum Mode {
    /// One record at a time, in input order.
    Sequential,

    /// Up to `concurrency` records in flight, yielded as they complete.
    #[default]
    Concurrent,
}

/// Engine configuration beyond the client and template.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub mode: Mode,
    /// Maximum in-flight LLM calls in concurrent mode.
    pub concurrency: usize,
    /// Run the JSON post-processor over model output.
    pub post_process: bool,
    /// Merge parsed keys into the record root (vs. nesting under `parsed`).
    pub merge_parsed: bool,
    /// Keep the raw model text in the `result` field.
    pub include_raw: bool,
    /// Extra LLM calls to make when the reply fails to parse as JSON.
    pub parse_retries: u64,
    /// Consecutive fatal failures before the breaker trips; 0 disables.
    pub breaker_threshold: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            concurrency: 10,
            post_process: true,
            merge_parsed: true,
            include_raw: false,
            parse_retries: 2,
            breaker_threshold: 5,
        }
    }
}

/// Engine for processing records with an LLM.
pub struct ProcessingEngine {
    state: Arc<EngineState>,
}

struct EngineState {
    client: Arc<dyn ChatClient>,
    template: PromptTemplate,
    options: EngineOptions,
    breaker: CircuitBreaker,
}

impl ProcessingEngine {
    pub fn new(
        client: Arc<dyn ChatClient>,
        template: PromptTemplate,
        options: EngineOptions,
    ) -> Self {
        let breaker = CircuitBreaker::new(options.breaker_threshold);
        Self {
            state: Arc::new(EngineState {
                client,
                template,
                options,
                breaker,
            }),
        }
    }

    /// A handle to the engine's breaker, so callers can inspect its status
    /// or `reset()` it and drive a fresh batch after a trip.
    pub fn breaker(&self) -> CircuitBreaker {
        self.state.breaker.clone()
    }

    /// Process `records`, yielding one result per record.
    ///
    /// The stream ends with an `Err` carrying [`CircuitBreakerTripped`]
    /// when too many consecutive fatal failures occur; dropping the stream
    /// at that point cancels any still-pending calls.
    pub fn process(&self, records: Vec<JsonObject>) -> BoxedStream<Result<JsonObject>> {
        let state = self.state.clone();
        let inner: BoxedStream<Result<JsonObject>> = match state.options.mode {
            Mode::Sequential => {
                let state = state.clone();
                stream::iter(records)
                    .then(move |record| process_record(state.clone(), record))
                    .boxed()
            }
            Mode::Concurrent => {
                let concurrency = state.options.concurrency.max(1);
                let state = state.clone();
                stream::iter(records)
                    .map(move |record| process_record(state.clone(), record))
                    .buffer_unordered(concurrency)
                    .boxed()
            }
        };
        guard_with_breaker(inner, self.state.breaker.clone())
    }
}

/// Wrap the result stream so the breaker is consulted between yields.
/// When it trips we emit the error and drop the inner stream, cancelling
/// everything still in flight.
fn guard_with_breaker(
    inner: BoxedStream<Result<JsonObject>>,
    breaker: CircuitBreaker,
) -> BoxedStream<Result<JsonObject>> {
    stream::unfold(Some(inner), move |state| {
        let breaker = breaker.clone();
        async move {
            let mut inner = state?;
            if breaker.is_tripped() {
                let tripped = CircuitBreakerTripped::new(breaker.status());
                warn!("{tripped}");
                return Some((Err(anyhow::Error::new(tripped)), None));
            }
            match inner.next().await {
                Some(item) => Some((item, Some(inner))),
                None => None,
            }
        }
    })
    .boxed()
}

/// Run one record through render → call → post-process, with parse
/// retries. Returns `Err` only for template/record mismatches.
#[instrument(level = "debug", skip_all, fields(idx = crate::record::index_of(&record)))]
async fn process_record(
    state: Arc<EngineState>,
    record: JsonObject,
) -> Result<JsonObject> {
    let prompt = state
        .template
        .render(&record)
        .context("error rendering prompt")?;

    let mut usage = TokenUsage::default();
    let mut attempts: u64 = 0;
    loop {
        attempts += 1;
        match state.client.complete(&prompt).await {
            Ok(completion) => {
                usage += completion.usage;
                let mut result = record.clone();
                result.insert(
                    fields::RESULT.to_owned(),
                    Value::String(completion.text),
                );
                if state.options.post_process {
                    postprocess::process_result(
                        &mut result,
                        state.options.merge_parsed,
                        state.options.include_raw,
                    );
                    if result.contains_key(fields::PARSE_ERROR) {
                        if attempts <= state.options.parse_retries {
                            debug!(attempts, "unparseable reply, retrying");
                            continue;
                        }
                        result.insert(
                            fields::RETRIES_EXHAUSTED.to_owned(),
                            Value::Bool(true),
                        );
                        result
                            .insert(fields::ATTEMPTS.to_owned(), Value::from(attempts));
                        result.insert(fields::USAGE.to_owned(), usage.to_value());
                        return Ok(result);
                    }
                }
                result.insert(fields::USAGE.to_owned(), usage.to_value());
                state.breaker.record_success();
                return Ok(result);
            }
            Err(err) => {
                if err.is_fatal() {
                    state.breaker.record_failure(&err, &record);
                } else {
                    debug!("transient failure surfaced for record: {err}");
                }
                let mut result = record.clone();
                result.insert(fields::ERROR.to_owned(), Value::String(err.to_string()));
                if !usage.is_zero() {
                    result.insert(fields::USAGE.to_owned(), usage.to_value());
                }
                return Ok(result);
            }
        }
    }
}
