//! The `process` subcommand: run a fresh batch job.

use std::sync::Arc;

use clap::Args;
use uuid::Uuid;

use super::DEFAULT_CHECKPOINT_DIR;
use crate::{
    adapters,
    breaker::CircuitBreakerTripped,
    config::{self, JobConfig},
    engine::{EngineOptions, Mode, ProcessingEngine},
    llm::{self, ClientOptions, OpenAiClient},
    prelude::*,
    progress::{JobMetadata, ProgressTracker},
    rate_limit::RateLimit,
    record::{assign_indices, index_of},
    resume, runner,
    runner::JobOutcome,
    template::PromptTemplate,
    ui::Ui,
    wal::IncrementalWriter,
};

/// Process command-line arguments.
#[derive(Debug, Args)]
pub struct ProcessOpts {
    /// Input file (.csv, .json, .jsonl, .txt) or sqlite:// URI.
    pub input: String,

    /// Output location, written in the input's format.
    pub output: String,

    /// Prompt template with {field} placeholders.
    #[clap(short = 'p', long)]
    pub prompt: Option<String>,

    /// Job configuration file, in TOML or JSON format.
    #[clap(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Model to use.
    #[clap(short = 'm', long)]
    pub model: Option<String>,

    /// API key for the LLM endpoint.
    #[clap(long)]
    pub api_key: Option<String>,

    /// Override the endpoint base URL.
    #[clap(long)]
    pub base_url: Option<String>,

    /// Replace the built-in JSON-only system prompt.
    #[clap(long)]
    pub system_prompt: Option<String>,

    /// Scheduling mode.
    #[clap(long, value_enum)]
    pub mode: Option<Mode>,

    /// Max number of in-flight LLM calls in concurrent mode.
    #[clap(short = 'b', long)]
    pub batch_size: Option<usize>,

    /// An upper limit on completion tokens per call.
    #[clap(long)]
    pub max_tokens: Option<u32>,

    /// Backoff re-attempts for transient endpoint failures.
    #[clap(long)]
    pub max_retries: Option<u8>,

    /// Sampling temperature, between 0.0 and 2.0.
    #[clap(long)]
    pub temperature: Option<f32>,

    /// A timeout, in seconds, for each LLM call.
    #[clap(long)]
    pub timeout: Option<u64>,

    /// A request rate limit of the form "10/s" or "600/m", applied on top
    /// of the concurrency bound.
    #[clap(long)]
    pub rate_limit: Option<RateLimit>,

    /// Keep raw model output instead of parsing it as JSON.
    #[clap(long)]
    pub no_post_process: bool,

    /// Nest parsed output under a "parsed" field instead of merging it
    /// into the record.
    #[clap(long)]
    pub no_merge: bool,

    /// Keep the raw model text alongside the parsed output.
    #[clap(long)]
    pub include_raw: bool,

    /// Extra LLM calls to make when a reply fails to parse as JSON.
    #[clap(long)]
    pub parse_retries: Option<u64>,

    /// Consecutive fatal failures before the job halts. 0 disables.
    #[clap(long)]
    pub fail_threshold: Option<u32>,

    /// Render the first K prompts and exit without calling the model.
    #[clap(long, value_name = "K")]
    pub preview: Option<usize>,

    /// In sequential mode, ask the operator how to proceed every N
    /// records.
    #[clap(long, value_name = "N")]
    pub checkin_interval: Option<u64>,

    /// Directory for checkpoints and results logs.
    #[clap(long, default_value = DEFAULT_CHECKPOINT_DIR)]
    pub checkpoint_dir: PathBuf,

    /// Job identifier; generated when not given.
    #[clap(long)]
    pub job_id: Option<String>,
}

/// Run the `process` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_process(ui: &Ui, opts: &ProcessOpts) -> Result<()> {
    let config = match &opts.config {
        Some(path) => config::load_job_config(path).await?,
        None => JobConfig::default(),
    };
    let prompt_text = opts
        .prompt
        .clone()
        .or_else(|| config.prompt.clone())
        .ok_or_else(|| anyhow!("a prompt is required: pass --prompt or --config"))?;
    let template = PromptTemplate::new(&prompt_text);

    // Read and enumerate the input.
    let mut adapter = adapters::for_paths(&opts.input, &opts.output)?;
    debug!(schema = %adapter.schema(), "input schema");
    let mut records = adapter.read_records().await?;
    if records.is_empty() {
        warn!("no records found in {}", opts.input);
        adapter.write_results(&[]).await?;
        return Ok(());
    }
    assign_indices(&mut records);
    info!("found {} records to process", records.len());

    // Preview mode: show rendered prompts, touch nothing else.
    if let Some(count) = opts.preview {
        for record in records.iter().take(count) {
            let rendered = template.render(record)?;
            println!("--- record {} ---", index_of(record).unwrap_or_default());
            println!("{rendered}");
            println!();
        }
        return Ok(());
    }

    // Fail fast when the template and the input schema disagree, before
    // any tokens are spent. Later records may still differ; the engine
    // surfaces those at render time.
    let missing: Vec<String> = template
        .fields()
        .into_iter()
        .filter(|field| !records[0].contains_key(field))
        .collect();
    if !missing.is_empty() {
        bail!(
            "template fields {missing:?} are not present in the input \
             (first record has: {:?})",
            records[0].keys().collect::<Vec<_>>()
        );
    }

    // Resolve settings: flags win over the config file, which wins over
    // defaults.
    let model = opts
        .model
        .clone()
        .or_else(|| std::env::var("PROMPT_BATCH_MODEL").ok())
        .or_else(|| config.llm.model.clone())
        .unwrap_or_else(|| llm::DEFAULT_MODEL.to_owned());
    let api_key = opts
        .api_key
        .clone()
        .or_else(|| config.llm.api_key.clone())
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());
    if api_key.is_none() {
        bail!("an API key is required: set OPENAI_API_KEY or pass --api-key");
    }
    let base_url = opts
        .base_url
        .clone()
        .or_else(|| config.llm.base_url.clone())
        .or_else(|| std::env::var("OPENAI_API_BASE").ok());
    let mode = opts.mode.or(config.processing.mode).unwrap_or_default();
    let batch_size = opts
        .batch_size
        .or(config.processing.batch_size)
        .unwrap_or(10);
    let max_tokens = opts
        .max_tokens
        .or(config.llm.max_tokens)
        .unwrap_or(llm::DEFAULT_MAX_TOKENS);
    let checkin_interval = opts
        .checkin_interval
        .or(config.processing.checkin_interval)
        .filter(|interval| *interval > 0);
    let no_post_process = opts.no_post_process || config.processing.no_post_process;
    let no_merge = opts.no_merge || config.processing.no_merge;
    let include_raw = opts.include_raw || config.processing.include_raw;

    let job_id = opts
        .job_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let input_sha256 = resume::hash_input(&opts.input).await?;

    let metadata = JobMetadata {
        input_file: opts.input.clone(),
        output_file: opts.output.clone(),
        prompt: prompt_text.clone(),
        model: model.clone(),
        mode,
        batch_size,
        max_tokens,
        no_post_process,
        no_merge,
        include_raw,
        checkin_interval,
        base_url: base_url.clone(),
        input_sha256,
    };
    let mut tracker = ProgressTracker::new(
        &job_id,
        records.len() as u64,
        &opts.checkpoint_dir,
        metadata,
    );
    // Persist immediately so the job is resumable from the first record.
    tracker.save().await?;
    let mut writer = IncrementalWriter::create(&job_id, &opts.checkpoint_dir).await?;

    let client = Arc::new(OpenAiClient::new(ClientOptions {
        model,
        api_key,
        base_url,
        system_prompt: opts
            .system_prompt
            .clone()
            .or_else(|| config.llm.system_prompt.clone()),
        temperature: opts
            .temperature
            .or(config.llm.temperature)
            .unwrap_or(llm::DEFAULT_TEMPERATURE),
        max_tokens,
        max_retries: opts
            .max_retries
            .or(config.llm.max_retries)
            .unwrap_or(llm::DEFAULT_MAX_RETRIES),
        timeout: opts.timeout.or(config.llm.timeout),
        rate_limit: opts.rate_limit.or(config.llm.rate_limit),
    })?);
    let engine = ProcessingEngine::new(
        client,
        template,
        EngineOptions {
            mode,
            concurrency: batch_size,
            post_process: !no_post_process,
            merge_parsed: !no_merge,
            include_raw,
            parse_retries: opts
                .parse_retries
                .or(config.processing.parse_retries)
                .unwrap_or(2),
            breaker_threshold: opts
                .fail_threshold
                .or(config.processing.fail_threshold)
                .unwrap_or(5),
        },
    );

    info!(%job_id, "starting job");
    // Check-ins only make sense when one record is in flight at a time.
    let checkin = matches!(mode, Mode::Sequential)
        .then_some(checkin_interval)
        .flatten();
    run_to_completion(
        ui,
        &engine,
        records,
        adapter.as_ref(),
        &mut writer,
        &mut tracker,
        checkin,
        &opts.output,
    )
    .await
}

/// Drive the engine and finish the job, shared with `resume`.
#[allow(clippy::too_many_arguments)]
pub(super) async fn run_to_completion(
    ui: &Ui,
    engine: &ProcessingEngine,
    records: Vec<JsonObject>,
    adapter: &dyn adapters::DataAdapter,
    writer: &mut IncrementalWriter,
    tracker: &mut ProgressTracker,
    checkin_interval: Option<u64>,
    output_file: &str,
) -> Result<()> {
    let job_id = tracker.job_id().to_owned();
    let outcome =
        runner::drive_job(ui, engine, records, writer, tracker, checkin_interval).await;
    match outcome {
        Ok(JobOutcome::Completed) => {
            let failures_dir = Path::new(output_file)
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."))
                .to_owned();
            let summary =
                runner::finalize_job(adapter, writer, tracker, &failures_dir).await?;
            runner::report_summary(&summary, output_file);
            Ok(())
        }
        Ok(JobOutcome::Paused) => {
            info!("job paused; resume with: prompt-batch resume {job_id}");
            Ok(())
        }
        Err(err) => {
            if let Some(tripped) = err.downcast_ref::<CircuitBreakerTripped>() {
                error!(
                    "{tripped}; inspect the failures, then resume with: \
                     prompt-batch resume {job_id}"
                );
            }
            Err(err)
        }
    }
}
