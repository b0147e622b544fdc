//! The `resume` subcommand: pick up a checkpointed job where it stopped.

use std::sync::Arc;

use clap::Args;

use super::DEFAULT_CHECKPOINT_DIR;
use crate::{
    adapters,
    engine::{EngineOptions, Mode, ProcessingEngine},
    llm::{self, ClientOptions, OpenAiClient},
    prelude::*,
    record::assign_indices,
    resume::{self, ResumableJob},
    template::PromptTemplate,
    ui::Ui,
};

/// Resume command-line arguments.
#[derive(Debug, Args)]
pub struct ResumeOpts {
    /// Identifier of the checkpointed job.
    pub job_id: String,

    /// API key for the LLM endpoint; not stored in checkpoints.
    #[clap(long)]
    pub api_key: Option<String>,

    /// Override the check-in interval recorded at job start.
    #[clap(long, value_name = "N")]
    pub checkin_interval: Option<u64>,

    /// Directory holding the job's checkpoint and results log.
    #[clap(long, default_value = DEFAULT_CHECKPOINT_DIR)]
    pub checkpoint_dir: PathBuf,

    /// Re-run the records that failed instead of the ones never attempted.
    #[clap(long)]
    pub retry_failures: bool,

    /// Resume even when the input file no longer matches its fingerprint.
    #[clap(long)]
    pub force: bool,
}

/// Run the `resume` subcommand.
#[instrument(level = "debug", skip_all, fields(job_id = %opts.job_id))]
pub async fn cmd_resume(ui: &Ui, opts: &ResumeOpts) -> Result<()> {
    let ResumableJob {
        mut tracker,
        mut writer,
    } = resume::load_job(&opts.checkpoint_dir, &opts.job_id).await?;
    let metadata = tracker.metadata().clone();
    info!(
        "resuming job {} ({} -> {})",
        opts.job_id, metadata.input_file, metadata.output_file
    );

    let current_hash = resume::hash_input(&metadata.input_file).await?;
    if opts.force {
        if resume::verify_input_unchanged(&metadata, current_hash.as_deref()).is_err() {
            warn!("input file changed since checkpoint; continuing because of --force");
        }
    } else {
        resume::verify_input_unchanged(&metadata, current_hash.as_deref())?;
    }

    // Re-enumerate the input exactly as the original run did.
    let mut adapter = adapters::for_paths(&metadata.input_file, &metadata.output_file)?;
    let mut records = adapter.read_records().await?;
    assign_indices(&mut records);

    let pending = if opts.retry_failures {
        let failed = writer.failed_indices().await?;
        resume::retain_failed(records, &failed)
    } else {
        let completed = writer.completed_indices().await?;
        resume::skip_completed(records, &completed)
    };
    info!(
        "{} of {} records left to process",
        pending.len(),
        tracker.total()
    );

    // The results log is the source of truth for the counters.
    let terminal = writer.read_all().await?.len() as u64;
    let failed = writer.failures().await?.len() as u64;
    tracker.set_counts(terminal, failed);

    let client = Arc::new(OpenAiClient::new(ClientOptions {
        model: metadata.model.clone(),
        api_key: opts.api_key.clone(),
        base_url: metadata.base_url.clone(),
        system_prompt: None,
        temperature: llm::DEFAULT_TEMPERATURE,
        max_tokens: metadata.max_tokens,
        max_retries: llm::DEFAULT_MAX_RETRIES,
        timeout: None,
        rate_limit: None,
    })?);
    let engine = ProcessingEngine::new(
        client,
        PromptTemplate::new(&metadata.prompt),
        EngineOptions {
            mode: metadata.mode,
            concurrency: metadata.batch_size,
            post_process: !metadata.no_post_process,
            merge_parsed: !metadata.no_merge,
            include_raw: metadata.include_raw,
            parse_retries: 2,
            breaker_threshold: 5,
        },
    );

    let checkin = matches!(metadata.mode, Mode::Sequential)
        .then(|| opts.checkin_interval.or(metadata.checkin_interval))
        .flatten()
        .filter(|interval| *interval > 0);
    super::process::run_to_completion(
        ui,
        &engine,
        pending,
        adapter.as_ref(),
        &mut writer,
        &mut tracker,
        checkin,
        &metadata.output_file,
    )
    .await
}
