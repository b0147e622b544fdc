use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use prompt_batch::{cmd, prelude::*, ui::Ui};

/// Run batch LLM prompts over tabular data, with checkpoints and resume.
#[derive(Debug, Parser)]
#[clap(
    version,
    after_help = r#"
Environment Variables:
  - OPENAI_API_KEY: API key for the LLM endpoint.
  - OPENAI_API_BASE (optional): Override the endpoint URL.
  - PROMPT_BATCH_MODEL (optional): Default model to use.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Process an input file through an LLM prompt.
    Process(cmd::process::ProcessOpts),
    /// Resume a checkpointed job.
    Resume(cmd::resume::ResumeOpts),
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::new();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();
    let subscriber = tracing_subscriber::fmt::layer()
        .with_writer(ui.stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Process(opts) => cmd::process::cmd_process(&ui, opts).await?,
        Cmd::Resume(opts) => cmd::resume::cmd_resume(&ui, opts).await?,
    }
    Ok(())
}
