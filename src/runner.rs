//! Drives a job: engine stream in, results log and tracker out.
//!
//! This is the loop shared by `process` and `resume`. Every result is
//! appended to the log before the counters move, so the log is always at
//! least as current as the checkpoint.

use futures::StreamExt as _;
use tokio::io::{AsyncBufReadExt as _, BufReader};

use crate::{
    adapters::DataAdapter,
    engine::ProcessingEngine,
    prelude::*,
    progress::ProgressTracker,
    record,
    ui::Ui,
    wal::IncrementalWriter,
};

/// How a drive loop ended.
#[derive(Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Every record reached a terminal result.
    Completed,

    /// The operator chose to pause at a check-in. The log and checkpoint
    /// stay on disk; the final output is not written.
    Paused,
}

/// What the operator chose at a check-in prompt.
enum CheckinChoice {
    Continue,
    Pause,
    DisablePrompts,
}

/// Pull results from the engine, append each to the log, and keep the
/// tracker current. With a check-in interval, pause every N records to ask
/// the operator how to proceed.
///
/// A circuit-breaker trip (or any other stream error) saves the checkpoint
/// and propagates; everything already emitted is safe in the log.
pub async fn drive_job(
    ui: &Ui,
    engine: &ProcessingEngine,
    records: Vec<JsonObject>,
    writer: &mut IncrementalWriter,
    tracker: &mut ProgressTracker,
    checkin_interval: Option<u64>,
) -> Result<JobOutcome> {
    let bar = ui.record_bar("Processing records", records.len() as u64);
    let mut stream = engine.process(records);

    let interval = checkin_interval.unwrap_or(0);
    let mut prompts_enabled = interval > 0;
    let mut since_checkin = 0u64;

    while let Some(item) = stream.next().await {
        match item {
            Ok(result) => {
                writer.write(&result).await?;
                if record::is_failure(&result) {
                    tracker.increment_failed();
                }
                tracker.update(1).await?;
                bar.inc(1);

                since_checkin += 1;
                if prompts_enabled && since_checkin >= interval {
                    since_checkin = 0;
                    match ask_operator(ui, tracker.processed(), tracker.total()).await? {
                        CheckinChoice::Continue => {}
                        CheckinChoice::DisablePrompts => prompts_enabled = false,
                        CheckinChoice::Pause => {
                            tracker.save().await?;
                            bar.abandon_with_message("Paused");
                            return Ok(JobOutcome::Paused);
                        }
                    }
                }
            }
            Err(err) => {
                tracker.save().await?;
                bar.abandon_with_message("Stopped");
                return Err(err);
            }
        }
    }

    tracker.save().await?;
    bar.finish_with_message("Processed records");
    Ok(JobOutcome::Completed)
}

/// Ask the operator whether to keep going.
async fn ask_operator(ui: &Ui, processed: u64, total: u64) -> Result<CheckinChoice> {
    ui.suspend(|| {
        eprint!(
            "Processed {processed}/{total} records. \
             [c]ontinue, [p]ause, [d]on't ask again: "
        );
    });
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("failed to read check-in response")?;
    Ok(match line.trim().chars().next() {
        Some('p') | Some('P') => CheckinChoice::Pause,
        Some('d') | Some('D') => CheckinChoice::DisablePrompts,
        _ => CheckinChoice::Continue,
    })
}

/// Final counts reported after a completed job.
#[derive(Debug)]
pub struct JobSummary {
    /// Terminal results written to the output.
    pub total: u64,
    /// Results whose latest attempt failed.
    pub failed: u64,
    /// The subset of failures caused by unparseable model output.
    pub parse_failed: u64,
    /// Where the failures log was written, if there were any.
    pub failures_path: Option<PathBuf>,
}

/// Assemble the final output from the results log, emit the failures file,
/// and clean up the job's working state.
pub async fn finalize_job(
    adapter: &dyn DataAdapter,
    writer: &IncrementalWriter,
    tracker: &ProgressTracker,
    failures_dir: &Path,
) -> Result<JobSummary> {
    let results = writer.read_all().await?;
    adapter
        .write_results(&results)
        .await
        .context("failed to write final output")?;

    let failures = writer.failures().await?;
    let parse_failed = failures
        .iter()
        .filter(|f| record::is_parse_failure(f))
        .count() as u64;
    let failures_path = writer.write_failures_file(failures_dir).await?;

    // The job is no longer resumable once the output exists.
    writer.remove().await?;
    tracker.remove().await?;

    Ok(JobSummary {
        total: results.len() as u64,
        failed: failures.len() as u64,
        parse_failed,
        failures_path,
    })
}

/// Report the summary to the operator.
pub fn report_summary(summary: &JobSummary, output_file: &str) {
    info!(
        "wrote {} results to {} ({} failed, {} of those parse failures)",
        summary.total, output_file, summary.failed, summary.parse_failed
    );
    if let Some(path) = &summary.failures_path {
        info!("failures written to {} for review", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapters,
        engine::{EngineOptions, Mode, ProcessingEngine},
        llm::testing::FakeClient,
        progress::JobMetadata,
        record::assign_indices,
        template::PromptTemplate,
    };

    fn metadata(input: &str, output: &str) -> JobMetadata {
        JobMetadata {
            input_file: input.to_owned(),
            output_file: output.to_owned(),
            prompt: "X {t}".to_owned(),
            model: "fake".to_owned(),
            mode: Mode::Sequential,
            batch_size: 2,
            max_tokens: 100,
            no_post_process: false,
            no_merge: false,
            include_raw: false,
            checkin_interval: None,
            base_url: None,
            input_sha256: None,
        }
    }

    #[tokio::test]
    async fn drive_and_finalize_produce_ordered_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.jsonl");
        let output = dir.path().join("out.jsonl");
        tokio::fs::write(&input, "{\"t\": \"a\"}\n{\"t\": \"boom\"}\n{\"t\": \"c\"}\n")
            .await
            .unwrap();

        let mut adapter = adapters::for_paths(
            input.to_str().unwrap(),
            output.to_str().unwrap(),
        )
        .unwrap();
        let mut records = adapter.read_records().await.unwrap();
        assign_indices(&mut records);

        let client = FakeClient::new(|_, prompt| {
            if prompt.contains("boom") {
                Err(FakeClient::transient_error())
            } else {
                Ok(FakeClient::completion("{\"r\": \"ok\"}"))
            }
        });
        let engine = ProcessingEngine::new(
            client,
            PromptTemplate::new("X {t}"),
            EngineOptions {
                mode: Mode::Sequential,
                ..EngineOptions::default()
            },
        );

        let ui = Ui::hidden();
        let mut writer = IncrementalWriter::create("runner_job", dir.path())
            .await
            .unwrap();
        let mut tracker = ProgressTracker::new(
            "runner_job",
            records.len() as u64,
            dir.path(),
            metadata(input.to_str().unwrap(), output.to_str().unwrap()),
        );

        let outcome =
            drive_job(&ui, &engine, records, &mut writer, &mut tracker, None)
                .await
                .unwrap();
        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(tracker.processed(), 3);
        assert_eq!(tracker.failed(), 1);

        let summary = finalize_job(adapter.as_ref(), &writer, &tracker, dir.path())
            .await
            .unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.parse_failed, 0);
        assert!(summary.failures_path.is_some());

        // Output is ordered by _idx with one line per record.
        let written = tokio::fs::read_to_string(&output).await.unwrap();
        let indices: Vec<u64> = written
            .lines()
            .map(|line| {
                serde_json::from_str::<JsonObject>(line)
                    .unwrap()
                    .get("_idx")
                    .and_then(Value::as_u64)
                    .unwrap()
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);

        // Working state is cleaned up: only the paused/tripped path keeps it.
        assert!(!writer.path().exists());
        assert!(!tracker.path().exists());
    }

    #[tokio::test]
    async fn breaker_trip_saves_the_checkpoint_and_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let client = FakeClient::new(|_, _| Err(FakeClient::fatal_error()));
        let engine = ProcessingEngine::new(
            client,
            PromptTemplate::new("X {t}"),
            EngineOptions {
                mode: Mode::Sequential,
                breaker_threshold: 2,
                ..EngineOptions::default()
            },
        );

        let mut records: Vec<JsonObject> = (0..5)
            .map(|i| {
                json!({"t": format!("r{i}")})
                    .as_object()
                    .unwrap()
                    .clone()
            })
            .collect();
        assign_indices(&mut records);

        let ui = Ui::hidden();
        let mut writer = IncrementalWriter::create("trip_job", dir.path())
            .await
            .unwrap();
        let mut tracker = ProgressTracker::new(
            "trip_job",
            5,
            dir.path(),
            metadata("in.jsonl", "out.jsonl"),
        );

        let err = drive_job(&ui, &engine, records, &mut writer, &mut tracker, None)
            .await
            .unwrap_err();
        assert!(
            err.downcast_ref::<crate::breaker::CircuitBreakerTripped>()
                .is_some()
        );
        // Checkpoint saved on the way out; results so far are in the log.
        assert!(tracker.path().exists());
        assert_eq!(writer.completed_indices().await.unwrap().len(), 2);
    }
}
