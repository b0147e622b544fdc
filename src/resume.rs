//! Rehydrate a checkpointed job and work out what is left to do.
//!
//! Resume correctness rests on `_idx` assignment being identical across
//! runs, which requires the input to be byte-for-byte what it was when the
//! checkpoint was written. We fingerprint the input at job start and
//! refuse to resume on a mismatch (the operator can override with
//! `--force` at their own risk).

use std::collections::BTreeSet;

use sha2::{Digest as _, Sha256};
use tokio::fs;

use crate::{
    prelude::*,
    progress::{JobMetadata, ProgressTracker},
    record::index_of,
    wal::IncrementalWriter,
};

/// A job loaded back from its checkpoint and results log.
pub struct ResumableJob {
    pub tracker: ProgressTracker,
    pub writer: IncrementalWriter,
}

/// Load the checkpoint and reopen the results log for `job_id`.
pub async fn load_job(checkpoint_dir: &Path, job_id: &str) -> Result<ResumableJob> {
    let tracker = ProgressTracker::load(checkpoint_dir, job_id).await?;
    let writer = IncrementalWriter::create(job_id, checkpoint_dir).await?;
    Ok(ResumableJob { tracker, writer })
}

/// SHA-256 of the input file, or `None` when the input is not a regular
/// file we can fingerprint (a `sqlite://` URI, for instance).
pub async fn hash_input(input: &str) -> Result<Option<String>> {
    let path = Path::new(input);
    if !path.is_file() {
        return Ok(None);
    }
    let contents = fs::read(path)
        .await
        .with_context(|| format!("failed to read {path:?} for fingerprinting"))?;
    let digest = Sha256::digest(&contents);
    Ok(Some(format!("{digest:x}")))
}

/// Refuse to resume when the input no longer matches the checkpoint's
/// fingerprint. Jobs whose input could not be fingerprinted pass through.
pub fn verify_input_unchanged(
    metadata: &JobMetadata,
    current_hash: Option<&str>,
) -> Result<()> {
    if let (Some(saved), Some(current)) = (&metadata.input_sha256, current_hash)
        && saved != current
    {
        bail!(
            "input file {:?} has changed since the checkpoint was written; \
             start a fresh `process` run, or pass --force to resume anyway",
            metadata.input_file
        );
    }
    Ok(())
}

/// Records whose `_idx` is not yet in the log: the normal resume set.
pub fn skip_completed(
    records: Vec<JsonObject>,
    completed: &BTreeSet<u64>,
) -> Vec<JsonObject> {
    records
        .into_iter()
        .filter(|record| !index_of(record).is_some_and(|idx| completed.contains(&idx)))
        .collect()
}

/// Records whose `_idx` is in the failed set: the `--retry-failures` set.
/// Fresh results append under the same `_idx`, and the log's latest-wins
/// read promotes them.
pub fn retain_failed(records: Vec<JsonObject>, failed: &BTreeSet<u64>) -> Vec<JsonObject> {
    records
        .into_iter()
        .filter(|record| index_of(record).is_some_and(|idx| failed.contains(&idx)))
        .collect()
}

#[cfg(test)]
mod tests {
    use futures::{StreamExt as _, TryStreamExt as _};

    use super::*;
    use crate::{
        engine::{EngineOptions, Mode, ProcessingEngine},
        llm::testing::FakeClient,
        record::assign_indices,
        template::PromptTemplate,
    };

    fn metadata_with_hash(hash: Option<&str>) -> JobMetadata {
        JobMetadata {
            input_file: "in.jsonl".to_owned(),
            output_file: "out.jsonl".to_owned(),
            prompt: "X {t}".to_owned(),
            model: "fake".to_owned(),
            mode: Mode::Concurrent,
            batch_size: 4,
            max_tokens: 100,
            no_post_process: false,
            no_merge: false,
            include_raw: false,
            checkin_interval: None,
            base_url: None,
            input_sha256: hash.map(str::to_owned),
        }
    }

    fn input_records(count: usize) -> Vec<JsonObject> {
        let mut records: Vec<JsonObject> = (0..count)
            .map(|i| json!({"t": format!("r{i}")}).as_object().unwrap().clone())
            .collect();
        assign_indices(&mut records);
        records
    }

    fn echo_engine(mode: Mode) -> ProcessingEngine {
        let client = FakeClient::new(|_, prompt| {
            let value = prompt.rsplit(' ').next().unwrap_or_default();
            Ok(FakeClient::completion(format!("{{\"r\": \"{value}\"}}")))
        });
        ProcessingEngine::new(
            client,
            PromptTemplate::new("X {t}"),
            EngineOptions {
                mode,
                concurrency: 4,
                ..EngineOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn killed_run_resumes_into_identical_output() {
        let dir = tempfile::tempdir().unwrap();
        let records = input_records(20);

        // First run dies after 7 results have reached the log.
        {
            let engine = echo_engine(Mode::Concurrent);
            let mut writer = IncrementalWriter::create("job_s4", dir.path())
                .await
                .unwrap();
            let mut stream = engine.process(records.clone());
            for _ in 0..7 {
                let result = stream.next().await.unwrap().unwrap();
                writer.write(&result).await.unwrap();
            }
            // Dropping the stream here abandons the in-flight remainder.
        }

        // Resume: skip what the log already has, process the rest.
        let job = load_job_for_test(dir.path(), "job_s4").await;
        let completed = job.writer.completed_indices().await.unwrap();
        assert_eq!(completed.len(), 7);

        let pending = skip_completed(records.clone(), &completed);
        assert_eq!(pending.len(), 13);

        let engine = echo_engine(Mode::Concurrent);
        let mut writer = job.writer;
        let results: Vec<JsonObject> = engine
            .process(pending)
            .try_collect()
            .await
            .unwrap();
        for result in &results {
            writer.write(result).await.unwrap();
        }

        // The assembled output covers every index exactly once, in order.
        let all = writer.read_all().await.unwrap();
        assert_eq!(all.len(), 20);
        let indices: Vec<u64> = all.iter().filter_map(index_of).collect();
        assert_eq!(indices, (0..20).collect::<Vec<u64>>());
        for result in &all {
            assert_eq!(
                result.get("r"),
                Some(&json!(format!("r{}", index_of(result).unwrap())))
            );
        }
    }

    /// Build a `ResumableJob` without a checkpoint file, for tests that
    /// only exercise the log.
    async fn load_job_for_test(dir: &Path, job_id: &str) -> ResumableJob {
        let tracker = ProgressTracker::new(job_id, 20, dir, metadata_with_hash(None));
        let writer = IncrementalWriter::create(job_id, dir).await.unwrap();
        ResumableJob { tracker, writer }
    }

    #[tokio::test]
    async fn retry_failures_promotes_fresh_results() {
        let dir = tempfile::tempdir().unwrap();
        let records = input_records(4);

        let mut writer = IncrementalWriter::create("job_retry", dir.path())
            .await
            .unwrap();
        for (idx, ok) in [(0u64, true), (1, false), (2, true), (3, false)] {
            let line = if ok {
                json!({"_idx": idx, "t": format!("r{idx}"), "r": "ok"})
            } else {
                json!({"_idx": idx, "t": format!("r{idx}"), "_error": "APIError: boom"})
            };
            writer.write(line.as_object().unwrap()).await.unwrap();
        }

        let failed = writer.failed_indices().await.unwrap();
        assert_eq!(failed, BTreeSet::from([1, 3]));

        let to_retry = retain_failed(records, &failed);
        assert_eq!(to_retry.len(), 2);

        let engine = echo_engine(Mode::Sequential);
        let results: Vec<JsonObject> =
            engine.process(to_retry).try_collect().await.unwrap();
        for result in &results {
            writer.write(result).await.unwrap();
        }

        assert!(writer.failed_indices().await.unwrap().is_empty());
        let all = writer.read_all().await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[1].get("r"), Some(&json!("r1")));
    }

    #[tokio::test]
    async fn checkpoint_round_trip_through_load_job() {
        let dir = tempfile::tempdir().unwrap();
        let tracker =
            ProgressTracker::new("job_load", 9, dir.path(), metadata_with_hash(Some("aa")));
        tracker.save().await.unwrap();

        let job = load_job(dir.path(), "job_load").await.unwrap();
        assert_eq!(job.tracker.total(), 9);
        assert_eq!(job.tracker.metadata().input_sha256.as_deref(), Some("aa"));

        assert!(load_job(dir.path(), "missing_job").await.is_err());
    }

    #[tokio::test]
    async fn changed_input_refuses_to_resume() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.jsonl");
        fs::write(&input, "{\"t\": \"a\"}\n").await.unwrap();

        let original = hash_input(input.to_str().unwrap()).await.unwrap();
        assert!(original.is_some());

        let metadata = metadata_with_hash(original.as_deref());
        verify_input_unchanged(&metadata, original.as_deref()).unwrap();

        fs::write(&input, "{\"t\": \"changed\"}\n").await.unwrap();
        let changed = hash_input(input.to_str().unwrap()).await.unwrap();
        assert!(verify_input_unchanged(&metadata, changed.as_deref()).is_err());

        // Unfingerprintable inputs (and legacy checkpoints) pass through.
        verify_input_unchanged(&metadata, None).unwrap();
        verify_input_unchanged(&metadata_with_hash(None), changed.as_deref()).unwrap();
    }
}
