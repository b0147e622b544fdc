//! The per-job write-ahead log of results.
//!
//! Every result is appended to `<dir>/.results_<job_id>.jsonl` and flushed
//! before we report it written, so a crash loses at most the record being
//! written at that instant. The log is append-only: retries for an index
//! append a fresh line, and the latest line per `_idx` wins on read. Lines
//! that fail to parse are torn writes from a crash and are skipped.

use std::collections::{BTreeMap, BTreeSet};

use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt as _,
};

use crate::{
    prelude::*,
    record::{self, index_of},
};

/// Appends results to the job's log and reads them back deduplicated.
pub struct IncrementalWriter {
    job_id: String,
    path: PathBuf,
    file: File,
}

impl IncrementalWriter {
    /// Open (creating if needed) the log for `job_id` under `checkpoint_dir`.
    pub async fn create(job_id: &str, checkpoint_dir: &Path) -> Result<Self> {
        fs::create_dir_all(checkpoint_dir).await.with_context(|| {
            format!("failed to create checkpoint dir {checkpoint_dir:?}")
        })?;
        let path = checkpoint_dir.join(format!(".results_{job_id}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open results log {path:?}"))?;
        Ok(Self {
            job_id: job_id.to_owned(),
            path,
            file,
        })
    }

    /// Where the log lives on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one result as a single JSON line and flush it.
    pub async fn write(&mut self, result: &JsonObject) -> Result<()> {
        let mut line = serde_json::to_string(result)
            .with_context(|| format!("failed to serialize result: {result:?}"))?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .await
            .context("failed to append to results log")?;
        self.file
            .flush()
            .await
            .context("failed to flush results log")?;
        Ok(())
    }

    /// Every parseable line in file order, skipping blanks and torn writes.
    async fn read_lines(&self) -> Result<Vec<JsonObject>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read results log {:?}", self.path)
                });
            }
        };
        let mut results = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonObject>(line) {
                Ok(result) => results.push(result),
                Err(_) => {
                    // Torn write from a crash. Skip it; the index will be
                    // reprocessed on resume.
                    debug!("skipping unparseable results-log line");
                }
            }
        }
        Ok(results)
    }

    /// The set of `_idx` values with at least one line in the log.
    pub async fn completed_indices(&self) -> Result<BTreeSet<u64>> {
        Ok(self
            .read_lines()
            .await?
            .iter()
            .filter_map(index_of)
            .collect())
    }

    /// The latest result per `_idx`, sorted by `_idx` ascending. Lines
    /// without an index follow the indexed ones in arrival order.
    pub async fn read_all(&self) -> Result<Vec<JsonObject>> {
        let mut by_index = BTreeMap::new();
        let mut unindexed = Vec::new();
        for result in self.read_lines().await? {
            match index_of(&result) {
                Some(idx) => {
                    // Last write wins: a retry supersedes earlier attempts.
                    by_index.insert(idx, result);
                }
                None => unindexed.push(result),
            }
        }
        let mut results: Vec<_> = by_index.into_values().collect();
        results.extend(unindexed);
        Ok(results)
    }

    /// Results whose latest occurrence is a failure, sorted by `_idx`.
    pub async fn failures(&self) -> Result<Vec<JsonObject>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(record::is_failure)
            .collect())
    }

    /// Indices whose latest result is a failure.
    pub async fn failed_indices(&self) -> Result<BTreeSet<u64>> {
        Ok(self.failures().await?.iter().filter_map(index_of).collect())
    }

    /// Write the failures to `<out_dir>/failures_<job_id>.jsonl` for
    /// operator review. Returns `None` when there are no failures.
    pub async fn write_failures_file(&self, out_dir: &Path) -> Result<Option<PathBuf>> {
        let failures = self.failures().await?;
        if failures.is_empty() {
            return Ok(None);
        }
        fs::create_dir_all(out_dir)
            .await
            .with_context(|| format!("failed to create output dir {out_dir:?}"))?;
        let path = out_dir.join(format!("failures_{}.jsonl", self.job_id));
        let mut contents = String::new();
        for failure in &failures {
            contents.push_str(&serde_json::to_string(failure)?);
            contents.push('\n');
        }
        fs::write(&path, contents)
            .await
            .with_context(|| format!("failed to write failures file {path:?}"))?;
        Ok(Some(path))
    }

    /// Delete the log, once the final output has been written.
    pub async fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to remove results log {:?}", self.path)),
        }
    }
}
