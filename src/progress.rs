//! Progress tracking and the per-job checkpoint file.
//!
//! The checkpoint is small and rewritten often; it holds the counters plus
//! everything needed to reconstruct the engine on resume. Its presence is
//! what marks a job as resumable.

use tokio::fs;

use crate::{engine::Mode, prelude::*};

/// Persist the checkpoint every N processed records.
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 10;

/// Engine configuration stored in the checkpoint so `resume` can rebuild
/// the job without the original command line.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct JobMetadata {
    pub input_file: String,
    pub output_file: String,
    pub prompt: String,
    pub model: String,
    pub mode: Mode,
    pub batch_size: usize,
    pub max_tokens: u32,
    pub no_post_process: bool,
    pub no_merge: bool,
    pub include_raw: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkin_interval: Option<u64>,
    pub base_url: Option<String>,
    /// SHA-256 of the input file at job start. Resume refuses to run when
    /// the input no longer matches, because `_idx` assignment depends on a
    /// stable enumeration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_sha256: Option<String>,
}

/// The on-disk checkpoint shape.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Checkpoint {
    pub job_id: String,
    pub total: u64,
    pub processed: u64,
    pub failed: u64,
    pub metadata: JobMetadata,
}

/// Tracks processed/failed counts and persists the checkpoint.
#[derive(Debug)]
pub struct ProgressTracker {
    checkpoint: Checkpoint,
    checkpoint_dir: PathBuf,
    interval: u64,
}

impl ProgressTracker {
    pub fn new(
        job_id: &str,
        total: u64,
        checkpoint_dir: &Path,
        metadata: JobMetadata,
    ) -> Self {
        Self {
            checkpoint: Checkpoint {
                job_id: job_id.to_owned(),
                total,
                processed: 0,
                failed: 0,
                metadata,
            },
            checkpoint_dir: checkpoint_dir.to_owned(),
            interval: DEFAULT_CHECKPOINT_INTERVAL,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.checkpoint.job_id
    }

    pub fn total(&self) -> u64 {
        self.checkpoint.total
    }

    pub fn processed(&self) -> u64 {
        self.checkpoint.processed
    }

    pub fn failed(&self) -> u64 {
        self.checkpoint.failed
    }

    pub fn metadata(&self) -> &JobMetadata {
        &self.checkpoint.metadata
    }

    /// Restore the counters from a more authoritative source (the results
    /// log) when resuming.
    pub fn set_counts(&mut self, processed: u64, failed: u64) {
        self.checkpoint.processed = processed;
        self.checkpoint.failed = failed;
    }

    /// Record `count` more processed records, persisting the checkpoint
    /// each time the total crosses the interval.
    pub async fn update(&mut self, count: u64) -> Result<()> {
        self.checkpoint.processed += count;
        if self.interval > 0 && self.checkpoint.processed % self.interval == 0 {
            self.save().await?;
        }
        Ok(())
    }

    pub fn increment_failed(&mut self) {
        self.checkpoint.failed += 1;
    }

    fn path_for(checkpoint_dir: &Path, job_id: &str) -> PathBuf {
        checkpoint_dir.join(format!(".progress_{job_id}.json"))
    }

    /// Where this tracker's checkpoint lives.
    pub fn path(&self) -> PathBuf {
        Self::path_for(&self.checkpoint_dir, &self.checkpoint.job_id)
    }

    /// Write the checkpoint atomically: a temp file in the same directory,
    /// then a rename over the final path.
    pub async fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.checkpoint_dir).await.with_context(|| {
            format!("failed to create checkpoint dir {:?}", self.checkpoint_dir)
        })?;
        let path = self.path();
        let tmp_path = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(&self.checkpoint)
            .context("failed to serialize checkpoint")?;
        fs::write(&tmp_path, contents)
            .await
            .with_context(|| format!("failed to write checkpoint {tmp_path:?}"))?;
        fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("failed to replace checkpoint {path:?}"))?;
        Ok(())
    }

    /// Rehydrate a tracker from a saved checkpoint.
    pub async fn load(checkpoint_dir: &Path, job_id: &str) -> Result<Self> {
        let path = Self::path_for(checkpoint_dir, job_id);
        let contents = fs::read_to_string(&path).await.with_context(|| {
            format!("no checkpoint for job {job_id:?} (looked at {path:?})")
        })?;
        let checkpoint: Checkpoint = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse checkpoint {path:?}"))?;
        Ok(Self {
            checkpoint,
            checkpoint_dir: checkpoint_dir.to_owned(),
            interval: DEFAULT_CHECKPOINT_INTERVAL,
        })
    }

    /// Delete the checkpoint once the job has fully completed.
    pub async fn remove(&self) -> Result<()> {
        match fs::remove_file(self.path()).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!("failed to remove checkpoint {:?}", self.path())
            }),
        }
    }
}
