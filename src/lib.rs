//! Batch LLM prompt processing with checkpoints and resume.
//!
//! The core is [`engine::ProcessingEngine`], which drives records from a
//! format adapter through a prompt template and a retrying chat client,
//! yielding one terminal result per record. Around it sit the pieces that
//! make a batch job safe to interrupt: [`wal::IncrementalWriter`] (an
//! append-only results log, flushed per record), [`progress`] (the
//! checkpoint that marks a job resumable), [`breaker`] (halt after
//! consecutive fatal failures), and [`resume`] (rebuild a job from its
//! checkpoint and log).
//!
//! The CLI in [`cmd`] is one front-end over this; the engine and its
//! collaborators do not depend on it.

pub mod adapters;
pub mod async_utils;
pub mod breaker;
pub mod cmd;
pub mod config;
pub mod engine;
pub mod llm;
pub mod postprocess;
pub mod prelude;
pub mod progress;
pub mod rate_limit;
pub mod record;
pub mod resume;
pub mod retry;
pub mod runner;
pub mod template;
pub mod ui;
pub mod wal;
