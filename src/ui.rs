//! Terminal UI: progress bars that coexist with `tracing` output.
//!
//! All human-facing chatter goes to stderr. Log lines are routed through a
//! writer that suspends the progress bars while printing, so the two never
//! interleave mid-line.

use std::{io, sync::Arc, time::Duration};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Shared handle to the terminal's progress area.
#[derive(Clone)]
pub struct Ui {
    progress: Arc<MultiProgress>,
}

impl Ui {
    pub fn new() -> Self {
        Self {
            progress: Arc::new(MultiProgress::new()),
        }
    }

    /// A UI that draws nothing. Used by tests and quiet runs.
    pub fn hidden() -> Self {
        Self {
            progress: Arc::new(MultiProgress::with_draw_target(
                ProgressDrawTarget::hidden(),
            )),
        }
    }

    /// A bar counting records through the pipeline.
    pub fn record_bar(&self, msg: &str, total: u64) -> ProgressBar {
        let style = ProgressStyle::default_bar()
            .template(
                "{msg:24} {pos:>5}/{len:5} {elapsed_precise} {wide_bar:.cyan/blue} {eta_precise}",
            )
            .expect("record bar template should be valid");
        let bar = self
            .progress
            .add(ProgressBar::new(total).with_style(style).with_message(msg.to_owned()));
        bar.enable_steady_tick(Duration::from_millis(250));
        bar
    }

    /// Run `f` with the progress bars hidden, so it can print cleanly.
    pub fn suspend<F: FnOnce() -> R, R>(&self, f: F) -> R {
        self.progress.suspend(f)
    }

    /// A `tracing`-compatible stderr writer that plays nicely with the
    /// progress bars.
    pub fn stderr_writer(&self) -> LogWriter {
        LogWriter { ui: self.clone() }
    }
}

impl Default for Ui {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes to stderr with progress bars suspended.
#[derive(Clone)]
pub struct LogWriter {
    ui: Ui,
}

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.suspend(|| io::stderr().flush())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui.suspend(|| io::stderr().write_all(buf))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
