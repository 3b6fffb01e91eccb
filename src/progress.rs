//! Run progress reporting.
//!
//! The engine hands a [`ProgressState`] snapshot to a [`ProgressReporter`]
//! every few records. Reporters are observers: they hold no pipeline
//! state and must return immediately. Terminal output goes to **stderr** so
//! stdout remains parseable for scripts.

use std::io::Write;

use tokio::sync::mpsc;

pub use course_harness_core::progress::ProgressState;

/// Receives progress snapshots. Must never block the caller.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, state: &ProgressState);
}

/// Human-friendly progress on stderr: "enhance  1,234 / 5,000  ok 1,200  failed 4  skipped 30".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, state: &ProgressState) {
        let line = format!(
            "{}  {} / {}  ok {}  failed {}  skipped {}\n",
            state.current_label,
            format_number(state.processed_count),
            format_number(state.total_count),
            format_number(state.success_count),
            format_number(state.failure_count),
            format_number(state.skipped_count),
        );
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, state: &ProgressState) {
        let obj = serde_json::json!({
            "event": "progress",
            "label": state.current_label,
            "processed": state.processed_count,
            "total": state.total_count,
            "success": state.success_count,
            "failed": state.failure_count,
            "skipped": state.skipped_count,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _state: &ProgressState) {}
}

/// Forwards snapshots into a bounded channel, dropping them when the
/// consumer falls behind.
pub struct ChannelProgress {
    tx: mpsc::Sender<ProgressState>,
}

impl ChannelProgress {
    pub fn new(tx: mpsc::Sender<ProgressState>) -> Self {
        Self { tx }
    }
}

impl ProgressReporter for ChannelProgress {
    fn report(&self, state: &ProgressState) {
        if self.tx.try_send(state.clone()).is_err() {
            tracing::debug!(processed = state.processed_count, "progress snapshot dropped");
        }
    }
}

/// Adapts a closure into a reporter.
pub struct FnProgress<F>(pub F);

impl<F> ProgressReporter for FnProgress<F>
where
    F: Fn(&ProgressState) + Send + Sync,
{
    fn report(&self, state: &ProgressState) {
        (self.0)(state)
    }
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn channel_reporter_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let reporter = ChannelProgress::new(tx);
        let mut state = ProgressState::new(3);
        state.processed_count = 1;
        reporter.report(&state);
        state.processed_count = 2;
        reporter.report(&state);

        assert_eq!(rx.try_recv().unwrap().processed_count, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fn_reporter_calls_closure() {
        let seen = Mutex::new(Vec::new());
        let reporter = FnProgress(|s: &ProgressState| seen.lock().unwrap().push(s.processed_count));
        let mut state = ProgressState::new(2);
        state.processed_count = 2;
        reporter.report(&state);
        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }
}
