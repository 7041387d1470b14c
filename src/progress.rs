//! Stage progress reporting.
//!
//! Reports observable progress during `cgx run` and `cgx stage` so users
//! see which stage is active and how many units are left. Progress goes to
//! **stderr** so stdout stays parseable for scripts.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum StageProgressEvent {
    /// Stage opened its manifest and counted its units.
    Started { stage: String, total: u64 },
    /// `n` of `total` units handled (written, skipped or fallback).
    Units { stage: String, n: u64, total: u64 },
    /// Stage reached a terminal state.
    Finished {
        stage: String,
        state: String,
        written: u64,
        skipped: u64,
    },
}

/// Receives progress events from the pipeline runner.
pub trait StageProgressReporter: Send + Sync {
    fn report(&self, event: StageProgressEvent);
}

/// Human-friendly progress on stderr: "stage enrich  1,234 / 5,000 units".
pub struct StderrProgress;

impl StageProgressReporter for StderrProgress {
    fn report(&self, event: StageProgressEvent) {
        let line = match &event {
            StageProgressEvent::Started { stage, total } => {
                format!("stage {}  started  {} units\n", stage, format_number(*total))
            }
            StageProgressEvent::Units { stage, n, total } => format!(
                "stage {}  {} / {} units\n",
                stage,
                format_number(*n),
                format_number(*total)
            ),
            StageProgressEvent::Finished {
                stage,
                state,
                written,
                skipped,
            } => format!(
                "stage {}  {}  written {}  skipped {}\n",
                stage,
                state,
                format_number(*written),
                format_number(*skipped)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl StageProgressReporter for JsonProgress {
    fn report(&self, event: StageProgressEvent) {
        let obj = match &event {
            StageProgressEvent::Started { stage, total } => serde_json::json!({
                "event": "started",
                "stage": stage,
                "total": total
            }),
            StageProgressEvent::Units { stage, n, total } => serde_json::json!({
                "event": "progress",
                "stage": stage,
                "n": n,
                "total": total
            }),
            StageProgressEvent::Finished {
                stage,
                state,
                written,
                skipped,
            } => serde_json::json!({
                "event": "finished",
                "stage": stage,
                "state": state,
                "written": written,
                "skipped": skipped
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl StageProgressReporter for NoProgress {
    fn report(&self, _event: StageProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" | "none" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> std::sync::Arc<dyn StageProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}
