//! Sync progress reporting.
//!
//! Reports observable progress during `docsync sync` so operators see which
//! class is listing and how far processing has got. Progress goes to
//! **stderr** so the run summary on stdout stays parseable for scripts.
//! Scheduled runs use [`NoProgress`]; they are covered by the run log.

use std::io::Write;
use std::sync::Arc;

/// A single progress event for one class run.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncProgressEvent {
    /// Listing candidates. Total unknown.
    Discovering { class: String },
    /// `n` of `total` candidates handled; `key` is the file just finished.
    Processing {
        class: String,
        n: u64,
        total: u64,
        key: String,
    },
}

pub trait SyncProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the orchestrator.
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync sop  processing  12 / 1,040  SOP_Gudang".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Discovering { class } => {
                format!("sync {}  listing...\n", class)
            }
            SyncProgressEvent::Processing {
                class,
                n,
                total,
                key,
            } => format!(
                "sync {}  processing  {} / {}  {}\n",
                class,
                format_number(*n),
                format_number(*total),
                key
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Discovering { class } => serde_json::json!({
                "event": "progress",
                "class": class,
                "phase": "discovering"
            }),
            SyncProgressEvent::Processing {
                class,
                n,
                total,
                key,
            } => serde_json::json!({
                "event": "progress",
                "class": class,
                "phase": "processing",
                "n": n,
                "total": total,
                "key": key
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
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

    pub fn reporter(&self) -> Arc<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn parses_cli_modes() {
        use clap::ValueEnum;

        assert_eq!(ProgressMode::from_str("json", false), Ok(ProgressMode::Json));
        assert_eq!(ProgressMode::from_str("human", false), Ok(ProgressMode::Human));
        assert_eq!(ProgressMode::from_str("off", false), Ok(ProgressMode::Off));
        assert!(ProgressMode::from_str("loud", false).is_err());
    }
}
