//! Run bookkeeping: per-document outcomes, run summaries, and run records.
//!
//! A [`RunSummary`] is what the orchestrator produces. A [`PipelineRun`] is
//! what the run log stores: the summary plus trigger, timing, and terminal
//! status. Finalizing a run consumes the running record, so a finalized
//! record cannot be finalized again.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, PipelineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    DryRun,
    Committed,
}

impl RunMode {
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run {
            Self::DryRun
        } else {
            Self::Committed
        }
    }

    pub fn is_dry_run(self) -> bool {
        self == Self::DryRun
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    PartialFailure,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
}

/// Operator-facing state of a run.
///
/// Splits `success` into "something was listed" and "nothing to do" so
/// clients never have to infer it from counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Running,
    NothingToDo,
    Success,
    PartialFailure,
    Aborted,
}

macro_rules! str_enum {
    ($ty:ty { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: '{}'", stringify!($ty), other)),
                }
            }
        }
    };
}

str_enum!(RunMode { DryRun => "dry_run", Committed => "committed" });
str_enum!(RunStatus {
    Running => "running",
    Success => "success",
    PartialFailure => "partial_failure",
    Aborted => "aborted",
});
str_enum!(Trigger { Scheduled => "scheduled", Manual => "manual" });
str_enum!(RunOutcome {
    Running => "running",
    NothingToDo => "nothing_to_do",
    Success => "success",
    PartialFailure => "partial_failure",
    Aborted => "aborted",
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Candidates listed inside the sync window.
    pub fetched: u64,
    pub upserted: u64,
    pub would_upsert: u64,
    pub skipped_unchanged: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Upserted,
    WouldUpsert,
    SkippedUnchanged,
    Failed { kind: ErrorKind, reason: String },
}

/// One audit-log line: which key (or file) ended how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentOutcome {
    /// Namespaced domain key, or the file name when no key could be derived.
    pub key: String,
    /// Remote file the record came from.
    pub source: String,
    #[serde(flatten)]
    pub outcome: Outcome,
    /// Input to the embedding model was cut to its maximum length.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

/// Result of one `sync_and_upsert` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub class: String,
    pub mode: RunMode,
    /// Lower bound on `last_modified` for candidates.
    pub window_start: DateTime<Utc>,
    /// The window started at or before the class checkpoint, so a clean
    /// committed run may move the checkpoint forward.
    pub covers_checkpoint: bool,
    pub counts: RunCounts,
    pub outcomes: Vec<DocumentOutcome>,
    /// Listing pages that failed after others succeeded.
    pub listing_errors: Vec<String>,
}

impl RunSummary {
    pub fn new(
        class: impl Into<String>,
        mode: RunMode,
        window_start: DateTime<Utc>,
        covers_checkpoint: bool,
    ) -> Self {
        Self {
            class: class.into(),
            mode,
            window_start,
            covers_checkpoint,
            counts: RunCounts::default(),
            outcomes: Vec::new(),
            listing_errors: Vec::new(),
        }
    }

    pub fn record(&mut self, key: impl Into<String>, source: impl Into<String>, outcome: Outcome) {
        self.record_with(key, source, outcome, false);
    }

    pub fn record_with(
        &mut self,
        key: impl Into<String>,
        source: impl Into<String>,
        outcome: Outcome,
        truncated: bool,
    ) {
        match &outcome {
            Outcome::Upserted => self.counts.upserted += 1,
            Outcome::WouldUpsert => self.counts.would_upsert += 1,
            Outcome::SkippedUnchanged => self.counts.skipped_unchanged += 1,
            Outcome::Failed { .. } => self.counts.failed += 1,
        }
        self.outcomes.push(DocumentOutcome {
            key: key.into(),
            source: source.into(),
            outcome,
            truncated,
        });
    }

    pub fn record_failure(
        &mut self,
        key: impl Into<String>,
        source: impl Into<String>,
        err: &PipelineError,
    ) {
        self.record(
            key,
            source,
            Outcome::Failed {
                kind: err.kind(),
                reason: err.to_string(),
            },
        );
    }

    /// `partial_failure` when any document or listing page failed.
    pub fn status(&self) -> RunStatus {
        if self.counts.failed > 0 || !self.listing_errors.is_empty() {
            RunStatus::PartialFailure
        } else {
            RunStatus::Success
        }
    }
}

/// A run as recorded in the run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub class: String,
    pub trigger: Trigger,
    pub mode: RunMode,
    pub status: RunStatus,
    pub outcome: RunOutcome,
    pub window_start: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counts: RunCounts,
    pub outcomes: Vec<DocumentOutcome>,
    pub listing_errors: Vec<String>,
    pub abort_reason: Option<String>,
    /// Finalizing this run moved the class checkpoint to `started_at`.
    pub advances_checkpoint: bool,
}

impl PipelineRun {
    pub fn begin(
        id: impl Into<String>,
        class: impl Into<String>,
        trigger: Trigger,
        mode: RunMode,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            class: class.into(),
            trigger,
            mode,
            status: RunStatus::Running,
            outcome: RunOutcome::Running,
            window_start: None,
            started_at,
            finished_at: None,
            counts: RunCounts::default(),
            outcomes: Vec::new(),
            listing_errors: Vec::new(),
            abort_reason: None,
            advances_checkpoint: false,
        }
    }

    pub fn complete(self, summary: RunSummary, finished_at: DateTime<Utc>) -> Self {
        let status = summary.status();
        let outcome = match status {
            RunStatus::PartialFailure => RunOutcome::PartialFailure,
            _ if summary.counts.fetched == 0 => RunOutcome::NothingToDo,
            _ => RunOutcome::Success,
        };
        let advances_checkpoint = status == RunStatus::Success
            && !summary.mode.is_dry_run()
            && summary.covers_checkpoint;
        Self {
            status,
            outcome,
            window_start: Some(summary.window_start),
            finished_at: Some(finished_at),
            counts: summary.counts,
            outcomes: summary.outcomes,
            listing_errors: summary.listing_errors,
            advances_checkpoint,
            ..self
        }
    }

    pub fn abort(self, reason: impl Into<String>, finished_at: DateTime<Utc>) -> Self {
        Self {
            status: RunStatus::Aborted,
            outcome: RunOutcome::Aborted,
            finished_at: Some(finished_at),
            abort_reason: Some(reason.into()),
            advances_checkpoint: false,
            ..self
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}
