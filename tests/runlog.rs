//! SQLite run log on a temporary database.

use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;

use docsync::db;
use docsync::migrate::run_migrations;
use docsync::runlog::{RunLog, SqliteRunLog};
use docsync_core::run::{
    Outcome, PipelineRun, RunMode, RunOutcome, RunStatus, RunSummary, Trigger,
};
use docsync_core::ErrorKind;

async fn open(tmp: &TempDir) -> SqliteRunLog {
    let pool = db::connect(&tmp.path().join("runs.sqlite")).await.unwrap();
    run_migrations(&pool).await.unwrap();
    SqliteRunLog::new(pool)
}

/// Millisecond precision, as stored.
fn at(minutes_ago: i64) -> DateTime<Utc> {
    let t = Utc::now() - Duration::minutes(minutes_ago);
    DateTime::from_timestamp_millis(t.timestamp_millis()).unwrap()
}

fn begin(id: &str, class: &str, started_at: DateTime<Utc>) -> PipelineRun {
    PipelineRun::begin(id, class, Trigger::Scheduled, RunMode::Committed, started_at)
}

fn clean_summary(class: &str, window_start: DateTime<Utc>) -> RunSummary {
    let mut summary = RunSummary::new(class, RunMode::Committed, window_start, true);
    summary.counts.fetched = 1;
    summary.record("sop:a", "a.pdf", Outcome::Upserted);
    summary
}

#[tokio::test]
async fn run_round_trips_through_start_and_finish() {
    let tmp = TempDir::new().unwrap();
    let log = open(&tmp).await;
    let started = at(10);

    let run = begin("r1", "sop", started);
    log.start(&run).await.unwrap();
    let listed = log.recent(None, 10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].outcome, RunOutcome::Running);
    assert!(!listed[0].is_finished());

    let mut summary = RunSummary::new("sop", RunMode::Committed, at(60), true);
    summary.counts.fetched = 2;
    summary.record("sop:a", "a.pdf", Outcome::Upserted);
    summary.record(
        "b.pdf",
        "b.pdf",
        Outcome::Failed {
            kind: ErrorKind::Extraction,
            reason: "OCR returned no text".into(),
        },
    );
    summary.listing_errors.push("page 2: timeout".into());
    let finished = run.complete(summary, at(9));
    log.finish(&finished).await.unwrap();

    let stored = log.recent(Some("sop"), 10).await.unwrap().remove(0);
    assert_eq!(stored.status, RunStatus::PartialFailure);
    assert_eq!(stored.outcome, RunOutcome::PartialFailure);
    assert_eq!(stored.trigger, Trigger::Scheduled);
    assert_eq!(stored.started_at, started);
    assert_eq!(stored.finished_at, finished.finished_at);
    assert_eq!(stored.counts, finished.counts);
    assert_eq!(stored.outcomes, finished.outcomes);
    assert_eq!(stored.listing_errors, vec!["page 2: timeout".to_string()]);
    assert_eq!(log.checkpoint("sop").await.unwrap(), None);
}

#[tokio::test]
async fn finish_is_accepted_once() {
    let tmp = TempDir::new().unwrap();
    let log = open(&tmp).await;

    let never_started = begin("ghost", "sop", at(5)).abort("boom", at(4));
    assert!(log.finish(&never_started).await.is_err());

    let run = begin("r1", "sop", at(5));
    log.start(&run).await.unwrap();
    let aborted = run.abort("vector store unavailable", at(4));
    log.finish(&aborted).await.unwrap();
    assert!(log.finish(&aborted).await.is_err());

    let stored = log.recent(None, 1).await.unwrap().remove(0);
    assert_eq!(stored.outcome, RunOutcome::Aborted);
    assert_eq!(stored.abort_reason.as_deref(), Some("vector store unavailable"));
}

#[tokio::test]
async fn checkpoint_only_moves_forward() {
    let tmp = TempDir::new().unwrap();
    let log = open(&tmp).await;

    let newer = begin("newer", "sop", at(10));
    log.start(&newer).await.unwrap();
    let newer = newer.complete(clean_summary("sop", at(60)), at(9));
    assert!(newer.advances_checkpoint);
    log.finish(&newer).await.unwrap();
    assert_eq!(log.checkpoint("sop").await.unwrap(), Some(newer.started_at));

    // An older run finishing late must not pull the checkpoint back.
    let older = begin("older", "sop", at(30));
    log.start(&older).await.unwrap();
    let older = older.complete(clean_summary("sop", at(90)), at(8));
    log.finish(&older).await.unwrap();
    assert_eq!(log.checkpoint("sop").await.unwrap(), Some(newer.started_at));

    assert_eq!(log.checkpoint("insw").await.unwrap(), None);
}

#[tokio::test]
async fn recent_filters_by_class_newest_first() {
    let tmp = TempDir::new().unwrap();
    let log = open(&tmp).await;
    log.start(&begin("a", "sop", at(30))).await.unwrap();
    log.start(&begin("b", "insw", at(20))).await.unwrap();
    log.start(&begin("c", "sop", at(10))).await.unwrap();

    let ids = |runs: Vec<PipelineRun>| runs.into_iter().map(|r| r.id).collect::<Vec<_>>();
    assert_eq!(ids(log.recent(None, 10).await.unwrap()), vec!["c", "b", "a"]);
    assert_eq!(ids(log.recent(Some("sop"), 10).await.unwrap()), vec!["c", "a"]);
    assert_eq!(ids(log.recent(None, 1).await.unwrap()), vec!["c"]);
}

#[tokio::test]
async fn unfinished_runs_are_abandoned_on_restart() {
    let tmp = TempDir::new().unwrap();
    let log = open(&tmp).await;
    let done = begin("done", "sop", at(20));
    log.start(&done).await.unwrap();
    log.finish(&done.complete(clean_summary("sop", at(60)), at(19)))
        .await
        .unwrap();
    log.start(&begin("stuck", "sop", at(10))).await.unwrap();

    // A second handle on the same file, as after a restart.
    let restarted = open(&tmp).await;
    assert_eq!(restarted.abandon_unfinished(Utc::now()).await.unwrap(), 1);

    let runs = restarted.recent(Some("sop"), 10).await.unwrap();
    assert!(runs.iter().all(|r| r.is_finished()));
    let stuck = runs.iter().find(|r| r.id == "stuck").unwrap();
    assert_eq!(stuck.outcome, RunOutcome::Aborted);
    assert!(stuck.abort_reason.is_some());
    assert_eq!(restarted.abandon_unfinished(Utc::now()).await.unwrap(), 0);
}
