//! End-to-end behaviour of one class pipeline against in-memory fakes.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use docsync::runlog::MemoryRunLog;
use docsync_core::fingerprint::point_id;
use docsync_core::index::{InMemoryIndex, VectorIndex};
use docsync_core::run::{Outcome, RunStatus};
use docsync_core::{ErrorKind, PipelineError};

use common::{
    docx, harness, harness_with, pdf_with_broken_font, pipeline, regulation, HashEmbedder,
    ScriptedSource,
};

fn failed_kinds(outcomes: &[docsync_core::run::DocumentOutcome]) -> Vec<(String, ErrorKind)> {
    outcomes
        .iter()
        .filter_map(|o| match &o.outcome {
            Outcome::Failed { kind, .. } => Some((o.key.clone(), *kind)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn second_run_without_changes_upserts_nothing() {
    let h = harness("insw", Arc::new(MemoryRunLog::new()));
    h.source.put("01.json", regulation("0101", &["Live horses"]));
    h.source.put("02.json", regulation("0102", &["Live bovine animals"]));

    let first = h.pipeline.sync_and_upsert(false).await.unwrap();
    assert_eq!(first.counts.fetched, 2);
    assert_eq!(first.counts.upserted, 2);
    assert_eq!(first.status(), RunStatus::Success);
    let upserts = h.index.upsert_calls();
    let embedded = h.embedder.texts_embedded.load(Ordering::SeqCst);

    let second = h.pipeline.sync_and_upsert(false).await.unwrap();
    assert_eq!(second.counts.fetched, 2);
    assert_eq!(second.counts.upserted, 0);
    assert_eq!(second.counts.skipped_unchanged, 2);
    assert_eq!(h.index.upsert_calls(), upserts);
    assert_eq!(h.embedder.texts_embedded.load(Ordering::SeqCst), embedded);
    assert_eq!(h.index.len(), 2);
}

#[tokio::test]
async fn dry_run_leaves_the_index_untouched() {
    let h = harness("insw", Arc::new(MemoryRunLog::new()));
    h.source.put("01.json", regulation("0101", &["Live horses"]));
    h.source.put("02.json", regulation("0102", &["Live bovine animals"]));

    let dry = h.pipeline.sync_and_upsert(true).await.unwrap();
    assert_eq!(dry.counts.would_upsert, 2);
    assert_eq!(dry.counts.upserted, 0);
    assert!(h.index.is_empty());
    assert_eq!(h.index.upsert_calls(), 0);

    h.pipeline.sync_and_upsert(false).await.unwrap();
    let before = h.index.snapshot();

    // Change one document, then dry-run again: stored fingerprints stay put.
    h.source.put("01.json", regulation("0101", &["Live horses, pure-bred"]));
    let dry = h.pipeline.sync_and_upsert(true).await.unwrap();
    assert_eq!(dry.counts.would_upsert, 1);
    assert_eq!(dry.counts.skipped_unchanged, 1);
    assert_eq!(h.index.snapshot(), before);
}

#[tokio::test]
async fn only_embedded_fields_trigger_an_upsert() {
    let h = harness("insw", Arc::new(MemoryRunLog::new()));
    h.source.put("01.json", regulation("0101", &["Live horses"]));
    h.source.put("02.json", regulation("0102", &["Live bovine animals"]));
    h.pipeline.sync_and_upsert(false).await.unwrap();

    // `notes` is not part of the embedded text.
    let mut doc: serde_json::Value =
        serde_json::from_slice(&regulation("0102", &["Live bovine animals"])).unwrap();
    doc["notes"] = serde_json::Value::from("revised");
    h.source.put("02.json", doc.to_string().into_bytes());
    let run = h.pipeline.sync_and_upsert(false).await.unwrap();
    assert_eq!(run.counts.upserted, 0);
    assert_eq!(run.counts.skipped_unchanged, 2);

    h.source.put("01.json", regulation("0101", &["Live asses"]));
    let run = h.pipeline.sync_and_upsert(false).await.unwrap();
    assert_eq!(run.counts.upserted, 1);
    assert_eq!(run.counts.skipped_unchanged, 1);
    let upserted: Vec<_> = run
        .outcomes
        .iter()
        .filter(|o| o.outcome == Outcome::Upserted)
        .map(|o| o.key.as_str())
        .collect();
    assert_eq!(upserted, vec!["insw:0101"]);
}

#[tokio::test]
async fn one_new_and_one_unchanged_document() {
    let h = harness("insw", Arc::new(MemoryRunLog::new()));
    h.source.put("01.json", regulation("0101", &["Live horses"]));
    h.pipeline.sync_and_upsert(false).await.unwrap();

    h.source.put("02.json", regulation("0102", &["Live bovine animals"]));
    let run = h.pipeline.sync_and_upsert(false).await.unwrap();
    assert_eq!(run.counts.fetched, 2);
    assert_eq!(run.counts.upserted, 1);
    assert_eq!(run.counts.skipped_unchanged, 1);
    assert_eq!(run.counts.failed, 0);
}

#[tokio::test]
async fn a_failing_document_does_not_stop_the_others() {
    let h = harness("insw", Arc::new(MemoryRunLog::new()));
    h.source.put("01.json", regulation("0101", &["Live horses"]));
    h.source.put("02.json", b"{ not json".to_vec());
    h.source.put("03.json", regulation("0103", &["Live swine"]));
    h.source.put("04.json", regulation("0104", &["Live sheep"]));
    h.source.fail_fetch("04.json");

    let run = h.pipeline.sync_and_upsert(false).await.unwrap();
    assert_eq!(run.counts.fetched, 4);
    assert_eq!(run.counts.upserted, 2);
    assert_eq!(run.counts.failed, 2);
    assert_eq!(run.status(), RunStatus::PartialFailure);
    assert_eq!(
        failed_kinds(&run.outcomes),
        vec![
            ("02.json".to_string(), ErrorKind::InvalidDocument),
            ("04.json".to_string(), ErrorKind::TransientIo),
        ]
    );
    assert!(h.index.get(&point_id("insw:0101")).is_some());
    assert!(h.index.get(&point_id("insw:0103")).is_some());
}

#[tokio::test]
async fn unparseable_pdf_fails_alone() {
    let h = harness("handbook", Arc::new(MemoryRunLog::new()));
    h.source.put("Rusak.pdf", pdf_with_broken_font());
    h.source.put("Panduan.docx", docx("Panduan ekspor barang"));

    let summary = h.pipeline.sync_and_upsert(false).await.unwrap();
    assert_eq!(summary.counts.fetched, 2);
    assert_eq!(summary.counts.failed, 1);
    assert_eq!(summary.counts.upserted, 1);
    assert_eq!(summary.status(), RunStatus::PartialFailure);
    assert_eq!(
        failed_kinds(&summary.outcomes),
        vec![("Rusak.pdf".to_string(), ErrorKind::Extraction)]
    );
    assert!(h.index.get(&point_id("handbook:Panduan")).is_some());
}

#[tokio::test]
async fn same_domain_key_in_two_classes_is_stored_twice() {
    let run_log = Arc::new(MemoryRunLog::new());
    let shared = Arc::new(InMemoryIndex::new());
    let embedder = Arc::new(HashEmbedder::new());

    let insw_source = Arc::new(ScriptedSource::new());
    insw_source.put("A1.json", regulation("A1", &["Tariff heading"]));
    let archive_source = Arc::new(ScriptedSource::new());
    archive_source.put("A1.json", regulation("A1", &["Archived heading"]));

    let insw = pipeline(
        "insw",
        insw_source,
        Arc::clone(&embedder),
        Arc::clone(&shared) as Arc<dyn VectorIndex>,
        run_log.clone(),
    );
    let archive = pipeline(
        "archive",
        archive_source,
        Arc::clone(&embedder),
        Arc::clone(&shared) as Arc<dyn VectorIndex>,
        run_log,
    );

    assert_eq!(insw.sync_and_upsert(false).await.unwrap().counts.upserted, 1);
    assert_eq!(archive.sync_and_upsert(false).await.unwrap().counts.upserted, 1);

    assert_ne!(point_id("insw:A1"), point_id("archive:A1"));
    assert_eq!(shared.len(), 2);
    let insw_point = shared.get(&point_id("insw:A1")).unwrap();
    let archive_point = shared.get(&point_id("archive:A1")).unwrap();
    assert_eq!(insw_point.payload["source_class"], "insw");
    assert_eq!(archive_point.payload["source_class"], "archive");
    assert_eq!(insw_point.payload["domain_key"], "A1");
    assert_eq!(archive_point.payload["domain_key"], "A1");
}

#[tokio::test]
async fn duplicate_key_within_a_run_is_a_collision() {
    let h = harness("insw", Arc::new(MemoryRunLog::new()));
    h.source.put("a.json", regulation("0101", &["Live horses"]));
    h.source.put("b.json", regulation("0101", &["Live horses, again"]));

    let run = h.pipeline.sync_and_upsert(false).await.unwrap();
    assert_eq!(run.counts.upserted, 1);
    assert_eq!(run.counts.failed, 1);
    let failed = run
        .outcomes
        .iter()
        .find(|o| matches!(o.outcome, Outcome::Failed { .. }))
        .unwrap();
    assert_eq!(failed.key, "insw:0101");
    assert_eq!(failed.source, "b.json");
    match &failed.outcome {
        Outcome::Failed { kind, reason } => {
            assert_eq!(*kind, ErrorKind::KeyCollision);
            assert!(reason.contains("a.json"), "{}", reason);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    let stored = h.index.get(&point_id("insw:0101")).unwrap();
    assert_eq!(stored.payload["name"], "a.json");
}

#[tokio::test]
async fn unavailable_store_aborts_the_run() {
    let h = harness("insw", Arc::new(MemoryRunLog::new()));
    h.source.put("01.json", regulation("0101", &["Live horses"]));
    h.index.set_available(false);

    let err = h.pipeline.sync_and_upsert(false).await.unwrap_err();
    assert!(matches!(err, PipelineError::StoreUnavailable(_)), "{:?}", err);
    assert!(err.is_fatal());
    assert_eq!(h.source.remote_calls(), 0);
}

#[tokio::test]
async fn failed_batch_is_retried_item_by_item() {
    let h = harness("sop", Arc::new(MemoryRunLog::new()));
    h.source.put("a.pdf", b"Handling incoming cargo".to_vec());
    h.source.put("b.pdf", b"POISON pill".to_vec());
    h.source.put("c.pdf", b"Customs clearance steps".to_vec());

    let run = h.pipeline.sync_and_upsert(false).await.unwrap();
    assert_eq!(run.counts.upserted, 2);
    assert_eq!(
        failed_kinds(&run.outcomes),
        vec![("sop:b".to_string(), ErrorKind::Embedding)]
    );
    assert!(h.index.get(&point_id("sop:a")).is_some());
    assert!(h.index.get(&point_id("sop:c")).is_some());
}

#[tokio::test]
async fn low_confidence_is_indexed_and_flagged_by_default() {
    let h = harness("sop", Arc::new(MemoryRunLog::new()));
    h.source.put("SOP_blurry.pdf", b"LOWCONF scanned procedure".to_vec());

    let run = h.pipeline.sync_and_upsert(false).await.unwrap();
    assert_eq!(run.counts.upserted, 1);
    let stored = h.index.get(&point_id("sop:SOP_blurry")).unwrap();
    assert_eq!(stored.payload["low_confidence"], true);
    assert_eq!(stored.payload["extraction_method"], "ocr");
    assert_eq!(stored.payload["doc_type"], "SOP");
}

#[tokio::test]
async fn low_confidence_can_be_skipped() {
    let h = harness("sop_strict", Arc::new(MemoryRunLog::new()));
    h.source.put("blurry.pdf", b"LOWCONF scanned procedure".to_vec());
    h.source.put("clear.pdf", b"Readable procedure".to_vec());
    h.source.put("blank.pdf", b"UNREADABLE".to_vec());

    let run = h.pipeline.sync_and_upsert(false).await.unwrap();
    assert_eq!(run.counts.upserted, 1);
    assert_eq!(
        failed_kinds(&run.outcomes),
        vec![
            ("blank.pdf".to_string(), ErrorKind::Extraction),
            ("blurry.pdf".to_string(), ErrorKind::Extraction),
        ]
    );
    assert!(h.index.get(&point_id("sop_strict:clear")).is_some());
}

#[tokio::test]
async fn long_inputs_are_truncated_and_flagged() {
    let h = harness_with(
        "insw",
        ScriptedSource::new(),
        HashEmbedder::with_max_chars(12),
        Arc::new(MemoryRunLog::new()),
    );
    h.source.put("01.json", regulation("0101", &["Live horses, asses, mules and hinnies"]));

    let run = h.pipeline.sync_and_upsert(false).await.unwrap();
    assert_eq!(run.counts.upserted, 1);
    assert!(run.outcomes[0].truncated);
    let stored = h.index.get(&point_id("insw:0101")).unwrap();
    assert_eq!(stored.payload["truncated"], true);

    // The cut is deterministic, so the next run sees the same fingerprint.
    let again = h.pipeline.sync_and_upsert(false).await.unwrap();
    assert_eq!(again.counts.skipped_unchanged, 1);
}

#[tokio::test]
async fn payload_carries_source_metadata() {
    let h = harness("insw", Arc::new(MemoryRunLog::new()));
    h.source.put("0101.json", regulation("0101", &["Live horses"]));
    h.pipeline.sync_and_upsert(false).await.unwrap();

    let stored = h.index.get(&point_id("insw:0101")).unwrap();
    assert_eq!(stored.key, "insw:0101");
    assert_eq!(stored.vector.len(), common::DIMS);
    let payload = &stored.payload;
    assert_eq!(payload["key"], "insw:0101");
    assert_eq!(payload["hs_code"], "0101");
    assert_eq!(payload["external_id"], "id-0101.json");
    assert_eq!(payload["web_url"], "https://drive.example/0101.json");
    assert_eq!(payload["fingerprint"], stored.fingerprint.as_str());
    assert_eq!(payload["document"]["notes"], "initial");
}

#[tokio::test]
async fn search_finds_the_matching_record() {
    let h = harness("insw", Arc::new(MemoryRunLog::new()));
    h.source.put("01.json", regulation("0101", &["Live horses"]));
    h.source.put("02.json", regulation("0102", &["Live bovine animals"]));
    h.source.put("03.json", regulation("0103", &["Live swine"]));
    h.pipeline.sync_and_upsert(false).await.unwrap();

    let hits = h.pipeline.search("Live swine 0103", 2).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].payload["key"], "insw:0103");
    assert!(hits[0].score >= hits[1].score);

    let err = h.pipeline.search("   ", 5).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidDocument(_)));
}
