//! Operator API over a real socket.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use docsync::runlog::MemoryRunLog;
use docsync::scheduler::RunScheduler;
use docsync::server;

use common::{harness, harness_with, regulation, Harness, HashEmbedder, ScriptedSource};

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(base: &str) {
    let client = reqwest::Client::new();
    for _ in 0..100 {
        if client.get(format!("{}/health", base)).send().await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server at {} did not come up", base);
}

async fn start(scheduler: Arc<RunScheduler>) -> String {
    let bind = format!("127.0.0.1:{}", find_free_port());
    let base = format!("http://{}", bind);
    tokio::spawn(async move {
        server::run_server(&bind, scheduler, std::future::pending())
            .await
            .unwrap();
    });
    wait_for_server(&base).await;
    base
}

async fn serve_insw() -> (Harness, String) {
    let run_log = Arc::new(MemoryRunLog::new());
    let h = harness("insw", run_log.clone());
    h.source.put("01.json", regulation("0101", &["Live horses"]));
    h.source.put("02.json", regulation("0102", &["Live bovine animals"]));
    let scheduler = RunScheduler::new(vec![Arc::clone(&h.pipeline)], run_log);
    let base = start(scheduler).await;
    (h, base)
}

#[tokio::test]
async fn health_reports_version() {
    let (_h, base) = serve_insw().await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn manual_run_then_history_and_status() {
    let (h, base) = serve_insw().await;
    let client = reqwest::Client::new();

    // Empty body: incremental committed run.
    let resp = client
        .post(format!("{}/classes/insw/run", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let run: Value = resp.json().await.unwrap();
    assert_eq!(run["class"], "insw");
    assert_eq!(run["outcome"], "success");
    assert_eq!(run["mode"], "committed");
    assert_eq!(run["trigger"], "manual");
    assert_eq!(run["counts"]["upserted"], 2);
    assert_eq!(h.index.len(), 2);

    let resp = client
        .post(format!("{}/classes/insw/run", base))
        .json(&json!({ "dry_run": true, "full": true }))
        .send()
        .await
        .unwrap();
    let dry: Value = resp.json().await.unwrap();
    assert_eq!(dry["mode"], "dry_run");
    assert_eq!(dry["counts"]["skipped_unchanged"], 2);

    let runs: Value = client
        .get(format!("{}/runs?class=insw&limit=1", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let runs = runs["runs"].as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["id"], dry["id"]);

    let status: Value = client
        .get(format!("{}/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let classes = status["classes"].as_array().unwrap();
    assert_eq!(classes.len(), 1);
    assert_eq!(classes[0]["class"], "insw");
    assert_eq!(classes[0]["state"], "idle");
    assert_eq!(classes[0]["collection"], "insw");
    assert_eq!(classes[0]["last_outcome"], "success");
}

#[tokio::test]
async fn errors_use_the_error_envelope() {
    let (_h, base) = serve_insw().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/classes/nope/run", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let resp = client
        .post(format!("{}/classes/insw/run", base))
        .header("content-type", "application/json")
        .body("{ nope")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = client
        .get(format!("{}/runs?class=nope", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("{}/classes/insw/search", base))
        .json(&json!({ "query": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn busy_class_returns_409() {
    let run_log = Arc::new(MemoryRunLog::new());
    let (source, entered, release) = ScriptedSource::gated();
    let h = harness_with("insw", source, HashEmbedder::new(), run_log.clone());
    h.source.put("01.json", regulation("0101", &["Live horses"]));
    let scheduler = RunScheduler::new(vec![Arc::clone(&h.pipeline)], run_log);
    let base = start(scheduler).await;
    let client = reqwest::Client::new();

    let first = tokio::spawn({
        let client = client.clone();
        let url = format!("{}/classes/insw/run", base);
        async move { client.post(url).send().await.unwrap().status() }
    });
    entered.notified().await;

    let status: Value = client
        .get(format!("{}/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["classes"][0]["state"], "running");

    let resp = client
        .post(format!("{}/classes/insw/run", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "locked");

    release.add_permits(1);
    assert_eq!(first.await.unwrap(), 200);
}

#[tokio::test]
async fn aborted_run_returns_502() {
    let (h, base) = serve_insw().await;
    h.index.set_available(false);

    let resp = reqwest::Client::new()
        .post(format!("{}/classes/insw/run", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "aborted");
    let run = &body["error"]["run"];
    assert_eq!(run["class"], "insw");
    assert_eq!(run["outcome"], "aborted");
    assert_eq!(run["counts"]["upserted"], 0);
    assert!(run["abort_reason"]
        .as_str()
        .unwrap()
        .contains("vector store unavailable"));

    let runs: Value = reqwest::get(format!("{}/runs?class=insw", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(runs["runs"][0]["id"], run["id"]);
}

#[tokio::test]
async fn search_returns_ranked_hits() {
    let (_h, base) = serve_insw().await;
    let client = reqwest::Client::new();
    client
        .post(format!("{}/classes/insw/run", base))
        .send()
        .await
        .unwrap();

    let body: Value = client
        .post(format!("{}/classes/insw/search", base))
        .json(&json!({ "query": "Live horses 0101", "top_k": 1 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["class"], "insw");
    let hits = body["hits"].as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["payload"]["key"], "insw:0101");
}
