//! Qdrant-backed [`VectorIndex`] over the REST API.
//!
//! One `QdrantIndex` per class collection. Point ids are the UUIDs from
//! [`point_id`](docsync_core::fingerprint::point_id); the fingerprint and
//! namespaced key live in the payload, so [`exists`](VectorIndex::exists)
//! is a payload-only point lookup.
//!
//! Connection failures and 5xx responses are retried; once retries are
//! spent they surface as [`PipelineError::StoreUnavailable`], which aborts
//! the run. A 4xx on upsert is [`PipelineError::StoreRejected`] and only
//! fails that document.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use docsync_core::index::{rank_hits, VectorIndex, FINGERPRINT_FIELD, KEY_FIELD};
use docsync_core::models::{IndexedDocument, SearchHit, StoredFingerprint};
use docsync_core::PipelineError;

use crate::config::VectorStoreConfig;
use crate::retry::{is_retryable_error, should_retry, Backoff};

/// Upper bound on points requested while resolving ties at the `top_k` cut.
const MAX_SEARCH_LIMIT: usize = 1024;

pub struct QdrantIndex {
    http: reqwest::Client,
    base_url: String,
    collection: String,
    api_key: Option<String>,
    backoff: Backoff,
}

#[derive(Deserialize)]
struct QdrantResponse<T> {
    result: T,
}

#[derive(Deserialize)]
struct CollectionInfo {
    config: CollectionConfig,
}

#[derive(Deserialize)]
struct CollectionConfig {
    params: CollectionParams,
}

#[derive(Deserialize)]
struct CollectionParams {
    vectors: VectorParams,
}

#[derive(Deserialize)]
struct VectorParams {
    size: usize,
}

#[derive(Deserialize)]
struct RetrievedPoint {
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Deserialize)]
struct ScoredPoint {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<Value>,
}

impl QdrantIndex {
    pub fn new(
        config: &VectorStoreConfig,
        collection: &str,
        api_key: Option<String>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            api_key,
            backoff: Backoff::new(config.max_attempts, config.retry_base_ms),
        })
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.collection, suffix)
    }

    /// Send with retries. Returns the final response whatever its status;
    /// only exhausted transport failures and 5xx become errors here.
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, PipelineError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut request = self.http.request(method.clone(), url);
            if let Some(key) = &self.api_key {
                request = request.header("api-key", key);
            }
            if let Some(body) = body {
                request = request.json(body);
            }
            match request.send().await {
                Ok(resp) if should_retry(resp.status()) => {
                    let status = resp.status();
                    if self.backoff.can_retry(attempt) {
                        warn!(collection = %self.collection, attempt, %status, "vector store request failed, retrying");
                        self.backoff.wait(attempt).await;
                        continue;
                    }
                    let body = resp.text().await.unwrap_or_default();
                    return Err(PipelineError::StoreUnavailable(format!(
                        "{} {} returned {}: {}",
                        method, url, status, body
                    )));
                }
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if is_retryable_error(&e) && self.backoff.can_retry(attempt) {
                        warn!(collection = %self.collection, attempt, error = %e, "vector store unreachable, retrying");
                        self.backoff.wait(attempt).await;
                        continue;
                    }
                    return Err(PipelineError::StoreUnavailable(format!(
                        "{} {}: {}",
                        method, url, e
                    )));
                }
            }
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, PipelineError> {
        resp.json::<QdrantResponse<T>>()
            .await
            .map(|r| r.result)
            .map_err(|e| PipelineError::StoreUnavailable(format!("invalid Qdrant response: {}", e)))
    }

    async fn unexpected(resp: reqwest::Response) -> PipelineError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        PipelineError::StoreUnavailable(format!("Qdrant returned {}: {}", status, body))
    }

    /// Nearest points in Qdrant's own order (descending score).
    async fn query_points(&self, vector: &[f32], limit: usize) -> Result<Vec<SearchHit>, PipelineError> {
        let body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        let resp = self
            .send(Method::POST, &self.collection_url("/points/search"), Some(&body))
            .await?;
        if !resp.status().is_success() {
            return Err(Self::unexpected(resp).await);
        }
        let points: Vec<ScoredPoint> = Self::read_json(resp).await?;
        Ok(points
            .into_iter()
            .map(|p| SearchHit {
                id: point_id_string(&p.id),
                score: p.score,
                payload: p.payload.unwrap_or(Value::Null),
            })
            .collect())
    }
}

fn point_id_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_collection(&self, dims: usize) -> Result<(), PipelineError> {
        let url = self.collection_url("");
        let resp = self.send(Method::GET, &url, None).await?;
        match resp.status() {
            StatusCode::OK => {
                let info: CollectionInfo = Self::read_json(resp).await?;
                let size = info.config.params.vectors.size;
                if size != dims {
                    return Err(PipelineError::StoreUnavailable(format!(
                        "collection {} has {}-dimension vectors, expected {}",
                        self.collection, size, dims
                    )));
                }
                debug!(collection = %self.collection, dims, "collection present");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                let body = json!({ "vectors": { "size": dims, "distance": "Cosine" } });
                let resp = self.send(Method::PUT, &url, Some(&body)).await?;
                if !resp.status().is_success() {
                    return Err(Self::unexpected(resp).await);
                }
                info!(collection = %self.collection, dims, "created collection");
                Ok(())
            }
            _ => Err(Self::unexpected(resp).await),
        }
    }

    async fn exists(&self, id: &str) -> Result<Option<StoredFingerprint>, PipelineError> {
        let body = json!({
            "ids": [id],
            "with_payload": { "include": [FINGERPRINT_FIELD, KEY_FIELD] },
            "with_vector": false,
        });
        let resp = self
            .send(Method::POST, &self.collection_url("/points"), Some(&body))
            .await?;
        // No collection yet (e.g. a dry run before the first sync): nothing stored.
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::unexpected(resp).await);
        }
        let points: Vec<RetrievedPoint> = Self::read_json(resp).await?;
        let Some(payload) = points.into_iter().next().and_then(|p| p.payload) else {
            return Ok(None);
        };
        let field = |name: &str| payload.get(name).and_then(Value::as_str).map(str::to_string);
        // A point without a fingerprint was not written by this pipeline; treat it as changed.
        Ok(Some(StoredFingerprint {
            fingerprint: field(FINGERPRINT_FIELD).unwrap_or_default(),
            key: field(KEY_FIELD),
        }))
    }

    async fn upsert(&self, doc: &IndexedDocument) -> Result<(), PipelineError> {
        let body = json!({
            "points": [{
                "id": doc.id,
                "vector": doc.vector,
                "payload": doc.payload,
            }]
        });
        let resp = self
            .send(Method::PUT, &self.collection_url("/points?wait=true"), Some(&body))
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        if status.is_client_error() {
            return Err(PipelineError::StoreRejected(format!(
                "upsert of {} rejected ({}): {}",
                doc.key, status, text
            )));
        }
        Err(PipelineError::StoreUnavailable(format!(
            "upsert of {} failed ({}): {}",
            doc.key, status, text
        )))
    }

    /// Qdrant applies `limit` before our tie-break, so the query widens
    /// until every point tied with the last kept hit has been returned.
    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<SearchHit>, PipelineError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let mut limit = top_k + 1;
        loop {
            let mut hits = self.query_points(vector, limit).await?;
            let boundary_tied = hits.len() == limit
                && hits[top_k - 1].score == hits[limit - 1].score;
            if !boundary_tied || limit >= MAX_SEARCH_LIMIT {
                rank_hits(&mut hits);
                hits.truncate(top_k);
                return Ok(hits);
            }
            limit = (limit * 2).min(MAX_SEARCH_LIMIT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn index(server: &MockServer) -> QdrantIndex {
        let config = VectorStoreConfig {
            url: server.uri(),
            api_key_env: "QDRANT_API_KEY".into(),
            timeout_secs: 5,
            max_attempts: 2,
            retry_base_ms: 1,
        };
        QdrantIndex::new(&config, "sop", Some("qk".into())).unwrap()
    }

    fn doc() -> IndexedDocument {
        IndexedDocument {
            id: "7f1c1a52-0000-5000-8000-000000000000".into(),
            key: "sop:IK_A".into(),
            vector: vec![0.6, 0.8],
            payload: json!({ "fingerprint": "abc", "key": "sop:IK_A" }),
            fingerprint: "abc".into(),
        }
    }

    #[tokio::test]
    async fn creates_missing_collection_with_cosine_distance() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/sop"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/collections/sop"))
            .and(header("api-key", "qk"))
            .and(body_partial_json(json!({ "vectors": { "size": 2, "distance": "Cosine" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": true })))
            .expect(1)
            .mount(&server)
            .await;

        index(&server).ensure_collection(2).await.unwrap();
    }

    #[tokio::test]
    async fn dimension_mismatch_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/sop"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": { "config": { "params": { "vectors": { "size": 768, "distance": "Cosine" } } } }
            })))
            .mount(&server)
            .await;

        let err = index(&server).ensure_collection(2).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn exists_reads_fingerprint_and_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/sop/points"))
            .and(body_partial_json(json!({ "with_vector": false })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [ { "id": "x", "payload": { "fingerprint": "abc", "key": "sop:IK_A" } } ]
            })))
            .mount(&server)
            .await;

        let stored = index(&server).exists("x").await.unwrap().unwrap();
        assert_eq!(stored.fingerprint, "abc");
        assert_eq!(stored.key.as_deref(), Some("sop:IK_A"));
    }

    #[tokio::test]
    async fn exists_returns_none_for_missing_point() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/sop/points"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": [] })))
            .mount(&server)
            .await;

        assert!(index(&server).exists("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_waits_and_maps_client_errors_to_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/collections/sop/points"))
            .and(query_param("wait", "true"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad payload"))
            .mount(&server)
            .await;

        let err = index(&server).upsert(&doc()).await.unwrap_err();
        assert!(matches!(err, PipelineError::StoreRejected(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn persistent_server_errors_are_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/collections/sop/points"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let err = index(&server).upsert(&doc()).await.unwrap_err();
        assert!(matches!(err, PipelineError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn search_results_are_ranked_with_id_tie_break() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/sop/points/search"))
            .and(body_partial_json(json!({ "limit": 4 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [
                    { "id": "b", "score": 0.5, "payload": {} },
                    { "id": "c", "score": 0.9, "payload": {} },
                    { "id": "a", "score": 0.5, "payload": {} }
                ]
            })))
            .mount(&server)
            .await;

        let hits = index(&server).search(&[0.6, 0.8], 3).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn search_widens_until_ties_at_the_cut_are_complete() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/sop/points/search"))
            .and(body_partial_json(json!({ "limit": 3 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [
                    { "id": "c", "score": 0.9, "payload": {} },
                    { "id": "b", "score": 0.5, "payload": {} },
                    { "id": "d", "score": 0.5, "payload": {} }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/collections/sop/points/search"))
            .and(body_partial_json(json!({ "limit": 6 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [
                    { "id": "c", "score": 0.9, "payload": {} },
                    { "id": "b", "score": 0.5, "payload": {} },
                    { "id": "d", "score": 0.5, "payload": {} },
                    { "id": "a", "score": 0.5, "payload": {} },
                    { "id": "e", "score": 0.1, "payload": {} }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let hits = index(&server).search(&[0.6, 0.8], 2).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }
}
