//! # Remote vector store
//!
//! A managed vector database can mirror every user's vectors so retrieval
//! works without the local index. Records are namespaced by user:
//! the vector at position `i` of user `u` is stored as `"{u}-{i}"` with
//! `{"text": <document>, "user": <u>}` metadata.
//!
//! The local [`IndexStore`](crate::index_store::IndexStore) stays the source
//! of truth. Writes here are best effort (see [`crate::service`]) and every add
//! rewrites all of a user's ids, so a failed mirror write heals on the next
//! successful one.
//!
//! [`PineconeStore`] speaks the Pinecone data-plane REST API
//! (`/vectors/upsert`, `/query`).

use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::backend::read_json;
use crate::config::RemoteConfig;
use crate::error::{RagError, Result};

/// Vectors per upsert request. Batches are sent concurrently.
const UPSERT_BATCH: usize = 100;

/// One vector to mirror.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub position: usize,
    pub values: Vec<f32>,
    pub text: String,
}

/// One ranked hit from the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMatch {
    pub id: String,
    /// Position parsed back out of the id, if it has the `"{user}-{n}"` shape.
    pub position: Option<usize>,
    /// Lower is closer, whatever the remote metric.
    pub distance: f32,
    pub text: Option<String>,
}

/// Similarity metric the remote index was created with.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemoteMetric {
    #[default]
    Euclidean,
    Cosine,
    Dotproduct,
}

impl RemoteMetric {
    /// Map a remote score onto "lower is closer".
    pub fn distance(self, score: f32) -> f32 {
        match self {
            RemoteMetric::Euclidean => score,
            RemoteMetric::Cosine | RemoteMetric::Dotproduct => -score,
        }
    }
}

/// Identifier of the vector at `position` in `user_id`'s corpus.
pub fn record_id(user_id: &str, position: usize) -> String {
    format!("{user_id}-{position}")
}

fn position_from_id(user_id: &str, id: &str) -> Option<usize> {
    id.strip_prefix(user_id)?.strip_prefix('-')?.parse().ok()
}

/// Order matches like the local index does: ascending distance, then position.
pub fn rank_matches(mut matches: Vec<RemoteMatch>, top_k: usize) -> Vec<RemoteMatch> {
    matches.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then(match (a.position, b.position) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.id.cmp(&b.id),
            })
    });
    matches.truncate(top_k);
    matches
}

/// A remote nearest-neighbour service holding per-user vectors.
#[async_trait]
pub trait RemoteVectorStore: Send + Sync {
    /// Insert or overwrite `records` for `user_id`.
    async fn upsert(&self, user_id: &str, records: Vec<RemoteRecord>) -> Result<()>;

    /// Up to `top_k` of `user_id`'s vectors closest to `vector`, ranked with [`rank_matches`].
    async fn query(&self, user_id: &str, vector: &[f32], top_k: usize) -> Result<Vec<RemoteMatch>>;
}

/// Pinecone data-plane client.
#[derive(Debug, Clone)]
pub struct PineconeStore {
    client: reqwest::Client,
    host: String,
    api_key: String,
    namespace: String,
    metric: RemoteMetric,
}

#[derive(Serialize)]
struct UpsertVector<'a> {
    id: String,
    values: &'a [f32],
    metadata: serde_json::Value,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Deserialize)]
struct QueryMatch {
    id: String,
    score: f32,
    #[serde(default)]
    metadata: Option<MatchMetadata>,
}

#[derive(Deserialize)]
struct MatchMetadata {
    text: Option<String>,
}

impl PineconeStore {
    pub fn new(config: &RemoteConfig, timeout: Duration) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| RagError::Config("remote vector store needs an API key".into()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RagError::Config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            host: config.host.trim_end_matches('/').to_string(),
            api_key,
            namespace: config.namespace.clone().unwrap_or_default(),
            metric: config.metric,
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.host, path))
            .header("Api-Key", &self.api_key)
    }

    async fn upsert_batch(&self, user_id: &str, batch: &[RemoteRecord]) -> Result<()> {
        let vectors: Vec<UpsertVector> = batch
            .iter()
            .map(|record| UpsertVector {
                id: record_id(user_id, record.position),
                values: &record.values,
                metadata: json!({ "text": record.text, "user": user_id }),
            })
            .collect();
        debug!("Upserting {} vectors for {}", vectors.len(), user_id);

        let response = self
            .post("/vectors/upsert")
            .json(&json!({ "vectors": vectors, "namespace": self.namespace }))
            .send()
            .await?;
        let _: serde_json::Value = read_json(response, "remote vector store").await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteVectorStore for PineconeStore {
    async fn upsert(&self, user_id: &str, records: Vec<RemoteRecord>) -> Result<()> {
        try_join_all(
            records
                .chunks(UPSERT_BATCH)
                .map(|batch| self.upsert_batch(user_id, batch)),
        )
        .await?;
        Ok(())
    }

    async fn query(&self, user_id: &str, vector: &[f32], top_k: usize) -> Result<Vec<RemoteMatch>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let response = self
            .post("/query")
            .json(&json!({
                "namespace": self.namespace,
                "vector": vector,
                "topK": top_k,
                "includeMetadata": true,
                "includeValues": false,
                "filter": { "user": { "$eq": user_id } },
            }))
            .send()
            .await?;
        let body: QueryResponse = read_json(response, "remote vector store").await?;

        let matches = body
            .matches
            .into_iter()
            .map(|m| RemoteMatch {
                position: position_from_id(user_id, &m.id),
                distance: self.metric.distance(m.score),
                text: m.metadata.and_then(|meta| meta.text),
                id: m.id,
            })
            .collect();
        Ok(rank_matches(matches, top_k))
    }
}
