//! # Retriever
//!
//! A transient, per-request view of one user's corpus: the documents, their
//! [`FlatIndex`], and the embedder that produced it.
//!
//! A retriever is built for a single add or query, loaded from the
//! [`IndexStore`], used, and dropped. Nothing survives between requests except
//! what was saved.

use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::embedding::{Embedder, embed_with_timeout};
use crate::error::{RagError, Result};
use crate::index_store::IndexStore;
use crate::prompt::RAG_SYSTEM_PROMPT;
use crate::remote::{RemoteRecord, RemoteVectorStore};
use crate::vector_index::FlatIndex;

/// Separator between retrieved documents in the composed context.
pub const CONTEXT_SEPARATOR: &str = "\n\n";

/// Where nearest-neighbour search runs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalBackend {
    /// The user's persisted flat index.
    #[default]
    #[serde(alias = "faiss")]
    #[value(alias = "faiss")]
    Local,
    /// The configured remote vector store.
    #[serde(alias = "pinecone")]
    #[value(alias = "pinecone")]
    Remote,
}

/// Ranked documents for one query, with the prompt material built from them.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RetrievalResult {
    pub query: String,
    pub retrieved_docs: Vec<String>,
    pub system_prompt: String,
    /// `retrieved_docs` joined with [`CONTEXT_SEPARATOR`], closest first.
    pub context: String,
    /// Distance of each retrieved document, parallel to `retrieved_docs`.
    pub distances: Vec<f32>,
}

pub struct Retriever {
    user_id: String,
    embedder: Arc<dyn Embedder>,
    timeout: Duration,
    remote: Option<Arc<dyn RemoteVectorStore>>,
    index: FlatIndex,
    documents: Vec<String>,
}

impl Retriever {
    /// An empty retriever for `user_id`.
    pub fn new(user_id: &str, embedder: Arc<dyn Embedder>, timeout: Duration) -> Self {
        Self {
            user_id: user_id.to_string(),
            embedder,
            timeout,
            remote: None,
            index: FlatIndex::new(),
            documents: Vec::new(),
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteVectorStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn documents(&self) -> &[String] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Replace the working set with `user_id`'s saved record.
    ///
    /// Returns `false`, leaving the retriever empty, when the user has no record.
    pub fn load(&mut self, store: &IndexStore) -> Result<bool> {
        match store.load(&self.user_id)? {
            Some(record) => {
                self.index = record.index;
                self.documents = record.documents;
                Ok(true)
            }
            None => {
                self.index = FlatIndex::new();
                self.documents.clear();
                Ok(false)
            }
        }
    }

    pub fn save(&self, store: &IndexStore) -> Result<()> {
        store.save(&self.user_id, &self.index, &self.documents)
    }

    /// Embed `documents` and make them the whole working set.
    ///
    /// The new index is staged before anything is replaced, so a failure
    /// leaves the previous working set in place.
    ///
    /// # Errors
    /// [`RagError::EmptyInput`] for an empty list; embedding errors otherwise.
    pub async fn embed_documents(&mut self, documents: Vec<String>) -> Result<()> {
        if documents.is_empty() {
            return Err(RagError::EmptyInput("no documents to embed".into()));
        }

        let vectors = embed_with_timeout(self.embedder.clone(), documents.clone(), self.timeout).await?;
        let mut index = FlatIndex::new();
        index.build(vectors)?;

        self.index = index;
        self.documents = documents;
        debug!("Embedded {} documents for {}", self.documents.len(), self.user_id);
        Ok(())
    }

    /// Embed only `documents` and append them after the existing working set.
    ///
    /// Falls back to [`embed_documents`](Self::embed_documents) when nothing is
    /// loaded yet.
    pub async fn append_documents(&mut self, documents: Vec<String>) -> Result<()> {
        if documents.is_empty() {
            return Err(RagError::EmptyInput("no documents to embed".into()));
        }
        if !self.index.is_built() {
            return self.embed_documents(documents).await;
        }

        let vectors = embed_with_timeout(self.embedder.clone(), documents.clone(), self.timeout).await?;
        let mut index = self.index.clone();
        index.add(vectors)?;

        self.index = index;
        self.documents.extend(documents);
        Ok(())
    }

    /// The `top_k` documents closest to `query`, and the prompt material built from them.
    ///
    /// # Errors
    /// - [`RagError::NotBuilt`] when no documents are loaded.
    /// - [`RagError::EmptyInput`] for a blank query.
    /// - [`RagError::BackendUnavailable`] when `backend` is remote but no remote
    ///   store is configured.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        backend: RetrievalBackend,
    ) -> Result<RetrievalResult> {
        if !self.index.is_built() || self.documents.is_empty() {
            return Err(RagError::NotBuilt(format!(
                "no documents loaded for user {}",
                self.user_id
            )));
        }
        if query.trim().is_empty() {
            return Err(RagError::EmptyInput("query text is empty".into()));
        }

        let mut vectors =
            embed_with_timeout(self.embedder.clone(), vec![query.to_string()], self.timeout).await?;
        let query_vector = vectors.pop().unwrap_or_default();

        let hits = match backend {
            RetrievalBackend::Local => self.search_local(&query_vector, top_k)?,
            RetrievalBackend::Remote => {
                let remote = self.remote.as_ref().ok_or_else(|| {
                    RagError::BackendUnavailable("no remote vector store is configured".into())
                })?;
                match self.search_remote(remote.as_ref(), &query_vector, top_k).await {
                    Ok(hits) => hits,
                    Err(e) => {
                        warn!(
                            "Remote search failed for {}, answering from the local index: {}",
                            self.user_id, e
                        );
                        self.search_local(&query_vector, top_k)?
                    }
                }
            }
        };

        let (retrieved_docs, distances): (Vec<String>, Vec<f32>) = hits.into_iter().unzip();
        debug!(
            "Retrieved {} documents for {} via {:?}",
            retrieved_docs.len(),
            self.user_id,
            backend
        );

        Ok(RetrievalResult {
            query: query.to_string(),
            context: retrieved_docs.join(CONTEXT_SEPARATOR),
            retrieved_docs,
            system_prompt: RAG_SYSTEM_PROMPT.to_string(),
            distances,
        })
    }

    fn search_local(&self, query_vector: &[f32], top_k: usize) -> Result<Vec<(String, f32)>> {
        Ok(self
            .index
            .search(query_vector, top_k)?
            .into_iter()
            .filter_map(|hit| {
                self.documents
                    .get(hit.position)
                    .map(|doc| (doc.clone(), hit.distance))
            })
            .collect())
    }

    async fn search_remote(
        &self,
        remote: &dyn RemoteVectorStore,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<(String, f32)>> {
        let matches = remote.query(&self.user_id, query_vector, top_k).await?;
        Ok(matches
            .into_iter()
            .filter_map(|m| {
                let doc = m
                    .position
                    .and_then(|p| self.documents.get(p).cloned())
                    .or(m.text)?;
                Some((doc, m.distance))
            })
            .take(top_k)
            .collect())
    }

    /// Every vector of the working set, ready to mirror remotely.
    pub fn remote_records(&self) -> Vec<RemoteRecord> {
        self.index
            .vectors()
            .zip(&self.documents)
            .enumerate()
            .map(|(position, (values, text))| RemoteRecord {
                position,
                values: values.to_vec(),
                text: text.clone(),
            })
            .collect()
    }
}
