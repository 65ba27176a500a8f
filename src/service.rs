//! # RAG service
//!
//! Orchestration of the two request flows over the per-user stores.
//!
//! **Add:** load the user's record (absent is an empty base), merge the new
//! documents after the existing ones, embed, rebuild the index, persist, then
//! mirror to the remote store if one is configured. Everything before the
//! save works on an in-memory copy, so a failed embed never touches the
//! durable record. Adds for the same user are serialised by a per-user lock.
//!
//! **Query:** resolve the model, load the user's record (absent is
//! [`RagError::NotFound`]), embed the query, search, compose the prompt, and
//! ask the resolved generation backend.
//!
//! The `*_reply` style entry points ([`RagService::add`], [`RagService::query`],
//! [`RagService::summarise_reply`]) never fail: every error becomes an
//! `{"error": ...}` payload carrying the HTTP status it maps to.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::backend::Backends;
use crate::config::RagConfig;
use crate::embedding::{Embedder, load_embedder};
use crate::error::{RagError, Result};
use crate::index_store::IndexStore;
use crate::prompt::Prompt;
use crate::remote::{PineconeStore, RemoteVectorStore};
use crate::retriever::{RetrievalBackend, RetrievalResult, Retriever};

/// Keyed async mutexes, one per user id.
///
/// An entry lives only while some caller holds or waits on it, so the map
/// stays bounded by the number of users with requests in flight.
#[derive(Debug, Default)]
struct UserLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held lock for one user; evicts the map entry on drop when no one else wants it.
struct UserGuard<'a> {
    locks: &'a UserLocks,
    user_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl UserLocks {
    async fn acquire(&self, user_id: &str) -> UserGuard<'_> {
        let lock = self.locks.entry(user_id.to_string()).or_default().clone();
        let guard = lock.lock_owned().await;
        UserGuard {
            locks: self,
            user_id: user_id.to_string(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        // release first so only the map's own Arc can remain
        drop(self.guard.take());
        self.locks
            .locks
            .remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// What an add did.
#[derive(Debug, Clone, PartialEq)]
pub struct AddOutcome {
    pub added: usize,
    pub total: usize,
    /// Set when the local save succeeded but the remote mirror did not.
    pub warning: Option<String>,
}

/// Error payload returned by every entry point instead of failing.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ErrorReply {
    pub error: String,
    /// Stable tag from [`RagError::kind`].
    pub kind: &'static str,
    /// Documents retrieved before generation failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieved_docs: Option<Vec<String>>,
    #[serde(skip)]
    pub status: u16,
}

impl ErrorReply {
    pub fn from_error(err: &RagError) -> Self {
        Self {
            error: err.to_string(),
            kind: err.kind(),
            retrieved_docs: None,
            status: err.status_code(),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum AddReply {
    Added {
        status: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
    Failed(ErrorReply),
}

/// A query as received from the CLI or the HTTP API.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct QueryRequest {
    #[serde(alias = "userId")]
    pub user_id: String,
    pub query: String,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub backend: Option<RetrievalBackend>,
    #[serde(default)]
    pub top_k: Option<usize>,
}

impl QueryRequest {
    pub fn new(user_id: &str, query: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            query: query.to_string(),
            model_name: None,
            backend: None,
            top_k: None,
        }
    }

    pub fn model(mut self, model_name: &str) -> Self {
        self.model_name = Some(model_name.to_string());
        self
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct QueryAnswer {
    pub query: String,
    pub answer: String,
    pub retrieved_docs: Vec<String>,
    pub model_name: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum QueryReply {
    Answer(QueryAnswer),
    Failed(ErrorReply),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum SummaryReply {
    Summary { summary: String },
    Failed(ErrorReply),
}

macro_rules! impl_status {
    ($($reply:ident),*) => {$(
        impl $reply {
            /// HTTP status for this payload.
            pub fn status(&self) -> u16 {
                match self {
                    $reply::Failed(e) => e.status,
                    _ => 200,
                }
            }
        }
    )*};
}

impl_status!(AddReply, QueryReply, SummaryReply);

pub struct RagService {
    config: RagConfig,
    store: IndexStore,
    embedder: Arc<dyn Embedder>,
    backends: Backends,
    remote: Option<Arc<dyn RemoteVectorStore>>,
    locks: UserLocks,
}

impl RagService {
    /// Build every component named by `config`: store, embedder, backends and
    /// the optional remote mirror.
    pub fn from_config(config: RagConfig) -> Result<Self> {
        let embedder = load_embedder(&config.embedding)?;
        let mut service = Self::new(config, embedder)?;
        if let Some(remote) = &service.config.remote {
            let store = PineconeStore::new(remote, service.config.generation_timeout())?;
            service.remote = Some(Arc::new(store));
        }
        Ok(service)
    }

    /// Like [`from_config`](Self::from_config) with a caller-supplied embedder
    /// and no remote mirror.
    pub fn new(config: RagConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let store = IndexStore::new(config.index_dir()?)?;
        let backends = Backends::from_config(&config)?;
        Ok(Self {
            config,
            store,
            embedder,
            backends,
            remote: None,
            locks: UserLocks::default(),
        })
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteVectorStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    fn retriever(&self, user_id: &str) -> Retriever {
        let retriever = Retriever::new(
            user_id,
            self.embedder.clone(),
            self.config.embedding_timeout(),
        );
        match &self.remote {
            Some(remote) => retriever.with_remote(remote.clone()),
            None => retriever,
        }
    }

    /// Append `documents` to `user_id`'s corpus.
    ///
    /// # Errors
    /// [`RagError::InvalidInput`] for a blank user id, [`RagError::EmptyInput`]
    /// for an empty list, then any load, embed or save error. Remote mirror
    /// failures are reported in [`AddOutcome::warning`] instead.
    pub async fn add_documents(&self, user_id: &str, documents: Vec<String>) -> Result<AddOutcome> {
        if user_id.trim().is_empty() {
            return Err(RagError::InvalidInput("user_id must not be empty".into()));
        }
        if documents.is_empty() {
            return Err(RagError::EmptyInput("no documents given".into()));
        }
        let added = documents.len();

        let _guard = self.locks.acquire(user_id).await;
        let mut retriever = self.retriever(user_id);
        let existed = retriever.load(&self.store)?;

        if self.config.embedding.incremental && existed {
            retriever.append_documents(documents).await?;
        } else {
            let mut merged = retriever.documents().to_vec();
            merged.extend(documents);
            retriever.embed_documents(merged).await?;
        }
        retriever.save(&self.store)?;
        info!("Added {} documents for {} ({} total)", added, user_id, retriever.len());

        let mut warning = None;
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.upsert(user_id, retriever.remote_records()).await {
                warn!("Remote mirror for {} not updated: {}", user_id, e);
                warning = Some(format!("saved locally, but the remote mirror was not updated: {e}"));
            }
        }

        Ok(AddOutcome {
            added,
            total: retriever.len(),
            warning,
        })
    }

    /// [`add_documents`](Self::add_documents) as a reply payload.
    pub async fn add(&self, user_id: &str, documents: Vec<String>) -> AddReply {
        match self.add_documents(user_id, documents).await {
            Ok(outcome) => AddReply::Added {
                status: "success".to_string(),
                message: format!("{} documents added for {}", outcome.added, user_id),
                warning: outcome.warning,
            },
            Err(e) => {
                error!("Add for {} failed: {}", user_id, e);
                AddReply::Failed(ErrorReply::from_error(&e))
            }
        }
    }

    /// Load `user_id`'s corpus and rank it against `query`.
    ///
    /// # Errors
    /// [`RagError::NotFound`] when the user has no record; retrieval errors otherwise.
    pub async fn retrieve(
        &self,
        user_id: &str,
        query: &str,
        top_k: usize,
        backend: RetrievalBackend,
    ) -> Result<RetrievalResult> {
        if !self.store.exists(user_id) {
            return Err(RagError::NotFound(user_id.to_string()));
        }
        let mut retriever = self.retriever(user_id);
        let found = {
            let _guard = self.locks.acquire(user_id).await;
            retriever.load(&self.store)?
        };
        if !found {
            return Err(RagError::NotFound(user_id.to_string()));
        }
        retriever.retrieve(query, top_k, backend).await
    }

    /// Answer `request` from the user's documents.
    ///
    /// Failures after a successful retrieval keep the retrieved documents in
    /// the error payload.
    pub async fn answer(&self, request: &QueryRequest) -> std::result::Result<QueryAnswer, ErrorReply> {
        let model_name = request
            .model_name
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.config.generation.default_model.clone());
        let top_k = request.top_k.unwrap_or(self.config.retrieval.top_k);
        let backend = request.backend.unwrap_or(self.config.retrieval.default_backend);

        let fail = |e: RagError| {
            error!("Query for {} failed: {}", request.user_id, e);
            ErrorReply::from_error(&e)
        };

        if top_k == 0 {
            return Err(fail(RagError::InvalidInput("top_k must be at least 1".into())));
        }
        let (generator, model) = self.backends.resolve(&model_name).map_err(fail)?;
        let retrieval = self
            .retrieve(&request.user_id, &request.query, top_k, backend)
            .await
            .map_err(fail)?;

        let prompt = Prompt::rag(&retrieval.system_prompt, &retrieval.context, &retrieval.query);
        match generator
            .generate(&model, &prompt, self.config.generation.max_tokens)
            .await
        {
            Ok(answer) => Ok(QueryAnswer {
                query: retrieval.query,
                answer,
                retrieved_docs: retrieval.retrieved_docs,
                model_name,
            }),
            Err(e) => {
                let mut reply = fail(e);
                reply.retrieved_docs = Some(retrieval.retrieved_docs);
                Err(reply)
            }
        }
    }

    /// [`answer`](Self::answer) as a reply payload.
    pub async fn query(&self, request: &QueryRequest) -> QueryReply {
        match self.answer(request).await {
            Ok(answer) => QueryReply::Answer(answer),
            Err(reply) => QueryReply::Failed(reply),
        }
    }

    /// Summarise `text` with `model`, or the configured summary model.
    pub async fn summarise(&self, text: &str, model: Option<&str>) -> Result<String> {
        if text.trim().is_empty() {
            return Err(RagError::EmptyInput("no text to summarise".into()));
        }
        let model_name = model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(self.config.generation.summary_model.as_str());
        let (generator, model) = self.backends.resolve(model_name)?;
        generator
            .generate(
                &model,
                &Prompt::summary(text),
                self.config.generation.summary_max_tokens,
            )
            .await
    }

    /// [`summarise`](Self::summarise) as a reply payload.
    pub async fn summarise_reply(&self, text: &str, model: Option<&str>) -> SummaryReply {
        match self.summarise(text, model).await {
            Ok(summary) => SummaryReply::Summary { summary },
            Err(e) => {
                error!("Summary failed: {}", e);
                SummaryReply::Failed(ErrorReply::from_error(&e))
            }
        }
    }
}
