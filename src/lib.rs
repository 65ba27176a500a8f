//! # Awful RAG (library root)
//!
//! Per-user retrieval-augmented generation. Every user owns an ordered list of
//! documents and a parallel vector index persisted side by side; a query embeds
//! the question, pulls the closest documents, and asks a generation backend to
//! answer from them.
//!
//! - Vector search and durable per-user storage (`vector_index`, `index_store`).
//! - Embedding models (`embedding`) and an optional remote vector mirror (`remote`).
//! - Generation backends and prompt rendering (`backend`, `prompt`).
//! - The per-request retriever and the orchestrating service (`retriever`, `service`).
//! - Surfaces: the `arag` CLI (`commands`) and the HTTP server (`server`).
//!
//! ## Quick look
//!
//! ```no_run
//! use std::sync::Arc;
//! use awful_rag::config::RagConfig;
//! use awful_rag::embedding::HashingEmbedder;
//! use awful_rag::service::{QueryRequest, RagService};
//!
//! # async fn demo() -> awful_rag::error::Result<()> {
//! let config = RagConfig::from_env()?;
//! let service = RagService::new(config, Arc::new(HashingEmbedder::new(512)))?;
//!
//! service
//!     .add_documents("u1", vec!["Paris is the capital of France.".into()])
//!     .await?;
//! let reply = service
//!     .query(&QueryRequest::new("u1", "What is the capital of France?"))
//!     .await;
//! println!("{}", serde_json::to_string(&reply)?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//! - [`backend`], [`commands`], [`config`], [`embedding`], [`error`], [`index_store`],
//!   [`prompt`], [`remote`], [`retriever`], [`server`], [`service`], [`vector_index`]

use std::path::PathBuf;

use directories::ProjectDirs;

use crate::error::{RagError, Result};

pub mod backend;
pub mod commands;
pub mod config;
pub mod embedding;
pub mod error;
pub mod index_store;
pub mod prompt;
pub mod remote;
pub mod retriever;
pub mod server;
pub mod service;
pub mod vector_index;

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "awful-sec", "arag")
        .ok_or_else(|| RagError::Config("unable to determine the home directory".into()))
}

/// Return the per-platform configuration directory used by `arag`.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("com", "awful-sec", "arag")`. The directory is **not** created.
///
/// # Examples
/// ```rust
/// let cfg = awful_rag::config_dir().expect("has a config dir");
/// println!("config at {}", cfg.display());
/// ```
pub fn config_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().to_path_buf())
}

/// Return the per-platform data directory, home of the per-user indices
/// unless `index_dir` is configured.
pub fn data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}
