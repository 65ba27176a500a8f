//! This module defines the command-line interface for `arag` using `clap`.
//!
//! It provides a `Cli` struct that represents the parsed command-line arguments,
//! and a `Commands` enum with the available subcommands and their options.
//!
//! # Examples
//!
//! ```no_run
//! use clap::Parser;
//! use awful_rag::commands::{Cli, Commands};
//!
//! let cli = Cli::parse();
//! match cli.command {
//!     Commands::Add { user_id, .. } => println!("adding for {user_id}"),
//!     _ => {}
//! }
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::error::{RagError, Result};
use crate::retriever::RetrievalBackend;

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Auto)]
pub struct Cli {
    /// Configuration file. Defaults to `config.yaml` in the platform config directory.
    #[arg(long, short = 'c', global = true, env = "AWFUL_RAG_CONFIG")]
    pub config: Option<PathBuf>,

    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

/// Represents the available subcommands and their options.
#[derive(Subcommand, Debug)]
#[command(about, long_about = None)]
pub enum Commands {
    /// Append documents to a user's corpus.
    ///
    /// `documents` is a JSON array of strings (`'["a", "b"]'`) or a single JSON
    /// string (`'"a"'`). Use `--raw` to pass plain text as one document.
    #[clap(name = "add", alias = "a")]
    Add {
        user_id: String,

        documents: String,

        /// Treat `documents` as a single plain-text document.
        #[arg(long)]
        raw: bool,
    },

    /// Answer a question from a user's documents.
    #[clap(name = "query", alias = "q")]
    Query {
        user_id: String,

        query: String,

        /// Model identifier, e.g. `llama3.2:1b`, `gemini-2.5-flash` or `ollama/<model>`.
        model_name: Option<String>,

        /// Where to run the nearest-neighbour search.
        #[arg(value_enum)]
        backend: Option<RetrievalBackend>,

        #[arg(long, short = 'k')]
        top_k: Option<usize>,
    },

    /// Summarise a piece of text.
    #[clap(name = "summarise", alias = "summarize")]
    Summarise {
        text: String,

        #[arg(long, short = 'm')]
        model: Option<String>,
    },

    /// Run the HTTP server.
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(long, short = 'p')]
        port: Option<u16>,
    },

    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

/// Parse the `documents` argument of `arag add`.
///
/// # Errors
/// [`RagError::InvalidInput`] for anything but a JSON array of strings or a
/// JSON string when `raw` is false.
pub fn parse_documents(input: &str, raw: bool) -> Result<Vec<String>> {
    if raw {
        if input.trim().is_empty() {
            return Err(RagError::EmptyInput("no document text given".into()));
        }
        return Ok(vec![input.to_string()]);
    }

    let value: serde_json::Value = serde_json::from_str(input).map_err(|_| {
        RagError::InvalidInput(
            "documents must be a JSON array of strings or a JSON string; use --raw for plain text"
                .into(),
        )
    })?;

    match value {
        serde_json::Value::String(document) => Ok(vec![document]),
        serde_json::Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                serde_json::Value::String(document) => Ok(document),
                other => Err(RagError::InvalidInput(format!(
                    "document {i} is not a string: {other}"
                ))),
            })
            .collect(),
        other => Err(RagError::InvalidInput(format!(
            "documents must be a JSON array of strings or a JSON string, got {other}"
        ))),
    }
}
