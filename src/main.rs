//! Main module for the Awful RAG CLI application (arag).
//!
//! Parses the command line, loads configuration, and dispatches to the
//! library. Every command prints exactly one JSON object on stdout, success or
//! error; logs go to stderr and are filtered with `RUST_LOG`.
//!
//! # Examples
//!
//! ```sh
//! arag init
//! arag add u1 '["Paris is the capital of France.", "The sun is a star."]'
//! arag query u1 "What is the capital of France?" llama3.2:1b local --top-k 1
//! arag serve --port 5000
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use awful_rag::commands::{self, Cli, Commands};
use awful_rag::config::{DEFAULT_CONFIG_YAML, RagConfig};
use awful_rag::error::{RagError, Result};
use awful_rag::server;
use awful_rag::service::{ErrorReply, QueryRequest, RagService};
use clap::Parser;
use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

static TRACING: OnceCell<()> = OnceCell::new();

fn main() -> ExitCode {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_writer(std::io::stderr)
            .init();
    });

    let cli = Cli::parse();
    let result = tokio::runtime::Runtime::new()
        .map_err(RagError::from)
        .and_then(|runtime| runtime.block_on(run(cli)));

    match result {
        Ok(code) => code,
        Err(e) => {
            print_json(&ErrorReply::from_error(&e));
            ExitCode::FAILURE
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => println!(r#"{{"error": "cannot encode reply: {e}"}}"#),
    }
}

fn exit_code(status: u16) -> ExitCode {
    if status == 200 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn config_path(cli_path: Option<PathBuf>) -> Result<PathBuf> {
    match cli_path {
        Some(path) => Ok(path),
        None => Ok(awful_rag::config_dir()?.join("config.yaml")),
    }
}

/// Config file if present, otherwise defaults; environment and validation either way.
fn load_config(path: &Path) -> Result<RagConfig> {
    if path.exists() {
        debug!("Loading config from {}", path.display());
        RagConfig::load(path)
    } else {
        debug!("No config at {}, using defaults", path.display());
        RagConfig::from_env()
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let path = config_path(cli.config)?;

    if let Commands::Init { force } = cli.command {
        return init(&path, force);
    }

    let mut config = load_config(&path)?;
    if let Commands::Serve { host, port } = &cli.command {
        if let Some(host) = host {
            config.server.host = host.clone();
        }
        if let Some(port) = port {
            config.server.port = *port;
        }
    }
    let service = RagService::from_config(config)?;

    match cli.command {
        Commands::Add {
            user_id,
            documents,
            raw,
        } => {
            let reply = match commands::parse_documents(&documents, raw) {
                Ok(documents) => service.add(&user_id, documents).await,
                Err(e) => {
                    print_json(&ErrorReply::from_error(&e));
                    return Ok(ExitCode::FAILURE);
                }
            };
            print_json(&reply);
            Ok(exit_code(reply.status()))
        }
        Commands::Query {
            user_id,
            query,
            model_name,
            backend,
            top_k,
        } => {
            let request = QueryRequest {
                user_id,
                query,
                model_name,
                backend,
                top_k,
            };
            let reply = service.query(&request).await;
            print_json(&reply);
            Ok(exit_code(reply.status()))
        }
        Commands::Summarise { text, model } => {
            let reply = service.summarise_reply(&text, model.as_deref()).await;
            print_json(&reply);
            Ok(exit_code(reply.status()))
        }
        Commands::Serve { .. } => {
            server::serve(Arc::new(service)).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Init { .. } => Ok(ExitCode::SUCCESS),
    }
}

/// Write the default configuration file.
fn init(path: &Path, force: bool) -> Result<ExitCode> {
    if path.exists() && !force {
        return Err(RagError::Config(format!(
            "{} already exists; pass --force to overwrite it",
            path.display()
        )));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    info!("Creating config file: {}", path.display());
    fs::write(path, DEFAULT_CONFIG_YAML)?;

    print_json(&json!({
        "status": "success",
        "message": format!("wrote {}", path.display()),
    }));
    Ok(ExitCode::SUCCESS)
}
