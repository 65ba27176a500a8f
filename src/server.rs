//! # HTTP server
//!
//! Thin axum layer over [`RagService`]. Every handler answers with the
//! service's reply payload; failures carry the status of the underlying
//! [`RagError`](crate::error::RagError) (404 unknown user, 400 bad input or
//! unsupported model, 502 backend trouble, 500 otherwise).
//!
//! | Method | Path                | Body / query                                         |
//! |--------|---------------------|------------------------------------------------------|
//! | GET    | `/`                 | welcome text                                         |
//! | GET    | `/rag/`             | `user_prompt`, optional `user_id`, `model_name`, `top_k` |
//! | GET    | `/summarise/`       | `text`                                               |
//! | POST   | `/api/add-docs`     | `{user_id, documents}`                               |
//! | POST   | `/api/query`        | `{user_id, query, model_name?, backend?, top_k?}`    |
//! | POST   | `/api/summarize`    | `{text, model_name?}`                                |
//!
//! `userId` is accepted for `user_id`, and `/api/add-docs` takes a single
//! `text` string in place of `documents`. Query strings or bodies that fail to
//! decode get an `{"error", "kind": "invalid_input"}` payload with the
//! extractor's status.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{RagError, Result};
use crate::service::{ErrorReply, QueryReply, QueryRequest, RagService};

const WELCOME: &str = "Welcome to the Awful RAG server. POST /api/add-docs to index documents, \
                       POST /api/query to ask about them.";

#[derive(Deserialize)]
struct RagParams {
    user_prompt: String,
    #[serde(alias = "userId")]
    user_id: Option<String>,
    model_name: Option<String>,
    top_k: Option<usize>,
}

#[derive(Deserialize)]
struct SummariseParams {
    text: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Documents {
    Many(Vec<String>),
    One(String),
}

impl From<Documents> for Vec<String> {
    fn from(documents: Documents) -> Self {
        match documents {
            Documents::Many(many) => many,
            Documents::One(one) => vec![one],
        }
    }
}

#[derive(Deserialize)]
struct AddDocsBody {
    #[serde(alias = "userId")]
    user_id: String,
    #[serde(alias = "text")]
    documents: Documents,
}

#[derive(Deserialize)]
struct SummarizeBody {
    text: String,
    model_name: Option<String>,
}

fn reply<T: Serialize>(status: u16, body: T) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body)).into_response()
}

/// Extractor failures as the same `{"error"}` payload the service returns.
fn rejected(status: StatusCode, message: String) -> Response {
    let failure = ErrorReply::from_error(&RagError::InvalidInput(message));
    (status, Json(failure)).into_response()
}

fn query_rejected(rejection: QueryRejection) -> Response {
    rejected(rejection.status(), rejection.body_text())
}

fn json_rejected(rejection: JsonRejection) -> Response {
    rejected(rejection.status(), rejection.body_text())
}

async fn welcome() -> &'static str {
    WELCOME
}

async fn rag(
    State(service): State<Arc<RagService>>,
    params: std::result::Result<Query<RagParams>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => return query_rejected(rejection),
    };
    let user_id = params
        .user_id
        .unwrap_or_else(|| service.config().server.default_user.clone());
    let mut request = QueryRequest::new(&user_id, &params.user_prompt);
    request.model_name = params.model_name;
    request.top_k = params.top_k;

    match service.query(&request).await {
        QueryReply::Answer(answer) => reply(200, json!({ "answer": answer.answer })),
        QueryReply::Failed(failure) => reply(failure.status, failure),
    }
}

async fn summarise(
    State(service): State<Arc<RagService>>,
    params: std::result::Result<Query<SummariseParams>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => return query_rejected(rejection),
    };
    let summary = service.summarise_reply(&params.text, None).await;
    reply(summary.status(), summary)
}

async fn add_docs(
    State(service): State<Arc<RagService>>,
    body: std::result::Result<Json<AddDocsBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return json_rejected(rejection),
    };
    let added = service.add(&body.user_id, body.documents.into()).await;
    reply(added.status(), added)
}

async fn query(
    State(service): State<Arc<RagService>>,
    request: std::result::Result<Json<QueryRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return json_rejected(rejection),
    };
    let answer = service.query(&request).await;
    reply(answer.status(), answer)
}

async fn summarize(
    State(service): State<Arc<RagService>>,
    body: std::result::Result<Json<SummarizeBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return json_rejected(rejection),
    };
    let summary = service
        .summarise_reply(&body.text, body.model_name.as_deref())
        .await;
    reply(summary.status(), summary)
}

/// All routes over `service`.
pub fn router(service: Arc<RagService>) -> Router {
    Router::new()
        .route("/", get(welcome))
        .route("/rag", get(rag))
        .route("/rag/", get(rag))
        .route("/summarise", get(summarise))
        .route("/summarise/", get(summarise))
        .route("/api/add-docs", post(add_docs))
        .route("/api/query", post(query))
        .route("/api/summarize", post(summarize))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Serve on the configured address until Ctrl-C.
pub async fn serve(service: Arc<RagService>) -> Result<()> {
    let server = &service.config().server;
    let addr: SocketAddr = format!("{}:{}", server.host, server.port)
        .parse()
        .map_err(|e| RagError::Config(format!("invalid server address: {e}")))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Serving on http://{}", addr);

    axum::serve(listener, router(service))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingKind, RagConfig};
    use crate::embedding::HashingEmbedder;
    use httpmock::prelude::*;
    use tempfile::TempDir;

    fn setup() {
        let _ = tracing_subscriber::fmt::try_init();
    }

    async fn spawn(dir: &TempDir, ollama_base: &str) -> String {
        setup();
        let mut config = RagConfig::default();
        config.index_dir = Some(dir.path().to_path_buf());
        config.embedding.kind = EmbeddingKind::Hashing;
        config.generation.ollama.api_base = ollama_base.to_string();
        config.generation.timeout_secs = 5;
        config.server.default_user = "u1".into();
        let service =
            Arc::new(RagService::new(config, Arc::new(HashingEmbedder::new(128))).unwrap());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(service)).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_welcome() {
        let dir = TempDir::new().unwrap();
        let base = spawn(&dir, "http://127.0.0.1:9/v1").await;

        let body = reqwest::get(format!("{base}/")).await.unwrap().text().await.unwrap();
        assert!(body.starts_with("Welcome"));
    }

    #[tokio::test]
    async fn test_add_then_rag_answers() {
        let ollama = MockServer::start_async().await;
        ollama
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).json_body(json!({
                    "id": "chatcmpl-1",
                    "object": "chat.completion",
                    "created": 1_700_000_000,
                    "model": "llama3.2:1b",
                    "choices": [{
                        "index": 0,
                        "message": { "role": "assistant", "content": "Paris." },
                        "finish_reason": "stop"
                    }]
                }));
            })
            .await;

        let dir = TempDir::new().unwrap();
        let base = spawn(&dir, &ollama.url("/v1")).await;
        let client = reqwest::Client::new();

        let added: serde_json::Value = client
            .post(format!("{base}/api/add-docs"))
            .json(&json!({ "user_id": "u1", "documents": ["Paris is the capital of France."] }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(added["status"], "success");

        let response = client
            .get(format!("{base}/rag/?user_prompt=What%20is%20the%20capital%20of%20France%3F"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body, json!({ "answer": "Paris." }));
    }

    #[tokio::test]
    async fn test_unknown_user_is_404() {
        let dir = TempDir::new().unwrap();
        let base = spawn(&dir, "http://127.0.0.1:9/v1").await;

        let response = reqwest::Client::new()
            .post(format!("{base}/api/query"))
            .json(&json!({ "user_id": "ghost", "query": "hello", "model_name": "llama3.2:1b" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], "No documents found for user ghost");
    }

    #[tokio::test]
    async fn test_empty_documents_are_400() {
        let dir = TempDir::new().unwrap();
        let base = spawn(&dir, "http://127.0.0.1:9/v1").await;

        let response = reqwest::Client::new()
            .post(format!("{base}/api/add-docs"))
            .json(&json!({ "user_id": "u1", "documents": [] }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn test_missing_query_parameter_is_json_error() {
        let dir = TempDir::new().unwrap();
        let base = spawn(&dir, "http://127.0.0.1:9/v1").await;

        let response = reqwest::get(format!("{base}/rag/")).await.unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["kind"], "invalid_input");
        assert!(body["error"].as_str().unwrap().contains("user_prompt"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_json_error() {
        let dir = TempDir::new().unwrap();
        let base = spawn(&dir, "http://127.0.0.1:9/v1").await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base}/api/add-docs"))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["kind"], "invalid_input");

        let response = client
            .post(format!("{base}/api/query"))
            .json(&json!({ "query": "who?" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 422);
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("user_id"));
    }

    #[tokio::test]
    async fn test_gateway_field_names_are_accepted() {
        let dir = TempDir::new().unwrap();
        let base = spawn(&dir, "http://127.0.0.1:9/v1").await;

        let response = reqwest::Client::new()
            .post(format!("{base}/api/add-docs"))
            .json(&json!({ "userId": "u7", "text": "hello" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["message"], "1 documents added for u7");
    }
}
