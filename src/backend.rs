//! # Generation backends
//!
//! Answers are produced by one of two kinds of remote model service:
//!
//! - [`LocalCompletion`]: an OpenAI-compatible `/chat/completions` endpoint,
//!   typically a local Ollama daemon. Requests and responses use the
//!   `async-openai` types.
//! - [`ManagedContent`]: a hosted `generateContent` API (Gemini) that takes a
//!   single block of text.
//!
//! Both are variants of [`GenerationBackend`]; [`Backends::resolve`] maps a
//! caller-supplied model identifier onto one of them through the configured
//! route table. Unknown identifiers are an [`RagError::UnsupportedProvider`],
//! never a silent fallback.

use std::str::FromStr;
use std::time::Duration;

use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, CreateChatCompletionRequestArgs,
    CreateChatCompletionResponse,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::config::{GeminiConfig, ModelRoute, OllamaConfig, RagConfig};
use crate::error::{RagError, Result};
use crate::prompt::Prompt;

/// Longest slice of an error body echoed back in a [`RagError::BackendUnavailable`].
const ERROR_BODY_LIMIT: usize = 300;

/// Which family of service serves a model.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    Gemini,
}

impl FromStr for ProviderKind {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ollama" => Ok(ProviderKind::Ollama),
            "gemini" => Ok(ProviderKind::Gemini),
            other => Err(RagError::UnsupportedProvider(other.to_string())),
        }
    }
}

/// Read a JSON body, turning non-2xx statuses and unparseable bodies into
/// typed errors.
pub(crate) async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
    service: &str,
) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        let snippet: String = body.chars().take(ERROR_BODY_LIMIT).collect();
        return Err(RagError::BackendUnavailable(format!(
            "{service} returned {status}: {snippet}"
        )));
    }

    serde_json::from_str(&body)
        .map_err(|e| RagError::MalformedResponse(format!("{service}: {e}")))
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| RagError::Config(format!("cannot build HTTP client: {e}")))
}

/// OpenAI-compatible chat completions.
#[derive(Debug, Clone)]
pub struct LocalCompletion {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

impl LocalCompletion {
    pub fn new(config: &OllamaConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    #[allow(deprecated)]
    async fn generate(&self, model: &str, prompt: &Prompt, max_tokens: u32) -> Result<String> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                content: ChatCompletionRequestSystemMessageContent::Text(prompt.chat_system()),
                name: None,
            }),
            ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(prompt.question.clone()),
                name: None,
            }),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .max_tokens(max_tokens)
            .messages(messages)
            .build()
            .map_err(|e| RagError::InvalidInput(format!("cannot build completion request: {e}")))?;

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        debug!("Sending chat completion request to {} for {}", self.api_base, model);
        let response = builder.send().await?;
        let body: CreateChatCompletionResponse =
            read_json(response, "local completion backend").await?;

        body.choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .ok_or_else(|| {
                RagError::MalformedResponse("completion response has no message content".into())
            })
    }
}

/// Hosted `generateContent` API.
#[derive(Debug, Clone)]
pub struct ManagedContent {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

impl ManagedContent {
    pub fn new(config: &GeminiConfig, api_key: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn generate(&self, model: &str, prompt: &Prompt, max_tokens: u32) -> Result<String> {
        let url = format!("{}/v1beta/models/{}:generateContent", self.api_base, model);
        debug!("Sending generateContent request for {}", model);

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&json!({
                "contents": [{ "parts": [{ "text": prompt.single_turn() }] }],
                "generationConfig": { "maxOutputTokens": max_tokens },
            }))
            .send()
            .await?;
        let body: GenerateContentResponse = read_json(response, "managed content backend").await?;

        let text: String = body
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.is_empty() {
            return Err(RagError::MalformedResponse(
                "generateContent response has no candidate text".into(),
            ));
        }
        Ok(text)
    }
}

/// A model service able to answer a [`Prompt`].
#[derive(Debug, Clone)]
pub enum GenerationBackend {
    LocalCompletion(LocalCompletion),
    ManagedContent(ManagedContent),
}

impl GenerationBackend {
    pub fn provider(&self) -> ProviderKind {
        match self {
            GenerationBackend::LocalCompletion(_) => ProviderKind::Ollama,
            GenerationBackend::ManagedContent(_) => ProviderKind::Gemini,
        }
    }

    /// Ask `model` to answer `prompt`, capped at `max_tokens` output tokens.
    pub async fn generate(&self, model: &str, prompt: &Prompt, max_tokens: u32) -> Result<String> {
        let answer = match self {
            GenerationBackend::LocalCompletion(backend) => {
                backend.generate(model, prompt, max_tokens).await?
            }
            GenerationBackend::ManagedContent(backend) => {
                backend.generate(model, prompt, max_tokens).await?
            }
        };
        info!("{:?} answered with {} characters", self.provider(), answer.len());
        Ok(answer.trim().to_string())
    }
}

/// Configured backends plus the model route table.
#[derive(Debug, Clone)]
pub struct Backends {
    routes: Vec<ModelRoute>,
    local: GenerationBackend,
    managed: Option<GenerationBackend>,
}

impl Backends {
    pub fn from_config(config: &RagConfig) -> Result<Self> {
        let timeout = config.generation_timeout();
        let local = GenerationBackend::LocalCompletion(LocalCompletion::new(
            &config.generation.ollama,
            timeout,
        )?);
        let managed = match config.gemini_key() {
            Some(key) => Some(GenerationBackend::ManagedContent(ManagedContent::new(
                &config.generation.gemini,
                key,
                timeout,
            )?)),
            None => None,
        };

        Ok(Self {
            routes: config.generation.models.clone(),
            local,
            managed,
        })
    }

    /// Backend and provider-side model name for `model_id`.
    ///
    /// Exact route-table matches win; otherwise an `ollama/` or `gemini/`
    /// prefix selects the provider and the remainder is the model name.
    pub fn resolve(&self, model_id: &str) -> Result<(&GenerationBackend, String)> {
        let model_id = model_id.trim();

        if let Some(route) = self.routes.iter().find(|route| route.name == model_id) {
            return Ok((self.backend_for(route.provider, model_id)?, model_id.to_string()));
        }

        if let Some((prefix, name)) = model_id.split_once('/') {
            if let Ok(provider) = prefix.parse::<ProviderKind>() {
                if !name.is_empty() {
                    return Ok((self.backend_for(provider, model_id)?, name.to_string()));
                }
            }
        }

        Err(RagError::UnsupportedProvider(format!(
            "no provider serves model '{model_id}'"
        )))
    }

    fn backend_for(&self, provider: ProviderKind, model_id: &str) -> Result<&GenerationBackend> {
        match provider {
            ProviderKind::Ollama => Ok(&self.local),
            ProviderKind::Gemini => self.managed.as_ref().ok_or_else(|| {
                RagError::UnsupportedProvider(format!(
                    "model '{model_id}' needs gemini, which has no API key configured"
                ))
            }),
        }
    }
}
