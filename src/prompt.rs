//! # Prompts
//!
//! Fixed instructional text and the two ways a prompt is rendered for a backend.
//!
//! The system prompts are constants: callers supply the question and the
//! retrieved context, never the instructions.
//!
//! - **Chat style** (OpenAI compatible backends): a system message made of the
//!   instructions followed by the context, and a user message with the question.
//! - **Single turn** (content-generation backends): one text block,
//!   `"{instructions}\nContext:\n{context}\n\nQuestion: {question}"`.

/// Prefixed to every retrieval-augmented request.
pub const RAG_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Use the following context to answer accurately:\n\n";

pub const SUMMARY_SYSTEM_PROMPT: &str = "You are a summarization assistant.";

/// Instructions, optional context, and the caller's question.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub context: Option<String>,
    pub question: String,
}

impl Prompt {
    /// Answer `question` from `context` under `system`.
    pub fn rag(system: &str, context: &str, question: &str) -> Self {
        Self {
            system: system.to_string(),
            context: Some(context.to_string()),
            question: question.to_string(),
        }
    }

    pub fn summary(text: &str) -> Self {
        Self {
            system: SUMMARY_SYSTEM_PROMPT.to_string(),
            context: None,
            question: format!("Summarize the text: {text}"),
        }
    }

    /// System message content for chat-style backends.
    pub fn chat_system(&self) -> String {
        match &self.context {
            Some(context) => format!("{}{}", self.system, context),
            None => self.system.clone(),
        }
    }

    /// The whole prompt as one block of text.
    pub fn single_turn(&self) -> String {
        match &self.context {
            Some(context) => format!(
                "{}\nContext:\n{}\n\nQuestion: {}",
                self.system, context, self.question
            ),
            None => format!("{}\n\n{}", self.system, self.question),
        }
    }
}
