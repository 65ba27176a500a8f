//! # Embedding
//!
//! Text → fixed-dimension vector. The rest of the crate only sees the
//! [`Embedder`] trait, so the neural model can be swapped for the lexical
//! [`HashingEmbedder`] (offline runs, tests) through configuration.
//!
//! ## Implementations
//! - [`SentenceEmbeddingsModel`]: `sentence-transformers/all-MiniLM-L6-v2`
//!   run with Candle. Weights come from the Hugging Face hub cache, output is
//!   mean-pooled and L2-normalised, 384 dimensions.
//! - [`HashingEmbedder`]: lowercased alphanumeric tokens hashed into a fixed
//!   number of buckets, L2-normalised. Deterministic and dependency-free at
//!   runtime; texts that share words land close together.
//!
//! Embedding is CPU bound and can be slow, so async callers go through
//! [`embed_with_timeout`], which runs the work on Tokio's blocking pool under a
//! deadline. An expired deadline is reported as
//! [`RagError::BackendUnavailable`] and is never retried.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use hf_hub::{Repo, RepoType, api::sync::Api};
use tokenizers::{Tokenizer, TruncationParams};
use tracing::{debug, info};

use crate::config::{EmbeddingConfig, EmbeddingKind};
use crate::error::{RagError, Result};

/// Maps text to vectors of a fixed dimension, deterministically for a given model.
pub trait Embedder: Send + Sync {
    /// Width of every vector this embedder produces.
    fn dimension(&self) -> usize;

    /// Embed each text, preserving order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// BERT position embeddings stop at 512.
const MAX_TOKENS: usize = 512;

fn embedding_error(err: impl Display) -> RagError {
    RagError::Embedding(err.to_string())
}

/// Sentence embeddings model using Candle (pure Rust)
pub struct SentenceEmbeddingsModel {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dimension: usize,
}

impl SentenceEmbeddingsModel {
    /// Load `model_id` (e.g. `sentence-transformers/all-MiniLM-L6-v2`) from the Hugging Face Hub.
    ///
    /// Files are fetched once into the local hub cache and memory-mapped afterwards.
    pub fn load(model_id: &str) -> Result<Self> {
        let device = Device::Cpu;
        info!("Loading embedding model {}", model_id);

        let repo = Repo::with_revision(model_id.to_string(), RepoType::Model, "main".to_string());
        let api = Api::new().map_err(embedding_error)?;
        let api_repo = api.repo(repo);

        let config_filename = api_repo.get("config.json").map_err(embedding_error)?;
        let tokenizer_filename = api_repo.get("tokenizer.json").map_err(embedding_error)?;
        let weights_filename = api_repo.get("model.safetensors").map_err(embedding_error)?;

        let config = std::fs::read_to_string(config_filename)?;
        let dimension = serde_json::from_str::<serde_json::Value>(&config)?["hidden_size"]
            .as_u64()
            .ok_or_else(|| RagError::Embedding("model config has no hidden_size".into()))?
            as usize;
        let config: Config = serde_json::from_str(&config)?;

        let mut tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| RagError::Embedding(format!("Failed to load tokenizer: {e}")))?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: MAX_TOKENS,
                ..Default::default()
            }))
            .map_err(embedding_error)?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_filename], DTYPE, &device)
                .map_err(embedding_error)?
        };
        let model = BertModel::load(vb, &config).map_err(embedding_error)?;

        Ok(Self {
            model,
            tokenizer,
            device,
            dimension,
        })
    }

    /// Encode a single text into a normalised embedding.
    pub fn encode(&self, text: &str) -> Result<Vec<f32>> {
        self.encode_inner(text).map_err(embedding_error)
    }

    fn encode_inner(
        &self,
        text: &str,
    ) -> std::result::Result<Vec<f32>, Box<dyn std::error::Error + Send + Sync>> {
        let tokens = self.tokenizer.encode(text, true)?;

        let token_ids = Tensor::new(tokens.get_ids(), &self.device)?.unsqueeze(0)?;
        let token_type_ids = Tensor::new(tokens.get_type_ids(), &self.device)?.unsqueeze(0)?;

        let output = self.model.forward(&token_ids, &token_type_ids, None)?;
        let embedding = self.mean_pooling(&output, tokens.get_attention_mask())?;
        let embedding = normalize(&embedding)?;

        Ok(embedding.to_vec1::<f32>()?)
    }

    /// Mean pooling over token embeddings, considering attention mask
    fn mean_pooling(
        &self,
        embeddings: &Tensor,
        attention_mask: &[u32],
    ) -> candle_core::Result<Tensor> {
        // embeddings: [1, seq_len, hidden], mask: [1, seq_len, 1]
        let mask = Tensor::new(attention_mask, &self.device)?
            .to_dtype(DType::F32)?
            .unsqueeze(0)?
            .unsqueeze(2)?;

        let sum = embeddings.broadcast_mul(&mask)?.sum(1)?;
        let count = mask.sum(1)?.clamp(1f32, f32::INFINITY)?;

        sum.broadcast_div(&count)?.squeeze(0)
    }
}

fn normalize(tensor: &Tensor) -> candle_core::Result<Tensor> {
    let norm = tensor.sqr()?.sum_all()?.sqrt()?;
    tensor.broadcast_div(&norm)
}

impl Embedder for SentenceEmbeddingsModel {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|text| self.encode(text)).collect()
    }
}

/// Bag-of-words embedder over hashed token buckets.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn bucket(&self, token: &str) -> usize {
        let digest = blake3::hash(token.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        (u64::from_le_bytes(head) % self.dimension as u64) as usize
    }

    fn encode(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            vector[self.bucket(&token.to_lowercase())] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.encode(text)).collect())
    }
}

/// Build the embedder selected by configuration.
pub fn load_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.kind {
        EmbeddingKind::Minilm => Ok(Arc::new(SentenceEmbeddingsModel::load(&config.model)?)),
        EmbeddingKind::Hashing => Ok(Arc::new(HashingEmbedder::new(config.hashing_dimension))),
    }
}

/// Embed `texts` on the blocking pool, giving up after `timeout`.
///
/// The output is checked against the embedder's contract: one vector per text,
/// each of [`Embedder::dimension`] width.
pub async fn embed_with_timeout(
    embedder: Arc<dyn Embedder>,
    texts: Vec<String>,
    timeout: Duration,
) -> Result<Vec<Vec<f32>>> {
    let count = texts.len();
    let dimension = embedder.dimension();
    debug!("Embedding {} texts", count);

    let task = tokio::task::spawn_blocking(move || embedder.embed(&texts));
    let vectors = match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result?,
        Ok(Err(join_error)) => {
            return Err(RagError::Embedding(format!("embedding task failed: {join_error}")));
        }
        Err(_) => {
            return Err(RagError::BackendUnavailable(format!(
                "embedding {count} texts timed out after {}s",
                timeout.as_secs_f32()
            )));
        }
    };

    if vectors.len() != count {
        return Err(RagError::MalformedResponse(format!(
            "embedder returned {} vectors for {count} texts",
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
        return Err(RagError::DimensionMismatch {
            expected: dimension,
            actual: bad.len(),
        });
    }
    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_index::squared_l2;

    struct SlowEmbedder;

    impl Embedder for SlowEmbedder {
        fn dimension(&self) -> usize {
            2
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(texts.iter().map(|_| vec![0.0, 0.0]).collect())
        }
    }

    struct ShortEmbedder;

    impl Embedder for ShortEmbedder {
        fn dimension(&self) -> usize {
            3
        }

        fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(vec![vec![1.0, 0.0, 0.0]])
        }
    }

    fn strings(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_hashing_embedder_is_deterministic_and_normalised() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed(&strings(&["Rust is cool."])).unwrap();
        let b = embedder.embed(&strings(&["rust IS cool"])).unwrap();
        assert_eq!(a, b, "case and punctuation should not matter");

        let norm: f32 = a[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hashing_embedder_empty_text_is_zero_vector() {
        let embedder = HashingEmbedder::new(16);
        let vectors = embedder.embed(&strings(&["  ...  "])).unwrap();
        assert!(vectors[0].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_hashing_embedder_shared_words_are_closer() {
        let embedder = HashingEmbedder::new(512);
        let vectors = embedder
            .embed(&strings(&[
                "What is the capital of France?",
                "Paris is the capital of France.",
                "The sun is a star.",
            ]))
            .unwrap();
        let to_paris = squared_l2(&vectors[0], &vectors[1]);
        let to_sun = squared_l2(&vectors[0], &vectors[2]);
        assert!(to_paris < to_sun);
    }

    #[tokio::test]
    async fn test_embed_with_timeout_expires() {
        let err = embed_with_timeout(
            Arc::new(SlowEmbedder),
            strings(&["slow"]),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RagError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_embed_with_timeout_checks_vector_count() {
        let err = embed_with_timeout(
            Arc::new(ShortEmbedder),
            strings(&["one", "two"]),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RagError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_embed_with_timeout_passes_through() {
        let vectors = embed_with_timeout(
            Arc::new(HashingEmbedder::new(32)),
            strings(&["alpha", "beta"]),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(vectors.len(), 2);
        assert!(vectors.iter().all(|v| v.len() == 32));
    }

    #[test]
    #[ignore = "downloads all-MiniLM-L6-v2 from the Hugging Face hub"]
    fn test_sentence_embeddings_model() {
        let model = SentenceEmbeddingsModel::load("sentence-transformers/all-MiniLM-L6-v2").unwrap();
        assert_eq!(model.dimension(), 384);
        let vectors = model
            .embed(&strings(&["Rust is cool.", "I love programming."]))
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), 384);
    }
}
