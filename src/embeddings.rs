//! Embedding gateway
//!
//! Local embedding model via ONNX Runtime; no network call at query time
//! once the model is cached. The gateway contract is deliberately small:
//! a batch of texts in, one L2-normalized vector per text out, inputs
//! truncated to a fixed character budget before tokenization.
//!
//! Model: all-MiniLM-L6-v2 (22MB, 384 dimensions, runs on CPU)

use crate::error::{EngineError, Result};
use crate::runlog::{EmbeddingCallRecord, RunLogger};
use crate::types::CancelToken;
use async_trait::async_trait;
use ndarray::Array2;
use ort::{
    inputs,
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokenizers::Tokenizer;

/// Embedding dimensions for all-MiniLM-L6-v2
pub const EMBEDDING_DIM: usize = 384;

/// Maximum sequence length for the model
const MAX_SEQ_LEN: usize = 256;

/// Inputs longer than this are truncated before tokenization.
pub const TRUNCATE_CHARS: usize = 2000;

#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    /// Embed a batch of texts. One vector per input, all the same
    /// dimension, L2-normalized.
    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>>;

    fn dim(&self) -> usize;
}

/// Truncate to the gateway's character budget on a char boundary.
pub fn truncate_input(text: &str) -> &str {
    match text.char_indices().nth(TRUNCATE_CHARS) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Cosine similarity. Inputs from this module are already L2-normalized,
/// so this is a dot product for them; arbitrary vectors get the full form.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Batch driver honoring gateway backpressure: splits into
/// `batch_size` chunks, sleeps `sleep_sec` on a rate limit and retries
/// the chunk up to `max_retries` times.
pub async fn embed_batched(
    gateway: &dyn EmbeddingGateway,
    texts: &[String],
    model: &str,
    batch_size: usize,
    max_retries: usize,
    sleep_sec: f64,
    cancel: &CancelToken,
) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(texts.len());
    for chunk in texts.chunks(batch_size.max(1)) {
        let mut attempt = 0;
        loop {
            cancel.check()?;
            match gateway.embed(chunk, model).await {
                Ok(mut vectors) => {
                    if vectors.len() != chunk.len() {
                        return Err(EngineError::Transport(format!(
                            "embedding gateway returned {} vectors for {} inputs",
                            vectors.len(),
                            chunk.len()
                        )));
                    }
                    out.append(&mut vectors);
                    break;
                }
                Err(EngineError::RateLimited) if attempt < max_retries => {
                    attempt += 1;
                    tokio::time::sleep(std::time::Duration::from_secs_f64(sleep_sec)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
    Ok(out)
}

/// Local embedding gateway backed by ONNX Runtime.
pub struct LocalEmbedder {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    logger: Arc<RunLogger>,
}

impl LocalEmbedder {
    /// Initialize with model from cache or download.
    pub fn new(model_dir: &Path, logger: Arc<RunLogger>) -> Result<Self> {
        std::fs::create_dir_all(model_dir)?;

        let model_path = model_dir.join("model.onnx");
        let tokenizer_path = model_dir.join("tokenizer.json");

        if !model_path.exists() || !tokenizer_path.exists() {
            Self::download_model(model_dir)?;
        }

        let session = (|| -> std::result::Result<Session, ort::Error> {
            let builder = Session::builder()?;
            let builder = builder.with_optimization_level(GraphOptimizationLevel::Level3)?;
            let mut builder = builder.with_intra_threads(4)?;
            builder.commit_from_file(&model_path)
        })()
        .map_err(|e| EngineError::Config(format!("failed to load ONNX model: {}", e)))?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| EngineError::Config(format!("failed to load tokenizer: {}", e)))?;

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            logger,
        })
    }

    fn download_model(model_dir: &Path) -> Result<()> {
        use hf_hub::api::sync::Api;

        tracing::info!("downloading embedding model (all-MiniLM-L6-v2)");
        let api = Api::new()
            .map_err(|e| EngineError::Transport(format!("hf-hub init failed: {}", e)))?;
        let repo = api.model("sentence-transformers/all-MiniLM-L6-v2".to_string());

        let model_path = repo
            .get("onnx/model.onnx")
            .map_err(|e| EngineError::Transport(format!("model download failed: {}", e)))?;
        std::fs::copy(&model_path, model_dir.join("model.onnx"))?;

        let tokenizer_path = repo
            .get("tokenizer.json")
            .map_err(|e| EngineError::Transport(format!("tokenizer download failed: {}", e)))?;
        std::fs::copy(&tokenizer_path, model_dir.join("tokenizer.json"))?;

        Ok(())
    }

    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let text = truncate_input(text);
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| EngineError::Transport(format!("tokenization failed: {}", e)))?;

        let ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        let attention_mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&m| m as i64)
            .collect();

        let len = ids.len().min(MAX_SEQ_LEN).max(1);
        let ids = &ids[..len.min(ids.len())];
        let attention_mask = &attention_mask[..len.min(attention_mask.len())];
        let token_type_ids = vec![0i64; ids.len()];
        let len = ids.len();

        let input_ids = Array2::from_shape_vec((1, len), ids.to_vec())
            .map_err(|e| EngineError::Transport(format!("tensor shape error: {}", e)))?;
        let attention = Array2::from_shape_vec((1, len), attention_mask.to_vec())
            .map_err(|e| EngineError::Transport(format!("tensor shape error: {}", e)))?;
        let token_types = Array2::from_shape_vec((1, len), token_type_ids)
            .map_err(|e| EngineError::Transport(format!("tensor shape error: {}", e)))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| EngineError::Transport("embedding session poisoned".into()))?;

        let outputs = session
            .run(inputs![
                "input_ids" => Tensor::from_array(input_ids)
                    .map_err(|e| EngineError::Transport(e.to_string()))?,
                "attention_mask" => Tensor::from_array(attention)
                    .map_err(|e| EngineError::Transport(e.to_string()))?,
                "token_type_ids" => Tensor::from_array(token_types)
                    .map_err(|e| EngineError::Transport(e.to_string()))?,
            ])
            .map_err(|e| EngineError::Transport(format!("ONNX inference failed: {}", e)))?;

        let output = outputs
            .get("last_hidden_state")
            .or_else(|| outputs.get("token_embeddings"))
            .ok_or_else(|| EngineError::Transport("no embedding output found".into()))?;

        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        let shape_vec: Vec<i64> = shape.iter().copied().collect();
        let data_vec: Vec<f32> = data.to_vec();
        drop(outputs);

        let embedding = mean_pool_flat(&data_vec, len, &shape_vec);
        Ok(l2_normalize(&embedding))
    }
}

#[async_trait]
impl EmbeddingGateway for LocalEmbedder {
    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>> {
        let started = Instant::now();
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            match self.embed_one(text) {
                Ok(v) => out.push(v),
                Err(err) => {
                    self.logger.embedding_call(&EmbeddingCallRecord {
                        batch_size: texts.len(),
                        model: model.to_string(),
                        latency_ms: started.elapsed().as_millis() as u64,
                        ok: false,
                        error: Some(err.to_string()),
                    });
                    return Err(err);
                }
            }
        }
        self.logger.embedding_call(&EmbeddingCallRecord {
            batch_size: texts.len(),
            model: model.to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
            ok: true,
            error: None,
        });
        Ok(out)
    }

    fn dim(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Mean pooling over the sequence dimension using the flat output slice.
/// Tensor shape: [1, seq_len, embedding_dim]
fn mean_pool_flat(data: &[f32], seq_len: usize, shape: &[i64]) -> Vec<f32> {
    let mut result = vec![0.0f32; EMBEDDING_DIM];
    let embed_dim = if shape.len() >= 3 {
        shape[2] as usize
    } else {
        EMBEDDING_DIM
    };

    for i in 0..seq_len {
        for (j, slot) in result.iter_mut().enumerate().take(embed_dim.min(EMBEDDING_DIM)) {
            let idx = i * embed_dim + j;
            if idx < data.len() {
                *slot += data[idx];
            }
        }
    }

    for v in result.iter_mut() {
        *v /= seq_len as f32;
    }
    result
}

fn l2_normalize(vec: &[f32]) -> Vec<f32> {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vec.iter().map(|x| x / norm).collect()
    } else {
        vec.to_vec()
    }
}

/// Default cache directory for the embedding model.
pub fn default_model_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("storyforge")
        .join("models")
        .join("minilm")
}
