//! Offline vector index
//!
//! Exact cosine top-k over a persisted corpus. One instance per corpus:
//! recall ideas, recall papers, novelty papers. Vectors persist as
//! little-endian f32 next to an id list and a small meta file, so an
//! index built offline loads without touching the embedding gateway.

use crate::config::{Config, IndexDirMode};
use crate::embeddings::{cosine_similarity, embed_batched, EmbeddingGateway};
use crate::error::{EngineError, Result};
use crate::types::CancelToken;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize)]
struct IndexMeta {
    model: String,
    dim: usize,
    count: usize,
}

/// The corpus a given index serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    RecallIdeas,
    RecallPapers,
    Novelty,
}

impl IndexKind {
    fn subdir(&self) -> &'static str {
        match self {
            IndexKind::RecallIdeas => "ideas",
            IndexKind::RecallPapers => "papers",
            IndexKind::Novelty => "novelty",
        }
    }

    fn family(&self) -> &'static str {
        match self {
            IndexKind::RecallIdeas | IndexKind::RecallPapers => "recall_index",
            IndexKind::Novelty => "novelty_index",
        }
    }
}

pub struct VectorIndex {
    ids: Vec<String>,
    vectors: Vec<Vec<f32>>,
    by_id: HashMap<String, usize>,
    dim: usize,
    model: String,
}

impl VectorIndex {
    /// Embed `(id, text)` pairs through the gateway and hold the result
    /// in memory. Callers gate this behind `INDEX_ALLOW_BUILD`.
    pub async fn build(
        items: &[(String, String)],
        gateway: &dyn EmbeddingGateway,
        model: &str,
        cfg: &Config,
        cancel: &CancelToken,
    ) -> Result<Self> {
        let texts: Vec<String> = items.iter().map(|(_, text)| text.clone()).collect();
        let vectors = embed_batched(
            gateway,
            &texts,
            model,
            cfg.embed_batch_size,
            cfg.embed_max_retries,
            cfg.embed_sleep_sec,
            cancel,
        )
        .await?;
        let dim = vectors.first().map(|v| v.len()).unwrap_or(gateway.dim());
        let ids: Vec<String> = items.iter().map(|(id, _)| id.clone()).collect();
        let by_id = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        Ok(Self {
            ids,
            vectors,
            by_id,
            dim,
            model: model.to_string(),
        })
    }

    /// Exact cosine search, descending, at most `k` hits.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(String, f32)> {
        let mut scored: Vec<(String, f32)> = self
            .ids
            .iter()
            .zip(self.vectors.iter())
            .map(|(id, vec)| (id.clone(), cosine_similarity(query, vec)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    /// Stored vector for an indexed id, if present.
    pub fn vector_of(&self, id: &str) -> Option<&[f32]> {
        self.by_id.get(id).map(|i| self.vectors[*i].as_slice())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let meta = IndexMeta {
            model: self.model.clone(),
            dim: self.dim,
            count: self.ids.len(),
        };
        std::fs::write(
            dir.join("index_meta.json"),
            serde_json::to_string_pretty(&meta)?,
        )?;
        std::fs::write(dir.join("ids.json"), serde_json::to_string(&self.ids)?)?;

        let mut bytes = Vec::with_capacity(self.ids.len() * self.dim * 4);
        for vector in &self.vectors {
            for value in vector {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
        std::fs::write(dir.join("vectors.bin"), bytes)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let meta: IndexMeta = serde_json::from_str(
            &std::fs::read_to_string(dir.join("index_meta.json")).map_err(|e| {
                EngineError::Config(format!("cannot read index meta in {:?}: {}", dir, e))
            })?,
        )?;
        let ids: Vec<String> =
            serde_json::from_str(&std::fs::read_to_string(dir.join("ids.json"))?)?;
        let bytes = std::fs::read(dir.join("vectors.bin"))?;

        let expected = meta.count * meta.dim * 4;
        if bytes.len() != expected || ids.len() != meta.count {
            return Err(EngineError::Config(format!(
                "index in {:?} is corrupt: {} ids, {} bytes, expected {}",
                dir,
                ids.len(),
                bytes.len(),
                expected
            )));
        }

        let mut vectors = Vec::with_capacity(meta.count);
        for chunk in bytes.chunks_exact(meta.dim * 4) {
            let vector: Vec<f32> = chunk
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            vectors.push(vector);
        }

        let by_id = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        Ok(Self {
            ids,
            vectors,
            by_id,
            dim: meta.dim,
            model: meta.model,
        })
    }
}

/// Resolve the on-disk directory for an index corpus.
///
/// `manual` mode uses the explicitly configured dirs; `auto_profile`
/// globs `output/<family>__<model_profile>*` and picks the first match.
pub fn resolve_index_dir(cfg: &Config, kind: IndexKind) -> Result<PathBuf> {
    match cfg.index_dir_mode {
        IndexDirMode::Manual => {
            let base = match kind {
                IndexKind::RecallIdeas | IndexKind::RecallPapers => cfg
                    .recall_index_dir
                    .clone()
                    .unwrap_or_else(|| cfg.output_dir.join("recall_index__default")),
                IndexKind::Novelty => cfg
                    .novelty_index_dir
                    .clone()
                    .unwrap_or_else(|| cfg.output_dir.join("novelty_index__default")),
            };
            Ok(base.join(kind.subdir()))
        }
        IndexDirMode::AutoProfile => {
            let pattern = format!(
                "{}/{}__{}*",
                cfg.output_dir.display(),
                kind.family(),
                cfg.model_profile
            );
            let mut matches: Vec<PathBuf> = glob::glob(&pattern)
                .map_err(|e| EngineError::Config(format!("bad index glob '{}': {}", pattern, e)))?
                .filter_map(|entry| entry.ok())
                .filter(|p| p.is_dir())
                .collect();
            matches.sort();
            match matches.into_iter().next() {
                Some(dir) => Ok(dir.join(kind.subdir())),
                None => Err(EngineError::Config(format!(
                    "no index directory matches '{}'",
                    pattern
                ))),
            }
        }
    }
}
