//! Novelty check and pivot constraints
//!
//! After a critic pass, the story's method keywords are searched against
//! the recent-conference corpus. A hit above the collision threshold
//! produces either a report, a pivot constraint re-entering generation,
//! or a hard failure, per policy. The pivot constraint is deterministic:
//! it forbids the colliding paper's method vocabulary and names a
//! direction to move in.

use crate::config::Config;
use crate::embeddings::{embed_batched, EmbeddingGateway};
use crate::error::Result;
use crate::index::VectorIndex;
use crate::kg::KgStore;
use crate::types::{CancelToken, Story};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tokens too generic to count as method vocabulary.
const STOPWORDS: &[&str] = &[
    "with", "that", "this", "from", "into", "over", "under", "then", "than", "them", "they",
    "their", "between", "using", "based", "approach", "method", "methods", "model", "models",
    "data", "results", "paper", "propose", "proposed", "novel", "framework", "system", "stage",
    "first", "second", "third", "each", "both", "while", "when", "where", "which", "through",
];

/// Keywords carried into the novelty query and pivot constraints.
const KEYWORD_CAP: usize = 8;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PivotConstraint {
    pub forbidden_techniques: Vec<String>,
    pub pivot_direction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_shift: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoveltyReport {
    /// False when the check was disabled or no index was available
    pub checked: bool,
    pub max_similarity: f64,
    pub nearest: Vec<(String, f64)>,
    /// Paper id of the collision, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collision_with: Option<String>,
}

impl NoveltyReport {
    pub fn collided(&self) -> bool {
        self.collision_with.is_some()
    }
}

pub struct NoveltyChecker<'a> {
    index: Option<&'a VectorIndex>,
    embedder: &'a dyn EmbeddingGateway,
    kg: &'a KgStore,
    cfg: &'a Config,
}

impl<'a> NoveltyChecker<'a> {
    pub fn new(
        index: Option<&'a VectorIndex>,
        embedder: &'a dyn EmbeddingGateway,
        kg: &'a KgStore,
        cfg: &'a Config,
    ) -> Self {
        Self {
            index,
            embedder,
            kg,
            cfg,
        }
    }

    /// Scan the recent corpus for near-duplicates of the story's method.
    pub async fn check(&self, story: &Story, cancel: &CancelToken) -> Result<NoveltyReport> {
        let Some(index) = self.index else {
            return Ok(NoveltyReport::default());
        };
        if !self.cfg.novelty_enable || index.is_empty() {
            return Ok(NoveltyReport::default());
        }
        cancel.check()?;

        let keywords = extract_method_keywords(&format!(
            "{} {}",
            story.method_skeleton,
            story.innovation_claims.join(" ")
        ));
        let query_text = if keywords.is_empty() {
            story.method_skeleton.clone()
        } else {
            keywords.join(" ")
        };

        let query_vec = embed_batched(
            self.embedder,
            &[query_text],
            &self.cfg.embed_model,
            self.cfg.embed_batch_size,
            self.cfg.embed_max_retries,
            self.cfg.embed_sleep_sec,
            cancel,
        )
        .await?
        .remove(0);

        let nearest: Vec<(String, f64)> = index
            .search(&query_vec, self.cfg.novelty_top_k)
            .into_iter()
            .map(|(id, sim)| (id, sim as f64))
            .collect();

        let max_similarity = nearest.first().map(|(_, sim)| *sim).unwrap_or(0.0);
        let collision_with = nearest
            .first()
            .filter(|(_, sim)| *sim > self.cfg.collision_threshold)
            .map(|(id, _)| id.clone());

        Ok(NoveltyReport {
            checked: true,
            max_similarity,
            nearest,
            collision_with,
        })
    }

    /// Deterministic pivot constraint from a detected collision: forbid
    /// the colliding paper's method vocabulary and point generation at a
    /// different mechanism.
    pub fn make_pivot(&self, story: &Story, colliding_id: &str) -> PivotConstraint {
        let paper = self.kg.paper_by_id(colliding_id);

        let forbidden = paper
            .and_then(|p| p.summary.as_ref())
            .map(|s| extract_method_keywords(&s.method))
            .filter(|kw| !kw.is_empty())
            .or_else(|| paper.map(|p| extract_method_keywords(&p.title)))
            .unwrap_or_default();

        let domain_shift = paper
            .and_then(|p| self.kg.domain_by_id(&p.domain_id))
            .map(|d| {
                format!(
                    "move toward an adjacent sub-domain of {} instead of its mainline",
                    d.name
                )
            });

        PivotConstraint {
            forbidden_techniques: forbidden,
            pivot_direction: format!(
                "Keep the goal behind '{}' but reach it through a different mechanism; \
                 differentiate from the overlapping prior work on method, not phrasing.",
                story.title
            ),
            domain_shift,
        }
    }
}

/// Distinct content-bearing tokens from a method description, most
/// frequent first.
pub fn extract_method_keywords(text: &str) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '-')
    {
        let token = token.trim_matches('-');
        if token.len() <= 3 || STOPWORDS.contains(&token) {
            continue;
        }
        if !counts.contains_key(token) {
            order.push(token.to_string());
        }
        *counts.entry(token.to_string()).or_insert(0) += 1;
    }
    order.sort_by(|a, b| counts[b].cmp(&counts[a]).then_with(|| a.cmp(b)));
    order.truncate(KEYWORD_CAP);
    order
}
