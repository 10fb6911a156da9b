//! Three-path pattern recall
//!
//! Runs three independent retrieval paths over the knowledge graph -
//! similar ideas, domain effectiveness, similar papers - and fuses the
//! per-pattern score maps with fixed weights. Each path is a pure
//! function of the graph plus similarity scores; batching and
//! backpressure live in the embedding gateway, not here.
//!
//! Embedding outages never fail recall: affected paths degrade to
//! token-Jaccard similarity and the audit records why.

use crate::config::Config;
use crate::embeddings::{cosine_similarity, embed_batched, EmbeddingGateway};
use crate::error::Result;
use crate::index::VectorIndex;
use crate::kg::KgStore;
use crate::types::CancelToken;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Sub-domain cosine matches below this are not treated as hits.
const SUBDOMAIN_HIT_THRESHOLD: f32 = 0.3;

/// Sub-domains kept when compressing a domain into one embedding text.
const SUBDOMAIN_TEXT_CAP: usize = 8;

/// Domains considered for the domain path.
const DOMAIN_POOL_CAP: usize = 50;

/// Floor applied to `works_well_in` effectiveness so weakly-negative
/// patterns are damped rather than inverted.
const EFFECTIVENESS_FLOOR: f64 = 0.1;

/// Paper quality fallback when `review_stats` is missing.
const QUALITY_FALLBACK: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecalledPattern {
    pub pattern_id: String,
    pub score: f64,
    pub path1: f64,
    pub path2: f64,
    pub path3: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdeaHit {
    pub idea_id: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainHit {
    pub domain_id: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubDomainHit {
    pub domain_id: String,
    pub sub_domain: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperHit {
    pub paper_id: String,
    pub similarity: f64,
    pub quality: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecallAudit {
    pub degraded: bool,
    pub reasons: Vec<String>,
    pub path1_top_ideas: Vec<IdeaHit>,
    pub path1_contributions: BTreeMap<String, f64>,
    pub path2_top_domains: Vec<DomainHit>,
    pub path2_top_sub_domains: Vec<SubDomainHit>,
    pub path3_top_papers: Vec<PaperHit>,
    pub final_top_k: Vec<RecalledPattern>,
}

#[derive(Debug, Clone)]
pub struct RecallOutcome {
    pub patterns: Vec<RecalledPattern>,
    pub audit: RecallAudit,
}

pub struct RecallEngine<'a> {
    kg: &'a KgStore,
    embedder: &'a dyn EmbeddingGateway,
    idea_index: Option<&'a VectorIndex>,
    paper_index: Option<&'a VectorIndex>,
    cfg: &'a Config,
    cancel: &'a CancelToken,
}

impl<'a> RecallEngine<'a> {
    pub fn new(
        kg: &'a KgStore,
        embedder: &'a dyn EmbeddingGateway,
        idea_index: Option<&'a VectorIndex>,
        paper_index: Option<&'a VectorIndex>,
        cfg: &'a Config,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            kg,
            embedder,
            idea_index,
            paper_index,
            cfg,
            cancel,
        }
    }

    /// Fused top-K patterns for a user idea.
    pub async fn recall(&self, user_idea: &str) -> Result<RecallOutcome> {
        self.cancel.check()?;
        let mut audit = RecallAudit::default();

        // One query embedding shared by all paths. An outage here
        // degrades every path to Jaccard.
        let query_vec = match self.embed_texts(&[user_idea.to_string()]).await {
            Ok(mut vectors) => Some(vectors.remove(0)),
            Err(err) => {
                audit.degraded = true;
                audit
                    .reasons
                    .push(format!("query embedding unavailable: {}", err));
                None
            }
        };

        let path1 = self
            .similar_idea_path(user_idea, query_vec.as_deref(), &mut audit)
            .await?;
        let path2 = self
            .domain_path(query_vec.as_deref(), &mut audit)
            .await?;
        let path3 = self
            .similar_paper_path(user_idea, query_vec.as_deref(), &mut audit)
            .await?;

        let fused = fuse_paths(&path1, &path2, &path3, self.cfg);
        if fused.is_empty() {
            audit.reasons.push("no candidate patterns".to_string());
        }
        audit.final_top_k = fused.clone();

        Ok(RecallOutcome {
            patterns: fused,
            audit,
        })
    }

    /// Path 1: two-stage retrieval over idea descriptions; each surviving
    /// idea contributes its similarity to every pattern it resolves to.
    async fn similar_idea_path(
        &self,
        user_idea: &str,
        query_vec: Option<&[f32]>,
        audit: &mut RecallAudit,
    ) -> Result<HashMap<String, f64>> {
        let query_tokens = token_set(user_idea);

        let mut coarse: Vec<(usize, f64)> = self
            .kg
            .ideas()
            .iter()
            .enumerate()
            .map(|(i, idea)| (i, jaccard(&query_tokens, &token_set(&idea.description))))
            .collect();
        coarse.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        coarse.truncate(self.cfg.coarse_recall_size);

        let candidates: Vec<(String, String, f64)> = coarse
            .iter()
            .map(|(i, sim)| {
                let idea = &self.kg.ideas()[*i];
                (idea.idea_id.clone(), idea.description.clone(), *sim)
            })
            .collect();

        let fine = self
            .fine_similarities(&candidates, self.idea_index, query_vec, "idea", audit)
            .await?;

        let mut scores: HashMap<String, f64> = HashMap::new();
        let mut top_ideas = Vec::new();
        for (idea_id, sim) in fine.iter().take(self.cfg.fine_top_k) {
            top_ideas.push(IdeaHit {
                idea_id: idea_id.clone(),
                similarity: *sim,
            });
            if let Some(idea) = self.kg.ideas().iter().find(|i| &i.idea_id == idea_id) {
                for pattern_id in &idea.pattern_ids {
                    *scores.entry(pattern_id.clone()).or_insert(0.0) += *sim;
                }
            }
        }

        audit.path1_top_ideas = top_ideas;
        audit.path1_contributions = scores.iter().map(|(k, v)| (k.clone(), *v)).collect();
        Ok(scores)
    }

    /// Path 2: embed one compressed text per domain, take the top
    /// domains, and credit the patterns that work well in them. A
    /// sub-domain hit restricts candidates and boosts the score.
    async fn domain_path(
        &self,
        query_vec: Option<&[f32]>,
        audit: &mut RecallAudit,
    ) -> Result<HashMap<String, f64>> {
        let mut scores: HashMap<String, f64> = HashMap::new();
        let Some(query_vec) = query_vec else {
            audit
                .reasons
                .push("domain path skipped without embeddings".to_string());
            return Ok(scores);
        };

        let pool: Vec<_> = self.kg.domains().iter().take(DOMAIN_POOL_CAP).collect();
        if pool.is_empty() {
            return Ok(scores);
        }

        let texts: Vec<String> = pool
            .iter()
            .map(|d| {
                let subs: Vec<&str> = d
                    .sub_domains
                    .iter()
                    .take(SUBDOMAIN_TEXT_CAP)
                    .map(|s| s.as_str())
                    .collect();
                format!("{} {}", d.name, subs.join(" | "))
            })
            .collect();

        let vectors = match self.embed_texts(&texts).await {
            Ok(v) => v,
            Err(err) => {
                audit.degraded = true;
                audit
                    .reasons
                    .push(format!("domain path degraded: {}", err));
                return Ok(scores);
            }
        };

        let mut ranked: Vec<(usize, f64)> = vectors
            .iter()
            .enumerate()
            .map(|(i, vec)| (i, cosine_similarity(query_vec, vec) as f64))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(self.cfg.domain_top_m);

        for (idx, domain_weight) in &ranked {
            self.cancel.check()?;
            let domain = pool[*idx];
            audit.path2_top_domains.push(DomainHit {
                domain_id: domain.domain_id.clone(),
                similarity: *domain_weight,
            });

            // Match this domain's sub-domains against the query.
            let mut sub_hits: Vec<(String, f32)> = Vec::new();
            if !domain.sub_domains.is_empty() {
                if let Ok(sub_vecs) = self.embed_texts(&domain.sub_domains).await {
                    for (sub, vec) in domain.sub_domains.iter().zip(sub_vecs.iter()) {
                        let sim = cosine_similarity(query_vec, vec);
                        if sim >= SUBDOMAIN_HIT_THRESHOLD {
                            sub_hits.push((sub.clone(), sim));
                        }
                    }
                    sub_hits.sort_by(|a, b| {
                        b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
                    });
                }
            }
            let max_subdomain_sim = sub_hits.first().map(|(_, s)| *s as f64).unwrap_or(0.0);
            for (sub, sim) in sub_hits.iter().take(3) {
                audit.path2_top_sub_domains.push(SubDomainHit {
                    domain_id: domain.domain_id.clone(),
                    sub_domain: sub.clone(),
                    similarity: *sim as f64,
                });
            }
            let hit_subs: HashSet<&str> = sub_hits.iter().map(|(s, _)| s.as_str()).collect();

            for (pattern, edge) in self.kg.patterns_effective_in(&domain.domain_id) {
                if !hit_subs.is_empty()
                    && !pattern.sub_domains.iter().any(|s| hit_subs.contains(s.as_str()))
                {
                    continue;
                }
                let contribution = domain_weight
                    * edge.effectiveness.max(EFFECTIVENESS_FLOOR)
                    * edge.confidence
                    * (1.0 + self.cfg.subdomain_boost * max_subdomain_sim);
                *scores.entry(pattern.pattern_id.clone()).or_insert(0.0) += contribution;
            }
        }

        Ok(scores)
    }

    /// Path 3: two-stage retrieval over paper titles weighted by review
    /// quality and the `uses_pattern` edge quality.
    async fn similar_paper_path(
        &self,
        user_idea: &str,
        query_vec: Option<&[f32]>,
        audit: &mut RecallAudit,
    ) -> Result<HashMap<String, f64>> {
        let query_tokens = token_set(user_idea);

        let mut coarse: Vec<(usize, f64)> = self
            .kg
            .papers()
            .iter()
            .enumerate()
            .map(|(i, paper)| (i, jaccard(&query_tokens, &token_set(&paper.title))))
            .collect();
        coarse.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        coarse.truncate(self.cfg.coarse_recall_size);

        let candidates: Vec<(String, String, f64)> = coarse
            .iter()
            .map(|(i, sim)| {
                let paper = &self.kg.papers()[*i];
                (paper.paper_id.clone(), paper.title.clone(), *sim)
            })
            .collect();

        let fine = self
            .fine_similarities(&candidates, self.paper_index, query_vec, "paper", audit)
            .await?;

        let mut scores: HashMap<String, f64> = HashMap::new();
        for (paper_id, sim) in fine.iter().take(self.cfg.fine_top_k) {
            let Some(paper) = self.kg.paper_by_id(paper_id) else {
                continue;
            };
            let quality = paper
                .review_stats
                .as_ref()
                .map(|s| s.avg_score10 / 10.0)
                .unwrap_or(QUALITY_FALLBACK);
            audit.path3_top_papers.push(PaperHit {
                paper_id: paper_id.clone(),
                similarity: *sim,
                quality,
            });
            for (pattern, edge) in self.kg.patterns_used_by(paper_id) {
                *scores.entry(pattern.pattern_id.clone()).or_insert(0.0) +=
                    sim * quality * edge.quality;
            }
        }

        Ok(scores)
    }

    /// Rank coarse candidates by embedding cosine when available, reusing
    /// index vectors and falling back to Jaccard on outage.
    async fn fine_similarities(
        &self,
        candidates: &[(String, String, f64)],
        index: Option<&VectorIndex>,
        query_vec: Option<&[f32]>,
        what: &str,
        audit: &mut RecallAudit,
    ) -> Result<Vec<(String, f64)>> {
        let coarse_ranked = || {
            candidates
                .iter()
                .map(|(id, _, sim)| (id.clone(), *sim))
                .collect::<Vec<_>>()
        };

        let Some(query_vec) = query_vec else {
            return Ok(coarse_ranked());
        };

        // Gather vectors: indexed ones first, embed the rest in batches.
        let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(candidates.len());
        let mut missing: Vec<usize> = Vec::new();
        for (i, (id, _, _)) in candidates.iter().enumerate() {
            match index.and_then(|ix| ix.vector_of(id)) {
                Some(vec) => vectors.push(Some(vec.to_vec())),
                None => {
                    vectors.push(None);
                    missing.push(i);
                }
            }
        }

        if !missing.is_empty() {
            let texts: Vec<String> = missing
                .iter()
                .map(|i| candidates[*i].1.clone())
                .collect();
            match self.embed_texts(&texts).await {
                Ok(embedded) => {
                    for (slot, vec) in missing.iter().zip(embedded.into_iter()) {
                        vectors[*slot] = Some(vec);
                    }
                }
                Err(err) => {
                    audit.degraded = true;
                    audit.reasons.push(format!(
                        "{} fine ranking degraded to token overlap: {}",
                        what, err
                    ));
                    return Ok(coarse_ranked());
                }
            }
        }

        let mut ranked: Vec<(String, f64)> = candidates
            .iter()
            .zip(vectors.iter())
            .map(|((id, _, coarse_sim), vec)| {
                let sim = vec
                    .as_ref()
                    .map(|v| cosine_similarity(query_vec, v) as f64)
                    .unwrap_or(*coarse_sim);
                (id.clone(), sim)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(ranked)
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        embed_batched(
            self.embedder,
            texts,
            &self.cfg.embed_model,
            self.cfg.embed_batch_size,
            self.cfg.embed_max_retries,
            self.cfg.embed_sleep_sec,
            self.cancel,
        )
        .await
    }
}

/// Weighted fusion of the three per-pattern score maps.
fn fuse_paths(
    path1: &HashMap<String, f64>,
    path2: &HashMap<String, f64>,
    path3: &HashMap<String, f64>,
    cfg: &Config,
) -> Vec<RecalledPattern> {
    let (n1, n2, n3) = if cfg.recall_normalize {
        (normalize(path1), normalize(path2), normalize(path3))
    } else {
        (path1.clone(), path2.clone(), path3.clone())
    };

    let mut all: HashSet<&String> = HashSet::new();
    all.extend(n1.keys());
    all.extend(n2.keys());
    all.extend(n3.keys());

    let mut fused: Vec<RecalledPattern> = all
        .into_iter()
        .map(|pattern_id| {
            let p1 = n1.get(pattern_id).copied().unwrap_or(0.0);
            let p2 = n2.get(pattern_id).copied().unwrap_or(0.0);
            let p3 = n3.get(pattern_id).copied().unwrap_or(0.0);
            RecalledPattern {
                pattern_id: pattern_id.clone(),
                score: cfg.recall_idea_weight * p1
                    + cfg.recall_domain_weight * p2
                    + cfg.recall_paper_weight * p3,
                path1: p1,
                path2: p2,
                path3: p3,
            }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.pattern_id.cmp(&b.pattern_id))
    });
    fused.truncate(cfg.final_top_k);
    fused
}

/// Min-max normalization of a score map into [0, 1]. A constant map
/// normalizes to all-ones so a single-candidate path still contributes.
fn normalize(scores: &HashMap<String, f64>) -> HashMap<String, f64> {
    if scores.is_empty() {
        return HashMap::new();
    }
    let min = scores.values().cloned().fold(f64::INFINITY, f64::min);
    let max = scores.values().cloned().fold(f64::NEG_INFINITY, f64::max);
    if (max - min).abs() < f64::EPSILON {
        return scores.keys().map(|k| (k.clone(), 1.0)).collect();
    }
    scores
        .iter()
        .map(|(k, v)| (k.clone(), (v - min) / (max - min)))
        .collect()
}

fn token_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|t| t.to_string())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}
