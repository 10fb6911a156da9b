//! Read-only knowledge graph store
//!
//! Loads the node files produced by the KG build
//! (`output/nodes_{idea,pattern,domain,paper}.json`) plus the typed edge
//! file (`output/knowledge_graph_v2.json`) once at startup. Entities live
//! in flat arrays keyed by interned indices; adjacency is held in maps of
//! index lists so graph walks never chase back-pointers.

use crate::error::{EngineError, Result};
use crate::types::{BelongsTo, Domain, Idea, Paper, Pattern, UsesPattern, WorksWellIn};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct EdgeFile {
    #[serde(default)]
    uses_pattern: Vec<UsesPatternEdge>,
    #[serde(default)]
    works_well_in: Vec<WorksWellInEdge>,
    #[serde(default)]
    belongs_to: Vec<BelongsToEdge>,
}

#[derive(Debug, Deserialize)]
struct UsesPatternEdge {
    paper_id: String,
    pattern_id: String,
    quality: f64,
}

#[derive(Debug, Deserialize)]
struct WorksWellInEdge {
    pattern_id: String,
    domain_id: String,
    effectiveness: f64,
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct BelongsToEdge {
    idea_id: String,
    domain_id: String,
    weight: f64,
}

/// Immutable store over the four entity arrays and typed edges.
#[derive(Debug)]
pub struct KgStore {
    ideas: Vec<Idea>,
    patterns: Vec<Pattern>,
    domains: Vec<Domain>,
    papers: Vec<Paper>,

    pattern_idx: HashMap<String, usize>,
    domain_idx: HashMap<String, usize>,
    paper_idx: HashMap<String, usize>,

    /// pattern index -> [(paper index, edge)]
    papers_by_pattern_edge: HashMap<usize, Vec<(usize, UsesPattern)>>,
    /// domain index -> [(pattern index, edge)]
    patterns_by_domain: HashMap<usize, Vec<(usize, WorksWellIn)>>,
    /// idea index -> [(domain index, edge)]
    domains_by_idea: HashMap<usize, Vec<(usize, BelongsTo)>>,
    /// pattern index -> paper indices assigned to its cluster
    cluster_papers: HashMap<usize, Vec<usize>>,
    /// domain index -> paper indices
    domain_papers: HashMap<usize, Vec<usize>>,

    /// sha256 of the raw nodes_paper.json bytes, pinning the tau table
    paper_file_hash: String,
}

impl KgStore {
    /// Load every KG artifact from `dir`. All invariant violations are
    /// configuration errors; the store never loads a partial graph.
    pub fn load(dir: &Path) -> Result<Self> {
        let ideas: Vec<Idea> = load_nodes(&dir.join("nodes_idea.json"))?;
        let patterns: Vec<Pattern> = load_nodes(&dir.join("nodes_pattern.json"))?;
        let domains: Vec<Domain> = load_nodes(&dir.join("nodes_domain.json"))?;

        let paper_path = dir.join("nodes_paper.json");
        let paper_bytes = std::fs::read(&paper_path).map_err(|e| {
            EngineError::Config(format!("cannot read {:?}: {}", paper_path, e))
        })?;
        let papers: Vec<Paper> = serde_json::from_slice(&paper_bytes).map_err(|e| {
            EngineError::Config(format!("cannot parse {:?}: {}", paper_path, e))
        })?;
        let paper_file_hash = hex::encode(Sha256::digest(&paper_bytes));

        let edge_path = dir.join("knowledge_graph_v2.json");
        let edge_body = std::fs::read_to_string(&edge_path)
            .map_err(|e| EngineError::Config(format!("cannot read {:?}: {}", edge_path, e)))?;
        let edges: EdgeFile = serde_json::from_str(&edge_body)
            .map_err(|e| EngineError::Config(format!("cannot parse {:?}: {}", edge_path, e)))?;

        Self::assemble(ideas, patterns, domains, papers, edges, paper_file_hash)
    }

    /// Build a store from already-parsed entities. Used by `load` and by
    /// tests that seed small graphs directly.
    pub fn from_parts(
        ideas: Vec<Idea>,
        patterns: Vec<Pattern>,
        domains: Vec<Domain>,
        papers: Vec<Paper>,
        uses_pattern: Vec<(String, String, UsesPattern)>,
        works_well_in: Vec<(String, String, WorksWellIn)>,
        belongs_to: Vec<(String, String, BelongsTo)>,
    ) -> Result<Self> {
        let edges = EdgeFile {
            uses_pattern: uses_pattern
                .into_iter()
                .map(|(paper_id, pattern_id, e)| UsesPatternEdge {
                    paper_id,
                    pattern_id,
                    quality: e.quality,
                })
                .collect(),
            works_well_in: works_well_in
                .into_iter()
                .map(|(pattern_id, domain_id, e)| WorksWellInEdge {
                    pattern_id,
                    domain_id,
                    effectiveness: e.effectiveness,
                    confidence: e.confidence,
                })
                .collect(),
            belongs_to: belongs_to
                .into_iter()
                .map(|(idea_id, domain_id, e)| BelongsToEdge {
                    idea_id,
                    domain_id,
                    weight: e.weight,
                })
                .collect(),
        };
        let hash = hex::encode(Sha256::digest(b"in-memory"));
        Self::assemble(ideas, patterns, domains, papers, edges, hash)
    }

    fn assemble(
        ideas: Vec<Idea>,
        patterns: Vec<Pattern>,
        domains: Vec<Domain>,
        papers: Vec<Paper>,
        edges: EdgeFile,
        paper_file_hash: String,
    ) -> Result<Self> {
        let idea_idx: HashMap<String, usize> = ideas
            .iter()
            .enumerate()
            .map(|(i, n)| (n.idea_id.clone(), i))
            .collect();
        let pattern_idx: HashMap<String, usize> = patterns
            .iter()
            .enumerate()
            .map(|(i, n)| (n.pattern_id.clone(), i))
            .collect();
        let domain_idx: HashMap<String, usize> = domains
            .iter()
            .enumerate()
            .map(|(i, n)| (n.domain_id.clone(), i))
            .collect();
        let paper_idx: HashMap<String, usize> = papers
            .iter()
            .enumerate()
            .map(|(i, n)| (n.paper_id.clone(), i))
            .collect();

        // Node invariants
        for paper in &papers {
            if let Some(stats) = &paper.review_stats {
                if !(1.0..=10.0).contains(&stats.avg_score10) {
                    return Err(EngineError::Config(format!(
                        "paper {} has avg_score10 {} outside [1, 10]",
                        paper.paper_id, stats.avg_score10
                    )));
                }
            }
            if !domain_idx.contains_key(&paper.domain_id) {
                return Err(EngineError::Config(format!(
                    "paper {} references unknown domain {}",
                    paper.paper_id, paper.domain_id
                )));
            }
            if let Some(pid) = &paper.pattern_id {
                if !pattern_idx.contains_key(pid) {
                    return Err(EngineError::Config(format!(
                        "paper {} references unknown pattern {}",
                        paper.paper_id, pid
                    )));
                }
            }
        }
        for idea in &ideas {
            for pid in &idea.pattern_ids {
                if !pattern_idx.contains_key(pid) {
                    return Err(EngineError::Config(format!(
                        "idea {} references unknown pattern {}",
                        idea.idea_id, pid
                    )));
                }
            }
        }

        // Edge invariants + adjacency
        let mut papers_by_pattern_edge: HashMap<usize, Vec<(usize, UsesPattern)>> = HashMap::new();
        for edge in &edges.uses_pattern {
            let paper = resolve(&paper_idx, &edge.paper_id, "uses_pattern paper")?;
            let pattern = resolve(&pattern_idx, &edge.pattern_id, "uses_pattern pattern")?;
            if !(0.0..=1.0).contains(&edge.quality) {
                return Err(EngineError::Config(format!(
                    "uses_pattern edge {} -> {} has quality {} outside [0, 1]",
                    edge.paper_id, edge.pattern_id, edge.quality
                )));
            }
            papers_by_pattern_edge
                .entry(pattern)
                .or_default()
                .push((paper, UsesPattern { quality: edge.quality }));
        }

        let mut patterns_by_domain: HashMap<usize, Vec<(usize, WorksWellIn)>> = HashMap::new();
        for edge in &edges.works_well_in {
            let pattern = resolve(&pattern_idx, &edge.pattern_id, "works_well_in pattern")?;
            let domain = resolve(&domain_idx, &edge.domain_id, "works_well_in domain")?;
            if !(-1.0..=1.0).contains(&edge.effectiveness) || !(0.0..=1.0).contains(&edge.confidence)
            {
                return Err(EngineError::Config(format!(
                    "works_well_in edge {} -> {} has out-of-range weights",
                    edge.pattern_id, edge.domain_id
                )));
            }
            patterns_by_domain.entry(domain).or_default().push((
                pattern,
                WorksWellIn {
                    effectiveness: edge.effectiveness,
                    confidence: edge.confidence,
                },
            ));
        }

        let mut domains_by_idea: HashMap<usize, Vec<(usize, BelongsTo)>> = HashMap::new();
        for edge in &edges.belongs_to {
            let idea = resolve(&idea_idx, &edge.idea_id, "belongs_to idea")?;
            let domain = resolve(&domain_idx, &edge.domain_id, "belongs_to domain")?;
            if !(0.0..=1.0).contains(&edge.weight) {
                return Err(EngineError::Config(format!(
                    "belongs_to edge {} -> {} has weight {} outside [0, 1]",
                    edge.idea_id, edge.domain_id, edge.weight
                )));
            }
            domains_by_idea
                .entry(idea)
                .or_default()
                .push((domain, BelongsTo { weight: edge.weight }));
        }

        let mut cluster_papers: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut domain_papers: HashMap<usize, Vec<usize>> = HashMap::new();
        for (i, paper) in papers.iter().enumerate() {
            if let Some(pid) = &paper.pattern_id {
                cluster_papers.entry(pattern_idx[pid]).or_default().push(i);
            }
            domain_papers
                .entry(domain_idx[&paper.domain_id])
                .or_default()
                .push(i);
        }

        Ok(Self {
            ideas,
            patterns,
            domains,
            papers,
            pattern_idx,
            domain_idx,
            paper_idx,
            papers_by_pattern_edge,
            patterns_by_domain,
            domains_by_idea,
            cluster_papers,
            domain_papers,
            paper_file_hash,
        })
    }

    pub fn ideas(&self) -> &[Idea] {
        &self.ideas
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn domains(&self) -> &[Domain] {
        &self.domains
    }

    pub fn papers(&self) -> &[Paper] {
        &self.papers
    }

    pub fn pattern_by_id(&self, id: &str) -> Option<&Pattern> {
        self.pattern_idx.get(id).map(|i| &self.patterns[*i])
    }

    pub fn paper_by_id(&self, id: &str) -> Option<&Paper> {
        self.paper_idx.get(id).map(|i| &self.papers[*i])
    }

    pub fn domain_by_id(&self, id: &str) -> Option<&Domain> {
        self.domain_idx.get(id).map(|i| &self.domains[*i])
    }

    /// Papers connected to a pattern by `uses_pattern` edges.
    pub fn papers_using(&self, pattern_id: &str) -> Vec<(&Paper, UsesPattern)> {
        let Some(idx) = self.pattern_idx.get(pattern_id) else {
            return Vec::new();
        };
        self.papers_by_pattern_edge
            .get(idx)
            .map(|edges| {
                edges
                    .iter()
                    .map(|(paper, edge)| (&self.papers[*paper], *edge))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `uses_pattern` edges leaving a paper.
    pub fn patterns_used_by(&self, paper_id: &str) -> Vec<(&Pattern, UsesPattern)> {
        let Some(paper) = self.paper_idx.get(paper_id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (pattern, edges) in &self.papers_by_pattern_edge {
            for (p, edge) in edges {
                if p == paper {
                    out.push((&self.patterns[*pattern], *edge));
                }
            }
        }
        out
    }

    /// Patterns with a `works_well_in` edge into the domain.
    pub fn patterns_effective_in(&self, domain_id: &str) -> Vec<(&Pattern, WorksWellIn)> {
        let Some(idx) = self.domain_idx.get(domain_id) else {
            return Vec::new();
        };
        self.patterns_by_domain
            .get(idx)
            .map(|edges| {
                edges
                    .iter()
                    .map(|(pattern, edge)| (&self.patterns[*pattern], *edge))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Domains an idea belongs to.
    pub fn domains_of(&self, idea_id: &str) -> Vec<(&Domain, BelongsTo)> {
        let Some(idx) = self
            .ideas
            .iter()
            .position(|i| i.idea_id == idea_id)
        else {
            return Vec::new();
        };
        self.domains_by_idea
            .get(&idx)
            .map(|edges| {
                edges
                    .iter()
                    .map(|(domain, edge)| (&self.domains[*domain], *edge))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Papers assigned to a pattern's cluster (via `Paper.pattern_id`).
    pub fn papers_in_cluster(&self, pattern_id: &str) -> Vec<&Paper> {
        let Some(idx) = self.pattern_idx.get(pattern_id) else {
            return Vec::new();
        };
        self.cluster_papers
            .get(idx)
            .map(|ids| ids.iter().map(|i| &self.papers[*i]).collect())
            .unwrap_or_default()
    }

    /// Papers in a domain.
    pub fn papers_in_domain(&self, domain_id: &str) -> Vec<&Paper> {
        let Some(idx) = self.domain_idx.get(domain_id) else {
            return Vec::new();
        };
        self.domain_papers
            .get(idx)
            .map(|ids| ids.iter().map(|i| &self.papers[*i]).collect())
            .unwrap_or_default()
    }

    /// sha256 hex digest of the raw `nodes_paper.json` bytes.
    pub fn paper_file_hash(&self) -> &str {
        &self.paper_file_hash
    }
}

fn load_nodes<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let body = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Config(format!("cannot read {:?}: {}", path, e)))?;
    serde_json::from_str(&body)
        .map_err(|e| EngineError::Config(format!("cannot parse {:?}: {}", path, e)))
}

fn resolve(idx: &HashMap<String, usize>, id: &str, what: &str) -> Result<usize> {
    idx.get(id)
        .copied()
        .ok_or_else(|| EngineError::Config(format!("{} endpoint '{}' does not exist", what, id)))
}
