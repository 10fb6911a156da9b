//! Core types for the storyforge engine
//!
//! Knowledge-graph entities are loaded once at process start and are
//! read-only afterwards. The `Story` is the only mutable entity and is
//! only ever rewritten by the generator; every other component consumes
//! it by reference.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A seed idea from the knowledge graph build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Idea {
    pub idea_id: String,
    pub description: String,
    #[serde(default)]
    pub pattern_ids: BTreeSet<String>,
}

/// A cluster summary of prior papers - a research-trope template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub pattern_id: String,
    pub name: String,
    pub cluster_size: usize,
    pub domain: String,
    #[serde(default)]
    pub sub_domains: Vec<String>,
    pub summary: PatternSummary,
    /// Present only when the KG build ran LLM enrichment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skeleton_examples: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_tricks: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternSummary {
    #[serde(default)]
    pub representative_ideas: Vec<String>,
    #[serde(default)]
    pub common_problems: Vec<String>,
    #[serde(default)]
    pub solution_approaches: Vec<String>,
    #[serde(default)]
    pub story: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub domain_id: String,
    pub name: String,
    #[serde(default)]
    pub sub_domains: Vec<String>,
    #[serde(default)]
    pub paper_count: usize,
}

/// A real prior paper. `review_stats` is the sole ground-truth signal for
/// anchor scoring; papers without it never become anchors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paper {
    pub paper_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_id: Option<String>,
    pub domain_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_stats: Option<ReviewStats>,
    /// Anonymizable content summary used to build blind cards. Papers
    /// without one cannot be shown to the critic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<PaperSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewStats {
    /// Average review score on the 1-10 scale
    pub avg_score10: f64,
    pub review_count: usize,
    pub dispersion10: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperSummary {
    #[serde(default)]
    pub problem: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub contrib: String,
}

// === Typed weighted edges ===

/// Paper -uses_pattern-> Pattern
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UsesPattern {
    /// Edge quality in [0, 1]
    pub quality: f64,
}

/// Pattern -works_well_in-> Domain
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorksWellIn {
    /// Effectiveness in [-1, 1]
    pub effectiveness: f64,
    /// Confidence in [0, 1]
    pub confidence: f64,
}

/// Idea -belongs_to-> Domain
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BelongsTo {
    pub weight: f64,
}

// === Generated entities ===

/// The structured paper story. Mutated only by the generator; archived in
/// history by the pipeline manager on each critic round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub problem_framing: String,
    pub gap_pattern: String,
    pub method_skeleton: String,
    pub innovation_claims: Vec<String>,
    pub experiments_plan: String,
}

impl Story {
    /// Ordered (field name, text) pairs, list fields joined.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("title", self.title.clone()),
            ("abstract", self.abstract_text.clone()),
            ("problem_framing", self.problem_framing.clone()),
            ("gap_pattern", self.gap_pattern.clone()),
            ("method_skeleton", self.method_skeleton.clone()),
            ("innovation_claims", self.innovation_claims.join("; ")),
            ("experiments_plan", self.experiments_plan.clone()),
        ]
    }
}

/// Runtime-only anchor record. Never serialized into an LLM prompt; the
/// critic only ever transmits the blind card derived from the paper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorSummary {
    pub paper_id: String,
    pub score10: f64,
    /// log(1 + review_count) / (1 + dispersion10)
    pub weight: f64,
}

impl AnchorSummary {
    pub fn from_stats(paper_id: &str, stats: &ReviewStats) -> Self {
        Self {
            paper_id: paper_id.to_string(),
            score10: stats.avg_score10,
            weight: (1.0 + stats.review_count as f64).ln() / (1.0 + stats.dispersion10),
        }
    }
}

// === Critic judgment types ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Judgement {
    Better,
    Tie,
    Worse,
}

impl Judgement {
    /// Target probability that the story beats the anchor.
    pub fn target(&self) -> f64 {
        match self {
            Judgement::Better => 1.0,
            Judgement::Tie => 0.5,
            Judgement::Worse => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    Weak,
    Medium,
    Strong,
}

impl Strength {
    pub fn weight(&self) -> f64 {
        match self {
            Strength::Weak => 1.0,
            Strength::Medium => 2.0,
            Strength::Strong => 3.0,
        }
    }
}

/// One blind pairwise judgment against a local anchor alias (A1..AK).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comparison {
    pub anchor_id: String,
    pub judgement: Judgement,
    pub strength: Strength,
    pub rationale: String,
}

/// Critic roles, each scored independently from the same blind cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Methodology,
    Novelty,
    Storyteller,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Methodology, Role::Novelty, Role::Storyteller];

    pub fn name(&self) -> &'static str {
        match self {
            Role::Methodology => "methodology",
            Role::Novelty => "novelty",
            Role::Storyteller => "storyteller",
        }
    }
}

/// Per-role scores from one critic round.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoleScores {
    pub methodology: f64,
    pub novelty: f64,
    pub storyteller: f64,
}

impl RoleScores {
    pub fn get(&self, role: Role) -> f64 {
        match role {
            Role::Methodology => self.methodology,
            Role::Novelty => self.novelty,
            Role::Storyteller => self.storyteller,
        }
    }

    pub fn average(&self) -> f64 {
        (self.methodology + self.novelty + self.storyteller) / 3.0
    }

    /// Roles whose score dropped more than `threshold` below `before`.
    pub fn degraded_roles(&self, before: &RoleScores, threshold: f64) -> Vec<Role> {
        Role::ALL
            .iter()
            .copied()
            .filter(|r| before.get(*r) - self.get(*r) > threshold)
            .collect()
    }
}

/// Cooperative cancellation flag shared across the pipeline and gateways.
/// Checked at every external call boundary; no new call is issued after
/// the flag is set.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Error out if cancellation was requested.
    pub fn check(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            Err(crate::error::EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchor_weight_formula() {
        let stats = ReviewStats {
            avg_score10: 7.0,
            review_count: 3,
            dispersion10: 1.0,
        };
        let anchor = AnchorSummary::from_stats("p1", &stats);
        assert_eq!(anchor.score10, 7.0);
        assert!((anchor.weight - (4.0f64.ln() / 2.0)).abs() < 1e-12);
    }

    #[test]
    fn test_judgement_targets() {
        assert_eq!(Judgement::Better.target(), 1.0);
        assert_eq!(Judgement::Tie.target(), 0.5);
        assert_eq!(Judgement::Worse.target(), 0.0);
    }

    #[test]
    fn test_degraded_roles() {
        let before = RoleScores {
            methodology: 7.0,
            novelty: 6.0,
            storyteller: 7.5,
        };
        let after = RoleScores {
            methodology: 6.2,
            novelty: 6.0,
            storyteller: 7.45,
        };
        let degraded = after.degraded_roles(&before, 0.1);
        assert_eq!(degraded, vec![Role::Methodology]);
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(matches!(
            token.check(),
            Err(crate::error::EngineError::Cancelled)
        ));
    }

    #[test]
    fn test_story_json_uses_abstract_key() {
        let story = Story {
            title: "t".into(),
            abstract_text: "a".into(),
            problem_framing: "p".into(),
            gap_pattern: "g".into(),
            method_skeleton: "m".into(),
            innovation_claims: vec!["c1".into(), "c2".into()],
            experiments_plan: "e".into(),
        };
        let json = serde_json::to_value(&story).unwrap();
        assert_eq!(json["abstract"], "a");
        let fields = story.fields();
        assert_eq!(fields[0].0, "title");
        assert_eq!(fields[5].1, "c1; c2");
    }
}
