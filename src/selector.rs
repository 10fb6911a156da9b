//! Pattern selection
//!
//! Classifies the recalled patterns on three dimensions - stability,
//! novelty, domain distance - with one LLM call per pattern, issued
//! concurrently. Any failed call falls back to the cluster-size rule so
//! selection never blocks the pipeline.

use crate::config::Config;
use crate::error::Result;
use crate::kg::KgStore;
use crate::llm::{strip_code_fence, ChatMessage, ChatRequest, LlmGateway, ResponseFormat};
use crate::recall::RecalledPattern;
use crate::types::{CancelToken, Pattern};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Cluster size at which the stability rule saturates.
const STABILITY_SATURATION: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreSource {
    Llm,
    Rule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternScores {
    pub pattern_id: String,
    /// How reliably this trope produces publishable work, in [0, 1]
    pub stability: f64,
    /// How much headroom for surprise remains, in [0, 1]
    pub novelty: f64,
    /// Distance from the user's idea; smaller is closer, in [0, 1]
    pub domain_distance: f64,
    pub source: ScoreSource,
}

/// Three orderings over the same candidate set. Stability and novelty
/// rank descending; domain distance ranks ascending (closest first).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionRankings {
    pub stability: Vec<String>,
    pub novelty: Vec<String>,
    pub domain_distance: Vec<String>,
    pub scores: HashMap<String, PatternScores>,
}

impl SelectionRankings {
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct RawScores {
    stability: f64,
    novelty: f64,
    domain_distance: f64,
}

pub struct PatternSelector {
    llm: Arc<dyn LlmGateway>,
    cfg: Arc<Config>,
}

impl PatternSelector {
    pub fn new(llm: Arc<dyn LlmGateway>, cfg: Arc<Config>) -> Self {
        Self { llm, cfg }
    }

    /// Score the top recalled patterns. Empty input yields empty
    /// rankings and no LLM traffic.
    pub async fn select(
        &self,
        recalled: &[RecalledPattern],
        kg: &KgStore,
        user_idea: &str,
        idea_brief: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<SelectionRankings> {
        if recalled.is_empty() {
            return Ok(SelectionRankings::default());
        }
        cancel.check()?;

        let mut set: JoinSet<PatternScores> = JoinSet::new();
        for candidate in recalled.iter().take(self.cfg.pattern_select_topn) {
            let Some(pattern) = kg.pattern_by_id(&candidate.pattern_id) else {
                continue;
            };
            let llm = Arc::clone(&self.llm);
            let cfg = Arc::clone(&self.cfg);
            let prompt = build_prompt(pattern, user_idea, idea_brief);
            let pattern_id = pattern.pattern_id.clone();
            let cluster_size = pattern.cluster_size;

            set.spawn(async move {
                let request = ChatRequest {
                    stage: "selector".to_string(),
                    system: Some(SYSTEM_PROMPT.to_string()),
                    messages: vec![ChatMessage::user(prompt)],
                    model: cfg.llm_model.clone(),
                    temperature: 0.0,
                    max_tokens: cfg.selector_max_tokens,
                    response_format: ResponseFormat::Json,
                };
                match llm.chat(&request).await {
                    Ok(outcome) => parse_scores(&pattern_id, &outcome.text)
                        .unwrap_or_else(|| rule_scores(&pattern_id, cluster_size)),
                    Err(err) => {
                        tracing::warn!(pattern = %pattern_id, error = %err, "selector call failed, using rule fallback");
                        rule_scores(&pattern_id, cluster_size)
                    }
                }
            });
        }

        let mut scores: HashMap<String, PatternScores> = HashMap::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(score) = joined {
                scores.insert(score.pattern_id.clone(), score);
            }
        }

        Ok(build_rankings(scores))
    }
}

const SYSTEM_PROMPT: &str = "You classify research-trope patterns for a story \
generation engine. Reply with a single JSON object: \
{\"stability\": s, \"novelty\": n, \"domain_distance\": d}, each in [0, 1]. \
stability = how reliably this pattern yields sound papers; novelty = how much \
unexplored room it still offers; domain_distance = how far the pattern's home \
domain is from the user's idea (0 = same area).";

fn build_prompt(pattern: &Pattern, user_idea: &str, idea_brief: Option<&str>) -> String {
    let mut prompt = format!(
        "## User idea\n{}\n\n## Pattern\nname: {}\ndomain: {}\ncluster size: {}\nstory: {}\n",
        user_idea, pattern.name, pattern.domain, pattern.cluster_size, pattern.summary.story
    );
    if !pattern.summary.solution_approaches.is_empty() {
        prompt.push_str(&format!(
            "approaches: {}\n",
            pattern.summary.solution_approaches.join("; ")
        ));
    }
    if let Some(brief) = idea_brief {
        prompt.push_str(&format!("\n## Idea brief\n{}\n", brief));
    }
    prompt.push_str("\nScore this pattern for the idea.");
    prompt
}

fn parse_scores(pattern_id: &str, text: &str) -> Option<PatternScores> {
    let raw: RawScores = serde_json::from_str(strip_code_fence(text)).ok()?;
    Some(PatternScores {
        pattern_id: pattern_id.to_string(),
        stability: raw.stability.clamp(0.0, 1.0),
        novelty: raw.novelty.clamp(0.0, 1.0),
        domain_distance: raw.domain_distance.clamp(0.0, 1.0),
        source: ScoreSource::Llm,
    })
}

/// Rule fallback: big clusters are stable and mined out, small ones are
/// the reverse; distance is unknown so it sits in the middle.
fn rule_scores(pattern_id: &str, cluster_size: usize) -> PatternScores {
    let stability = (cluster_size as f64 / STABILITY_SATURATION).clamp(0.0, 1.0);
    PatternScores {
        pattern_id: pattern_id.to_string(),
        stability,
        novelty: 1.0 - stability,
        domain_distance: 0.5,
        source: ScoreSource::Rule,
    }
}

fn build_rankings(scores: HashMap<String, PatternScores>) -> SelectionRankings {
    let mut by_stability: Vec<&PatternScores> = scores.values().collect();
    by_stability.sort_by(|a, b| {
        b.stability
            .partial_cmp(&a.stability)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.pattern_id.cmp(&b.pattern_id))
    });

    let mut by_novelty: Vec<&PatternScores> = scores.values().collect();
    by_novelty.sort_by(|a, b| {
        b.novelty
            .partial_cmp(&a.novelty)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.pattern_id.cmp(&b.pattern_id))
    });

    let mut by_distance: Vec<&PatternScores> = scores.values().collect();
    by_distance.sort_by(|a, b| {
        a.domain_distance
            .partial_cmp(&b.domain_distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.pattern_id.cmp(&b.pattern_id))
    });

    SelectionRankings {
        stability: by_stability.iter().map(|s| s.pattern_id.clone()).collect(),
        novelty: by_novelty.iter().map(|s| s.pattern_id.clone()).collect(),
        domain_distance: by_distance.iter().map(|s| s.pattern_id.clone()).collect(),
        scores,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kg::tests as kgt;
    use crate::llm::tests::ScriptedLlm;
    use crate::types::{BelongsTo, UsesPattern, WorksWellIn};

    fn store() -> KgStore {
        KgStore::from_parts(
            vec![],
            vec![
                kgt::pattern("pt1", "rl-optimization", "d1", 10),
                kgt::pattern("pt2", "contrastive-objective", "d1", 40),
            ],
            vec![kgt::domain("d1", "ml", &[])],
            vec![],
            Vec::<(String, String, UsesPattern)>::new(),
            Vec::<(String, String, WorksWellIn)>::new(),
            Vec::<(String, String, BelongsTo)>::new(),
        )
        .unwrap()
    }

    fn recalled(ids: &[&str]) -> Vec<RecalledPattern> {
        ids.iter()
            .map(|id| RecalledPattern {
                pattern_id: id.to_string(),
                score: 1.0,
                path1: 1.0,
                path2: 0.0,
                path3: 0.0,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_llm_scores_ranked() {
        // Scores arrive per pattern; order of replies does not matter
        // because both tasks pop from the same script.
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok(r#"{"stability": 0.9, "novelty": 0.2, "domain_distance": 0.1}"#.into()),
            Ok(r#"{"stability": 0.3, "novelty": 0.8, "domain_distance": 0.6}"#.into()),
        ]));
        let selector = PatternSelector::new(llm, Arc::new(Config::default()));
        let rankings = selector
            .select(
                &recalled(&["pt1", "pt2"]),
                &store(),
                "an idea",
                None,
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(rankings.scores.len(), 2);
        assert_eq!(rankings.stability.len(), 2);
        assert_eq!(rankings.novelty.len(), 2);
        assert_eq!(rankings.domain_distance.len(), 2);

        // stability descending, domain_distance ascending
        let top_stability = &rankings.scores[&rankings.stability[0]];
        let second_stability = &rankings.scores[&rankings.stability[1]];
        assert!(top_stability.stability >= second_stability.stability);

        let closest = &rankings.scores[&rankings.domain_distance[0]];
        let farthest = &rankings.scores[&rankings.domain_distance[1]];
        assert!(closest.domain_distance <= farthest.domain_distance);
    }

    #[tokio::test]
    async fn test_rule_fallback_on_gateway_failure() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Err(crate::error::EngineError::Transport("down".into())),
            Err(crate::error::EngineError::Transport("down".into())),
        ]));
        let selector = PatternSelector::new(llm, Arc::new(Config::default()));
        let rankings = selector
            .select(
                &recalled(&["pt1", "pt2"]),
                &store(),
                "an idea",
                None,
                &CancelToken::new(),
            )
            .await
            .unwrap();

        let pt1 = &rankings.scores["pt1"];
        assert_eq!(pt1.source, ScoreSource::Rule);
        assert!((pt1.stability - 0.2).abs() < 1e-12);
        assert!((pt1.novelty - 0.8).abs() < 1e-12);
        assert_eq!(pt1.domain_distance, 0.5);

        let pt2 = &rankings.scores["pt2"];
        assert!((pt2.stability - 0.8).abs() < 1e-12);
        // Big cluster outranks small on stability under the rule.
        assert_eq!(rankings.stability[0], "pt2");
        assert_eq!(rankings.novelty[0], "pt1");
    }

    #[tokio::test]
    async fn test_garbled_json_falls_back() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok("not json at all".into())]));
        let selector = PatternSelector::new(llm, Arc::new(Config::default()));
        let rankings = selector
            .select(
                &recalled(&["pt1"]),
                &store(),
                "an idea",
                None,
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(rankings.scores["pt1"].source, ScoreSource::Rule);
    }

    #[tokio::test]
    async fn test_empty_recall_is_empty_and_silent() {
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let selector = PatternSelector::new(Arc::clone(&llm) as Arc<dyn LlmGateway>, Arc::new(Config::default()));
        let rankings = selector
            .select(&[], &store(), "an idea", None, &CancelToken::new())
            .await
            .unwrap();
        assert!(rankings.is_empty());
        assert_eq!(llm.call_count(), 0);
    }

    #[test]
    fn test_clamping() {
        let parsed = parse_scores(
            "p",
            r#"{"stability": 1.4, "novelty": -0.2, "domain_distance": 0.5}"#,
        )
        .unwrap();
        assert_eq!(parsed.stability, 1.0);
        assert_eq!(parsed.novelty, 0.0);
    }
}
