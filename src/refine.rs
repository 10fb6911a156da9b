//! Refinement engine
//!
//! Decides how a failing story changes between critic rounds. The
//! weakest role picks the ranking to draw the next pattern from, the
//! failure map keeps burned (pattern, issue) pairs out of rotation, and
//! the idea-fusion sub-routine turns the chosen pattern into guidance
//! the generator can co-evolve with. Rollback restoration itself is the
//! pipeline manager's move; this module supplies the decisions.

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::llm::{strip_code_fence, ChatMessage, ChatRequest, LlmGateway, ResponseFormat};
use crate::selector::SelectionRankings;
use crate::types::{CancelToken, Pattern, Role, RoleScores, Story};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Failed (pattern, issue) pairs. A pattern burned for novelty can still
/// be tried for a methodology fix.
pub type FailureMap = HashMap<String, HashSet<Role>>;

/// Two concepts and the bridge between them, produced by the fusion call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdeaFusion {
    pub concept_a: String,
    pub concept_b: String,
    pub fusion_approach: String,
    pub fused_idea: String,
    #[serde(default)]
    pub expected_benefits: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReflectionScores {
    pub concept_unity: f64,
    pub technical_soundness: f64,
    pub novelty_level: f64,
    pub narrative_clarity: f64,
}

/// Second-pass self-check over a fusion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FusionReflection {
    #[serde(default)]
    pub scores: ReflectionScores,
    pub fusion_quality: f64,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// What one refinement round did, archived by the pipeline manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementRecord {
    pub iteration: usize,
    pub issue: Role,
    pub pattern_id: String,
    /// injected | rolled_back | novelty_mode | fusion_skipped
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fusion_quality: Option<f64>,
}

/// True when the novelty score failed to move meaningfully since the
/// previous round.
pub fn novelty_stagnated(previous: f64, current: f64, delta: f64) -> bool {
    current - previous <= delta
}

/// The role that most needs fixing this round.
pub fn weakest_role(scores: &RoleScores) -> Role {
    Role::ALL
        .iter()
        .copied()
        .min_by(|a, b| {
            scores
                .get(*a)
                .partial_cmp(&scores.get(*b))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(Role::Novelty)
}

/// The ranking a weak role draws patterns from: weak novelty wants the
/// novelty ranking, weak methodology wants stability, weak storytelling
/// wants the closest domain.
pub fn ranking_for<'a>(role: Role, rankings: &'a SelectionRankings) -> &'a [String] {
    match role {
        Role::Novelty => &rankings.novelty,
        Role::Methodology => &rankings.stability,
        Role::Storyteller => &rankings.domain_distance,
    }
}

/// First pattern in the role's ranking that is neither the current one
/// nor already burned for this issue.
pub fn next_pattern(
    role: Role,
    rankings: &SelectionRankings,
    failures: &FailureMap,
    current: Option<&str>,
) -> Option<String> {
    ranking_for(role, rankings)
        .iter()
        .find(|candidate| {
            Some(candidate.as_str()) != current
                && !failures
                    .get(candidate.as_str())
                    .map(|kinds| kinds.contains(&role))
                    .unwrap_or(false)
        })
        .cloned()
}

/// Mark a pattern as failed for one issue kind.
pub fn mark_failed(failures: &mut FailureMap, pattern_id: &str, role: Role) {
    failures
        .entry(pattern_id.to_string())
        .or_default()
        .insert(role);
}

pub struct RefinementEngine {
    llm: Arc<dyn LlmGateway>,
    cfg: Arc<Config>,
}

impl RefinementEngine {
    pub fn new(llm: Arc<dyn LlmGateway>, cfg: Arc<Config>) -> Self {
        Self { llm, cfg }
    }

    /// Fusion then reflection. Returns `None` when the reflection puts
    /// fusion quality under the configured bar, meaning the caller
    /// should move on to the next candidate pattern.
    pub async fn attempt_fusion(
        &self,
        story: &Story,
        pattern: &Pattern,
        cancel: &CancelToken,
    ) -> Result<Option<(IdeaFusion, FusionReflection)>> {
        let fusion = self.fuse(story, pattern, cancel).await?;
        let reflection = self.reflect(&fusion, cancel).await?;
        if reflection.fusion_quality < self.cfg.fusion_quality_threshold {
            tracing::info!(
                pattern = %pattern.pattern_id,
                quality = reflection.fusion_quality,
                "fusion under the quality bar, skipping pattern"
            );
            return Ok(None);
        }
        Ok(Some((fusion, reflection)))
    }

    async fn fuse(
        &self,
        story: &Story,
        pattern: &Pattern,
        cancel: &CancelToken,
    ) -> Result<IdeaFusion> {
        let prompt = format!(
            "## Current story\ntitle: {}\nproblem: {}\nmethod: {}\n\n## Pattern to fuse in\n\
             name: {}\nstory: {}\napproaches: {}\n\nExtract the story's core concept and the \
             pattern's core concept, then fuse them into ONE reframed idea.",
            story.title,
            story.problem_framing,
            story.method_skeleton,
            pattern.name,
            pattern.summary.story,
            pattern.summary.solution_approaches.join("; "),
        );
        self.json_call(
            "refine.fusion",
            FUSION_SYSTEM,
            prompt,
            self.cfg.fusion_max_tokens,
            |text| {
                let fusion: IdeaFusion = serde_json::from_str(strip_code_fence(text))
                    .map_err(|e| format!("not a valid fusion object: {}", e))?;
                if fusion.fused_idea.trim().is_empty() {
                    return Err("fused_idea is empty".to_string());
                }
                Ok(fusion)
            },
            cancel,
        )
        .await
    }

    async fn reflect(&self, fusion: &IdeaFusion, cancel: &CancelToken) -> Result<FusionReflection> {
        let prompt = format!(
            "## Fusion under review\nconcept A: {}\nconcept B: {}\napproach: {}\nfused idea: {}\n\n\
             Assess whether this is one coherent concept or two ideas stapled together.",
            fusion.concept_a, fusion.concept_b, fusion.fusion_approach, fusion.fused_idea
        );
        self.json_call(
            "refine.reflection",
            REFLECTION_SYSTEM,
            prompt,
            self.cfg.fusion_max_tokens,
            |text| {
                let reflection: FusionReflection = serde_json::from_str(strip_code_fence(text))
                    .map_err(|e| format!("not a valid reflection object: {}", e))?;
                if !(0.0..=1.0).contains(&reflection.fusion_quality) {
                    return Err(format!(
                        "fusion_quality {} outside [0, 1]",
                        reflection.fusion_quality
                    ));
                }
                Ok(reflection)
            },
            cancel,
        )
        .await
    }

    async fn json_call<T, F>(
        &self,
        stage: &str,
        system: &str,
        prompt: String,
        max_tokens: usize,
        parse: F,
        cancel: &CancelToken,
    ) -> Result<T>
    where
        F: Fn(&str) -> std::result::Result<T, String>,
    {
        let mut messages = vec![ChatMessage::user(prompt)];
        let mut last_error = String::new();

        for attempt in 0..=self.cfg.json_retries {
            cancel.check()?;
            let request = ChatRequest {
                stage: stage.to_string(),
                system: Some(system.to_string()),
                messages: messages.clone(),
                model: self.cfg.llm_model.clone(),
                temperature: self.cfg.story_temperature,
                max_tokens,
                response_format: ResponseFormat::Json,
            };
            let outcome = self.llm.chat(&request).await?;
            match parse(&outcome.text) {
                Ok(value) => return Ok(value),
                Err(reason) => {
                    tracing::warn!(stage, attempt, %reason, "refinement JSON rejected");
                    last_error = reason.clone();
                    messages.push(ChatMessage::assistant(outcome.text));
                    messages.push(ChatMessage::user(format!(
                        "Your reply was rejected: {}. Respond again with ONLY the corrected JSON.",
                        reason
                    )));
                }
            }
        }

        Err(EngineError::InvalidOutput(format!(
            "{} produced no valid JSON after {} repairs: {}",
            stage, self.cfg.json_retries, last_error
        )))
    }
}

const FUSION_SYSTEM: &str = "You fuse research concepts. Reply with ONLY JSON: \
{\"concept_a\", \"concept_b\", \"fusion_approach\", \"fused_idea\", \
\"expected_benefits\": [..]}. The fused idea must be one concept, not a list.";

const REFLECTION_SYSTEM: &str = "You audit concept fusions. Reply with ONLY JSON: \
{\"scores\": {\"concept_unity\", \"technical_soundness\", \"novelty_level\", \
\"narrative_clarity\"}, \"fusion_quality\": q in [0,1], \"suggestions\": [..]}.";

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::kg::tests as kgt;
    use crate::llm::tests::ScriptedLlm;

    pub(crate) fn fusion_json(quality_hint: &str) -> String {
        serde_json::json!({
            "concept_a": "policy learning",
            "concept_b": quality_hint,
            "fusion_approach": "treat scheduling as a learned policy",
            "fused_idea": "policy-guided adaptive scheduling",
            "expected_benefits": ["tighter latency"]
        })
        .to_string()
    }

    pub(crate) fn reflection_json(quality: f64) -> String {
        serde_json::json!({
            "scores": {
                "concept_unity": 0.8,
                "technical_soundness": 0.7,
                "novelty_level": 0.75,
                "narrative_clarity": 0.7
            },
            "fusion_quality": quality,
            "suggestions": ["name the shared objective earlier"]
        })
        .to_string()
    }

    fn rankings() -> SelectionRankings {
        let mut rankings = SelectionRankings::default();
        rankings.novelty = vec!["ptA".into(), "ptB".into(), "ptC".into()];
        rankings.stability = vec!["ptB".into(), "ptA".into(), "ptC".into()];
        rankings.domain_distance = vec!["ptC".into(), "ptA".into(), "ptB".into()];
        rankings
    }

    #[test]
    fn test_weakest_role() {
        let scores = RoleScores {
            methodology: 7.0,
            novelty: 5.5,
            storyteller: 6.8,
        };
        assert_eq!(weakest_role(&scores), Role::Novelty);
    }

    #[test]
    fn test_role_to_ranking_mapping() {
        let r = rankings();
        assert_eq!(ranking_for(Role::Novelty, &r)[0], "ptA");
        assert_eq!(ranking_for(Role::Methodology, &r)[0], "ptB");
        assert_eq!(ranking_for(Role::Storyteller, &r)[0], "ptC");
    }

    #[test]
    fn test_next_pattern_skips_failed_and_current() {
        let r = rankings();
        let mut failures = FailureMap::new();

        // ptA burned for novelty: novelty draw moves to ptB.
        mark_failed(&mut failures, "ptA", Role::Novelty);
        assert_eq!(
            next_pattern(Role::Novelty, &r, &failures, None),
            Some("ptB".to_string())
        );

        // ptA burned for novelty is still available for methodology.
        assert_eq!(
            next_pattern(Role::Methodology, &r, &failures, Some("ptB")),
            Some("ptA".to_string())
        );

        // Everything burned: nothing left.
        mark_failed(&mut failures, "ptB", Role::Novelty);
        mark_failed(&mut failures, "ptC", Role::Novelty);
        assert_eq!(next_pattern(Role::Novelty, &r, &failures, None), None);
    }

    #[test]
    fn test_stagnation_boundary() {
        assert!(novelty_stagnated(5.5, 5.6, 0.5));
        assert!(novelty_stagnated(5.5, 6.0, 0.5));
        assert!(!novelty_stagnated(5.5, 6.1, 0.5));
    }

    #[tokio::test]
    async fn test_fusion_above_bar_returned() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok(fusion_json("speculative decoding")),
            Ok(reflection_json(0.72)),
        ]));
        let engine = RefinementEngine::new(llm, Arc::new(Config::default()));
        let story: Story = serde_json::from_str(&crate::story::tests::story_json("T")).unwrap();
        let pattern = kgt::pattern("ptA", "speculative", "d1", 8);

        let result = engine
            .attempt_fusion(&story, &pattern, &CancelToken::new())
            .await
            .unwrap();
        let (fusion, reflection) = result.unwrap();
        assert_eq!(fusion.fused_idea, "policy-guided adaptive scheduling");
        assert!((reflection.fusion_quality - 0.72).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_fusion_below_bar_skipped() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok(fusion_json("weak pairing")),
            Ok(reflection_json(0.4)),
        ]));
        let engine = RefinementEngine::new(llm, Arc::new(Config::default()));
        let story: Story = serde_json::from_str(&crate::story::tests::story_json("T")).unwrap();
        let pattern = kgt::pattern("ptA", "weak", "d1", 8);

        let result = engine
            .attempt_fusion(&story, &pattern, &CancelToken::new())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_fusion_json_repair() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok("no json".into()),
            Ok(fusion_json("second try")),
            Ok(reflection_json(0.9)),
        ]));
        let engine = RefinementEngine::new(Arc::clone(&llm) as _, Arc::new(Config::default()));
        let story: Story = serde_json::from_str(&crate::story::tests::story_json("T")).unwrap();
        let pattern = kgt::pattern("ptA", "x", "d1", 8);

        let result = engine
            .attempt_fusion(&story, &pattern, &CancelToken::new())
            .await
            .unwrap();
        assert!(result.is_some());
        assert_eq!(llm.call_count(), 3);
    }
}
