//! Story generation
//!
//! Turns (idea, pattern, optional guidance) into a structured `Story`.
//! Two modes share one code path: the initial prompt carries the pattern
//! summary and skeleton examples; the refinement prompt carries the
//! previous story, coach edits, fusion guidance and pivot constraints.
//! Output is strict JSON; malformed replies get bounded repair prompts.

use crate::coach::CoachAdvice;
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::llm::{strip_code_fence, ChatMessage, ChatRequest, LlmGateway, ResponseFormat};
use crate::novelty::PivotConstraint;
use crate::refine::IdeaFusion;
use crate::types::{CancelToken, Pattern, Story};
use std::sync::Arc;

/// Skeleton examples carried into the prompt.
const SKELETON_EXAMPLES_CAP: usize = 3;

/// Structured expansion of the raw idea text. Optional enrichment: the
/// pipeline runs without one when the expansion call fails.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IdeaBrief {
    pub core_goal: String,
    #[serde(default)]
    pub key_constraints: Vec<String>,
    #[serde(default)]
    pub candidate_directions: Vec<String>,
}

impl IdeaBrief {
    pub fn render(&self) -> String {
        let mut out = format!("core goal: {}", self.core_goal);
        if !self.key_constraints.is_empty() {
            out.push_str(&format!("\nconstraints: {}", self.key_constraints.join("; ")));
        }
        if !self.candidate_directions.is_empty() {
            out.push_str(&format!(
                "\ncandidate directions: {}",
                self.candidate_directions.join("; ")
            ));
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerateGuidance {
    pub idea_brief: Option<String>,
    pub constraints: Option<PivotConstraint>,
    pub injected_tricks: Vec<String>,
    pub previous_story: Option<Story>,
    pub review_feedback: Option<CoachAdvice>,
    pub fused_idea: Option<IdeaFusion>,
    pub reflection_guidance: Vec<String>,
}

impl GenerateGuidance {
    fn is_refinement(&self) -> bool {
        self.previous_story.is_some()
    }
}

pub struct StoryGenerator {
    llm: Arc<dyn LlmGateway>,
    cfg: Arc<Config>,
}

impl StoryGenerator {
    pub fn new(llm: Arc<dyn LlmGateway>, cfg: Arc<Config>) -> Self {
        Self { llm, cfg }
    }

    /// Expand the raw idea into a structured brief. Best-effort: any
    /// failure degrades to `None` rather than blocking the run.
    pub async fn expand_brief(&self, user_idea: &str, cancel: &CancelToken) -> Option<IdeaBrief> {
        if cancel.check().is_err() {
            return None;
        }
        let request = ChatRequest {
            stage: "brief".to_string(),
            system: Some(BRIEF_SYSTEM.to_string()),
            messages: vec![ChatMessage::user(format!(
                "Research idea: {}\n\nExpand it into the brief JSON.",
                user_idea
            ))],
            model: self.cfg.llm_model.clone(),
            temperature: 0.3,
            max_tokens: self.cfg.coach_max_tokens,
            response_format: ResponseFormat::Json,
        };
        match self.llm.chat(&request).await {
            Ok(outcome) => match serde_json::from_str::<IdeaBrief>(strip_code_fence(&outcome.text))
            {
                Ok(brief) if !brief.core_goal.trim().is_empty() => Some(brief),
                _ => {
                    tracing::warn!("idea brief reply unusable, continuing without one");
                    None
                }
            },
            Err(err) => {
                tracing::warn!(%err, "idea brief call failed, continuing without one");
                None
            }
        }
    }

    /// Generate (or refine) a story for the idea under a pattern.
    pub async fn generate(
        &self,
        user_idea: &str,
        pattern: &Pattern,
        guidance: &GenerateGuidance,
        cancel: &CancelToken,
    ) -> Result<Story> {
        let stage = if guidance.is_refinement() {
            "story.refine"
        } else {
            "story.initial"
        };
        let prompt = build_prompt(user_idea, pattern, guidance);

        let mut messages = vec![ChatMessage::user(prompt)];
        let mut last_error = String::new();

        for attempt in 0..=self.cfg.json_retries {
            cancel.check()?;
            let request = ChatRequest {
                stage: stage.to_string(),
                system: Some(SYSTEM_PROMPT.to_string()),
                messages: messages.clone(),
                model: self.cfg.llm_model.clone(),
                temperature: self.cfg.story_temperature,
                max_tokens: self.cfg.story_max_tokens,
                response_format: ResponseFormat::Json,
            };
            let outcome = self.llm.chat(&request).await?;

            match parse_story(&outcome.text) {
                Ok(story) => return Ok(story),
                Err(reason) => {
                    tracing::warn!(attempt, %reason, "story JSON rejected, repairing");
                    last_error = reason.clone();
                    messages.push(ChatMessage::assistant(outcome.text));
                    messages.push(ChatMessage::user(format!(
                        "Your reply was rejected: {}. Respond again with ONLY the \
                         corrected JSON object, no prose.",
                        reason
                    )));
                }
            }
        }

        Err(EngineError::InvalidOutput(format!(
            "story generation produced no valid JSON after {} repairs: {}",
            self.cfg.json_retries, last_error
        )))
    }
}

const BRIEF_SYSTEM: &str = "You expand raw research ideas. Reply with ONLY a \
JSON object: {\"core_goal\": \"...\", \"key_constraints\": [..], \
\"candidate_directions\": [..]}. Stay faithful to the idea; do not invent a \
different project.";

const SYSTEM_PROMPT: &str = "You are a research-story architect. You turn a raw \
idea and a research-trope pattern into a structured paper story. Reply with \
ONLY a JSON object with keys: title, abstract, problem_framing, gap_pattern, \
method_skeleton, innovation_claims (array of strings), experiments_plan. \
No markdown, no commentary.";

fn build_prompt(user_idea: &str, pattern: &Pattern, guidance: &GenerateGuidance) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("## Idea\n{}\n", user_idea));
    if let Some(brief) = &guidance.idea_brief {
        prompt.push_str(&format!("\n## Idea brief\n{}\n", brief));
    }

    prompt.push_str(&format!(
        "\n## Pattern: {}\ndomain: {}\nstory: {}\n",
        pattern.name, pattern.domain, pattern.summary.story
    ));
    if !pattern.summary.common_problems.is_empty() {
        prompt.push_str(&format!(
            "common problems: {}\n",
            pattern.summary.common_problems.join("; ")
        ));
    }
    if !pattern.summary.solution_approaches.is_empty() {
        prompt.push_str(&format!(
            "solution approaches: {}\n",
            pattern.summary.solution_approaches.join("; ")
        ));
    }
    if let Some(examples) = &pattern.skeleton_examples {
        for (i, example) in examples.iter().take(SKELETON_EXAMPLES_CAP).enumerate() {
            prompt.push_str(&format!("\n### Skeleton example {}\n{}\n", i + 1, example));
        }
    }
    if !guidance.injected_tricks.is_empty() {
        prompt.push_str(&format!(
            "\n## Tricks worth weaving in\n{}\n",
            guidance.injected_tricks.join("\n")
        ));
    }

    if let Some(previous) = &guidance.previous_story {
        prompt.push_str("\n## Previous story (to be improved, not discarded)\n");
        for (field, text) in previous.fields() {
            prompt.push_str(&format!("{}: {}\n", field, text));
        }
    }
    if let Some(feedback) = &guidance.review_feedback {
        prompt.push_str("\n## Reviewer edit suggestions\n");
        for edit in &feedback.suggested_edits {
            prompt.push_str(&format!(
                "- [{}] {}: {}\n",
                edit.action, edit.field, edit.content
            ));
        }
        if !feedback.priority.is_empty() {
            prompt.push_str(&format!(
                "Work on these fields first: {}\n",
                feedback.priority.join(", ")
            ));
        }
    }
    if let Some(fusion) = &guidance.fused_idea {
        prompt.push_str(&format!(
            "\n## Fusion guidance\nconcept A: {}\nconcept B: {}\nfused core idea: {}\n\
             reframed problem: {}\nLet the two concepts CO-EVOLVE into one method; \
             do not stack them side by side.\n",
            fusion.concept_a, fusion.concept_b, fusion.fused_idea, fusion.fusion_approach
        ));
    }
    if !guidance.reflection_guidance.is_empty() {
        prompt.push_str(&format!(
            "\n## Reflection suggestions\n{}\n",
            guidance.reflection_guidance.join("\n")
        ));
    }
    if let Some(constraints) = &guidance.constraints {
        prompt.push_str("\n## Hard constraints\n");
        if !constraints.forbidden_techniques.is_empty() {
            prompt.push_str(&format!(
                "Do NOT build the method around: {}\n",
                constraints.forbidden_techniques.join(", ")
            ));
        }
        prompt.push_str(&format!(
            "Pivot direction: {}\n",
            constraints.pivot_direction
        ));
        if let Some(shift) = &constraints.domain_shift {
            prompt.push_str(&format!("Consider shifting toward: {}\n", shift));
        }
    }

    prompt.push_str("\nProduce the story JSON now.");
    prompt
}

/// Parse and sanity-check a story reply. Returns a human-readable
/// rejection reason for the repair prompt on failure.
fn parse_story(text: &str) -> std::result::Result<Story, String> {
    let story: Story = serde_json::from_str(strip_code_fence(text))
        .map_err(|e| format!("not a valid story object: {}", e))?;

    for (field, value) in [
        ("title", &story.title),
        ("abstract", &story.abstract_text),
        ("problem_framing", &story.problem_framing),
        ("method_skeleton", &story.method_skeleton),
        ("experiments_plan", &story.experiments_plan),
    ] {
        if value.trim().is_empty() {
            return Err(format!("field '{}' is empty", field));
        }
    }
    if story.innovation_claims.is_empty() {
        return Err("innovation_claims must list at least one claim".to_string());
    }
    Ok(story)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::kg::tests as kgt;
    use crate::llm::tests::ScriptedLlm;

    pub(crate) fn story_json(title: &str) -> String {
        serde_json::json!({
            "title": title,
            "abstract": "We study the problem.",
            "problem_framing": "The problem matters.",
            "gap_pattern": "Existing work misses the gap.",
            "method_skeleton": "Three-stage method.",
            "innovation_claims": ["claim one"],
            "experiments_plan": "Benchmarks and ablations."
        })
        .to_string()
    }

    fn pattern() -> Pattern {
        let mut p = kgt::pattern("pt1", "rl-optimization", "d1", 12);
        p.skeleton_examples = Some(vec!["example skeleton".into()]);
        p
    }

    #[tokio::test]
    async fn test_initial_generation() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(story_json("RL for inference"))]));
        let generator = StoryGenerator::new(Arc::clone(&llm) as _, Arc::new(Config::default()));
        let story = generator
            .generate(
                "rl for inference",
                &pattern(),
                &GenerateGuidance::default(),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(story.title, "RL for inference");

        // Initial prompt carries the skeleton example.
        let calls = llm.calls.lock().unwrap();
        assert_eq!(calls[0].stage, "story.initial");
        assert!(calls[0].messages[0].content.contains("example skeleton"));
    }

    #[tokio::test]
    async fn test_repair_after_malformed_json() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok("here is your story: {broken".into()),
            Ok(story_json("Fixed")),
        ]));
        let generator = StoryGenerator::new(Arc::clone(&llm) as _, Arc::new(Config::default()));
        let story = generator
            .generate(
                "idea",
                &pattern(),
                &GenerateGuidance::default(),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(story.title, "Fixed");
        assert_eq!(llm.call_count(), 2);

        // Repair turn includes the rejected reply for context.
        let calls = llm.calls.lock().unwrap();
        assert_eq!(calls[1].messages.len(), 3);
        assert!(calls[1].messages[2].content.contains("rejected"));
    }

    #[tokio::test]
    async fn test_gives_up_after_retry_budget() {
        let mut cfg = Config::default();
        cfg.json_retries = 1;
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok("nope".into()),
            Ok("still nope".into()),
        ]));
        let generator = StoryGenerator::new(Arc::clone(&llm) as _, Arc::new(cfg));
        let err = generator
            .generate(
                "idea",
                &pattern(),
                &GenerateGuidance::default(),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOutput(_)));
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_refinement_prompt_carries_guidance() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(story_json("Refined"))]));
        let generator = StoryGenerator::new(Arc::clone(&llm) as _, Arc::new(Config::default()));

        let previous: Story = serde_json::from_str(&story_json("Old title")).unwrap();
        let guidance = GenerateGuidance {
            previous_story: Some(previous),
            fused_idea: Some(IdeaFusion {
                concept_a: "policy learning".into(),
                concept_b: "speculative decoding".into(),
                fusion_approach: "reframe scheduling as a learned policy".into(),
                fused_idea: "policy-guided speculative inference".into(),
                expected_benefits: vec!["lower latency".into()],
            }),
            reflection_guidance: vec!["tighten the gap statement".into()],
            ..Default::default()
        };

        generator
            .generate("idea", &pattern(), &guidance, &CancelToken::new())
            .await
            .unwrap();

        let calls = llm.calls.lock().unwrap();
        assert_eq!(calls[0].stage, "story.refine");
        let prompt = &calls[0].messages[0].content;
        assert!(prompt.contains("Old title"));
        assert!(prompt.contains("CO-EVOLVE"));
        assert!(prompt.contains("tighten the gap statement"));
    }

    #[tokio::test]
    async fn test_brief_expansion() {
        let brief = serde_json::json!({
            "core_goal": "cut inference latency",
            "key_constraints": ["no retraining"],
            "candidate_directions": ["learned schedulers"]
        })
        .to_string();
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(brief)]));
        let generator = StoryGenerator::new(llm, Arc::new(Config::default()));
        let brief = generator
            .expand_brief("rl for inference", &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(brief.core_goal, "cut inference latency");
        let rendered = brief.render();
        assert!(rendered.contains("core goal: cut inference latency"));
        assert!(rendered.contains("no retraining"));
    }

    #[tokio::test]
    async fn test_brief_failure_degrades_to_none() {
        let llm = Arc::new(ScriptedLlm::new(vec![Err(
            crate::error::EngineError::Transport("down".into()),
        )]));
        let generator = StoryGenerator::new(llm, Arc::new(Config::default()));
        assert!(generator
            .expand_brief("idea", &CancelToken::new())
            .await
            .is_none());

        let llm = Arc::new(ScriptedLlm::new(vec![Ok("not json".into())]));
        let generator = StoryGenerator::new(llm, Arc::new(Config::default()));
        assert!(generator
            .expand_brief("idea", &CancelToken::new())
            .await
            .is_none());
    }

    #[test]
    fn test_parse_rejects_empty_fields() {
        let mut value: serde_json::Value = serde_json::from_str(&story_json("t")).unwrap();
        value["method_skeleton"] = serde_json::Value::String("  ".into());
        let err = parse_story(&value.to_string()).unwrap_err();
        assert!(err.contains("method_skeleton"));

        value["method_skeleton"] = serde_json::Value::String("m".into());
        value["innovation_claims"] = serde_json::json!([]);
        let err = parse_story(&value.to_string()).unwrap_err();
        assert!(err.contains("innovation_claims"));
    }
}
