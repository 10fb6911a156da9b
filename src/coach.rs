//! Story coach
//!
//! One post-scoring LLM call that returns field-level edit suggestions.
//! The coach never sees anchors and never alters scores; its output only
//! feeds the next refinement prompt.

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::llm::{strip_code_fence, ChatMessage, ChatRequest, LlmGateway, ResponseFormat};
use crate::types::{CancelToken, RoleScores, Story};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const STORY_FIELDS: &[&str] = &[
    "title",
    "abstract",
    "problem_framing",
    "gap_pattern",
    "method_skeleton",
    "innovation_claims",
    "experiments_plan",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldFeedback {
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "abstract")]
    pub abstract_text: String,
    #[serde(default)]
    pub problem_framing: String,
    #[serde(default)]
    pub method_skeleton: String,
    #[serde(default)]
    pub innovation_claims: String,
    #[serde(default)]
    pub experiments_plan: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedEdit {
    pub field: String,
    /// rewrite | tighten | expand | drop
    pub action: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoachAdvice {
    #[serde(default)]
    pub field_feedback: FieldFeedback,
    #[serde(default)]
    pub suggested_edits: Vec<SuggestedEdit>,
    #[serde(default)]
    pub priority: Vec<String>,
}

pub struct Coach {
    llm: Arc<dyn LlmGateway>,
    cfg: Arc<Config>,
}

impl Coach {
    pub fn new(llm: Arc<dyn LlmGateway>, cfg: Arc<Config>) -> Self {
        Self { llm, cfg }
    }

    pub async fn advise(
        &self,
        story: &Story,
        scores: &RoleScores,
        cancel: &CancelToken,
    ) -> Result<CoachAdvice> {
        let mut messages = vec![ChatMessage::user(build_prompt(story, scores))];
        let mut last_error = String::new();

        for attempt in 0..=self.cfg.json_retries {
            cancel.check()?;
            let request = ChatRequest {
                stage: "coach".to_string(),
                system: Some(SYSTEM_PROMPT.to_string()),
                messages: messages.clone(),
                model: self.cfg.llm_model.clone(),
                temperature: self.cfg.coach_temperature,
                max_tokens: self.cfg.coach_max_tokens,
                response_format: ResponseFormat::Json,
            };
            let outcome = self.llm.chat(&request).await?;
            match parse_advice(&outcome.text) {
                Ok(advice) => return Ok(advice),
                Err(reason) => {
                    tracing::warn!(attempt, %reason, "coach JSON rejected, repairing");
                    last_error = reason.clone();
                    messages.push(ChatMessage::assistant(outcome.text));
                    messages.push(ChatMessage::user(format!(
                        "Your reply was rejected: {}. Respond again with ONLY the \
                         corrected JSON object.",
                        reason
                    )));
                }
            }
        }

        Err(EngineError::InvalidOutput(format!(
            "coach produced no valid JSON after {} repairs: {}",
            self.cfg.json_retries, last_error
        )))
    }
}

const SYSTEM_PROMPT: &str = "You are a writing coach for research-paper stories. \
Given a story and its three role scores, suggest concrete field-level edits. \
Reply with ONLY a JSON object: {\"field_feedback\": {title, abstract, \
problem_framing, method_skeleton, innovation_claims, experiments_plan}, \
\"suggested_edits\": [{\"field\", \"action\", \"content\"}], \
\"priority\": [field names, weakest first]}. Never mention scores or reviewers.";

fn build_prompt(story: &Story, scores: &RoleScores) -> String {
    let mut prompt = String::from("## Story\n");
    for (field, text) in story.fields() {
        prompt.push_str(&format!("{}: {}\n", field, text));
    }
    prompt.push_str(&format!(
        "\n## Current standing\nmethodology {:.1}, novelty {:.1}, storytelling {:.1} (1-10)\n\
         \nSuggest edits that lift the weakest dimensions.",
        scores.methodology, scores.novelty, scores.storyteller
    ));
    prompt
}

fn parse_advice(text: &str) -> std::result::Result<CoachAdvice, String> {
    let advice: CoachAdvice = serde_json::from_str(strip_code_fence(text))
        .map_err(|e| format!("not a valid advice object: {}", e))?;

    for edit in &advice.suggested_edits {
        if !STORY_FIELDS.contains(&edit.field.as_str()) {
            return Err(format!("suggested edit targets unknown field '{}'", edit.field));
        }
    }
    for field in &advice.priority {
        if !STORY_FIELDS.contains(&field.as_str()) {
            return Err(format!("priority lists unknown field '{}'", field));
        }
    }
    Ok(advice)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::llm::tests::ScriptedLlm;

    pub(crate) fn advice_json() -> String {
        serde_json::json!({
            "field_feedback": {
                "title": "fine",
                "abstract": "too broad",
                "problem_framing": "sharpen",
                "method_skeleton": "name the stages",
                "innovation_claims": "claim two is weak",
                "experiments_plan": "add a baseline"
            },
            "suggested_edits": [
                {"field": "abstract", "action": "tighten", "content": "lead with the gap"},
                {"field": "method_skeleton", "action": "expand", "content": "spell out stage two"}
            ],
            "priority": ["method_skeleton", "abstract"]
        })
        .to_string()
    }

    fn story() -> Story {
        serde_json::from_str(&crate::story::tests::story_json("T")).unwrap()
    }

    fn scores() -> RoleScores {
        RoleScores {
            methodology: 6.0,
            novelty: 7.0,
            storyteller: 6.5,
        }
    }

    #[tokio::test]
    async fn test_advice_parsed() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(advice_json())]));
        let coach = Coach::new(llm, Arc::new(Config::default()));
        let advice = coach
            .advise(&story(), &scores(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(advice.suggested_edits.len(), 2);
        assert_eq!(advice.priority[0], "method_skeleton");
        assert_eq!(advice.field_feedback.abstract_text, "too broad");
    }

    #[tokio::test]
    async fn test_unknown_field_triggers_repair() {
        let bad = serde_json::json!({
            "suggested_edits": [{"field": "conclusion", "action": "add", "content": "x"}],
            "priority": []
        })
        .to_string();
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(bad), Ok(advice_json())]));
        let coach = Coach::new(Arc::clone(&llm) as _, Arc::new(Config::default()));
        let advice = coach
            .advise(&story(), &scores(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(llm.call_count(), 2);
        assert_eq!(advice.priority.len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_repairs_bubble() {
        let mut cfg = Config::default();
        cfg.json_retries = 0;
        let llm = Arc::new(ScriptedLlm::new(vec![Ok("garbage".into())]));
        let coach = Coach::new(llm, Arc::new(cfg));
        let err = coach
            .advise(&story(), &scores(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOutput(_)));
    }
}
