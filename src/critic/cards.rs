//! Blind cards
//!
//! The only representation of a story or an anchor paper that ever
//! reaches the judge. Four whitelisted fields, hard length caps, local
//! aliases instead of identities. The leak validator runs over every
//! assembled prompt before transmission; a hit is a build bug, not a
//! recoverable condition.

use crate::error::{EngineError, Result};
use crate::types::{AnchorSummary, Paper, Story};
use serde::{Deserialize, Serialize};

pub const PROBLEM_CAP: usize = 220;
pub const METHOD_CAP: usize = 280;
pub const CONTRIB_CAP: usize = 320;

/// Terms that would anchor the judge to an absolute scale. Matched as
/// whole tokens; `/10` is matched as a raw substring.
pub const FORBIDDEN_TERMS: &[&str] = &["score", "scores", "rating", "ratings", "accept", "reject"];

/// Minimum title-window length that counts as an identity leak.
const TITLE_WINDOW: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindCard {
    pub problem: String,
    pub method: String,
    pub contrib: String,
    pub card_version: String,
}

impl BlindCard {
    pub fn from_story(story: &Story, card_version: &str) -> Self {
        let problem = format!("{} {}", story.problem_framing, story.gap_pattern);
        Self {
            problem: cap(&problem, PROBLEM_CAP),
            method: cap(&story.method_skeleton, METHOD_CAP),
            contrib: cap(&story.innovation_claims.join("; "), CONTRIB_CAP),
            card_version: card_version.to_string(),
        }
    }

    /// Anchor card from a paper's anonymizable summary. Papers without a
    /// summary cannot be carded and never reach the judge.
    pub fn from_paper(paper: &Paper, card_version: &str) -> Option<Self> {
        let summary = paper.summary.as_ref()?;
        Some(Self {
            problem: cap(&summary.problem, PROBLEM_CAP),
            method: cap(&summary.method, METHOD_CAP),
            contrib: cap(&summary.contrib, CONTRIB_CAP),
            card_version: card_version.to_string(),
        })
    }

    /// Re-carding a card is the identity: caps are idempotent.
    pub fn recard(&self) -> Self {
        Self {
            problem: cap(&self.problem, PROBLEM_CAP),
            method: cap(&self.method, METHOD_CAP),
            contrib: cap(&self.contrib, CONTRIB_CAP),
            card_version: self.card_version.clone(),
        }
    }

    pub fn render(&self, label: &str) -> String {
        format!(
            "[{}]\nproblem: {}\nmethod: {}\ncontribution: {}\n",
            label, self.problem, self.method, self.contrib
        )
    }
}

/// Hard truncation on a char boundary.
fn cap(text: &str, limit: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(limit) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

/// Assign stable local aliases A1..AK. Anchors must already be sorted by
/// score10 ascending so aliases reproduce across replays.
pub fn assign_aliases(anchors: &[AnchorSummary]) -> Vec<(String, AnchorSummary)> {
    anchors
        .iter()
        .enumerate()
        .map(|(i, anchor)| (format!("A{}", i + 1), anchor.clone()))
        .collect()
}

/// Sort anchors into the canonical alias order.
pub fn sort_for_aliasing(anchors: &mut [AnchorSummary]) {
    anchors.sort_by(|a, b| {
        a.score10
            .partial_cmp(&b.score10)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.paper_id.cmp(&b.paper_id))
    });
}

/// Reject a prompt that leaks anchor identity or absolute-score anchors.
///
/// Checks, against each anchor paper: the raw `paper_id`, and any
/// normalized title window of length >= 8. Checks globally: the `/10`
/// substring, bare `N/10` fractions and the forbidden term list.
pub fn validate_blind_prompt(prompt: &str, anchor_papers: &[&Paper]) -> Result<()> {
    let normalized = normalize(prompt);

    if normalized.contains("/10") {
        return Err(leak("prompt contains '/10'"));
    }
    for term in FORBIDDEN_TERMS {
        if normalized
            .split(|c: char| !c.is_alphanumeric())
            .any(|token| token == *term)
        {
            return Err(leak(&format!("prompt contains forbidden term '{}'", term)));
        }
    }

    for paper in anchor_papers {
        let id = normalize(&paper.paper_id);
        if !id.is_empty() && normalized.contains(&id) {
            return Err(leak(&format!("prompt contains paper id '{}'", paper.paper_id)));
        }
        let title = normalize(&paper.title);
        let chars: Vec<char> = title.chars().collect();
        if chars.len() >= TITLE_WINDOW {
            for window in chars.windows(TITLE_WINDOW) {
                let needle: String = window.iter().collect();
                if normalized.contains(&needle) {
                    return Err(leak(&format!(
                        "prompt contains a title fragment of '{}'",
                        paper.paper_id
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Validate one rationale line: word budget plus the forbidden filter.
pub fn validate_rationale(rationale: &str) -> std::result::Result<(), String> {
    if rationale.split_whitespace().count() > 25 {
        return Err("rationale exceeds 25 words".to_string());
    }
    let normalized = normalize(rationale);
    if normalized.contains("/10") {
        return Err("rationale contains '/10'".to_string());
    }
    for term in FORBIDDEN_TERMS {
        if normalized
            .split(|c: char| !c.is_alphanumeric())
            .any(|token| token == *term)
        {
            return Err(format!("rationale contains forbidden term '{}'", term));
        }
    }
    Ok(())
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn leak(reason: &str) -> EngineError {
    EngineError::InvalidOutput(format!("blind-card leak: {}", reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PaperSummary, ReviewStats};

    fn sample_paper() -> Paper {
        Paper {
            paper_id: "pp-2024-0042".to_string(),
            title: "Amortized Quantile Proxies for Blackbox Search".to_string(),
            pattern_id: None,
            domain_id: "d1".to_string(),
            review_stats: Some(ReviewStats {
                avg_score10: 7.0,
                review_count: 4,
                dispersion10: 1.0,
            }),
            summary: Some(PaperSummary {
                problem: "tuning expensive simulators without gradients".to_string(),
                method: "surrogate model over sampled configurations".to_string(),
                contrib: "sample-efficient tuning under tight budgets".to_string(),
            }),
        }
    }

    fn sample_story() -> Story {
        serde_json::from_str(&crate::story::tests::story_json("A story title")).unwrap()
    }

    #[test]
    fn test_card_caps_and_idempotence() {
        let mut story = sample_story();
        story.method_skeleton = "m".repeat(METHOD_CAP + 100);
        let card = BlindCard::from_story(&story, "card_v1");
        assert_eq!(card.method.chars().count(), METHOD_CAP);
        assert!(card.problem.chars().count() <= PROBLEM_CAP);

        // BlindCard(BlindCard(x)) == BlindCard(x)
        assert_eq!(card.recard(), card);
    }

    #[test]
    fn test_card_from_paper_requires_summary() {
        let mut paper = sample_paper();
        assert!(BlindCard::from_paper(&paper, "card_v1").is_some());
        paper.summary = None;
        assert!(BlindCard::from_paper(&paper, "card_v1").is_none());
    }

    #[test]
    fn test_aliases_follow_score_order() {
        let mut anchors = vec![
            AnchorSummary {
                paper_id: "high".into(),
                score10: 8.0,
                weight: 1.0,
            },
            AnchorSummary {
                paper_id: "low".into(),
                score10: 5.0,
                weight: 1.0,
            },
        ];
        sort_for_aliasing(&mut anchors);
        let aliased = assign_aliases(&anchors);
        assert_eq!(aliased[0].0, "A1");
        assert_eq!(aliased[0].1.paper_id, "low");
        assert_eq!(aliased[1].0, "A2");
        assert_eq!(aliased[1].1.paper_id, "high");
    }

    #[test]
    fn test_clean_prompt_passes() {
        let paper = sample_paper();
        let card = BlindCard::from_paper(&paper, "card_v1").unwrap();
        let prompt = format!("Compare the submission with:\n{}", card.render("A1"));
        assert!(validate_blind_prompt(&prompt, &[&paper]).is_ok());
    }

    #[test]
    fn test_paper_id_leak_detected() {
        let paper = sample_paper();
        let prompt = "judging against pp-2024-0042 now";
        assert!(validate_blind_prompt(prompt, &[&paper]).is_err());
    }

    #[test]
    fn test_title_fragment_leak_detected() {
        let paper = sample_paper();
        // >= 8 consecutive chars of the title
        let prompt = "this mentions quantile proxies openly";
        assert!(validate_blind_prompt(prompt, &[&paper]).is_err());
    }

    #[test]
    fn test_score_vocabulary_rejected() {
        let paper = sample_paper();
        assert!(validate_blind_prompt("give it 7/10 please", &[&paper]).is_err());
        assert!(validate_blind_prompt("what rating fits", &[&paper]).is_err());
        assert!(validate_blind_prompt("should we accept this", &[&paper]).is_err());
        // "scoreboard" is not the token "score"
        assert!(validate_blind_prompt("the scoreboard metaphor", &[&paper]).is_ok());
    }

    #[test]
    fn test_rationale_validation() {
        assert!(validate_rationale("stronger problem grounding than the reference").is_ok());
        let long = "word ".repeat(26);
        assert!(validate_rationale(&long).is_err());
        assert!(validate_rationale("this deserves 9/10").is_err());
        assert!(validate_rationale("i would accept it").is_err());
    }
}
