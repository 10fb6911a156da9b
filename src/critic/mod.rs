//! Anchored critic
//!
//! Reproducible 1-10 review scores from blind pairwise comparisons.
//! The judge never sees identities or numbers: it compares the story
//! card against aliased anchor cards, one call per role, and the
//! deterministic inference kernel turns its judgments into scores
//! against the anchors' real review outcomes. One densification round
//! adds anchors near the first estimate when the judge was uncertain.

pub mod anchors;
pub mod cards;
pub mod inference;
pub mod tau;

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::kg::KgStore;
use crate::llm::{strip_code_fence, ChatMessage, ChatRequest, LlmGateway, ResponseFormat};
use crate::types::{
    AnchorSummary, CancelToken, Comparison, Judgement, Paper, Role, RoleScores, Story, Strength,
};
use anchors::PassThresholds;
use cards::BlindCard;
use inference::{InferenceResult, JudgedAnchor};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tau::ResolvedTaus;

/// One role's blind judgments plus the inferred standing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleReview {
    pub role: Role,
    pub inference: InferenceResult,
    pub comparisons: Vec<Comparison>,
}

/// Full critic outcome for one story. The anchor list is program log
/// material only; nothing here was ever shown to the judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticReview {
    pub scores: RoleScores,
    pub passed: bool,
    pub thresholds: PassThresholds,
    pub roles: Vec<RoleReview>,
    pub anchors: Vec<AnchorSummary>,
    pub densified: bool,
}

#[derive(Debug, Deserialize)]
struct JudgeReply {
    rubric_version: String,
    comparisons: Vec<Comparison>,
}

pub struct AnchoredCritic {
    llm: Arc<dyn LlmGateway>,
    cfg: Arc<Config>,
    taus: ResolvedTaus,
}

impl AnchoredCritic {
    pub fn new(llm: Arc<dyn LlmGateway>, cfg: Arc<Config>, taus: ResolvedTaus) -> Self {
        Self { llm, cfg, taus }
    }

    /// Review a story against the anchors of its pattern.
    pub async fn review(
        &self,
        story: &Story,
        kg: &KgStore,
        pattern_id: &str,
        cancel: &CancelToken,
    ) -> Result<CriticReview> {
        cancel.check()?;
        let pool = anchors::build_pool(kg, pattern_id)?;
        let selected = anchors::select_initial(&pool, &self.cfg);

        let round1 = self.judge_round(story, kg, &selected, cancel).await?;

        let mut used = selected;
        let mut roles = round1;
        let mut densified = false;

        if self.cfg.densify_enable && needs_densify(&roles, &self.cfg) {
            let center = roles.iter().map(|r| r.inference.score).sum::<f64>() / roles.len() as f64;
            let extra = anchors::select_buckets(&pool, &used, center, &self.cfg);
            if !extra.is_empty() {
                let mut combined = used.clone();
                combined.extend(extra);
                cards::sort_for_aliasing(&mut combined);
                // Second round is still blind: fresh aliases, same cards
                // discipline, one repeat only.
                roles = self.judge_round(story, kg, &combined, cancel).await?;
                used = combined;
                densified = true;
            }
        }

        let thresholds = anchors::pass_thresholds(kg, pattern_id)?;
        let scores = collect_scores(&roles);
        let above_q75 = Role::ALL
            .iter()
            .filter(|r| scores.get(**r) >= thresholds.q75)
            .count();
        let passed = above_q75 >= 2 && scores.average() >= thresholds.q50;

        Ok(CriticReview {
            scores,
            passed,
            thresholds,
            roles,
            anchors: used,
            densified,
        })
    }

    /// Judge one anchor set: three role calls from the same blind cards,
    /// issued concurrently.
    async fn judge_round(
        &self,
        story: &Story,
        kg: &KgStore,
        selected: &[AnchorSummary],
        cancel: &CancelToken,
    ) -> Result<Vec<RoleReview>> {
        let aliased = cards::assign_aliases(selected);
        let story_card = BlindCard::from_story(story, &self.cfg.card_version);

        let mut papers: Vec<&Paper> = Vec::with_capacity(aliased.len());
        let mut anchor_cards: Vec<(String, BlindCard)> = Vec::with_capacity(aliased.len());
        for (alias, anchor) in &aliased {
            let paper = kg.paper_by_id(&anchor.paper_id).ok_or_else(|| {
                EngineError::StepFailed(format!("anchor paper {} vanished", anchor.paper_id))
            })?;
            let card = BlindCard::from_paper(paper, &self.cfg.card_version).ok_or_else(|| {
                EngineError::StepFailed(format!("anchor paper {} has no summary", anchor.paper_id))
            })?;
            papers.push(paper);
            anchor_cards.push((alias.clone(), card));
        }

        let (methodology, novelty, storyteller) = tokio::join!(
            self.judge_role(Role::Methodology, &story_card, &anchor_cards, &papers, &aliased, cancel),
            self.judge_role(Role::Novelty, &story_card, &anchor_cards, &papers, &aliased, cancel),
            self.judge_role(Role::Storyteller, &story_card, &anchor_cards, &papers, &aliased, cancel),
        );

        Ok(vec![methodology?, novelty?, storyteller?])
    }

    async fn judge_role(
        &self,
        role: Role,
        story_card: &BlindCard,
        anchor_cards: &[(String, BlindCard)],
        papers: &[&Paper],
        aliased: &[(String, AnchorSummary)],
        cancel: &CancelToken,
    ) -> Result<RoleReview> {
        let system = rubric_for(role, &self.cfg.rubric_version);
        let prompt = build_judge_prompt(story_card, anchor_cards);

        // Leak check runs over everything the wire would carry.
        cards::validate_blind_prompt(&format!("{}\n{}", system, prompt), papers)?;

        let expected: Vec<&str> = aliased.iter().map(|(alias, _)| alias.as_str()).collect();
        let mut messages = vec![ChatMessage::user(prompt)];
        let mut last_reply: Option<JudgeReply> = None;
        let mut last_error = String::new();

        for attempt in 0..=self.cfg.json_retries {
            cancel.check()?;
            let request = ChatRequest {
                stage: format!("critic.{}", role.name()),
                system: Some(system.clone()),
                messages: messages.clone(),
                model: self.cfg.judge_model.clone(),
                temperature: self.cfg.critic_temperature,
                max_tokens: self.cfg.critic_max_tokens,
                response_format: ResponseFormat::Json,
            };
            let outcome = self.llm.chat(&request).await?;

            match parse_judge_reply(&outcome.text, &self.cfg.rubric_version, &expected) {
                Ok(reply) => {
                    return self.infer_role(role, reply.comparisons, aliased);
                }
                Err((reason, partial)) => {
                    tracing::warn!(role = role.name(), attempt, %reason, "judge reply rejected");
                    last_error = reason.clone();
                    if let Some(partial) = partial {
                        last_reply = Some(partial);
                    }
                    messages.push(ChatMessage::assistant(outcome.text));
                    messages.push(ChatMessage::user(format!(
                        "Your reply was rejected: {}. Respond again with ONLY the corrected \
                         JSON: every reference A1..A{} exactly once, rationale under 25 words, \
                         no scale or verdict vocabulary.",
                        reason,
                        expected.len()
                    )));
                }
            }
        }

        if !self.cfg.critic_strict_json {
            if let Some(reply) = last_reply {
                tracing::warn!(
                    role = role.name(),
                    "downgrading to partial judge reply after exhausted repairs"
                );
                let comparisons = downgrade_comparisons(reply.comparisons, &expected);
                return self.infer_role(role, comparisons, aliased);
            }
        }

        Err(EngineError::InvalidOutput(format!(
            "{} judge produced no valid reply after {} repairs: {}",
            role.name(),
            self.cfg.json_retries,
            last_error
        )))
    }

    fn infer_role(
        &self,
        role: Role,
        comparisons: Vec<Comparison>,
        aliased: &[(String, AnchorSummary)],
    ) -> Result<RoleReview> {
        let by_alias: HashMap<&str, &AnchorSummary> = aliased
            .iter()
            .map(|(alias, anchor)| (alias.as_str(), anchor))
            .collect();

        let judged: Vec<JudgedAnchor> = comparisons
            .iter()
            .filter_map(|c| {
                by_alias.get(c.anchor_id.as_str()).map(|anchor| JudgedAnchor {
                    anchor: (*anchor).clone(),
                    target: c.judgement.target(),
                    strength_weight: c.strength.weight(),
                })
            })
            .collect();

        let result = inference::infer_score(&judged, self.taus.get(role), self.cfg.grid_step)?;
        Ok(RoleReview {
            role,
            inference: result,
            comparisons,
        })
    }
}

/// Densify when any role came back uncertain: lossy fit, an ordering
/// violation, or consistently weak judgments.
pub(crate) fn needs_densify(roles: &[RoleReview], cfg: &Config) -> bool {
    roles.iter().any(|r| {
        r.inference.normalized_loss > cfg.densify_loss_threshold
            || r.inference.monotonic_violations >= 1
            || r.inference.avg_strength < cfg.densify_min_avg_conf
    })
}

fn collect_scores(roles: &[RoleReview]) -> RoleScores {
    let pick = |role: Role| {
        roles
            .iter()
            .find(|r| r.role == role)
            .map(|r| r.inference.score)
            .unwrap_or(1.0)
    };
    RoleScores {
        methodology: pick(Role::Methodology),
        novelty: pick(Role::Novelty),
        storyteller: pick(Role::Storyteller),
    }
}

fn rubric_for(role: Role, rubric_version: &str) -> String {
    let focus = match role {
        Role::Methodology => {
            "Judge the technical substance: is the method sound, are the moving \
             parts justified, would the experiments expose the claims?"
        }
        Role::Novelty => {
            "Judge the freshness: does the submission open ground the references \
             do not already cover, or does it rearrange known pieces?"
        }
        Role::Storyteller => {
            "Judge the narrative: does problem, gap and method form one arc a \
             reader can follow and believe?"
        }
    };
    format!(
        "You are a blind reviewer (rubric_version: {}). {} You see one submission \
         and several reference works, all anonymized. For EACH reference, state \
         whether the submission is better, tie, or worse on this dimension alone, \
         how firmly you hold that view (weak, medium, strong), and one rationale \
         under 25 words. Never guess identities, never use verdict or scale \
         vocabulary. Reply with ONLY JSON: {{\"rubric_version\": \"{}\", \
         \"comparisons\": [{{\"anchor_id\": \"A1\", \"judgement\": \
         \"better|tie|worse\", \"strength\": \"weak|medium|strong\", \
         \"rationale\": \"...\"}}]}}.",
        rubric_version, focus, rubric_version
    )
}

fn build_judge_prompt(story_card: &BlindCard, anchor_cards: &[(String, BlindCard)]) -> String {
    let mut prompt = String::from("## Submission\n");
    prompt.push_str(&story_card.render("SUBMISSION"));
    prompt.push_str("\n## References\n");
    for (alias, card) in anchor_cards {
        prompt.push('\n');
        prompt.push_str(&card.render(alias));
    }
    prompt.push_str("\nCompare the submission against every reference.");
    prompt
}

/// Parse and validate one judge reply. On failure returns the reason and
/// any partially-parsed reply (for non-strict downgrades).
fn parse_judge_reply(
    text: &str,
    rubric_version: &str,
    expected: &[&str],
) -> std::result::Result<JudgeReply, (String, Option<JudgeReply>)> {
    let reply: JudgeReply = match serde_json::from_str(strip_code_fence(text)) {
        Ok(reply) => reply,
        Err(e) => return Err((format!("not a valid judgment object: {}", e), None)),
    };

    if reply.rubric_version != rubric_version {
        return Err((
            format!(
                "rubric_version '{}' does not match '{}'",
                reply.rubric_version, rubric_version
            ),
            Some(reply),
        ));
    }

    let expected_set: HashSet<&str> = expected.iter().copied().collect();
    let mut seen: HashSet<&str> = HashSet::new();
    for comparison in &reply.comparisons {
        if !expected_set.contains(comparison.anchor_id.as_str()) {
            return Err((
                format!("unknown reference '{}'", comparison.anchor_id),
                Some(reply),
            ));
        }
        if !seen.insert(comparison.anchor_id.as_str()) {
            return Err((
                format!("reference '{}' judged twice", comparison.anchor_id),
                Some(reply),
            ));
        }
        if let Err(reason) = cards::validate_rationale(&comparison.rationale) {
            return Err((reason, Some(reply)));
        }
    }
    if seen.len() != expected.len() {
        let missing: Vec<&str> = expected
            .iter()
            .filter(|alias| !seen.contains(**alias))
            .copied()
            .collect();
        return Err((
            format!("references not judged: {}", missing.join(", ")),
            Some(reply),
        ));
    }

    Ok(reply)
}

/// Non-strict salvage: keep the valid comparisons, fill the gaps with
/// weak ties so inference still covers every anchor.
fn downgrade_comparisons(mut partial: Vec<Comparison>, expected: &[&str]) -> Vec<Comparison> {
    let expected_set: HashSet<&str> = expected.iter().copied().collect();
    let mut seen: HashSet<String> = HashSet::new();
    partial.retain(|c| {
        expected_set.contains(c.anchor_id.as_str())
            && cards::validate_rationale(&c.rationale).is_ok()
            && seen.insert(c.anchor_id.clone())
    });
    for alias in expected {
        if !seen.contains(*alias) {
            partial.push(Comparison {
                anchor_id: alias.to_string(),
                judgement: Judgement::Tie,
                strength: Strength::Weak,
                rationale: String::new(),
            });
        }
    }
    partial
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::kg::tests as kgt;
    use crate::types::{BelongsTo, PaperSummary, UsesPattern, WorksWellIn};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Judge mock: reads the aliases out of the prompt and answers every
    /// one of them, cycling through a scripted judgment sequence.
    pub(crate) struct AutoJudge {
        pub script: Vec<(Judgement, Strength)>,
        pub rubric_version: String,
        pub calls: AtomicUsize,
        pub stages: Mutex<Vec<String>>,
    }

    impl AutoJudge {
        pub(crate) fn new(script: Vec<(Judgement, Strength)>) -> Self {
            Self {
                script,
                rubric_version: "rubric_v2".to_string(),
                calls: AtomicUsize::new(0),
                stages: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn all_better() -> Self {
            Self::new(vec![(Judgement::Better, Strength::Strong)])
        }

        pub(crate) fn all_worse() -> Self {
            Self::new(vec![(Judgement::Worse, Strength::Strong)])
        }
    }

    #[async_trait]
    impl LlmGateway for AutoJudge {
        async fn chat(&self, request: &ChatRequest) -> Result<crate::llm::ChatOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.stages.lock().unwrap().push(request.stage.clone());

            let prompt = &request.messages[0].content;
            let mut aliases: Vec<String> = Vec::new();
            for part in prompt.split('[').skip(1) {
                if let Some(end) = part.find(']') {
                    let alias = &part[..end];
                    if alias.starts_with('A') && alias[1..].chars().all(|c| c.is_ascii_digit()) {
                        aliases.push(alias.to_string());
                    }
                }
            }

            let comparisons: Vec<serde_json::Value> = aliases
                .iter()
                .enumerate()
                .map(|(i, alias)| {
                    let (judgement, strength) = self.script[i % self.script.len()];
                    serde_json::json!({
                        "anchor_id": alias,
                        "judgement": judgement,
                        "strength": strength,
                        "rationale": "sharper mechanism than the reference",
                    })
                })
                .collect();

            let body = serde_json::json!({
                "rubric_version": self.rubric_version,
                "comparisons": comparisons,
            });
            Ok(crate::llm::ChatOutcome {
                text: body.to_string(),
                usage: Default::default(),
                latency_ms: 1,
            })
        }
    }

    pub(crate) fn cluster_store(scores: &[f64]) -> KgStore {
        let papers: Vec<_> = scores
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let mut p = kgt::paper(
                    &format!("anch{:02}", i),
                    &format!("archive item entry {:02}", i),
                    Some("pt1"),
                    "d1",
                    *s,
                );
                p.summary = Some(PaperSummary {
                    problem: format!("prior framing {:02}", i),
                    method: format!("prior mechanism {:02}", i),
                    contrib: format!("prior findings {:02}", i),
                });
                p
            })
            .collect();
        KgStore::from_parts(
            vec![],
            vec![kgt::pattern("pt1", "rl-optimization", "d1", papers.len())],
            vec![kgt::domain("d1", "ml", &[])],
            papers,
            Vec::<(String, String, UsesPattern)>::new(),
            Vec::<(String, String, WorksWellIn)>::new(),
            Vec::<(String, String, BelongsTo)>::new(),
        )
        .unwrap()
    }

    pub(crate) fn sample_story() -> Story {
        serde_json::from_str(&crate::story::tests::story_json("A fresh direction")).unwrap()
    }

    fn taus(value: f64) -> ResolvedTaus {
        ResolvedTaus {
            methodology: value,
            novelty: value,
            storyteller: value,
        }
    }

    fn critic(llm: Arc<dyn LlmGateway>, cfg: Config) -> AnchoredCritic {
        AnchoredCritic::new(llm, Arc::new(cfg), taus(1.0))
    }

    #[tokio::test]
    async fn test_all_better_passes() {
        let kg = cluster_store(&[5.0, 6.0, 7.0, 8.0, 9.0]);
        let judge = Arc::new(AutoJudge::all_better());
        let critic = critic(Arc::clone(&judge) as _, Config::default());

        let review = critic
            .review(&sample_story(), &kg, "pt1", &CancelToken::new())
            .await
            .unwrap();

        // All-better saturates every role at the top of the scale.
        assert!((review.scores.methodology - 10.0).abs() < 1e-9);
        assert!(review.passed);
        assert!(review.thresholds.q50 <= review.thresholds.q75);
        // 3 roles, no densification needed
        assert_eq!(judge.calls.load(Ordering::SeqCst), 3);
        assert!(!review.densified);

        // Scores are in range and anchors are logged in alias order.
        for role in &review.roles {
            assert!(role.inference.score >= 1.0 && role.inference.score <= 10.0);
            assert_eq!(role.comparisons.len(), review.anchors.len());
        }
        assert!(review
            .anchors
            .windows(2)
            .all(|w| w[0].score10 <= w[1].score10));
    }

    #[tokio::test]
    async fn test_all_worse_fails() {
        let kg = cluster_store(&[5.0, 6.0, 7.0, 8.0, 9.0]);
        let judge = Arc::new(AutoJudge::all_worse());
        let critic = critic(judge, Config::default());

        let review = critic
            .review(&sample_story(), &kg, "pt1", &CancelToken::new())
            .await
            .unwrap();
        assert!(!review.passed);
        assert!(review.scores.average() < review.thresholds.q50);
    }

    #[tokio::test]
    async fn test_mixed_judgments_golden_score() {
        let kg = cluster_store(&[5.0, 6.0, 7.0, 8.0, 9.0]);
        // A1..A5 ascending: better, better, tie, worse, better.
        let judge = Arc::new(AutoJudge::new(vec![
            (Judgement::Better, Strength::Medium),
            (Judgement::Better, Strength::Medium),
            (Judgement::Tie, Strength::Medium),
            (Judgement::Worse, Strength::Medium),
            (Judgement::Better, Strength::Medium),
        ]));
        let mut cfg = Config::default();
        cfg.densify_enable = false;
        let critic = critic(judge, cfg);

        let review = critic
            .review(&sample_story(), &kg, "pt1", &CancelToken::new())
            .await
            .unwrap();

        // Equal anchor weights and uniform strengths: the golden argmin.
        for role in &review.roles {
            assert!(
                (role.inference.score - 8.21).abs() < 0.05,
                "{} got {}",
                role.role.name(),
                role.inference.score
            );
            assert_eq!(role.inference.monotonic_violations, 2);
        }
    }

    #[tokio::test]
    async fn test_densification_second_round() {
        // Plenty of anchors so buckets have material to add; ordering
        // violations in round one force the repeat.
        let scores: Vec<f64> = (0..20).map(|i| 2.0 + i as f64 * 0.4).collect();
        let kg = cluster_store(&scores);
        let judge = Arc::new(AutoJudge::new(vec![
            (Judgement::Worse, Strength::Weak),
            (Judgement::Better, Strength::Weak),
        ]));
        let critic = critic(Arc::clone(&judge) as _, Config::default());

        let review = critic
            .review(&sample_story(), &kg, "pt1", &CancelToken::new())
            .await
            .unwrap();

        assert!(review.densified);
        // Two rounds of three role calls each.
        assert_eq!(judge.calls.load(Ordering::SeqCst), 6);
        assert!(review.anchors.len() > Config::default().anchor_max_initial.min(9));
    }

    #[tokio::test]
    async fn test_leaky_story_rejected_before_any_call() {
        let kg = cluster_store(&[5.0, 6.0, 7.0]);
        let mut story = sample_story();
        // Smuggle an anchor title fragment into the story text.
        story.method_skeleton = "we extend archive item entry 00 directly".into();

        let judge = Arc::new(AutoJudge::all_better());
        let critic = critic(Arc::clone(&judge) as _, Config::default());

        let err = critic
            .review(&story, &kg, "pt1", &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOutput(_)));
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_insufficient_anchors_refused() {
        let kg = cluster_store(&[5.0, 6.0]);
        let judge = Arc::new(AutoJudge::all_better());
        let critic = critic(Arc::clone(&judge) as _, Config::default());

        let err = critic
            .review(&sample_story(), &kg, "pt1", &CancelToken::new())
            .await
            .unwrap_err();
        match err {
            EngineError::Config(msg) => assert!(msg.contains("insufficient anchors")),
            other => panic!("expected Config error, got {:?}", other),
        }
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_rubric_bubbles_when_strict() {
        let kg = cluster_store(&[5.0, 6.0, 7.0, 8.0, 9.0]);
        let mut judge = AutoJudge::all_better();
        judge.rubric_version = "rubric_v0".to_string();
        let critic = critic(Arc::new(judge), Config::default());

        let err = critic
            .review(&sample_story(), &kg, "pt1", &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOutput(_)));
    }

    #[tokio::test]
    async fn test_stale_rubric_downgrades_when_lenient() {
        // Same stale judge, but non-strict mode salvages the parseable
        // comparisons instead of failing the round.
        let kg = cluster_store(&[5.0, 6.0, 7.0, 8.0, 9.0]);
        let mut judge = AutoJudge::all_better();
        judge.rubric_version = "rubric_v0".to_string();
        let mut cfg = Config::default();
        cfg.critic_strict_json = false;
        let critic = critic(Arc::new(judge), cfg);

        let review = critic
            .review(&sample_story(), &kg, "pt1", &CancelToken::new())
            .await
            .unwrap();
        // The salvaged all-better judgments still saturate the scale.
        assert!((review.scores.methodology - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_rejects_incomplete_coverage() {
        let text = serde_json::json!({
            "rubric_version": "rubric_v2",
            "comparisons": [
                {"anchor_id": "A1", "judgement": "better", "strength": "weak", "rationale": "r"}
            ]
        })
        .to_string();
        let err = parse_judge_reply(&text, "rubric_v2", &["A1", "A2"]).unwrap_err();
        assert!(err.0.contains("A2"));
    }

    #[test]
    fn test_parse_rejects_duplicate_and_forbidden() {
        let dup = serde_json::json!({
            "rubric_version": "rubric_v2",
            "comparisons": [
                {"anchor_id": "A1", "judgement": "better", "strength": "weak", "rationale": "r"},
                {"anchor_id": "A1", "judgement": "tie", "strength": "weak", "rationale": "r"}
            ]
        })
        .to_string();
        assert!(parse_judge_reply(&dup, "rubric_v2", &["A1", "A2"]).is_err());

        let leaky = serde_json::json!({
            "rubric_version": "rubric_v2",
            "comparisons": [
                {"anchor_id": "A1", "judgement": "better", "strength": "weak",
                 "rationale": "clearly a 9/10 effort"}
            ]
        })
        .to_string();
        assert!(parse_judge_reply(&leaky, "rubric_v2", &["A1"]).is_err());
    }

    #[test]
    fn test_downgrade_fills_missing_with_weak_ties() {
        let partial = vec![Comparison {
            anchor_id: "A2".into(),
            judgement: Judgement::Better,
            strength: Strength::Strong,
            rationale: "stronger grounding".into(),
        }];
        let fixed = downgrade_comparisons(partial, &["A1", "A2", "A3"]);
        assert_eq!(fixed.len(), 3);
        let a1 = fixed.iter().find(|c| c.anchor_id == "A1").unwrap();
        assert_eq!(a1.judgement, Judgement::Tie);
        assert_eq!(a1.strength, Strength::Weak);
    }

    #[test]
    fn test_rubrics_carry_no_forbidden_vocabulary() {
        for role in Role::ALL {
            let rubric = rubric_for(role, "rubric_v2");
            assert!(cards::validate_blind_prompt(&rubric, &[]).is_ok(), "{:?}", role);
        }
    }
}
