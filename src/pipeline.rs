//! Pipeline manager
//!
//! Drives one idea end-to-end: recall, selection, generation, anchored
//! review, refinement, novelty verification. Tracks the global best
//! story across critic rounds and emits either the first passing story
//! or that best as fallback. Strictly sequential across rounds; the
//! parallelism lives inside the stages.

use crate::coach::{Coach, CoachAdvice};
use crate::config::{Config, NoveltyAction};
use crate::critic::anchors::PassThresholds;
use crate::critic::tau::ResolvedTaus;
use crate::critic::{AnchoredCritic, CriticReview};
use crate::embeddings::EmbeddingGateway;
use crate::error::{EngineError, Result};
use crate::index::VectorIndex;
use crate::kg::KgStore;
use crate::llm::LlmGateway;
use crate::novelty::{NoveltyChecker, NoveltyReport, PivotConstraint};
use crate::recall::{RecallAudit, RecallEngine};
use crate::refine::{
    self, FailureMap, RefinementEngine, RefinementRecord,
};
use crate::runlog::RunLogger;
use crate::selector::{PatternSelector, SelectionRankings};
use crate::story::{GenerateGuidance, StoryGenerator};
use crate::types::{CancelToken, Role, RoleScores, Story};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewHistoryEntry {
    pub iteration: usize,
    pub pattern_id: String,
    pub scores: RoleScores,
    pub average: f64,
    pub passed: bool,
    pub densified: bool,
    pub thresholds: PassThresholds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalStorySource {
    pub iteration: usize,
    pub score: f64,
    pub is_best_across_iterations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    pub final_story: Option<Story>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_story_source: Option<FinalStorySource>,
    pub iterations: usize,
    pub review_history: Vec<ReviewHistoryEntry>,
    pub refinement_history: Vec<RefinementRecord>,
    pub recall_audit: RecallAudit,
    pub pivots: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub novelty: Option<NoveltyReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

struct BestStory {
    story: Story,
    average: f64,
    iteration: usize,
}

struct RunState {
    review_history: Vec<ReviewHistoryEntry>,
    refinement_history: Vec<RefinementRecord>,
    best: Option<BestStory>,
    failures: FailureMap,
    pivots: usize,
    refine_rounds: usize,
}

impl RunState {
    fn new() -> Self {
        Self {
            review_history: Vec::new(),
            refinement_history: Vec::new(),
            best: None,
            failures: FailureMap::new(),
            pivots: 0,
            refine_rounds: 0,
        }
    }

    /// Record a critic round; returns its iteration index.
    fn record(&mut self, review: &CriticReview, pattern_id: &str, story: &Story) -> usize {
        let iteration = self.review_history.len();
        let average = review.scores.average();
        self.review_history.push(ReviewHistoryEntry {
            iteration,
            pattern_id: pattern_id.to_string(),
            scores: review.scores,
            average,
            passed: review.passed,
            densified: review.densified,
            thresholds: review.thresholds,
        });
        let better = self.best.as_ref().map(|b| average > b.average).unwrap_or(true);
        if better {
            self.best = Some(BestStory {
                story: story.clone(),
                average,
                iteration,
            });
        }
        iteration
    }

    /// Novelty improvement between the last two recorded rounds.
    fn novelty_stagnated(&self, delta: f64) -> bool {
        let n = self.review_history.len();
        if n < 2 {
            return false;
        }
        refine::novelty_stagnated(
            self.review_history[n - 2].scores.novelty,
            self.review_history[n - 1].scores.novelty,
            delta,
        )
    }
}

pub struct PipelineManager {
    kg: Arc<KgStore>,
    llm: Arc<dyn LlmGateway>,
    embedder: Arc<dyn EmbeddingGateway>,
    idea_index: Option<VectorIndex>,
    paper_index: Option<VectorIndex>,
    novelty_index: Option<VectorIndex>,
    cfg: Arc<Config>,
    logger: Arc<RunLogger>,
    cancel: CancelToken,
}

impl PipelineManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kg: Arc<KgStore>,
        llm: Arc<dyn LlmGateway>,
        embedder: Arc<dyn EmbeddingGateway>,
        idea_index: Option<VectorIndex>,
        paper_index: Option<VectorIndex>,
        novelty_index: Option<VectorIndex>,
        cfg: Arc<Config>,
        logger: Arc<RunLogger>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            kg,
            llm,
            embedder,
            idea_index,
            paper_index,
            novelty_index,
            cfg,
            logger,
            cancel,
        }
    }

    /// Run the full pipeline for one idea.
    pub async fn run(&self, user_idea: &str) -> Result<PipelineResult> {
        // Tau pinning is checked before anything talks to a provider.
        let taus = ResolvedTaus::resolve(&self.cfg, self.kg.paper_file_hash())?;
        let critic = AnchoredCritic::new(Arc::clone(&self.llm), Arc::clone(&self.cfg), taus);
        let selector = PatternSelector::new(Arc::clone(&self.llm), Arc::clone(&self.cfg));
        let generator = StoryGenerator::new(Arc::clone(&self.llm), Arc::clone(&self.cfg));
        let coach = Coach::new(Arc::clone(&self.llm), Arc::clone(&self.cfg));
        let refiner = RefinementEngine::new(Arc::clone(&self.llm), Arc::clone(&self.cfg));
        let novelty_checker = NoveltyChecker::new(
            self.novelty_index.as_ref(),
            self.embedder.as_ref(),
            &self.kg,
            &self.cfg,
        );

        // 1. Recall
        let recall_engine = RecallEngine::new(
            &self.kg,
            self.embedder.as_ref(),
            self.idea_index.as_ref(),
            self.paper_index.as_ref(),
            &self.cfg,
            &self.cancel,
        );
        let recall = recall_engine.recall(user_idea).await?;
        self.logger.event(
            "recall_done",
            serde_json::json!({"candidates": recall.patterns.len()}),
        );

        if recall.patterns.is_empty() {
            return Ok(PipelineResult {
                success: false,
                final_story: None,
                final_story_source: None,
                iterations: 0,
                review_history: Vec::new(),
                refinement_history: Vec::new(),
                recall_audit: recall.audit,
                pivots: 0,
                novelty: None,
                reason: Some("no_candidate_patterns".to_string()),
            });
        }

        // 2. Brief + selection
        let brief = generator.expand_brief(user_idea, &self.cancel).await;
        let brief_text = brief.as_ref().map(|b| b.render());
        let rankings = selector
            .select(
                &recall.patterns,
                &self.kg,
                user_idea,
                brief_text.as_deref(),
                &self.cancel,
            )
            .await?;
        self.logger.event(
            "selection_done",
            serde_json::json!({"scored": rankings.scores.len()}),
        );

        // 3. Initial generation under the fused-top pattern
        let mut pattern_id = recall.patterns[0].pattern_id.clone();
        let mut story = {
            let pattern = self.pattern(&pattern_id)?;
            let guidance = GenerateGuidance {
                idea_brief: brief_text.clone(),
                ..Default::default()
            };
            generator
                .generate(user_idea, &pattern, &guidance, &self.cancel)
                .await?
        };

        let mut state = RunState::new();
        let mut review = critic.review(&story, &self.kg, &pattern_id, &self.cancel).await?;
        let mut cur_iter = state.record(&review, &pattern_id, &story);
        self.log_review(cur_iter, &review);

        // 4. Review / refine loop
        loop {
            self.cancel.check()?;

            if review.passed {
                let report = novelty_checker.check(&story, &self.cancel).await?;
                if !report.collided() {
                    return Ok(self.finish_pass(state, story, cur_iter, recall.audit, report));
                }
                let colliding = report.collision_with.clone().unwrap_or_default();
                self.logger.event(
                    "collision",
                    serde_json::json!({"paper_id": colliding, "max_similarity": report.max_similarity}),
                );
                match self.cfg.novelty_action {
                    NoveltyAction::ReportOnly => {
                        return Ok(self.finish_pass(state, story, cur_iter, recall.audit, report));
                    }
                    NoveltyAction::Fail => {
                        return Ok(self.finish_fallback(
                            state,
                            recall.audit,
                            Some(report),
                            "novelty_collision",
                        ));
                    }
                    NoveltyAction::Pivot => {
                        if state.pivots >= self.cfg.max_pivots {
                            return Ok(self.finish_fallback(
                                state,
                                recall.audit,
                                Some(report),
                                "novelty_collision_unresolved",
                            ));
                        }
                        state.pivots += 1;
                        let constraints = novelty_checker.make_pivot(&story, &colliding);
                        state.refinement_history.push(RefinementRecord {
                            iteration: cur_iter,
                            issue: Role::Novelty,
                            pattern_id: pattern_id.clone(),
                            action: "pivot".to_string(),
                            fusion_quality: None,
                        });
                        story = self
                            .regenerate_with_pivot(&generator, user_idea, &pattern_id, &story, constraints)
                            .await?;
                        review = critic.review(&story, &self.kg, &pattern_id, &self.cancel).await?;
                        cur_iter = state.record(&review, &pattern_id, &story);
                        self.log_review(cur_iter, &review);
                        continue;
                    }
                }
            }

            // Failed review: spend a refinement round if any are left.
            if state.refine_rounds >= self.cfg.max_refine_iterations {
                return Ok(self.finish_fallback(
                    state,
                    recall.audit,
                    None,
                    "refinement_budget_exhausted",
                ));
            }

            let advice = coach.advise(&story, &review.scores, &self.cancel).await?;

            if state.novelty_stagnated(self.cfg.novelty_stagnation_delta) {
                match self
                    .novelty_mode(
                        &critic, &generator, &refiner, &rankings, &advice, user_idea, &story,
                        &review, &pattern_id, &mut state,
                    )
                    .await?
                {
                    Some((new_story, new_review, new_pattern, iter)) => {
                        story = new_story;
                        review = new_review;
                        pattern_id = new_pattern;
                        cur_iter = iter;
                        continue;
                    }
                    None => {
                        return Ok(self.finish_fallback(
                            state,
                            recall.audit,
                            None,
                            "novelty_mode_exhausted",
                        ));
                    }
                }
            }

            // Injection: the weakest role picks the next pattern.
            let issue = refine::weakest_role(&review.scores);
            let Some(next_id) =
                refine::next_pattern(issue, &rankings, &state.failures, Some(&pattern_id))
            else {
                return Ok(self.finish_fallback(state, recall.audit, None, "patterns_exhausted"));
            };

            let next_pattern = self.pattern(&next_id)?;
            let fusion = refiner
                .attempt_fusion(&story, &next_pattern, &self.cancel)
                .await?;
            let Some((fusion, reflection)) = fusion else {
                state.refinement_history.push(RefinementRecord {
                    iteration: cur_iter,
                    issue,
                    pattern_id: next_id.clone(),
                    action: "fusion_skipped".to_string(),
                    fusion_quality: None,
                });
                refine::mark_failed(&mut state.failures, &next_id, issue);
                continue;
            };

            state.refinement_history.push(RefinementRecord {
                iteration: cur_iter,
                issue,
                pattern_id: next_id.clone(),
                action: "injected".to_string(),
                fusion_quality: Some(reflection.fusion_quality),
            });

            let guidance = GenerateGuidance {
                previous_story: Some(story.clone()),
                review_feedback: Some(advice.clone()),
                fused_idea: Some(fusion),
                reflection_guidance: reflection.suggestions.clone(),
                injected_tricks: next_pattern.common_tricks.clone().unwrap_or_default(),
                ..Default::default()
            };
            let candidate = generator
                .generate(user_idea, &next_pattern, &guidance, &self.cancel)
                .await?;

            state.refine_rounds += 1;
            let pre_scores = review.scores;
            let pre_review = review.clone();
            let pre_story = story.clone();
            let pre_pattern = pattern_id.clone();

            let new_review = critic
                .review(&candidate, &self.kg, &next_id, &self.cancel)
                .await?;
            let new_iter = state.record(&new_review, &next_id, &candidate);
            self.log_review(new_iter, &new_review);

            let degraded = new_review
                .scores
                .degraded_roles(&pre_scores, self.cfg.degradation_threshold);
            if degraded.is_empty() {
                story = candidate;
                review = new_review;
                pattern_id = next_id;
                cur_iter = new_iter;
            } else {
                for role in &degraded {
                    refine::mark_failed(&mut state.failures, &next_id, *role);
                }
                state.refinement_history.push(RefinementRecord {
                    iteration: new_iter,
                    issue: degraded[0],
                    pattern_id: next_id.clone(),
                    action: "rolled_back".to_string(),
                    fusion_quality: None,
                });
                self.logger.event(
                    "rollback",
                    serde_json::json!({"pattern_id": next_id, "degraded": degraded.iter().map(|r| r.name()).collect::<Vec<_>>()}),
                );
                // Retained story is the pre-round story.
                story = pre_story;
                review = pre_review;
                pattern_id = pre_pattern;
                // cur_iter stays at the pre-round review for bookkeeping
            }
        }
    }

    /// Novelty mode: walk the novelty ranking, fusing each candidate
    /// pattern and judging the result, until one passes or the budget is
    /// spent. Returns the passing round, if any.
    #[allow(clippy::too_many_arguments)]
    async fn novelty_mode(
        &self,
        critic: &AnchoredCritic,
        generator: &StoryGenerator,
        refiner: &RefinementEngine,
        rankings: &SelectionRankings,
        advice: &CoachAdvice,
        user_idea: &str,
        base_story: &Story,
        base_review: &CriticReview,
        current_pattern: &str,
        state: &mut RunState,
    ) -> Result<Option<(Story, CriticReview, String, usize)>> {
        self.logger.event(
            "novelty_mode",
            serde_json::json!({"from_pattern": current_pattern}),
        );

        let candidates: Vec<String> = rankings
            .novelty
            .iter()
            .filter(|p| p.as_str() != current_pattern)
            .filter(|p| {
                !state
                    .failures
                    .get(p.as_str())
                    .map(|kinds| kinds.contains(&Role::Novelty))
                    .unwrap_or(false)
            })
            .take(self.cfg.novelty_mode_max_patterns)
            .cloned()
            .collect();

        for candidate_id in candidates {
            self.cancel.check()?;
            let pattern = self.pattern(&candidate_id)?;

            let Some((fusion, reflection)) = refiner
                .attempt_fusion(base_story, &pattern, &self.cancel)
                .await?
            else {
                state.refinement_history.push(RefinementRecord {
                    iteration: state.review_history.len().saturating_sub(1),
                    issue: Role::Novelty,
                    pattern_id: candidate_id.clone(),
                    action: "fusion_skipped".to_string(),
                    fusion_quality: None,
                });
                continue;
            };

            let guidance = GenerateGuidance {
                previous_story: Some(base_story.clone()),
                review_feedback: Some(advice.clone()),
                fused_idea: Some(fusion),
                reflection_guidance: reflection.suggestions.clone(),
                injected_tricks: pattern.common_tricks.clone().unwrap_or_default(),
                ..Default::default()
            };
            let candidate = generator
                .generate(user_idea, &pattern, &guidance, &self.cancel)
                .await?;

            let new_review = critic
                .review(&candidate, &self.kg, &candidate_id, &self.cancel)
                .await?;
            let iter = state.record(&new_review, &candidate_id, &candidate);
            self.log_review(iter, &new_review);

            state.refinement_history.push(RefinementRecord {
                iteration: iter,
                issue: Role::Novelty,
                pattern_id: candidate_id.clone(),
                action: "novelty_mode".to_string(),
                fusion_quality: Some(reflection.fusion_quality),
            });

            let degraded = new_review
                .scores
                .degraded_roles(&base_review.scores, self.cfg.degradation_threshold);
            if !degraded.is_empty() {
                for role in &degraded {
                    refine::mark_failed(&mut state.failures, &candidate_id, *role);
                }
                continue;
            }
            if new_review.passed {
                return Ok(Some((candidate, new_review, candidate_id, iter)));
            }
        }
        Ok(None)
    }

    async fn regenerate_with_pivot(
        &self,
        generator: &StoryGenerator,
        user_idea: &str,
        pattern_id: &str,
        story: &Story,
        constraints: PivotConstraint,
    ) -> Result<Story> {
        let pattern = self.pattern(pattern_id)?;
        let guidance = GenerateGuidance {
            previous_story: Some(story.clone()),
            constraints: Some(constraints),
            ..Default::default()
        };
        generator
            .generate(user_idea, &pattern, &guidance, &self.cancel)
            .await
    }

    fn pattern(&self, pattern_id: &str) -> Result<crate::types::Pattern> {
        self.kg
            .pattern_by_id(pattern_id)
            .cloned()
            .ok_or_else(|| EngineError::StepFailed(format!("pattern {} not in graph", pattern_id)))
    }

    /// Full critic audit goes to the program-only run log: anchors with
    /// their real scores, per-role comparisons and inference internals.
    fn log_review(&self, iteration: usize, review: &CriticReview) {
        let roles: Vec<serde_json::Value> = review
            .roles
            .iter()
            .map(|r| {
                serde_json::json!({
                    "role": r.role.name(),
                    "inference": r.inference,
                    "comparisons": r.comparisons,
                })
            })
            .collect();
        self.logger.event(
            "critic_done",
            serde_json::json!({
                "iteration": iteration,
                "passed": review.passed,
                "scores": review.scores,
                "average": review.scores.average(),
                "thresholds": review.thresholds,
                "densified": review.densified,
                "anchors": review.anchors,
                "roles": roles,
            }),
        );
    }

    fn finish_pass(
        &self,
        state: RunState,
        story: Story,
        iteration: usize,
        recall_audit: RecallAudit,
        novelty: NoveltyReport,
    ) -> PipelineResult {
        let average = state.review_history[iteration].average;
        let is_best = state
            .best
            .as_ref()
            .map(|b| b.iteration == iteration)
            .unwrap_or(false);
        PipelineResult {
            success: true,
            final_story: Some(story),
            final_story_source: Some(FinalStorySource {
                iteration,
                score: average,
                is_best_across_iterations: is_best,
            }),
            iterations: state.review_history.len(),
            review_history: state.review_history,
            refinement_history: state.refinement_history,
            recall_audit,
            pivots: state.pivots,
            novelty: Some(novelty),
            reason: None,
        }
    }

    fn finish_fallback(
        &self,
        state: RunState,
        recall_audit: RecallAudit,
        novelty: Option<NoveltyReport>,
        reason: &str,
    ) -> PipelineResult {
        let (final_story, source) = match &state.best {
            Some(best) => (
                Some(best.story.clone()),
                Some(FinalStorySource {
                    iteration: best.iteration,
                    score: best.average,
                    is_best_across_iterations: true,
                }),
            ),
            None => (None, None),
        };
        PipelineResult {
            success: false,
            final_story,
            final_story_source: source,
            iterations: state.review_history.len(),
            review_history: state.review_history,
            refinement_history: state.refinement_history,
            recall_audit,
            pivots: state.pivots,
            novelty,
            reason: Some(reason.to_string()),
        }
    }
}

/// Write the run's result bundle: `final_story.json`,
/// `pipeline_result.json` and a small manifest.
pub fn write_artifacts(
    result: &PipelineResult,
    results_root: &Path,
    run_id: &str,
    user_idea: &str,
) -> Result<std::path::PathBuf> {
    let dir = results_root.join(run_id);
    std::fs::create_dir_all(&dir)?;

    if let Some(story) = &result.final_story {
        std::fs::write(
            dir.join("final_story.json"),
            serde_json::to_string_pretty(story)?,
        )?;
    }
    std::fs::write(
        dir.join("pipeline_result.json"),
        serde_json::to_string_pretty(result)?,
    )?;
    let manifest = serde_json::json!({
        "run_id": run_id,
        "idea": user_idea,
        "created_at": chrono::Utc::now().to_rfc3339(),
        "success": result.success,
        "iterations": result.iterations,
        "pivots": result.pivots,
    });
    std::fs::write(
        dir.join("manifest.json"),
        serde_json::to_string_pretty(&manifest)?,
    )?;
    Ok(dir)
}
