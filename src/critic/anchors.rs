//! Anchor selection
//!
//! Anchors are real papers with known review outcomes. The initial set
//! spreads across the cluster's score distribution (quantile picks plus
//! the heaviest exemplars); densification adds anchors bucketed around
//! the current estimate when the first round was too uncertain. The
//! pass thresholds come from the same distribution.

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::kg::KgStore;
use crate::types::{AnchorSummary, Paper};
use statrs::statistics::{Data, OrderStatistics};
use std::collections::HashSet;

/// Pass rule for one pattern: at least two roles >= q75 and the role
/// average >= q50, both taken from the cluster's real scores.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct PassThresholds {
    pub q50: f64,
    pub q75: f64,
}

/// Minimum usable anchors before widening to the pattern's domain, and
/// the hard floor below which scoring refuses.
const MIN_USABLE_ANCHORS: usize = 3;

/// A paper is usable as an anchor when it carries both ground truth and
/// anonymizable content.
fn usable(paper: &Paper) -> bool {
    paper.review_stats.is_some() && paper.summary.is_some()
}

/// All usable anchors for a pattern, widened to the pattern's domain
/// when the cluster alone is too thin.
pub fn build_pool(kg: &KgStore, pattern_id: &str) -> Result<Vec<AnchorSummary>> {
    let mut papers: Vec<&Paper> = kg
        .papers_in_cluster(pattern_id)
        .into_iter()
        .filter(|p| usable(p))
        .collect();

    if papers.len() < MIN_USABLE_ANCHORS {
        if let Some(pattern) = kg.pattern_by_id(pattern_id) {
            let mut seen: HashSet<&str> =
                papers.iter().map(|p| p.paper_id.as_str()).collect();
            for paper in kg.papers_in_domain(&pattern.domain) {
                if usable(paper) && seen.insert(paper.paper_id.as_str()) {
                    papers.push(paper);
                }
            }
        }
    }

    if papers.len() < MIN_USABLE_ANCHORS {
        return Err(EngineError::Config(format!(
            "insufficient anchors: pattern {} has {} usable papers, need {}",
            pattern_id,
            papers.len(),
            MIN_USABLE_ANCHORS
        )));
    }

    let mut anchors: Vec<AnchorSummary> = papers
        .iter()
        .filter_map(|p| {
            p.review_stats
                .as_ref()
                .map(|stats| AnchorSummary::from_stats(&p.paper_id, stats))
        })
        .collect();
    anchors.sort_by(|a, b| {
        a.score10
            .partial_cmp(&b.score10)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.paper_id.cmp(&b.paper_id))
    });
    Ok(anchors)
}

/// Initial anchor set: one anchor nearest each configured quantile of
/// the pool's score distribution, plus up to `anchor_max_exemplars` of
/// the heaviest remaining anchors, capped at `anchor_max_initial`.
/// Returned sorted by score10 ascending.
pub fn select_initial(pool: &[AnchorSummary], cfg: &Config) -> Vec<AnchorSummary> {
    let scores: Vec<f64> = pool.iter().map(|a| a.score10).collect();
    let mut data = Data::new(scores);

    let mut chosen: Vec<AnchorSummary> = Vec::new();
    let mut taken: HashSet<String> = HashSet::new();

    for q in &cfg.anchor_quantiles {
        let target = data.quantile(*q);
        let nearest = pool
            .iter()
            .filter(|a| !taken.contains(&a.paper_id))
            .min_by(|a, b| {
                (a.score10 - target)
                    .abs()
                    .partial_cmp(&(b.score10 - target).abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        if let Some(anchor) = nearest {
            taken.insert(anchor.paper_id.clone());
            chosen.push(anchor.clone());
        }
    }

    let mut exemplars: Vec<&AnchorSummary> = pool
        .iter()
        .filter(|a| !taken.contains(&a.paper_id))
        .collect();
    exemplars.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.paper_id.cmp(&b.paper_id))
    });
    for exemplar in exemplars.into_iter().take(cfg.anchor_max_exemplars) {
        taken.insert(exemplar.paper_id.clone());
        chosen.push(exemplar.clone());
    }

    chosen.sort_by(|a, b| {
        a.score10
            .partial_cmp(&b.score10)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.paper_id.cmp(&b.paper_id))
    });
    chosen.truncate(cfg.anchor_max_initial);
    chosen
}

/// Densification anchors: buckets of width `bucket_size` centered on the
/// current estimate; each bucket contributes its heaviest unselected
/// anchor. The combined set stays under `anchor_max_total`.
pub fn select_buckets(
    pool: &[AnchorSummary],
    selected: &[AnchorSummary],
    center: f64,
    cfg: &Config,
) -> Vec<AnchorSummary> {
    let taken: HashSet<&str> = selected.iter().map(|a| a.paper_id.as_str()).collect();
    let budget = cfg.anchor_max_total.saturating_sub(selected.len());
    if budget == 0 {
        return Vec::new();
    }

    let half_span = cfg.bucket_size * cfg.bucket_count as f64 / 2.0;
    let low = (center - half_span).max(1.0);

    let mut extra: Vec<AnchorSummary> = Vec::new();
    for bucket in 0..cfg.bucket_count {
        let lo = low + bucket as f64 * cfg.bucket_size;
        let hi = lo + cfg.bucket_size;
        let best = pool
            .iter()
            .filter(|a| !taken.contains(a.paper_id.as_str()))
            .filter(|a| a.score10 >= lo && a.score10 < hi)
            .filter(|a| !extra.iter().any(|e| e.paper_id == a.paper_id))
            .max_by(|a, b| {
                a.weight
                    .partial_cmp(&b.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        if let Some(anchor) = best {
            extra.push(anchor.clone());
            if extra.len() == budget {
                break;
            }
        }
    }
    extra
}

/// q50/q75 thresholds for the pattern's pass rule, from every cluster
/// paper with review stats (content summaries are not required here).
pub fn pass_thresholds(kg: &KgStore, pattern_id: &str) -> Result<PassThresholds> {
    let mut scores: Vec<f64> = kg
        .papers_in_cluster(pattern_id)
        .into_iter()
        .filter_map(|p| p.review_stats.as_ref())
        .map(|s| s.avg_score10)
        .collect();

    if scores.len() < MIN_USABLE_ANCHORS {
        if let Some(pattern) = kg.pattern_by_id(pattern_id) {
            scores = kg
                .papers_in_domain(&pattern.domain)
                .into_iter()
                .filter_map(|p| p.review_stats.as_ref())
                .map(|s| s.avg_score10)
                .collect();
        }
    }
    if scores.is_empty() {
        return Err(EngineError::Config(format!(
            "insufficient anchors: no scored papers for pattern {}",
            pattern_id
        )));
    }

    let mut data = Data::new(scores);
    Ok(PassThresholds {
        q50: data.quantile(0.5),
        q75: data.quantile(0.75),
    })
}
