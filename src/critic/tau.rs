//! Tau table
//!
//! Per-role logistic temperatures are fit offline against the anchor
//! corpus and persisted with the exact conditions of the fit: rubric
//! version, card version, judge model and a hash of the paper node
//! file. Scoring under any other conditions is refused before the
//! first LLM call; the table must be refit, not reinterpreted.

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::types::Role;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TauTable {
    pub tau_methodology: f64,
    pub tau_novelty: f64,
    pub tau_storyteller: f64,
    pub rubric_version: String,
    pub card_version: String,
    pub judge_model: String,
    pub nodes_paper_hash: String,
}

impl TauTable {
    pub fn load(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read tau table {:?}: {}", path, e)))?;
        serde_json::from_str(&body)
            .map_err(|e| EngineError::Config(format!("cannot parse tau table {:?}: {}", path, e)))
    }

    /// Refuse unless every pinned condition matches the running engine.
    pub fn validate(&self, cfg: &Config, paper_hash: &str) -> Result<()> {
        let mut mismatches = Vec::new();
        if self.rubric_version != cfg.rubric_version {
            mismatches.push(format!(
                "rubric_version {} vs engine {}",
                self.rubric_version, cfg.rubric_version
            ));
        }
        if self.card_version != cfg.card_version {
            mismatches.push(format!(
                "card_version {} vs engine {}",
                self.card_version, cfg.card_version
            ));
        }
        if self.judge_model != cfg.judge_model {
            mismatches.push(format!(
                "judge_model {} vs engine {}",
                self.judge_model, cfg.judge_model
            ));
        }
        if self.nodes_paper_hash != paper_hash {
            mismatches.push("nodes_paper_hash differs from the loaded corpus".to_string());
        }
        if !mismatches.is_empty() {
            return Err(EngineError::Config(format!(
                "tau table mismatch, recalibrate before scoring: {}",
                mismatches.join("; ")
            )));
        }
        if self.tau_methodology <= 0.0 || self.tau_novelty <= 0.0 || self.tau_storyteller <= 0.0 {
            return Err(EngineError::Config(
                "tau table carries a non-positive temperature".into(),
            ));
        }
        Ok(())
    }

    fn role_tau(&self, role: Role) -> f64 {
        match role {
            Role::Methodology => self.tau_methodology,
            Role::Novelty => self.tau_novelty,
            Role::Storyteller => self.tau_storyteller,
        }
    }
}

/// Per-role taus the critic actually runs with.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedTaus {
    pub methodology: f64,
    pub novelty: f64,
    pub storyteller: f64,
}

impl ResolvedTaus {
    /// Resolution order per role: explicit config override, then the
    /// validated offline table, then the default. A table on disk is
    /// always validated even when overrides exist for some roles; a
    /// missing table falls back to overrides/default with a warning.
    pub fn resolve(cfg: &Config, paper_hash: &str) -> Result<ResolvedTaus> {
        let table = if cfg.tau_path.exists() {
            let table = TauTable::load(&cfg.tau_path)?;
            table.validate(cfg, paper_hash)?;
            Some(table)
        } else {
            if !cfg.all_taus_overridden() {
                tracing::warn!(
                    path = %cfg.tau_path.display(),
                    "no tau table on disk; falling back to configured/default taus"
                );
            }
            None
        };

        let pick = |role: Role| {
            cfg.tau_override(role)
                .or_else(|| table.as_ref().map(|t| t.role_tau(role)))
                .unwrap_or(cfg.tau_default)
        };

        let resolved = ResolvedTaus {
            methodology: pick(Role::Methodology),
            novelty: pick(Role::Novelty),
            storyteller: pick(Role::Storyteller),
        };
        if resolved.methodology <= 0.0 || resolved.novelty <= 0.0 || resolved.storyteller <= 0.0 {
            return Err(EngineError::Config(
                "resolved taus must all be positive".into(),
            ));
        }
        Ok(resolved)
    }

    pub fn get(&self, role: Role) -> f64 {
        match role {
            Role::Methodology => self.methodology,
            Role::Novelty => self.novelty,
            Role::Storyteller => self.storyteller,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TauTable {
        TauTable {
            tau_methodology: 0.9,
            tau_novelty: 1.1,
            tau_storyteller: 1.0,
            rubric_version: "rubric_v2".into(),
            card_version: "card_v1".into(),
            judge_model: "claude-3-5-sonnet-20241022".into(),
            nodes_paper_hash: "abc123".into(),
        }
    }

    #[test]
    fn test_matching_table_resolves() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("judge_tau.json");
        std::fs::write(&path, serde_json::to_string(&table()).unwrap()).unwrap();

        let mut cfg = Config::default();
        cfg.tau_path = path;
        let taus = ResolvedTaus::resolve(&cfg, "abc123").unwrap();
        assert!((taus.methodology - 0.9).abs() < 1e-12);
        assert!((taus.get(Role::Novelty) - 1.1).abs() < 1e-12);
    }

    #[test]
    fn test_rubric_mismatch_refuses() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("judge_tau.json");
        let mut stale = table();
        stale.rubric_version = "rubric_v1".into();
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let mut cfg = Config::default();
        cfg.tau_path = path;
        let err = ResolvedTaus::resolve(&cfg, "abc123").unwrap_err();
        match err {
            EngineError::Config(msg) => {
                assert!(msg.contains("recalibrate"));
                assert!(msg.contains("rubric_version"));
            }
            other => panic!("expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn test_corpus_hash_mismatch_refuses() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("judge_tau.json");
        std::fs::write(&path, serde_json::to_string(&table()).unwrap()).unwrap();

        let mut cfg = Config::default();
        cfg.tau_path = path;
        assert!(ResolvedTaus::resolve(&cfg, "different-corpus").is_err());
    }

    #[test]
    fn test_missing_table_uses_overrides_and_default() {
        let mut cfg = Config::default();
        cfg.tau_path = std::path::PathBuf::from("/nonexistent/judge_tau.json");
        cfg.tau_methodology = Some(0.7);
        let taus = ResolvedTaus::resolve(&cfg, "whatever").unwrap();
        assert!((taus.methodology - 0.7).abs() < 1e-12);
        assert!((taus.novelty - cfg.tau_default).abs() < 1e-12);
    }

    #[test]
    fn test_override_beats_table() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("judge_tau.json");
        std::fs::write(&path, serde_json::to_string(&table()).unwrap()).unwrap();

        let mut cfg = Config::default();
        cfg.tau_path = path;
        cfg.tau_storyteller = Some(2.0);
        let taus = ResolvedTaus::resolve(&cfg, "abc123").unwrap();
        assert!((taus.storyteller - 2.0).abs() < 1e-12);
        assert!((taus.methodology - 0.9).abs() < 1e-12);
    }
}
