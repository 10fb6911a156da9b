//! Engine configuration
//!
//! A single immutable `Config` is built at startup. Precedence is
//! process env > TOML config file > defaults, resolved by a pure
//! function so the layering is testable without touching the real
//! environment.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// What the verifier does when a collision is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoveltyAction {
    ReportOnly,
    Pivot,
    Fail,
}

impl NoveltyAction {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "report_only" => Ok(NoveltyAction::ReportOnly),
            "pivot" => Ok(NoveltyAction::Pivot),
            "fail" => Ok(NoveltyAction::Fail),
            other => Err(EngineError::Config(format!(
                "NOVELTY_ACTION must be report_only|pivot|fail, got '{}'",
                other
            ))),
        }
    }
}

/// How vector index directories are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexDirMode {
    Manual,
    AutoProfile,
}

impl IndexDirMode {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "manual" => Ok(IndexDirMode::Manual),
            "auto_profile" => Ok(IndexDirMode::AutoProfile),
            other => Err(EngineError::Config(format!(
                "INDEX_DIR_MODE must be manual|auto_profile, got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Recall tuning
    pub recall_idea_weight: f64,
    pub recall_domain_weight: f64,
    pub recall_paper_weight: f64,
    pub recall_normalize: bool,
    pub final_top_k: usize,
    pub coarse_recall_size: usize,
    pub fine_top_k: usize,
    pub domain_top_m: usize,
    pub subdomain_boost: f64,

    // Pattern selector
    pub pattern_select_topn: usize,

    // Per-stage sampling
    pub story_temperature: f64,
    pub critic_temperature: f64,
    pub coach_temperature: f64,

    // JSON discipline
    pub critic_strict_json: bool,
    pub json_retries: usize,

    // Anchor selection
    pub anchor_quantiles: Vec<f64>,
    pub anchor_max_initial: usize,
    pub anchor_max_total: usize,
    pub anchor_max_exemplars: usize,

    // Densification
    pub densify_enable: bool,
    pub densify_loss_threshold: f64,
    pub densify_min_avg_conf: f64,
    pub bucket_size: f64,
    pub bucket_count: usize,

    // Score inference
    pub tau_methodology: Option<f64>,
    pub tau_novelty: Option<f64>,
    pub tau_storyteller: Option<f64>,
    pub tau_default: f64,
    pub tau_path: PathBuf,
    pub grid_step: f64,

    // Refinement
    pub max_refine_iterations: usize,
    pub novelty_mode_max_patterns: usize,
    pub fusion_quality_threshold: f64,
    pub degradation_threshold: f64,
    pub novelty_stagnation_delta: f64,

    // Novelty / verifier
    pub novelty_enable: bool,
    pub novelty_action: NoveltyAction,
    pub max_pivots: usize,
    pub collision_threshold: f64,
    pub novelty_top_k: usize,

    // Index dirs
    pub index_dir_mode: IndexDirMode,
    pub index_allow_build: bool,
    pub recall_index_dir: Option<PathBuf>,
    pub novelty_index_dir: Option<PathBuf>,
    pub model_profile: String,

    // Gateways
    pub embed_batch_size: usize,
    pub embed_max_retries: usize,
    pub embed_sleep_sec: f64,
    pub max_retries: usize,
    pub llm_api_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub judge_model: String,
    pub embed_model: String,
    pub llm_timeout_secs: u64,

    // Per-stage token budgets
    pub story_max_tokens: usize,
    pub critic_max_tokens: usize,
    pub coach_max_tokens: usize,
    pub selector_max_tokens: usize,
    pub fusion_max_tokens: usize,

    // Versions pinned into prompts and the tau table
    pub rubric_version: String,
    pub card_version: String,

    // Artifact layout
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub results_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recall_idea_weight: 0.4,
            recall_domain_weight: 0.2,
            recall_paper_weight: 0.4,
            recall_normalize: true,
            final_top_k: 10,
            coarse_recall_size: 100,
            fine_top_k: 10,
            domain_top_m: 5,
            subdomain_boost: 0.5,
            pattern_select_topn: 20,
            story_temperature: 0.7,
            critic_temperature: 0.2,
            coach_temperature: 0.3,
            critic_strict_json: true,
            json_retries: 2,
            anchor_quantiles: vec![0.05, 0.15, 0.25, 0.50, 0.75, 0.85, 0.95],
            anchor_max_initial: 11,
            anchor_max_total: 30,
            anchor_max_exemplars: 2,
            densify_enable: true,
            densify_loss_threshold: 0.9,
            densify_min_avg_conf: 1.5,
            bucket_size: 0.5,
            bucket_count: 4,
            tau_methodology: None,
            tau_novelty: None,
            tau_storyteller: None,
            tau_default: 1.0,
            tau_path: PathBuf::from("output/judge_tau.json"),
            grid_step: 0.01,
            max_refine_iterations: 3,
            novelty_mode_max_patterns: 10,
            fusion_quality_threshold: 0.65,
            degradation_threshold: 0.1,
            novelty_stagnation_delta: 0.5,
            novelty_enable: true,
            novelty_action: NoveltyAction::Pivot,
            max_pivots: 1,
            collision_threshold: 0.75,
            novelty_top_k: 10,
            index_dir_mode: IndexDirMode::Manual,
            index_allow_build: false,
            recall_index_dir: None,
            novelty_index_dir: None,
            model_profile: "default".to_string(),
            embed_batch_size: 32,
            embed_max_retries: 3,
            embed_sleep_sec: 2.0,
            max_retries: 3,
            llm_api_url: "https://api.anthropic.com/v1/messages".to_string(),
            llm_api_key: String::new(),
            llm_model: "claude-3-5-sonnet-20241022".to_string(),
            judge_model: "claude-3-5-sonnet-20241022".to_string(),
            embed_model: "all-MiniLM-L6-v2".to_string(),
            llm_timeout_secs: 120,
            story_max_tokens: 4096,
            critic_max_tokens: 2048,
            coach_max_tokens: 1024,
            selector_max_tokens: 512,
            fusion_max_tokens: 1024,
            rubric_version: "rubric_v2".to_string(),
            card_version: "card_v1".to_string(),
            output_dir: PathBuf::from("output"),
            log_dir: PathBuf::from("log"),
            results_dir: PathBuf::from("results"),
        }
    }
}

/// Every key the config surface recognizes, in env-var form.
const KNOWN_KEYS: &[&str] = &[
    "RECALL_IDEA_WEIGHT",
    "RECALL_DOMAIN_WEIGHT",
    "RECALL_PAPER_WEIGHT",
    "RECALL_NORMALIZE",
    "FINAL_TOP_K",
    "COARSE_RECALL_SIZE",
    "RECALL_FINE_TOP_K",
    "RECALL_DOMAIN_TOP_M",
    "RECALL_SUBDOMAIN_BOOST",
    "PATTERN_SELECT_TOPN",
    "STORY_TEMPERATURE",
    "CRITIC_TEMPERATURE",
    "COACH_TEMPERATURE",
    "CRITIC_STRICT_JSON",
    "JSON_RETRIES",
    "ANCHOR_QUANTILES",
    "ANCHOR_MAX_INITIAL",
    "ANCHOR_MAX_TOTAL",
    "ANCHOR_MAX_EXEMPLARS",
    "DENSIFY_ENABLE",
    "DENSIFY_LOSS_THRESHOLD",
    "DENSIFY_MIN_AVG_CONF",
    "BUCKET_SIZE",
    "BUCKET_COUNT",
    "TAU_METHODOLOGY",
    "TAU_NOVELTY",
    "TAU_STORYTELLER",
    "TAU_DEFAULT",
    "TAU_PATH",
    "GRID_STEP",
    "MAX_REFINE_ITERATIONS",
    "NOVELTY_MODE_MAX_PATTERNS",
    "FUSION_QUALITY_THRESHOLD",
    "DEGRADATION_THRESHOLD",
    "NOVELTY_STAGNATION_DELTA",
    "NOVELTY_ENABLE",
    "NOVELTY_ACTION",
    "MAX_PIVOTS",
    "COLLISION_THRESHOLD",
    "NOVELTY_TOP_K",
    "INDEX_DIR_MODE",
    "INDEX_ALLOW_BUILD",
    "RECALL_INDEX_DIR",
    "NOVELTY_INDEX_DIR",
    "MODEL_PROFILE",
    "EMBED_BATCH_SIZE",
    "EMBED_MAX_RETRIES",
    "EMBED_SLEEP_SEC",
    "MAX_RETRIES",
    "LLM_API_URL",
    "LLM_API_KEY",
    "LLM_MODEL",
    "JUDGE_MODEL",
    "EMBED_MODEL",
    "LLM_TIMEOUT_SECS",
    "STORY_MAX_TOKENS",
    "CRITIC_MAX_TOKENS",
    "COACH_MAX_TOKENS",
    "SELECTOR_MAX_TOKENS",
    "FUSION_MAX_TOKENS",
    "RUBRIC_VERSION",
    "CARD_VERSION",
    "OUTPUT_DIR",
    "LOG_DIR",
    "RESULTS_DIR",
];

impl Config {
    /// Build a config from a TOML file body and an env map, applying
    /// defaults < file < env. Pure; the caller supplies both layers.
    pub fn from_sources(file_toml: Option<&str>, env: &HashMap<String, String>) -> Result<Config> {
        let mut cfg = Config::default();

        if let Some(body) = file_toml {
            let table: toml::Table = body
                .parse()
                .map_err(|e| EngineError::Config(format!("config file is not valid TOML: {}", e)))?;
            for (key, value) in &table {
                let canonical = key.to_ascii_uppercase();
                if !KNOWN_KEYS.contains(&canonical.as_str()) {
                    return Err(EngineError::Config(format!(
                        "unrecognized config key '{}'",
                        key
                    )));
                }
                let raw = match value {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                cfg.apply(&canonical, &raw)?;
            }
        }

        for key in KNOWN_KEYS {
            if let Some(raw) = env.get(*key) {
                cfg.apply(key, raw)?;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from the real process environment plus an optional file path.
    pub fn load(file: Option<&Path>) -> Result<Config> {
        let body = match file {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                EngineError::Config(format!("cannot read config file {:?}: {}", path, e))
            })?),
            None => None,
        };
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::from_sources(body.as_deref(), &env)
    }

    fn apply(&mut self, key: &str, raw: &str) -> Result<()> {
        match key {
            "RECALL_IDEA_WEIGHT" => self.recall_idea_weight = parse_f64(key, raw)?,
            "RECALL_DOMAIN_WEIGHT" => self.recall_domain_weight = parse_f64(key, raw)?,
            "RECALL_PAPER_WEIGHT" => self.recall_paper_weight = parse_f64(key, raw)?,
            "RECALL_NORMALIZE" => self.recall_normalize = parse_bool(key, raw)?,
            "FINAL_TOP_K" => self.final_top_k = parse_usize(key, raw)?,
            "COARSE_RECALL_SIZE" => self.coarse_recall_size = parse_usize(key, raw)?,
            "RECALL_FINE_TOP_K" => self.fine_top_k = parse_usize(key, raw)?,
            "RECALL_DOMAIN_TOP_M" => self.domain_top_m = parse_usize(key, raw)?,
            "RECALL_SUBDOMAIN_BOOST" => self.subdomain_boost = parse_f64(key, raw)?,
            "PATTERN_SELECT_TOPN" => self.pattern_select_topn = parse_usize(key, raw)?,
            "STORY_TEMPERATURE" => self.story_temperature = parse_f64(key, raw)?,
            "CRITIC_TEMPERATURE" => self.critic_temperature = parse_f64(key, raw)?,
            "COACH_TEMPERATURE" => self.coach_temperature = parse_f64(key, raw)?,
            "CRITIC_STRICT_JSON" => self.critic_strict_json = parse_bool(key, raw)?,
            "JSON_RETRIES" => self.json_retries = parse_usize(key, raw)?,
            "ANCHOR_QUANTILES" => self.anchor_quantiles = parse_f64_list(key, raw)?,
            "ANCHOR_MAX_INITIAL" => self.anchor_max_initial = parse_usize(key, raw)?,
            "ANCHOR_MAX_TOTAL" => self.anchor_max_total = parse_usize(key, raw)?,
            "ANCHOR_MAX_EXEMPLARS" => self.anchor_max_exemplars = parse_usize(key, raw)?,
            "DENSIFY_ENABLE" => self.densify_enable = parse_bool(key, raw)?,
            "DENSIFY_LOSS_THRESHOLD" => self.densify_loss_threshold = parse_f64(key, raw)?,
            "DENSIFY_MIN_AVG_CONF" => self.densify_min_avg_conf = parse_f64(key, raw)?,
            "BUCKET_SIZE" => self.bucket_size = parse_f64(key, raw)?,
            "BUCKET_COUNT" => self.bucket_count = parse_usize(key, raw)?,
            "TAU_METHODOLOGY" => self.tau_methodology = Some(parse_f64(key, raw)?),
            "TAU_NOVELTY" => self.tau_novelty = Some(parse_f64(key, raw)?),
            "TAU_STORYTELLER" => self.tau_storyteller = Some(parse_f64(key, raw)?),
            "TAU_DEFAULT" => self.tau_default = parse_f64(key, raw)?,
            "TAU_PATH" => self.tau_path = PathBuf::from(raw),
            "GRID_STEP" => self.grid_step = parse_f64(key, raw)?,
            "MAX_REFINE_ITERATIONS" => self.max_refine_iterations = parse_usize(key, raw)?,
            "NOVELTY_MODE_MAX_PATTERNS" => self.novelty_mode_max_patterns = parse_usize(key, raw)?,
            "FUSION_QUALITY_THRESHOLD" => self.fusion_quality_threshold = parse_f64(key, raw)?,
            "DEGRADATION_THRESHOLD" => self.degradation_threshold = parse_f64(key, raw)?,
            "NOVELTY_STAGNATION_DELTA" => self.novelty_stagnation_delta = parse_f64(key, raw)?,
            "NOVELTY_ENABLE" => self.novelty_enable = parse_bool(key, raw)?,
            "NOVELTY_ACTION" => self.novelty_action = NoveltyAction::parse(raw)?,
            "MAX_PIVOTS" => self.max_pivots = parse_usize(key, raw)?,
            "COLLISION_THRESHOLD" => self.collision_threshold = parse_f64(key, raw)?,
            "NOVELTY_TOP_K" => self.novelty_top_k = parse_usize(key, raw)?,
            "INDEX_DIR_MODE" => self.index_dir_mode = IndexDirMode::parse(raw)?,
            "INDEX_ALLOW_BUILD" => self.index_allow_build = parse_bool(key, raw)?,
            "RECALL_INDEX_DIR" => self.recall_index_dir = Some(PathBuf::from(raw)),
            "NOVELTY_INDEX_DIR" => self.novelty_index_dir = Some(PathBuf::from(raw)),
            "MODEL_PROFILE" => self.model_profile = raw.to_string(),
            "EMBED_BATCH_SIZE" => self.embed_batch_size = parse_usize(key, raw)?,
            "EMBED_MAX_RETRIES" => self.embed_max_retries = parse_usize(key, raw)?,
            "EMBED_SLEEP_SEC" => self.embed_sleep_sec = parse_f64(key, raw)?,
            "MAX_RETRIES" => self.max_retries = parse_usize(key, raw)?,
            "LLM_API_URL" => self.llm_api_url = raw.to_string(),
            "LLM_API_KEY" => self.llm_api_key = raw.to_string(),
            "LLM_MODEL" => self.llm_model = raw.to_string(),
            "JUDGE_MODEL" => self.judge_model = raw.to_string(),
            "EMBED_MODEL" => self.embed_model = raw.to_string(),
            "LLM_TIMEOUT_SECS" => self.llm_timeout_secs = parse_usize(key, raw)? as u64,
            "STORY_MAX_TOKENS" => self.story_max_tokens = parse_usize(key, raw)?,
            "CRITIC_MAX_TOKENS" => self.critic_max_tokens = parse_usize(key, raw)?,
            "COACH_MAX_TOKENS" => self.coach_max_tokens = parse_usize(key, raw)?,
            "SELECTOR_MAX_TOKENS" => self.selector_max_tokens = parse_usize(key, raw)?,
            "FUSION_MAX_TOKENS" => self.fusion_max_tokens = parse_usize(key, raw)?,
            "RUBRIC_VERSION" => self.rubric_version = raw.to_string(),
            "CARD_VERSION" => self.card_version = raw.to_string(),
            "OUTPUT_DIR" => self.output_dir = PathBuf::from(raw),
            "LOG_DIR" => self.log_dir = PathBuf::from(raw),
            "RESULTS_DIR" => self.results_dir = PathBuf::from(raw),
            _ => unreachable!("unknown key passed apply: {}", key),
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let weights = [
            self.recall_idea_weight,
            self.recall_domain_weight,
            self.recall_paper_weight,
        ];
        if weights.iter().any(|w| *w < 0.0) {
            return Err(EngineError::Config(
                "recall path weights must be non-negative".into(),
            ));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(EngineError::Config(
                "at least one recall path weight must be positive".into(),
            ));
        }
        if self.grid_step <= 0.0 || self.grid_step > 1.0 {
            return Err(EngineError::Config(format!(
                "GRID_STEP must be in (0, 1], got {}",
                self.grid_step
            )));
        }
        if self.anchor_quantiles.is_empty()
            || self.anchor_quantiles.iter().any(|q| *q <= 0.0 || *q >= 1.0)
        {
            return Err(EngineError::Config(
                "ANCHOR_QUANTILES must be a non-empty list of values in (0, 1)".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.collision_threshold) {
            return Err(EngineError::Config(format!(
                "COLLISION_THRESHOLD must be in [0, 1], got {}",
                self.collision_threshold
            )));
        }
        if self.final_top_k == 0 || self.coarse_recall_size == 0 {
            return Err(EngineError::Config(
                "FINAL_TOP_K and COARSE_RECALL_SIZE must be positive".into(),
            ));
        }
        if self.bucket_size <= 0.0 {
            return Err(EngineError::Config("BUCKET_SIZE must be positive".into()));
        }
        Ok(())
    }

    /// Per-role tau from explicit config, falling back to the default.
    /// Only consulted when no offline-fit tau table is pinned.
    pub fn tau_override(&self, role: crate::types::Role) -> Option<f64> {
        match role {
            crate::types::Role::Methodology => self.tau_methodology,
            crate::types::Role::Novelty => self.tau_novelty,
            crate::types::Role::Storyteller => self.tau_storyteller,
        }
    }

    /// True when every role has an explicit tau override.
    pub fn all_taus_overridden(&self) -> bool {
        self.tau_methodology.is_some()
            && self.tau_novelty.is_some()
            && self.tau_storyteller.is_some()
    }
}

fn parse_f64(key: &str, raw: &str) -> Result<f64> {
    raw.trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("{} must be a number, got '{}'", key, raw)))
}

fn parse_usize(key: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("{} must be an integer, got '{}'", key, raw)))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(EngineError::Config(format!(
            "{} must be a boolean, got '{}'",
            key, raw
        ))),
    }
}

fn parse_f64_list(key: &str, raw: &str) -> Result<Vec<f64>> {
    raw.split(',')
        .map(|part| parse_f64(key, part))
        .collect::<Result<Vec<_>>>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.final_top_k, 10);
        assert_eq!(cfg.coarse_recall_size, 100);
        assert!((cfg.recall_idea_weight - 0.4).abs() < 1e-12);
        assert!((cfg.recall_domain_weight - 0.2).abs() < 1e-12);
        assert_eq!(cfg.anchor_quantiles.len(), 7);
        assert_eq!(cfg.max_pivots, 1);
        assert_eq!(cfg.novelty_action, NoveltyAction::Pivot);
        assert!(cfg.recall_normalize);
    }

    #[test]
    fn test_env_overrides_file() {
        let file = "final_top_k = 5\nstory_temperature = 0.9\n";
        let mut env = HashMap::new();
        env.insert("FINAL_TOP_K".to_string(), "3".to_string());
        let cfg = Config::from_sources(Some(file), &env).unwrap();
        // env wins over file, file wins over default
        assert_eq!(cfg.final_top_k, 3);
        assert!((cfg.story_temperature - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        let file = "final_topk = 5\n";
        let err = Config::from_sources(Some(file), &HashMap::new()).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_quantile_list_parsing() {
        let mut env = HashMap::new();
        env.insert("ANCHOR_QUANTILES".to_string(), "0.1,0.5,0.9".to_string());
        let cfg = Config::from_sources(None, &env).unwrap();
        assert_eq!(cfg.anchor_quantiles, vec![0.1, 0.5, 0.9]);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut env = HashMap::new();
        env.insert("GRID_STEP".to_string(), "0".to_string());
        assert!(Config::from_sources(None, &env).is_err());

        let mut env = HashMap::new();
        env.insert("NOVELTY_ACTION".to_string(), "explode".to_string());
        assert!(Config::from_sources(None, &env).is_err());

        let mut env = HashMap::new();
        env.insert("RECALL_IDEA_WEIGHT".to_string(), "-1".to_string());
        assert!(Config::from_sources(None, &env).is_err());
    }

    #[test]
    fn test_novelty_action_parsing() {
        let mut env = HashMap::new();
        env.insert("NOVELTY_ACTION".to_string(), "report_only".to_string());
        let cfg = Config::from_sources(None, &env).unwrap();
        assert_eq!(cfg.novelty_action, NoveltyAction::ReportOnly);
    }

    #[test]
    fn test_tau_overrides() {
        let mut env = HashMap::new();
        env.insert("TAU_METHODOLOGY".to_string(), "0.8".to_string());
        env.insert("TAU_NOVELTY".to_string(), "1.1".to_string());
        let cfg = Config::from_sources(None, &env).unwrap();
        assert_eq!(cfg.tau_override(crate::types::Role::Methodology), Some(0.8));
        assert_eq!(cfg.tau_override(crate::types::Role::Storyteller), None);
        assert!(!cfg.all_taus_overridden());
    }
}
