//! storyforge CLI
//!
//! One positional argument: the research idea text. Writes
//! `results/<run_id>/{final_story.json, pipeline_result.json,
//! manifest.json}` and per-run logs under `log/<run_id>/`.
//!
//! Exit codes: 0 success (passed or fallback), 2 configuration error,
//! 3 fatal engine error, 130 cancelled.

use std::path::PathBuf;
use std::sync::Arc;

use storyforge::embeddings::default_model_dir;
use storyforge::index::{resolve_index_dir, IndexKind};
use storyforge::{
    write_artifacts, CancelToken, Config, HttpLlmGateway, KgStore, LocalEmbedder,
    PipelineManager, RunLogger, VectorIndex,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    std::process::exit(run().await);
}

struct CliArgs {
    config_path: Option<PathBuf>,
    idea: String,
    help: bool,
}

fn parse_args(args: &[String]) -> anyhow::Result<CliArgs> {
    let mut config_path: Option<PathBuf> = None;
    let mut idea_parts: Vec<String> = Vec::new();
    let mut help = false;
    for arg in args {
        if let Some(path) = arg.strip_prefix("--config=") {
            config_path = Some(PathBuf::from(path));
        } else if arg == "--help" || arg == "-h" {
            help = true;
        } else if arg.starts_with("--") {
            anyhow::bail!("unknown option: {}", arg);
        } else {
            idea_parts.push(arg.clone());
        }
    }
    let idea = idea_parts.join(" ");
    if !help && idea.trim().is_empty() {
        anyhow::bail!("no idea text given");
    }
    Ok(CliArgs {
        config_path,
        idea,
        help,
    })
}

async fn run() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("error: {}", err);
            print_usage();
            return 2;
        }
    };
    if args.help {
        print_usage();
        return 0;
    }
    let config_path = args.config_path;
    let idea = args.idea;

    let cfg = match Config::load(config_path.as_deref()) {
        Ok(cfg) => Arc::new(cfg),
        Err(err) => {
            eprintln!("configuration error: {}", err);
            return 2;
        }
    };

    let run_id = uuid::Uuid::new_v4().to_string();
    let logger = match RunLogger::new(&cfg.log_dir, &run_id) {
        Ok(logger) => Arc::new(logger),
        Err(err) => {
            eprintln!("cannot open run log: {}", err);
            return 3;
        }
    };
    let _ = logger.write_meta(&serde_json::json!({
        "run_id": run_id,
        "idea": idea,
        "started_at": chrono::Utc::now().to_rfc3339(),
        "llm_model": cfg.llm_model,
        "judge_model": cfg.judge_model,
        "embed_model": cfg.embed_model,
    }));

    // Cooperative cancellation: first Ctrl-C stops issuing new calls.
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("cancellation requested, finishing current call");
                cancel.cancel();
            }
        });
    }

    match build_and_run(&cfg, &idea, Arc::clone(&logger), cancel).await {
        Ok(result) => {
            match write_artifacts(&result, &cfg.results_dir, &run_id, &idea) {
                Ok(dir) => {
                    print_summary(&result, &dir);
                }
                Err(err) => {
                    eprintln!("failed to write results: {}", err);
                    logger.flush();
                    return 3;
                }
            }
            logger.flush();
            0
        }
        Err(err) => {
            eprintln!("engine error: {}", err);
            // Leave a structured trace of the failure in the results dir.
            let failure = serde_json::json!({
                "success": false,
                "run_id": run_id,
                "error": err.to_string(),
                "reason": "fatal_engine_error",
            });
            let dir = cfg.results_dir.join(&run_id);
            let _ = std::fs::create_dir_all(&dir);
            let _ = std::fs::write(
                dir.join("pipeline_result.json"),
                serde_json::to_string_pretty(&failure).unwrap_or_default(),
            );
            logger.flush();
            err.exit_code()
        }
    }
}

async fn build_and_run(
    cfg: &Arc<Config>,
    idea: &str,
    logger: Arc<RunLogger>,
    cancel: CancelToken,
) -> storyforge::Result<storyforge::PipelineResult> {
    let kg = Arc::new(KgStore::load(&cfg.output_dir)?);
    tracing::info!(
        ideas = kg.ideas().len(),
        patterns = kg.patterns().len(),
        papers = kg.papers().len(),
        "knowledge graph loaded"
    );

    let llm = Arc::new(HttpLlmGateway::new(
        cfg.llm_api_url.clone(),
        cfg.llm_api_key.clone(),
        cfg.max_retries,
        cfg.llm_timeout_secs,
        cancel.clone(),
        Arc::clone(&logger),
    )?);
    let embedder = Arc::new(LocalEmbedder::new(&default_model_dir(), Arc::clone(&logger))?);

    let idea_index = load_or_build_index(cfg, IndexKind::RecallIdeas, &kg, embedder.as_ref(), &cancel).await;
    let paper_index = load_or_build_index(cfg, IndexKind::RecallPapers, &kg, embedder.as_ref(), &cancel).await;
    let novelty_index = match resolve_index_dir(cfg, IndexKind::Novelty) {
        Ok(dir) => match VectorIndex::load(&dir) {
            Ok(index) => Some(index),
            Err(err) => {
                tracing::warn!(%err, "novelty index unavailable; collision check disabled");
                None
            }
        },
        Err(err) => {
            tracing::warn!(%err, "novelty index dir unresolved; collision check disabled");
            None
        }
    };

    let manager = PipelineManager::new(
        kg,
        llm,
        embedder,
        idea_index,
        paper_index,
        novelty_index,
        Arc::clone(cfg),
        logger,
        cancel,
    );
    manager.run(idea).await
}

/// Load a recall index, rebuilding it from the KG when allowed.
async fn load_or_build_index(
    cfg: &Config,
    kind: IndexKind,
    kg: &KgStore,
    embedder: &LocalEmbedder,
    cancel: &CancelToken,
) -> Option<VectorIndex> {
    let dir = match resolve_index_dir(cfg, kind) {
        Ok(dir) => dir,
        Err(err) => {
            tracing::warn!(%err, "index dir unresolved; recall will embed on the fly");
            return None;
        }
    };
    match VectorIndex::load(&dir) {
        Ok(index) => return Some(index),
        Err(err) => {
            if !cfg.index_allow_build {
                tracing::warn!(%err, "index not loadable and building is disabled");
                return None;
            }
        }
    }

    let items: Vec<(String, String)> = match kind {
        IndexKind::RecallIdeas => kg
            .ideas()
            .iter()
            .map(|i| (i.idea_id.clone(), i.description.clone()))
            .collect(),
        IndexKind::RecallPapers => kg
            .papers()
            .iter()
            .map(|p| (p.paper_id.clone(), p.title.clone()))
            .collect(),
        IndexKind::Novelty => return None,
    };
    tracing::info!(count = items.len(), "building recall index");
    match VectorIndex::build(&items, embedder, &cfg.embed_model, cfg, cancel).await {
        Ok(index) => {
            if let Err(err) = index.save(&dir) {
                tracing::warn!(%err, "built index could not be persisted");
            }
            Some(index)
        }
        Err(err) => {
            tracing::warn!(%err, "index build failed; recall will embed on the fly");
            None
        }
    }
}

fn print_summary(result: &storyforge::PipelineResult, dir: &std::path::Path) {
    if result.success {
        println!("story accepted after {} iteration(s)", result.iterations);
    } else {
        println!(
            "no passing story ({}); emitted best of {} iteration(s)",
            result.reason.as_deref().unwrap_or("unknown"),
            result.iterations
        );
    }
    if let Some(source) = &result.final_story_source {
        println!(
            "final story: iteration {}, average {:.2}{}",
            source.iteration,
            source.score,
            if source.is_best_across_iterations {
                " (best across run)"
            } else {
                ""
            }
        );
    }
    if result.pivots > 0 {
        println!("pivots taken: {}", result.pivots);
    }
    println!("results: {}", dir.display());
}

fn print_usage() {
    println!("usage: storyforge [--config=PATH] <idea text>");
    println!();
    println!("Turns a research idea into a structured paper story using the");
    println!("knowledge graph under OUTPUT_DIR (default ./output).");
}
