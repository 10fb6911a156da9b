//! Per-run artifact logging
//!
//! Every run gets `log/<run_id>/` with `meta.json` plus three append-only
//! JSONL streams: pipeline events, LLM calls, and embedding calls.
//! Records are appended in pipeline order; replaying a run reads the
//! events stream top to bottom.

use crate::error::Result;
use chrono::Utc;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Serialize)]
pub struct LlmCallRecord {
    pub stage: String,
    pub model: String,
    pub prompt_chars: usize,
    pub output_chars: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub latency_ms: u64,
    pub attempt: usize,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingCallRecord {
    pub batch_size: usize,
    pub model: String,
    pub latency_ms: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
struct Streams {
    events: File,
    llm_calls: File,
    embedding_calls: File,
}

#[derive(Clone, Copy)]
enum Stream {
    Events,
    LlmCalls,
    EmbeddingCalls,
}

/// Append-only writer for one run's log directory. `disabled()` swallows
/// everything; used by tests and by library callers that manage their own
/// logging.
#[derive(Debug)]
pub struct RunLogger {
    run_id: String,
    dir: Option<PathBuf>,
    streams: Option<Mutex<Streams>>,
}

impl RunLogger {
    pub fn new(log_root: &Path, run_id: &str) -> Result<Self> {
        let dir = log_root.join(run_id);
        std::fs::create_dir_all(&dir)?;
        let open = |name: &str| -> Result<File> {
            Ok(OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(name))?)
        };
        Ok(Self {
            run_id: run_id.to_string(),
            dir: Some(dir.clone()),
            streams: Some(Mutex::new(Streams {
                events: open("events.jsonl")?,
                llm_calls: open("llm_calls.jsonl")?,
                embedding_calls: open("embedding_calls.jsonl")?,
            })),
        })
    }

    pub fn disabled() -> Self {
        Self {
            run_id: "disabled".to_string(),
            dir: None,
            streams: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Write `meta.json` once at run start.
    pub fn write_meta(&self, meta: &serde_json::Value) -> Result<()> {
        if let Some(dir) = &self.dir {
            let body = serde_json::to_string_pretty(meta)?;
            std::fs::write(dir.join("meta.json"), body)?;
        }
        Ok(())
    }

    /// Append a pipeline event. Failures to log never fail the pipeline.
    pub fn event(&self, kind: &str, payload: serde_json::Value) {
        let value = serde_json::json!({
            "ts": Utc::now().to_rfc3339(),
            "run_id": self.run_id,
            "kind": kind,
            "payload": payload,
        });
        self.append(Stream::Events, &value);
    }

    pub fn llm_call(&self, record: &LlmCallRecord) {
        let value = serde_json::json!({
            "ts": Utc::now().to_rfc3339(),
            "run_id": self.run_id,
            "call": record,
        });
        self.append(Stream::LlmCalls, &value);
    }

    pub fn embedding_call(&self, record: &EmbeddingCallRecord) {
        let value = serde_json::json!({
            "ts": Utc::now().to_rfc3339(),
            "run_id": self.run_id,
            "call": record,
        });
        self.append(Stream::EmbeddingCalls, &value);
    }

    /// Flush all streams; called on shutdown and cancellation.
    pub fn flush(&self) {
        if let Some(streams) = &self.streams {
            if let Ok(mut guard) = streams.lock() {
                let _ = guard.events.flush();
                let _ = guard.llm_calls.flush();
                let _ = guard.embedding_calls.flush();
            }
        }
    }

    fn append(&self, stream: Stream, value: &serde_json::Value) {
        let Some(streams) = &self.streams else {
            return;
        };
        let Ok(mut guard) = streams.lock() else {
            return;
        };
        if let Ok(line) = serde_json::to_string(value) {
            let file = match stream {
                Stream::Events => &mut guard.events,
                Stream::LlmCalls => &mut guard.llm_calls,
                Stream::EmbeddingCalls => &mut guard.embedding_calls,
            };
            let _ = writeln!(file, "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streams_written_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let logger = RunLogger::new(tmp.path(), "run-1").unwrap();
        logger.event("recall_done", serde_json::json!({"patterns": 3}));
        logger.event("critic_done", serde_json::json!({"iteration": 0}));
        logger.llm_call(&LlmCallRecord {
            stage: "critic.methodology".into(),
            model: "m".into(),
            prompt_chars: 100,
            output_chars: 50,
            input_tokens: 20,
            output_tokens: 10,
            latency_ms: 5,
            attempt: 1,
            ok: true,
            error: None,
        });
        logger.flush();

        let events = std::fs::read_to_string(tmp.path().join("run-1/events.jsonl")).unwrap();
        let lines: Vec<&str> = events.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("recall_done"));
        assert!(lines[1].contains("critic_done"));

        let calls = std::fs::read_to_string(tmp.path().join("run-1/llm_calls.jsonl")).unwrap();
        assert!(calls.contains("critic.methodology"));
    }

    #[test]
    fn test_disabled_logger_is_silent() {
        let logger = RunLogger::disabled();
        logger.event("anything", serde_json::json!({}));
        logger.flush();
        assert!(logger.dir().is_none());
    }

    #[test]
    fn test_meta_written() {
        let tmp = tempfile::tempdir().unwrap();
        let logger = RunLogger::new(tmp.path(), "run-2").unwrap();
        logger
            .write_meta(&serde_json::json!({"idea": "test idea", "run_id": "run-2"}))
            .unwrap();
        let body = std::fs::read_to_string(tmp.path().join("run-2/meta.json")).unwrap();
        assert!(body.contains("test idea"));
    }
}
