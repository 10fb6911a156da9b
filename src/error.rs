//! Engine error kinds
//!
//! Gateway-layer failures (rate limits, timeouts, transport) are retried
//! locally and only bubble once exhausted. Semantic failures propagate to
//! the pipeline manager which decides rollback vs fallback. `Config` and
//! `Cancelled` are terminal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or invalid configuration, tau-table mismatch. Fatal.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network or provider failure after local retries were exhausted.
    #[error("transport error: {0}")]
    Transport(String),

    /// Provider signalled backpressure (HTTP 429).
    #[error("rate limited by provider")]
    RateLimited,

    /// Per-call timeout elapsed.
    #[error("call timed out after {0}s")]
    Timeout(u64),

    /// LLM output violated the expected JSON schema, a length cap, or the
    /// forbidden-term filter, and repair retries were exhausted.
    #[error("invalid model output: {0}")]
    InvalidOutput(String),

    /// The novelty verifier found a near-duplicate in the recent corpus.
    #[error("collision with prior work {paper_id} (similarity {similarity:.3})")]
    CollisionDetected { paper_id: String, similarity: f64 },

    /// A pipeline step failed non-recoverably; the refinement engine rolls
    /// back and marks the attempted pattern as failed.
    #[error("step failed: {0}")]
    StepFailed(String),

    /// Cooperative cancellation was requested.
    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether a gateway should retry the call that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::RateLimited | EngineError::Timeout(_) | EngineError::Transport(_)
        )
    }

    /// Process exit code for the binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Config(_) => 2,
            EngineError::Cancelled => 130,
            _ => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::RateLimited.is_retryable());
        assert!(EngineError::Timeout(30).is_retryable());
        assert!(EngineError::Transport("reset".into()).is_retryable());
        assert!(!EngineError::Config("bad".into()).is_retryable());
        assert!(!EngineError::InvalidOutput("schema".into()).is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(EngineError::Config("tau".into()).exit_code(), 2);
        assert_eq!(EngineError::Cancelled.exit_code(), 130);
        assert_eq!(EngineError::StepFailed("x".into()).exit_code(), 3);
    }
}
