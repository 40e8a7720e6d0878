//! Typed error hierarchy for the Nimbus orchestrator.
//!
//! `PipelineError` covers everything that can end a job: LLM, build, and
//! deploy failures are caught once at the top of the pipeline task, recorded
//! on the job row, and surfaced as a terminal `error` SSE event. The HTTP
//! layer maps the request-scoped kinds (bad request, auth, not-found) to
//! responses before a pipeline ever starts.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Missing required configuration: {0}")]
    ConfigMissing(&'static str),

    #[error("LLM generation failed: {0}")]
    Llm(String),

    #[error("Build failed in sandbox {sandbox_id}: {message}\n--- {phase} log (tail) ---\n{log_tail}")]
    Build {
        sandbox_id: String,
        phase: String,
        message: String,
        log_tail: String,
    },

    #[error("Deploy failed: {message}\n--- deploy log (tail) ---\n{log}")]
    Deploy { message: String, log: String },

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("Sandbox error: {0}")]
    Sandbox(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Sandbox identity carried by driver errors, when one was provisioned.
    /// The pipeline uses this to attribute failures even when the sandbox
    /// handle never made it back to the caller.
    pub fn sandbox_id(&self) -> Option<&str> {
        match self {
            Self::Build { sandbox_id, .. } => Some(sandbox_id),
            _ => None,
        }
    }
}
