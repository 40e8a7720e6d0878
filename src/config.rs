//! Process configuration, read from the environment once at startup and
//! passed explicitly. No global state.

use crate::errors::PipelineError;

pub const DEFAULT_MODEL_FALLBACK: &str = "anthropic/claude-3.5-sonnet";
const DEFAULT_SANDBOX_IMAGE: &str = "oven/bun:1";
const DEFAULT_R2_BUCKET: &str = "nimbus-logs";

/// Credentials and knobs shared by the server, pipeline, and sweeper.
#[derive(Debug, Clone)]
pub struct Config {
    /// Model used when a job request does not name one.
    pub default_model: String,
    pub openrouter_api_key: String,
    pub cloudflare_api_token: String,
    pub cloudflare_account_id: String,
    /// Shared bearer token guarding administrative log retrieval.
    pub auth_token: String,
    /// R2 bucket holding archived build/deploy logs.
    pub r2_bucket: String,
    /// Container image used for build sandboxes.
    pub sandbox_image: String,
}

impl Config {
    pub fn from_env() -> Result<Self, PipelineError> {
        Ok(Self {
            default_model: std::env::var("DEFAULT_MODEL")
                .unwrap_or_else(|_| DEFAULT_MODEL_FALLBACK.to_string()),
            openrouter_api_key: require("OPENROUTER_API_KEY")?,
            cloudflare_api_token: require("CLOUDFLARE_API_TOKEN")?,
            cloudflare_account_id: require("CLOUDFLARE_ACCOUNT_ID")?,
            auth_token: require("AUTH_TOKEN")?,
            r2_bucket: std::env::var("R2_BUCKET").unwrap_or_else(|_| DEFAULT_R2_BUCKET.to_string()),
            sandbox_image: std::env::var("SANDBOX_IMAGE")
                .unwrap_or_else(|_| DEFAULT_SANDBOX_IMAGE.to_string()),
        })
    }
}

fn require(name: &'static str) -> Result<String, PipelineError> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(PipelineError::ConfigMissing(name)),
    }
}
