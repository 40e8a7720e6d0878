//! Edge-worker control plane: the one call the orchestrator makes against
//! the Workers API directly is deleting a script during cleanup. Deploys
//! happen inside the sandbox through the wrangler tool.

use anyhow::{Context, Result};
use async_trait::async_trait;

#[async_trait]
pub trait WorkerApi: Send + Sync {
    /// Delete a deployed worker script. A missing script (HTTP 404) counts
    /// as success so the sweeper stays idempotent.
    async fn delete_worker(&self, name: &str) -> Result<()>;
}

pub struct CloudflareWorkerApi {
    http: reqwest::Client,
    base_url: String,
    account_id: String,
    api_token: String,
}

impl CloudflareWorkerApi {
    pub fn new(account_id: String, api_token: String) -> Self {
        Self::with_base_url(
            "https://api.cloudflare.com/client/v4".to_string(),
            account_id,
            api_token,
        )
    }

    pub fn with_base_url(base_url: String, account_id: String, api_token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            account_id,
            api_token,
        }
    }
}

#[async_trait]
impl WorkerApi for CloudflareWorkerApi {
    async fn delete_worker(&self, name: &str) -> Result<()> {
        let url = format!(
            "{}/accounts/{}/workers/scripts/{}?force=true",
            self.base_url, self.account_id, name
        );
        let resp = self
            .http
            .delete(&url)
            .header("Authorization", format!("Bearer {}", self.api_token))
            .send()
            .await
            .with_context(|| format!("Failed to call worker delete API for {}", name))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status()
            .with_context(|| format!("Worker delete rejected for {}", name))?;
        Ok(())
    }
}
