//! Log archive: an object store for build/deploy log blobs, keyed by job id
//! and phase. The production binding is Cloudflare R2 through its REST
//! surface; tests and local runs can use the in-memory store.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;

pub fn build_log_key(job_id: &str) -> String {
    format!("jobs/{}/build.log", job_id)
}

pub fn deploy_log_key(job_id: &str) -> String {
    format!("jobs/{}/deploy.log", job_id)
}

#[async_trait]
pub trait LogArchive: Send + Sync {
    /// Store a text blob under `key`. Keys are write-once in practice; a
    /// second put overwrites.
    async fn put(&self, key: &str, body: &str) -> Result<()>;

    /// Fetch a blob; `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove a blob. Deleting a missing key is a success.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Cloudflare R2 bucket addressed through the accounts REST API with the
/// same token the deploy driver exports into the sandbox.
pub struct R2LogArchive {
    http: reqwest::Client,
    base_url: String,
    account_id: String,
    api_token: String,
    bucket: String,
}

impl R2LogArchive {
    pub fn new(account_id: String, api_token: String, bucket: String) -> Self {
        Self::with_base_url(
            "https://api.cloudflare.com/client/v4".to_string(),
            account_id,
            api_token,
            bucket,
        )
    }

    pub fn with_base_url(
        base_url: String,
        account_id: String,
        api_token: String,
        bucket: String,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            account_id,
            api_token,
            bucket,
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/accounts/{}/r2/buckets/{}/objects/{}",
            self.base_url, self.account_id, self.bucket, key
        )
    }
}

#[async_trait]
impl LogArchive for R2LogArchive {
    async fn put(&self, key: &str, body: &str) -> Result<()> {
        let resp = self
            .http
            .put(self.object_url(key))
            .header("Authorization", format!("Bearer {}", self.api_token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body.to_string())
            .send()
            .await
            .with_context(|| format!("Failed to upload log object {}", key))?;
        resp.error_for_status()
            .with_context(|| format!("Log upload rejected for {}", key))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let resp = self
            .http
            .get(self.object_url(key))
            .header("Authorization", format!("Bearer {}", self.api_token))
            .send()
            .await
            .with_context(|| format!("Failed to fetch log object {}", key))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp
            .error_for_status()
            .with_context(|| format!("Log fetch rejected for {}", key))?;
        let body = resp
            .text()
            .await
            .with_context(|| format!("Failed to read log object {}", key))?;
        Ok(Some(body))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.object_url(key))
            .header("Authorization", format!("Bearer {}", self.api_token))
            .send()
            .await
            .with_context(|| format!("Failed to delete log object {}", key))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status()
            .with_context(|| format!("Log delete rejected for {}", key))?;
        Ok(())
    }
}

/// In-memory archive for tests and credential-less local runs.
#[derive(Default)]
pub struct MemoryLogArchive {
    objects: Mutex<HashMap<String, String>>,
}

impl MemoryLogArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let guard = self.objects.lock().expect("archive lock poisoned");
        let mut keys: Vec<String> = guard.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl LogArchive for MemoryLogArchive {
    async fn put(&self, key: &str, body: &str) -> Result<()> {
        self.objects
            .lock()
            .map_err(|_| anyhow::anyhow!("archive lock poisoned"))?
            .insert(key.to_string(), body.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .objects
            .lock()
            .map_err(|_| anyhow::anyhow!("archive lock poisoned"))?
            .get(key)
            .cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .lock()
            .map_err(|_| anyhow::anyhow!("archive lock poisoned"))?
            .remove(key);
        Ok(())
    }
}
