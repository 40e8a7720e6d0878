use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job. Transitions form a DAG:
/// `pending → running → {completed, failed}` and `{completed, failed} → expired`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Expired,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    /// Terminal states that become eligible for expiration.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Where a project deploys: plain static assets or an edge worker script.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployTarget {
    Static,
    Workers,
}

impl DeployTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Workers => "workers",
        }
    }
}

impl std::fmt::Display for DeployTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeployTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(Self::Static),
            "workers" => Ok(Self::Workers),
            _ => Err(format!("Invalid deploy target: {}", s)),
        }
    }
}

/// One file of an LLM-generated project tree. `path` is project-relative;
/// parent directories are created implicitly when the tree is materialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

/// Optional per-project descriptor embedded as `nimbus.config.json` in the
/// generated tree. A missing or unparseable file means "unspecified"; after
/// normalization the registry writes the file back fully resolved.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NimbusConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<DeployTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_entry: Option<String>,
}

impl NimbusConfig {
    pub const FILE_NAME: &'static str = "nimbus.config.json";
}

/// Usage and timing metrics written in one update when a job completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobMetrics {
    pub file_count: i64,
    pub lines_of_code: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost: f64,
    pub llm_latency_ms: i64,
    pub install_duration_ms: i64,
    pub build_duration_ms: i64,
    pub deploy_duration_ms: i64,
    pub total_duration_ms: i64,
}

/// The central entity: one invocation of the pipeline from a user prompt to
/// an edge-deployed artifact. Timestamps are RFC-3339 strings, nullable until
/// the corresponding transition fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub prompt: String,
    pub model: String,
    pub status: JobStatus,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub expires_at: Option<String>,
    pub preview_url: Option<String>,
    pub deployed_url: Option<String>,
    pub error_message: Option<String>,
    pub file_count: Option<i64>,
    pub lines_of_code: Option<i64>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cost: Option<f64>,
    pub llm_latency_ms: Option<i64>,
    pub install_duration_ms: Option<i64>,
    pub build_duration_ms: Option<i64>,
    pub deploy_duration_ms: Option<i64>,
    pub total_duration_ms: Option<i64>,
    pub build_log_key: Option<String>,
    pub deploy_log_key: Option<String>,
    pub worker_name: Option<String>,
}

/// Projection returned by the job listing: truncated prompt, no metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListItem {
    pub id: String,
    pub prompt: String,
    pub model: String,
    pub status: JobStatus,
    pub created_at: String,
    pub deployed_url: Option<String>,
}

/// Mint a fresh job id: `job_` followed by eight lowercase hex characters.
pub fn new_job_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("job_{}", &uuid[..8])
}

/// Worker name for a job: deterministic, DNS-label-safe, unique per job.
pub fn worker_name_for(job_id: &str) -> String {
    let suffix = job_id.strip_prefix("job_").unwrap_or(job_id);
    format!("nimbus-{}", suffix)
}
