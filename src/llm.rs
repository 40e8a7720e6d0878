//! OpenRouter client: posts a chat-style request, requires a JSON object
//! `{files: [{path, content}, ...]}`, and reports usage metrics.
//!
//! The first attempt carries a strict JSON-schema response-format
//! descriptor. Providers that reject structured output are retried exactly
//! once without the descriptor; everything else fails the job.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::errors::PipelineError;
use crate::models::GeneratedFile;
use crate::util::strip_code_fences;

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const TEMPERATURE: f64 = 0.7;
const MAX_TOKENS: u32 = 8192;
/// How long to wait before asking the generation endpoint for post-hoc cost.
const COST_LOOKUP_DELAY_MS: u64 = 500;
/// How much raw content to quote when the response fails to parse.
const PARSE_DIAGNOSTIC_CHARS: usize = 500;

/// Static base of the system prompt; framework rules from the registry are
/// appended per request.
pub const BASE_SYSTEM_PROMPT: &str = "You generate complete, small web applications. Respond with \
a single JSON object of the form {\"files\": [{\"path\": \"...\", \"content\": \"...\"}, ...]} and \
nothing else. Emit every file the project needs to build and run.";

#[derive(Debug, Clone, Default)]
pub struct LlmUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost: f64,
}

#[derive(Debug, Clone)]
pub struct LlmResult {
    pub files: Vec<GeneratedFile>,
    pub usage: LlmUsage,
    pub latency_ms: i64,
}

/// Capability binding for file generation; the pipeline only sees this.
#[async_trait]
pub trait FileGenerator: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<LlmResult, PipelineError>;
}

pub struct OpenRouterClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    id: Option<String>,
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
    #[serde(default)]
    cost: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FilesPayload {
    files: Vec<Value>,
}

impl OpenRouterClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, OPENROUTER_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url,
        }
    }

    async fn post_chat(&self, body: &Value) -> Result<(reqwest::StatusCode, String), PipelineError> {
        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| PipelineError::Llm(format!("request failed: {}", e)))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| PipelineError::Llm(format!("failed to read response body: {}", e)))?;
        Ok((status, text))
    }

    /// Retrieve the cost of a completed generation. OpenRouter materializes
    /// accounting shortly after the response; errors here are swallowed and
    /// reported as zero cost.
    async fn lookup_cost(&self, generation_id: &str) -> f64 {
        tokio::time::sleep(std::time::Duration::from_millis(COST_LOOKUP_DELAY_MS)).await;
        let url = format!("{}/generation?id={}", self.base_url, generation_id);
        let resp = self
            .http
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await;
        let Ok(resp) = resp else {
            return 0.0;
        };
        let Ok(body) = resp.json::<Value>().await else {
            return 0.0;
        };
        body.get("data")
            .and_then(|d| d.get("total_cost"))
            .and_then(|c| c.as_f64())
            .unwrap_or(0.0)
    }
}

#[async_trait]
impl FileGenerator for OpenRouterClient {
    async fn generate(
        &self,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<LlmResult, PipelineError> {
        let started = std::time::Instant::now();

        let with_schema = build_request_body(model, system_prompt, user_prompt, true);
        let (status, text) = self.post_chat(&with_schema).await?;

        let (status, text) = if !status.is_success() && is_schema_rejection(&text) {
            eprintln!("[llm] provider rejected json_schema response format, retrying without it");
            let bare = build_request_body(model, system_prompt, user_prompt, false);
            self.post_chat(&bare).await?
        } else {
            (status, text)
        };

        if !status.is_success() {
            return Err(PipelineError::Llm(format!(
                "provider returned {}: {}",
                status,
                crate::util::tail_chars(&text, PARSE_DIAGNOSTIC_CHARS)
            )));
        }

        let response: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| PipelineError::Llm(format!("malformed provider response: {}", e)))?;
        let latency_ms = started.elapsed().as_millis() as i64;

        let choice = response
            .choices
            .first()
            .ok_or_else(|| PipelineError::Llm("provider returned no choices".to_string()))?;
        let files = parse_generated_files(&choice.message.content)?;

        let mut usage = LlmUsage::default();
        let mut known_cost = None;
        if let Some(u) = &response.usage {
            usage.prompt_tokens = u.prompt_tokens;
            usage.completion_tokens = u.completion_tokens;
            usage.total_tokens = u.total_tokens;
            known_cost = u.cost;
        }
        usage.cost = match (known_cost, &response.id) {
            (Some(cost), _) => cost,
            (None, Some(id)) => self.lookup_cost(id).await,
            (None, None) => 0.0,
        };

        Ok(LlmResult {
            files,
            usage,
            latency_ms,
        })
    }
}

/// Assemble the chat-completions body; `with_schema` controls whether the
/// strict response-format descriptor rides along.
pub fn build_request_body(
    model: &str,
    system_prompt: &str,
    user_prompt: &str,
    with_schema: bool,
) -> Value {
    let mut body = json!({
        "model": model,
        "messages": [
            {"role": "system", "content": system_prompt},
            {"role": "user", "content": user_prompt},
        ],
        "temperature": TEMPERATURE,
        "max_tokens": MAX_TOKENS,
    });
    if with_schema {
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": {
                "name": "generated_files",
                "strict": true,
                "schema": {
                    "type": "object",
                    "properties": {
                        "files": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "path": {"type": "string"},
                                    "content": {"type": "string"},
                                },
                                "required": ["path", "content"],
                                "additionalProperties": false,
                            },
                        },
                    },
                    "required": ["files"],
                    "additionalProperties": false,
                },
            },
        });
    }
    body
}

/// Does an error body look like a structured-output rejection?
pub fn is_schema_rejection(error_body: &str) -> bool {
    // Compiled per call; this path runs at most once per job.
    let re = Regex::new(r"(?i)response_format|structured output|json_schema|schema")
        .expect("static regex");
    re.is_match(error_body)
}

/// Parse the model's message content into generated files. Accepts bare
/// JSON or a fenced block; anything else fails with a bounded excerpt of
/// the raw content for diagnosis.
pub fn parse_generated_files(content: &str) -> Result<Vec<GeneratedFile>, PipelineError> {
    let cleaned = strip_code_fences(content);
    let parse = |raw: &str| -> Result<Vec<GeneratedFile>, String> {
        let payload: FilesPayload = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        let mut files = Vec::with_capacity(payload.files.len());
        for entry in payload.files {
            let path = entry
                .get("path")
                .and_then(|p| p.as_str())
                .ok_or_else(|| "file entry missing string 'path'".to_string())?;
            let content = entry
                .get("content")
                .and_then(|c| c.as_str())
                .ok_or_else(|| format!("file '{}' missing string 'content'", path))?;
            files.push(GeneratedFile {
                path: path.to_string(),
                content: content.to_string(),
            });
        }
        Ok(files)
    };

    parse(cleaned).map_err(|reason| {
        let excerpt: String = content.chars().take(PARSE_DIAGNOSTIC_CHARS).collect();
        PipelineError::Llm(format!(
            "could not parse generated files ({}); raw content begins: {}",
            reason, excerpt
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_carries_schema_by_default() {
        let body = build_request_body("test/model", "sys", "user", true);
        assert_eq!(body["model"], "test/model");
        assert_eq!(body["temperature"], 0.7);
        assert_eq!(body["max_tokens"], 8192);
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "user");
    }

    #[test]
    fn test_request_body_without_schema() {
        let body = build_request_body("test/model", "sys", "user", false);
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn test_schema_rejection_detection() {
        assert!(is_schema_rejection("response_format not supported"));
        assert!(is_schema_rejection("Structured Output is unavailable for this model"));
        assert!(is_schema_rejection(r#"{"error": {"message": "json_schema invalid"}}"#));
        assert!(is_schema_rejection("the provided SCHEMA was rejected"));
        assert!(!is_schema_rejection("rate limit exceeded"));
    }

    #[test]
    fn test_parse_bare_json() {
        let files = parse_generated_files(
            r#"{"files": [{"path": "index.html", "content": "<html></html>"}]}"#,
        )
        .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "index.html");
    }

    #[test]
    fn test_parse_fenced_json_matches_bare() {
        let bare = r#"{"files": [{"path": "a.js", "content": "x"}]}"#;
        let fenced = format!("```json\n{}\n```", bare);
        assert_eq!(
            parse_generated_files(bare).unwrap(),
            parse_generated_files(&fenced).unwrap()
        );
    }

    #[test]
    fn test_parse_failure_quotes_bounded_excerpt() {
        let garbage = format!("the model rambled {}", "a".repeat(2000));
        let err = parse_generated_files(&garbage).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("raw content begins"));
        // 500 chars of excerpt plus the fixed framing, never the full 2 KB.
        assert!(text.len() < 700);
    }

    #[test]
    fn test_parse_rejects_non_string_fields() {
        let err =
            parse_generated_files(r#"{"files": [{"path": "a.js", "content": 42}]}"#).unwrap_err();
        assert!(err.to_string().contains("missing string 'content'"));
    }

    #[test]
    fn test_parse_rejects_missing_files_array() {
        assert!(parse_generated_files(r#"{"tree": []}"#).is_err());
    }

    #[test]
    fn test_empty_files_array_is_valid() {
        assert!(parse_generated_files(r#"{"files": []}"#).unwrap().is_empty());
    }
}
