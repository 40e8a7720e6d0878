//! Deploy driver: runs the wrangler deploy tool inside the already-built
//! sandbox, parses the resulting workers.dev URL, and keeps credentials out
//! of every log line that leaves this module.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::builder::{DEPLOY_LOG, PROJECT_ROOT, read_log_tail};
use crate::config::Config;
use crate::errors::PipelineError;
use crate::sandbox::Sandbox;

const DEPLOY_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub deployed_url: String,
    /// Credential-sanitized tail of the deploy log, for archival.
    pub deploy_log: String,
}

/// Deploy the built project with the synthesized `wrangler.nimbus.toml`.
pub async fn run_deploy(
    sandbox: &Arc<dyn Sandbox>,
    config: &Config,
) -> Result<DeployOutcome, PipelineError> {
    let cmd = format!(
        "cd {root} && export CLOUDFLARE_API_TOKEN=\"{token}\" CLOUDFLARE_ACCOUNT_ID=\"{account}\" \
         && bunx wrangler deploy --config wrangler.nimbus.toml > {log} 2>&1",
        root = PROJECT_ROOT,
        token = config.cloudflare_api_token,
        account = config.cloudflare_account_id,
        log = DEPLOY_LOG,
    );

    let result = match tokio::time::timeout(DEPLOY_TIMEOUT, sandbox.exec(&cmd, DEPLOY_TIMEOUT)).await
    {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "wrangler deploy timed out after {}s",
            DEPLOY_TIMEOUT.as_secs()
        )),
    };

    let log = sanitize_deploy_log(&read_log_tail(sandbox, DEPLOY_LOG).await);

    let output = result.map_err(|e| PipelineError::Deploy {
        message: format!("{:#}", e),
        log: log.clone(),
    })?;
    if !output.success() {
        return Err(PipelineError::Deploy {
            message: format!("wrangler deploy exited with code {}", output.exit_code),
            log,
        });
    }

    let deployed_url = parse_workers_url(&log).ok_or_else(|| PipelineError::Deploy {
        message: "no workers.dev URL in deploy output".to_string(),
        log: log.clone(),
    })?;

    Ok(DeployOutcome {
        deployed_url,
        deploy_log: log,
    })
}

/// First workers.dev URL in the deploy output.
pub fn parse_workers_url(log: &str) -> Option<String> {
    let re = Regex::new(r"https://[A-Za-z0-9][A-Za-z0-9.-]*\.workers\.dev").expect("static regex");
    re.find(log).map(|m| m.as_str().to_string())
}

/// Replace exported credential values before the log reaches an error
/// surface or the archive.
pub fn sanitize_deploy_log(log: &str) -> String {
    let token = Regex::new(r#"CLOUDFLARE_API_TOKEN="[^"]*""#).expect("static regex");
    let account = Regex::new(r#"CLOUDFLARE_ACCOUNT_ID="[^"]*""#).expect("static regex");
    let pass = token.replace_all(log, r#"CLOUDFLARE_API_TOKEN="[REDACTED]""#);
    account
        .replace_all(&pass, r#"CLOUDFLARE_ACCOUNT_ID="[REDACTED]""#)
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_workers_url() {
        let log = "Uploaded nimbus-a1b2c3d4 (1.2 sec)\n\
                   Deployed nimbus-a1b2c3d4 triggers (0.3 sec)\n\
                   https://nimbus-a1b2c3d4.subdomain.workers.dev\n\
                   Current Version ID: 1234";
        assert_eq!(
            parse_workers_url(log).as_deref(),
            Some("https://nimbus-a1b2c3d4.subdomain.workers.dev")
        );
    }

    #[test]
    fn test_parse_workers_url_absent() {
        assert_eq!(parse_workers_url("wrangler crashed before publishing"), None);
        // A non-workers URL must not match.
        assert_eq!(parse_workers_url("see https://example.com/docs"), None);
    }

    #[test]
    fn test_sanitize_redacts_both_credentials() {
        let log = "+ export CLOUDFLARE_API_TOKEN=\"sk-very-secret\" CLOUDFLARE_ACCOUNT_ID=\"abc123\"\nDeployed";
        let clean = sanitize_deploy_log(log);
        assert!(!clean.contains("sk-very-secret"));
        assert!(!clean.contains("abc123"));
        assert!(clean.contains("CLOUDFLARE_API_TOKEN=\"[REDACTED]\""));
        assert!(clean.contains("CLOUDFLARE_ACCOUNT_ID=\"[REDACTED]\""));
        assert!(clean.contains("Deployed"));
    }

    #[test]
    fn test_sanitize_is_a_noop_on_clean_logs() {
        let log = "Uploaded. https://nimbus-x.workers.dev";
        assert_eq!(sanitize_deploy_log(log), log);
    }
}
