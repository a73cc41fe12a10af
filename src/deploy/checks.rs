// ABOUTME: Executes configured pre- and post-deployment checks.
// ABOUTME: URL checks use the health probe; the rest run shell commands with timeouts.

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::model::{CheckResult, CheckStatus};
use crate::config::{CheckConfig, CheckKind};
use crate::health::{HealthProbe, ProbeOutcome};

/// Fixed backoff between check attempts.
pub const CHECK_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Outcome of running a list of checks: all individual results, plus the
/// first required failure if any.
pub struct ChecksOutcome {
    pub results: Vec<CheckResult>,
    pub required_failure: Option<(String, String)>,
}

impl ChecksOutcome {
    pub fn ok(&self) -> bool {
        self.required_failure.is_none()
    }
}

/// Run checks in configured order. A required failure stops the run; the
/// remaining checks are not attempted (they stay unreported, matching the
/// abort semantics of the pipeline).
pub async fn run_checks(configs: &[CheckConfig]) -> ChecksOutcome {
    let mut results = Vec::with_capacity(configs.len());

    for config in configs {
        let result = run_check(config).await;
        let failed = result.status == CheckStatus::Failed;
        let message = result.message.clone().unwrap_or_default();
        results.push(result);

        if failed && config.required {
            return ChecksOutcome {
                results,
                required_failure: Some((config.name.clone(), message)),
            };
        }
    }

    ChecksOutcome {
        results,
        required_failure: None,
    }
}

/// Run a single check with its retry budget (retries + 1 attempts, fixed
/// 2s backoff between attempts).
pub async fn run_check(config: &CheckConfig) -> CheckResult {
    let mut result = CheckResult::running(&config.name, config.kind);

    let attempts = config.retries + 1;
    let mut last_message = String::new();

    for attempt in 1..=attempts {
        match attempt_check(config).await {
            Attempt::Passed => {
                tracing::info!(check = %config.name, attempt, "check passed");
                result.finish(CheckStatus::Passed, None);
                return result;
            }
            Attempt::Skipped(reason) => {
                tracing::info!(check = %config.name, %reason, "check skipped");
                result.finish(CheckStatus::Skipped, Some(reason));
                return result;
            }
            Attempt::Failed(message) => {
                tracing::warn!(check = %config.name, attempt, attempts, %message, "check attempt failed");
                last_message = message;
                if attempt < attempts {
                    tokio::time::sleep(CHECK_RETRY_BACKOFF).await;
                }
            }
        }
    }

    result.finish(CheckStatus::Failed, Some(last_message));
    result
}

enum Attempt {
    Passed,
    Failed(String),
    Skipped(String),
}

async fn attempt_check(config: &CheckConfig) -> Attempt {
    match config.kind {
        CheckKind::HealthCheck => {
            let Some(url) = config.url.as_deref() else {
                return Attempt::Skipped("no url configured".to_string());
            };
            url_check(url, config.timeout).await
        }
        _ => {
            let Some(command) = config.command.as_deref() else {
                return Attempt::Skipped("no command configured".to_string());
            };
            command_check(command, config.timeout).await
        }
    }
}

/// Probe an http URL; pass on 2xx.
async fn url_check(url: &str, timeout: Duration) -> Attempt {
    let Some((addr, path)) = split_url(url) else {
        return Attempt::Failed(format!("unsupported url: {url}"));
    };

    let probe = HealthProbe::new(path, timeout);
    match probe.check(&addr).await {
        ProbeOutcome::Healthy => Attempt::Passed,
        ProbeOutcome::Unhealthy => Attempt::Failed(format!("{url} returned non-2xx")),
        ProbeOutcome::Unreachable => Attempt::Failed(format!("{url} unreachable")),
    }
}

/// Run a shell command; pass on exit code 0.
async fn command_check(command: &str, timeout: Duration) -> Attempt {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) if output.status.success() => Attempt::Passed,
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Attempt::Failed(format!(
                "exit code {:?}: {}",
                output.status.code(),
                stderr.trim()
            ))
        }
        Ok(Err(e)) => Attempt::Failed(format!("failed to execute: {e}")),
        Err(_elapsed) => Attempt::Failed(format!("timed out after {timeout:?}")),
    }
}

/// Split "http://host:port/path" into (host:port, /path). Only plain
/// http URLs are supported; the proxy and probes never speak TLS.
fn split_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("http://")?;
    match rest.split_once('/') {
        Some((addr, path)) => Some((addr.to_string(), format!("/{path}"))),
        None => Some((rest.to_string(), "/".to_string())),
    }
}
