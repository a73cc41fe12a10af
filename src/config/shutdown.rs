// ABOUTME: Graceful shutdown configuration: budgets, hooks, and trigger signals.
// ABOUTME: Hook entries here are matched to registered hook actions by name.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Budget for the orderly drain → stop-services → cleanup sequence.
    #[serde(default = "default_graceful_timeout", with = "humantime_serde")]
    pub graceful_timeout: Duration,

    /// Hard ceiling; once elapsed the process is forcibly terminated.
    #[serde(default = "default_force_timeout", with = "humantime_serde")]
    pub force_timeout: Duration,

    /// Whether draining waits for in-flight requests to finish.
    #[serde(default = "default_true")]
    pub wait_for_active_requests: bool,

    #[serde(default)]
    pub hooks: Vec<HookConfig>,

    /// OS signals that trigger shutdown, e.g. ["SIGTERM", "SIGINT"].
    #[serde(default = "default_signals")]
    pub signals: Vec<String>,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: default_graceful_timeout(),
            force_timeout: default_force_timeout(),
            wait_for_active_requests: true,
            hooks: vec![],
            signals: default_signals(),
        }
    }
}

/// Declarative half of a shutdown hook. A hook with a `command` is
/// self-contained; one without gets its executable half registered at
/// runtime under the same name.
#[derive(Debug, Clone, Deserialize)]
pub struct HookConfig {
    pub name: String,

    /// Higher priority runs first.
    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_hook_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// A required hook's failure escalates to forced shutdown.
    #[serde(default)]
    pub required: bool,

    /// Shell command run at shutdown; a non-zero exit fails the hook.
    #[serde(default)]
    pub command: Option<String>,
}

fn default_graceful_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_force_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_hook_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

fn default_signals() -> Vec<String> {
    vec!["SIGTERM".to_string(), "SIGINT".to_string()]
}
