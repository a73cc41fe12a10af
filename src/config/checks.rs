// ABOUTME: Pre- and post-deployment check configuration.
// ABOUTME: Each check names a kind, a target (URL or shell command), and a retry budget.

use serde::Deserialize;
use std::time::Duration;

/// What a configured check verifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// GET against a URL, 200 means pass. Pre-deployment.
    HealthCheck,
    /// Shell command verifying pending migrations are applied.
    DatabaseMigration,
    /// Shell command verifying external dependencies are reachable.
    DependencyCheck,
    /// Post-deployment smoke test command.
    SmokeTest,
    /// Post-deployment integration test command.
    IntegrationTest,
    /// Post-deployment performance test command.
    PerformanceTest,
    /// Arbitrary shell command.
    Custom,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CheckKind::HealthCheck => "health_check",
            CheckKind::DatabaseMigration => "database_migration",
            CheckKind::DependencyCheck => "dependency_check",
            CheckKind::SmokeTest => "smoke_test",
            CheckKind::IntegrationTest => "integration_test",
            CheckKind::PerformanceTest => "performance_test",
            CheckKind::Custom => "custom",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: CheckKind,

    /// Shell command for command-based checks.
    #[serde(default)]
    pub command: Option<String>,

    /// Target URL for `health_check` checks.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_required")]
    pub required: bool,

    #[serde(default = "default_check_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Extra attempts after the first. Post-deployment checks back off
    /// a fixed 2s between attempts.
    #[serde(default)]
    pub retries: u32,
}

fn default_required() -> bool {
    true
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(30)
}
