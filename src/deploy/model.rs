// ABOUTME: Deployment, instance, and check records with their status machines.
// ABOUTME: Includes the bounded per-deployment log and the 50-entry history ring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::{CheckKind, Strategy};
use crate::types::{DeploymentId, InstanceId, Version};

/// Per-deployment log entries kept, oldest dropped first.
pub const LOG_LIMIT: usize = 50;

/// Terminal deployments kept in the history ring.
pub const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Completed | DeploymentStatus::Failed | DeploymentStatus::RolledBack
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Pending,
    Starting,
    Healthy,
    Unhealthy,
    Updating,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
}

/// Outcome of one pre- or post-deployment check. Append-only within a
/// deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub kind: CheckKind,
    pub status: CheckStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl CheckResult {
    pub fn running(name: impl Into<String>, kind: CheckKind) -> Self {
        Self {
            name: name.into(),
            kind,
            status: CheckStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            message: None,
        }
    }

    pub fn finish(&mut self, status: CheckStatus, message: Option<String>) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.message = message;
    }

    pub fn passed(&self) -> bool {
        self.status == CheckStatus::Passed
    }
}

/// One running replica of the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub status: InstanceStatus,
    pub version: Version,
    pub port: u16,
    pub checks_passed: u32,
    pub checks_failed: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(port: u16, version: Version) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::new(format!("instance-{port}")),
            status: InstanceStatus::Pending,
            version,
            port,
            checks_passed: 0,
            checks_failed: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: InstanceStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn record_health(&mut self, passed: bool) {
        if passed {
            self.checks_passed += 1;
        } else {
            self.checks_failed += 1;
        }
        self.updated_at = Utc::now();
    }

    /// A fresh start resets the monotonic health counters.
    pub fn reset_health(&mut self) {
        self.checks_passed = 0;
        self.checks_failed = 0;
        self.updated_at = Utc::now();
    }

    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// One rollout attempt. Mutated only by its owning manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub strategy: Strategy,
    pub status: DeploymentStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub current_step: String,
    pub completed_steps: u32,
    pub total_steps: u32,
    pub from_version: Option<Version>,
    pub to_version: Version,
    pub instances: Vec<Instance>,
    pub checks: Vec<CheckResult>,
    pub log: VecDeque<LogEntry>,
    pub rollback_available: bool,
}

impl Deployment {
    pub fn new(strategy: Strategy, from: Option<Version>, to: Version, total_steps: u32) -> Self {
        Self {
            id: DeploymentId::generate(),
            strategy,
            status: DeploymentStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            current_step: "Pending".to_string(),
            completed_steps: 0,
            total_steps,
            from_version: from,
            to_version: to,
            instances: vec![],
            checks: vec![],
            log: VecDeque::new(),
            rollback_available: false,
        }
    }

    pub fn log(&mut self, message: impl Into<String>) {
        if self.log.len() == LOG_LIMIT {
            self.log.pop_front();
        }
        self.log.push_back(LogEntry {
            at: Utc::now(),
            message: message.into(),
        });
    }

    /// Enter the named pipeline step. Steps are monotonic: completed_steps
    /// only ever grows.
    pub fn begin_step(&mut self, step: impl Into<String>) {
        self.current_step = step.into();
        self.log(format!("step: {}", self.current_step));
    }

    pub fn complete_step(&mut self) {
        self.completed_steps += 1;
    }

    pub fn finish(&mut self, status: DeploymentStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// Bounded ring of terminal deployments, newest last.
#[derive(Debug, Default)]
pub struct DeploymentHistory {
    ring: VecDeque<Deployment>,
}

impl DeploymentHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn archive(&mut self, deployment: Deployment) {
        if self.ring.len() == HISTORY_LIMIT {
            self.ring.pop_front();
        }
        self.ring.push_back(deployment);
    }

    pub fn find(&self, id: &DeploymentId) -> Option<&Deployment> {
        self.ring.iter().rev().find(|d| &d.id == id)
    }

    pub fn find_mut(&mut self, id: &DeploymentId) -> Option<&mut Deployment> {
        self.ring.iter_mut().rev().find(|d| &d.id == id)
    }

    /// Most recent deployment that can still be rolled back.
    pub fn latest_rollback_target(&mut self) -> Option<&mut Deployment> {
        self.ring.iter_mut().rev().find(|d| d.rollback_available)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Deployment> {
        self.ring.iter()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}
