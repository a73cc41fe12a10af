// ABOUTME: Graceful shutdown coordinator: drain connections, run hooks, then clean up.
// ABOUTME: A hard force timeout bounds the whole sequence; required hook failures force too.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::config::{HookConfig, ShutdownConfig};
use crate::events::{Event, EventBus};

/// Hard ceiling on the connection drain phase, independent of the
/// graceful timeout.
const DRAIN_CEILING: Duration = Duration::from_secs(30);

/// How often drain progress is re-checked and progress events are emitted.
const TICK: Duration = Duration::from_secs(1);

pub type HookFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
pub type HookAction = Box<dyn Fn() -> HookFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShutdownPhase {
    NotStarted,
    Draining,
    StoppingServices,
    Cleanup,
    Completed,
    Forced,
}

impl ShutdownPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownPhase::NotStarted => "NOT_STARTED",
            ShutdownPhase::Draining => "DRAINING",
            ShutdownPhase::StoppingServices => "STOPPING_SERVICES",
            ShutdownPhase::Cleanup => "CLEANUP",
            ShutdownPhase::Completed => "COMPLETED",
            ShutdownPhase::Forced => "FORCED",
        }
    }
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the shutdown sequence ended. Maps directly to the process exit
/// code: clean shutdowns exit 0, forced ones exit 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Completed,
    Forced,
}

impl ShutdownOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownOutcome::Completed => 0,
            ShutdownOutcome::Forced => 1,
        }
    }
}

/// A named cleanup step run during STOPPING_SERVICES. Hooks run one at a
/// time in descending priority order, each bounded by its own timeout.
pub struct ShutdownHook {
    pub name: String,
    pub priority: i32,
    pub timeout: Duration,
    pub required: bool,
    action: HookAction,
}

impl ShutdownHook {
    pub fn new(name: impl Into<String>, action: HookAction) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            timeout: Duration::from_secs(10),
            required: false,
            action,
        }
    }

    pub fn from_config(config: &HookConfig, action: HookAction) -> Self {
        Self {
            name: config.name.clone(),
            priority: config.priority,
            timeout: config.timeout,
            required: config.required,
            action,
        }
    }

    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }
}

/// Dropping the guard marks the connection finished. Obtained from
/// [`GracefulShutdownManager::track_connection`].
pub struct ConnectionGuard {
    id: u64,
    connections: Arc<Mutex<HashMap<u64, Option<AbortHandle>>>>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connections.lock().remove(&self.id);
    }
}

/// Point-in-time view for status queries.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ShutdownStatus {
    pub phase: ShutdownPhase,
    pub active_connections: usize,
    pub registered_hooks: usize,
}

pub struct GracefulShutdownManager {
    config: ShutdownConfig,
    events: EventBus,
    hooks: Mutex<Vec<ShutdownHook>>,
    listeners: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    connections: Arc<Mutex<HashMap<u64, Option<AbortHandle>>>>,
    next_connection: AtomicU64,
    phase: Arc<Mutex<ShutdownPhase>>,
    started: AtomicBool,
    outcome: watch::Sender<Option<ShutdownOutcome>>,
}

impl GracefulShutdownManager {
    pub fn new(config: ShutdownConfig, events: EventBus) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            config,
            events,
            hooks: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_connection: AtomicU64::new(0),
            phase: Arc::new(Mutex::new(ShutdownPhase::NotStarted)),
            started: AtomicBool::new(false),
            outcome,
        }
    }

    pub fn register_hook(&self, hook: ShutdownHook) {
        tracing::debug!(hook = %hook.name, priority = hook.priority, "shutdown hook registered");
        self.hooks.lock().push(hook);
    }

    /// Register a listener closer, called at the start of DRAINING so no
    /// new work is accepted while existing work finishes.
    pub fn register_listener(&self, close: Box<dyn FnOnce() + Send>) {
        self.listeners.lock().push(close);
    }

    /// Track an in-flight request. Pass the task's abort handle so a
    /// forced shutdown can cancel it; `None` means it cannot be cancelled
    /// and will simply be abandoned.
    pub fn track_connection(&self, abort: Option<AbortHandle>) -> ConnectionGuard {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections.lock().insert(id, abort);
        ConnectionGuard {
            id,
            connections: Arc::clone(&self.connections),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.lock()
    }

    pub fn status(&self) -> ShutdownStatus {
        ShutdownStatus {
            phase: self.phase(),
            active_connections: self.active_connections(),
            registered_hooks: self.hooks.lock().len(),
        }
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        *self.phase.lock() = phase;
        tracing::info!(%phase, "shutdown phase");
    }

    /// Run the whole shutdown sequence. Idempotent: concurrent and repeat
    /// callers wait for the one in-flight run and get its outcome.
    pub async fn initiate_shutdown(&self, reason: &str) -> ShutdownOutcome {
        if self.started.swap(true, Ordering::SeqCst) {
            let mut rx = self.outcome.subscribe();
            loop {
                if let Some(outcome) = *rx.borrow() {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    return ShutdownOutcome::Forced;
                }
            }
        }

        tracing::info!(reason, "shutdown initiated");
        self.events.emit(Event::ShutdownInitiated {
            reason: reason.to_string(),
        });

        let started_at = Instant::now();
        let ticker = self.spawn_progress_ticker(started_at);

        // The force timeout bounds everything: drain, hooks, cleanup.
        let outcome = tokio::select! {
            outcome = self.run_sequence() => outcome,
            _ = tokio::time::sleep(self.config.force_timeout) => {
                tracing::error!(timeout = ?self.config.force_timeout, "force timeout elapsed");
                self.force("force timeout elapsed")
            }
        };

        ticker.abort();
        if outcome == ShutdownOutcome::Completed {
            self.set_phase(ShutdownPhase::Completed);
            self.events.emit(Event::ShutdownCompleted);
        }
        let _ = self.outcome.send(Some(outcome));
        outcome
    }

    /// Emit a progress event every second while the graceful window is
    /// open. The countdown ends with the graceful timeout even when the
    /// sequence itself runs longer.
    fn spawn_progress_ticker(&self, started_at: Instant) -> tokio::task::JoinHandle<()> {
        let phase = Arc::clone(&self.phase);
        let events = self.events.clone();
        let graceful_timeout = self.config.graceful_timeout;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(TICK).await;
                if started_at.elapsed() >= graceful_timeout {
                    break;
                }
                let current = *phase.lock();
                events.emit(Event::ShutdownProgress {
                    phase: current.to_string(),
                    elapsed_secs: started_at.elapsed().as_secs(),
                });
            }
        })
    }

    async fn run_sequence(&self) -> ShutdownOutcome {
        self.set_phase(ShutdownPhase::Draining);
        self.drain().await;

        self.set_phase(ShutdownPhase::StoppingServices);
        if let Err(failed) = self.run_hooks().await {
            return self.force(&format!("required hook '{failed}' failed"));
        }

        self.set_phase(ShutdownPhase::Cleanup);
        self.cleanup();

        ShutdownOutcome::Completed
    }

    /// Stop accepting new work, then wait for in-flight requests to
    /// finish. The wait is bounded by 60% of the graceful timeout, capped
    /// at 30s; whatever is still running after that gets aborted.
    async fn drain(&self) {
        for close in self.listeners.lock().drain(..) {
            close();
        }

        if !self.config.wait_for_active_requests {
            self.abort_remaining_connections();
            return;
        }

        let budget = (self.config.graceful_timeout.mul_f64(0.6)).min(DRAIN_CEILING);
        let deadline = Instant::now() + budget;
        loop {
            let active = self.active_connections();
            if active == 0 {
                tracing::info!("all connections drained");
                return;
            }
            if Instant::now() >= deadline {
                tracing::warn!(active, "drain budget exhausted, aborting remaining connections");
                self.abort_remaining_connections();
                return;
            }
            tracing::debug!(active, "waiting for connections to drain");
            tokio::time::sleep(TICK).await;
        }
    }

    fn abort_remaining_connections(&self) {
        let mut connections = self.connections.lock();
        for (_, abort) in connections.drain() {
            if let Some(handle) = abort {
                handle.abort();
            }
        }
    }

    /// Run hooks highest priority first, each bounded by its own timeout.
    /// Returns the name of the first required hook that failed.
    async fn run_hooks(&self) -> Result<(), String> {
        let mut hooks = std::mem::take(&mut *self.hooks.lock());
        hooks.sort_by(|a, b| b.priority.cmp(&a.priority));

        for hook in hooks {
            tracing::info!(hook = %hook.name, priority = hook.priority, "running shutdown hook");
            let run = (hook.action)();
            let result = match tokio::time::timeout(hook.timeout, run).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(message)) => Err(message),
                Err(_elapsed) => Err(format!("timed out after {:?}", hook.timeout)),
            };

            match result {
                Ok(()) => tracing::info!(hook = %hook.name, "shutdown hook finished"),
                Err(message) if hook.required => {
                    tracing::error!(hook = %hook.name, %message, "required shutdown hook failed");
                    return Err(hook.name);
                }
                Err(message) => {
                    tracing::warn!(hook = %hook.name, %message, "optional shutdown hook failed");
                }
            }
        }
        Ok(())
    }

    fn cleanup(&self) {
        // Connections should be gone by now; clear any stragglers so the
        // final status reads zero.
        self.abort_remaining_connections();
    }

    fn force(&self, reason: &str) -> ShutdownOutcome {
        // Listeners normally close during DRAINING; a force timeout can
        // fire before that phase got to run.
        for close in self.listeners.lock().drain(..) {
            close();
        }
        self.abort_remaining_connections();
        self.set_phase(ShutdownPhase::Forced);
        self.events.emit(Event::ShutdownForced {
            reason: reason.to_string(),
        });
        ShutdownOutcome::Forced
    }
}
