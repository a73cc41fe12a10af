// ABOUTME: Entry point for the cutover CLI application.
// ABOUTME: Parses arguments, builds the orchestrator, and wires shutdown signals.

mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use cutover::config::{self, Config};
use cutover::error::{Error, Result};
use cutover::orchestrator::DeploymentOrchestrator;
use cutover::types::{DeploymentId, Version};
use futures::FutureExt;
use std::env;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing subscriber based on verbose flag
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let result = run(cli).await;

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { service, force } => {
            let cwd = env::current_dir().expect("Failed to get current directory");
            let path = config::init_config(&cwd, service.as_deref(), force)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        Commands::Deploy { version, artifact } => {
            let cwd = env::current_dir().expect("Failed to get current directory");
            let config = Config::discover(&cwd)?;
            let version = Version::new(version).map_err(Error::InvalidConfig)?;
            deploy(config, &cwd, &artifact, version).await
        }
        Commands::Rollback { id } => {
            let cwd = env::current_dir().expect("Failed to get current directory");
            let config = Config::discover(&cwd)?;
            rollback(config, &cwd, id).await
        }
        Commands::Status => {
            let cwd = env::current_dir().expect("Failed to get current directory");
            let config = Config::discover(&cwd)?;
            status(config, &cwd)
        }
    }
}

/// Run one deployment, then keep serving until a shutdown signal arrives.
/// The process exit code reports how the shutdown went: 0 for a clean
/// one, 1 when it had to be forced.
async fn deploy(config: Config, dir: &Path, artifact: &Path, version: Version) -> Result<()> {
    let signals = config.shutdown.signals.clone();
    let orchestrator = DeploymentOrchestrator::new(config);
    orchestrator.restore_state(dir)?;
    orchestrator.initialize().await?;

    serve_guarded(&orchestrator, dir, &signals, async {
        match orchestrator.deploy(artifact, version.clone()).await {
            Ok(id) => {
                orchestrator.persist_state(dir)?;
                println!("Deployment {id} completed: {version} is live");
                Ok(())
            }
            Err(e) => {
                // The failure is part of the history; record it before
                // bailing out.
                let _ = orchestrator.persist_state(dir);
                let _ = orchestrator.shutdown("deployment failed").await;
                Err(e)
            }
        }
    })
    .await
}

/// Roll back to the previous version, then serve it until a shutdown
/// signal arrives, mirroring `deploy`.
async fn rollback(config: Config, dir: &Path, id: Option<String>) -> Result<()> {
    let signals = config.shutdown.signals.clone();
    let orchestrator = DeploymentOrchestrator::new(config);
    orchestrator.restore_state(dir)?;
    orchestrator.initialize().await?;

    serve_guarded(&orchestrator, dir, &signals, async {
        match orchestrator.rollback(id.map(DeploymentId::new)).await {
            Ok(id) => {
                orchestrator.persist_state(dir)?;
                println!("Rolled back deployment {id}");
                Ok(())
            }
            Err(e) => {
                let _ = orchestrator.persist_state(dir);
                let _ = orchestrator.shutdown("rollback failed").await;
                Err(e)
            }
        }
    })
    .await
}

/// Run `work`, then serve until a shutdown signal. A panic anywhere in
/// between still runs the shutdown sequence, with a reason naming the
/// panic, before the process exits non-zero.
async fn serve_guarded<F>(
    orchestrator: &DeploymentOrchestrator,
    dir: &Path,
    signals: &[String],
    work: F,
) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let outcome = AssertUnwindSafe(async {
        work.await?;
        println!("Serving; send {} to stop", signals.join(" or "));
        wait_for_signal(signals).await;
        Ok(())
    })
    .catch_unwind()
    .await;

    match outcome {
        Ok(Ok(())) => {
            let outcome = orchestrator.shutdown("shutdown signal received").await;
            let _ = orchestrator.persist_state(dir);
            std::process::exit(outcome.exit_code());
        }
        Ok(Err(e)) => Err(e),
        Err(payload) => {
            let reason = format!("uncaught panic: {}", panic_reason(payload.as_ref()));
            tracing::error!(%reason, "fault, shutting down");
            let _ = orchestrator.shutdown(&reason).await;
            let _ = orchestrator.persist_state(dir);
            std::process::exit(1);
        }
    }
}

fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn status(config: Config, dir: &Path) -> Result<()> {
    let orchestrator = DeploymentOrchestrator::new(config);
    orchestrator.restore_state(dir)?;
    let status = orchestrator.status();

    println!("Service: {}", status.service);
    println!("Strategy: {}", status.strategy);
    match &status.current_version {
        Some(version) => println!("Current version: {version}"),
        None => println!("Current version: none"),
    }
    match &status.deployment {
        Some(deployment) => println!(
            "Last deployment: {} ({:?}, step {}/{})",
            deployment.id, deployment.status, deployment.completed_steps, deployment.total_steps
        ),
        None => println!("Last deployment: none"),
    }
    for instance in &status.instances {
        println!(
            "  {} port {} {:?} (+{}/-{})",
            instance.id,
            instance.port,
            instance.status,
            instance.checks_passed,
            instance.checks_failed
        );
    }
    if let Some(bg) = &status.blue_green {
        let active = bg
            .active
            .map(|name| name.to_string())
            .unwrap_or_else(|| "none".to_string());
        println!("Blue-green: active={active}");
        for env in [&bg.blue, &bg.green] {
            println!("  {} port {} {:?}", env.name, env.port, env.status);
        }
    }
    println!("Shutdown phase: {}", status.shutdown.phase);
    Ok(())
}

/// Block until one of the configured signals arrives.
async fn wait_for_signal(names: &[String]) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut streams = Vec::new();
    for name in names {
        let kind = match name.as_str() {
            "SIGTERM" => SignalKind::terminate(),
            "SIGINT" => SignalKind::interrupt(),
            "SIGQUIT" => SignalKind::quit(),
            "SIGHUP" => SignalKind::hangup(),
            other => {
                tracing::warn!(signal = other, "unsupported signal name, ignoring");
                continue;
            }
        };
        match signal(kind) {
            Ok(stream) => streams.push((name.clone(), stream)),
            Err(e) => tracing::warn!(signal = %name, error = %e, "failed to install handler"),
        }
    }

    if streams.is_empty() {
        let _ = tokio::signal::ctrl_c().await;
        return;
    }

    let waits = streams.iter_mut().map(|(name, stream)| {
        Box::pin(async move {
            stream.recv().await;
            name.clone()
        })
    });
    let (name, _, _) = futures::future::select_all(waits).await;
    tracing::info!(signal = %name, "shutdown signal received");
}
