// ABOUTME: Pre-deployment backups: timestamped directories, optional db dump, pruning.
// ABOUTME: Backups are pruned oldest-first beyond the configured retention count.

use chrono::Utc;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

use crate::config::BackupConfig;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("failed to copy {path}: {source}")]
    Copy {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("database dump failed: {0}")]
    DatabaseDump(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Creates and prunes `backup-<timestamp>` directories.
pub struct BackupManager {
    config: BackupConfig,
}

impl BackupManager {
    pub fn new(config: BackupConfig) -> Self {
        Self { config }
    }

    /// Create one backup directory, copy configured files into it, run
    /// the database dump if enabled, then prune old backups.
    ///
    /// # Errors
    ///
    /// Returns an error if any configured file cannot be copied or the
    /// dump command fails; pruning failures are logged, not fatal.
    pub async fn create(&self) -> Result<PathBuf, BackupError> {
        let dir = self
            .config
            .path
            .join(format!("backup-{}", Utc::now().format("%Y%m%d%H%M%S%3f")));
        tokio::fs::create_dir_all(&dir).await?;

        for path in &self.config.include_files {
            let Some(name) = path.file_name() else {
                tracing::warn!(path = %path.display(), "skipping backup entry without file name");
                continue;
            };
            let dest = dir.join(name);
            tokio::fs::copy(path, &dest)
                .await
                .map_err(|source| BackupError::Copy {
                    path: path.clone(),
                    source,
                })?;
            tracing::debug!(from = %path.display(), to = %dest.display(), "backed up file");
        }

        if self.config.include_database {
            self.dump_database(&dir).await?;
        }

        if let Err(e) = self.prune().await {
            tracing::warn!(error = %e, "backup pruning failed");
        }

        tracing::info!(dir = %dir.display(), "backup created");
        Ok(dir)
    }

    async fn dump_database(&self, dir: &std::path::Path) -> Result<(), BackupError> {
        let Some(command) = self.config.database_dump_command.as_deref() else {
            tracing::warn!("include_database set but no database_dump_command configured");
            return Ok(());
        };

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BackupError::DatabaseDump(e.to_string()))?;

        if !output.status.success() {
            return Err(BackupError::DatabaseDump(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        tokio::fs::write(dir.join("db-dump.sql"), &output.stdout).await?;
        Ok(())
    }

    /// Delete backups oldest-first beyond `retention_count`. Timestamped
    /// names sort lexicographically in creation order.
    pub async fn prune(&self) -> Result<usize, BackupError> {
        let mut backups = vec![];
        let mut entries = tokio::fs::read_dir(&self.config.path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("backup-") && entry.file_type().await?.is_dir() {
                backups.push((name, entry.path()));
            }
        }

        backups.sort_by(|a, b| a.0.cmp(&b.0));

        let excess = backups.len().saturating_sub(self.config.retention_count);
        for (name, path) in backups.into_iter().take(excess) {
            tokio::fs::remove_dir_all(&path).await?;
            tracing::info!(backup = %name, "pruned old backup");
        }
        Ok(excess)
    }
}
