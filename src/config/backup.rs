// ABOUTME: Pre-deployment backup configuration.
// ABOUTME: Controls what is copied aside and how many backups are retained.

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Directory that receives `backup-<timestamp>` subdirectories.
    #[serde(default = "default_backup_path")]
    pub path: PathBuf,

    /// How many backups to keep; older ones are pruned oldest-first.
    #[serde(default = "default_retention")]
    pub retention_count: usize,

    /// Files to copy into each backup.
    #[serde(default)]
    pub include_files: Vec<PathBuf>,

    #[serde(default)]
    pub include_database: bool,

    /// Shell command producing a database dump on stdout, written to
    /// `db-dump.sql` inside the backup directory.
    #[serde(default)]
    pub database_dump_command: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_backup_path() -> PathBuf {
    PathBuf::from("./backups")
}

fn default_retention() -> usize {
    5
}
