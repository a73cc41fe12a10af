// ABOUTME: On-disk orchestrator state: current version, history, artifacts, pool.
// ABOUTME: A small JSON blob so rollback and status work across process runs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::bluegreen::EnvName;
use crate::deploy::{Deployment, Instance};
use crate::error::Result;
use crate::types::Version;

/// State file location, relative to the project directory.
pub const STATE_FILE: &str = ".cutover/state.json";

/// Everything a later `rollback` or `status` invocation needs to pick up
/// where the last run left off.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    pub current_version: Option<Version>,

    /// Terminal deployment records, oldest first.
    #[serde(default)]
    pub history: Vec<Deployment>,

    /// Artifact paths by version, so a rollback can re-stage them.
    #[serde(default)]
    pub artifacts: Vec<(Version, PathBuf)>,

    /// The rolling pool as of the last save.
    #[serde(default)]
    pub instances: Vec<Instance>,

    pub blue_green: Option<PersistedBlueGreen>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedBlueGreen {
    pub active: Option<EnvName>,
    pub blue_version: Option<Version>,
    pub green_version: Option<Version>,
}

impl PersistedState {
    /// Load the blob from `dir`. `Ok(None)` when nothing has been written
    /// yet; a present but unparseable file is an error.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let state = serde_json::from_str(&content)?;
        Ok(Some(state))
    }

    /// Write the blob under `dir`, via a temp file so readers never see a
    /// half-written state.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(STATE_FILE);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}
