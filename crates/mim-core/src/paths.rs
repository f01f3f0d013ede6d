//! On-disk state layout under the XDG state directory.
//!
//! Everything durable lives under one root (default `~/.local/state/mim`):
//! stage journals, JSON state files, extraction manifests, quarantined
//! inputs, and the spool directory the CLI drops events into.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolved state layout. All paths are absolute.
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    /// Layout rooted at the default XDG state home.
    pub fn default_root() -> Result<Self> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("mim")?;
        Ok(Self::at(xdg_dirs.get_state_home()))
    }

    /// Layout rooted at an explicit directory (tests, alternate instances).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create every directory the kernel writes into.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.queue_dir(),
            self.state_dir(),
            self.manifest_dir(),
            self.quarantine_dir(),
            self.spool_dir(),
            self.download_dir(),
            self.extraction_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("create state dir: {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.root.join("queue")
    }

    /// Journal for one stage: `queue/<stage>.log`.
    pub fn stage_journal(&self, stage: &str) -> PathBuf {
        self.queue_dir().join(format!("{stage}.log"))
    }

    pub fn retry_journal(&self) -> PathBuf {
        self.queue_dir().join("retry.log")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    /// Advisory in-flight snapshot; never read during restore.
    pub fn snapshot_file(&self) -> PathBuf {
        self.state_dir().join("current.json")
    }

    pub fn cache_file(&self) -> PathBuf {
        self.state_dir().join("cache.json")
    }

    pub fn ledger_file(&self) -> PathBuf {
        self.state_dir().join("conversions.json")
    }

    pub fn quarantine_index(&self) -> PathBuf {
        self.state_dir().join("failed.json")
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    pub fn manifest_file(&self, archive_id: &str) -> PathBuf {
        self.manifest_dir().join(format!("{archive_id}.json"))
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.root.join("quarantine")
    }

    /// Events dropped by `mim add`; consumed by the running pipeline.
    pub fn spool_dir(&self) -> PathBuf {
        self.root.join("spool")
    }

    /// Materialized payloads before routing.
    pub fn download_dir(&self) -> PathBuf {
        self.root.join("downloads")
    }

    /// Per-archive extraction roots live under here.
    pub fn extraction_dir(&self) -> PathBuf {
        self.root.join("extract")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("lock.pid")
    }
}
