//! Deferred conversion ledger: on-disk state for long or unreliable
//! conversions so they never block album uploads of compatible media.
//!
//! The file is rewritten atomically (tmp + rename) after every mutation;
//! the deferred worker throttles how often it calls in here while a
//! conversion is running.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::task::{unix_now, ArchiveCtx};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionEntry {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub status: ConversionStatus,
    pub progress_pct: u8,
    pub started_at: i64,
    pub updated_at: i64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Album origin when the video was pulled out of an archive batch.
    #[serde(default)]
    pub archive_ctx: Option<ArchiveCtx>,
}

pub struct ConversionLedger {
    path: PathBuf,
    entries: Vec<ConversionEntry>,
}

impl ConversionLedger {
    /// Load the ledger, tolerating a missing or unparseable file.
    pub fn load(path: &Path) -> Self {
        let entries = match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!("conversion ledger unparseable, starting empty: {}", e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!("conversion ledger unreadable, starting empty: {}", e);
                Vec::new()
            }
        };
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(&self.entries)?;
        std::fs::write(&tmp, json)
            .with_context(|| format!("write conversion ledger: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("swap conversion ledger: {}", self.path.display()))?;
        Ok(())
    }

    /// Register an incompatible video. Idempotent on `input_path`.
    pub fn add_pending(
        &mut self,
        input: &Path,
        output: &Path,
        archive_ctx: Option<ArchiveCtx>,
    ) -> Result<()> {
        if self.entries.iter().any(|e| e.input_path == input) {
            return Ok(());
        }
        let now = unix_now();
        self.entries.push(ConversionEntry {
            input_path: input.to_path_buf(),
            output_path: output.to_path_buf(),
            status: ConversionStatus::Pending,
            progress_pct: 0,
            started_at: 0,
            updated_at: now,
            retry_count: 0,
            last_error: None,
            archive_ctx,
        });
        self.save()
    }

    /// Claim the oldest pending entry, marking it in progress.
    pub fn claim_next(&mut self) -> Result<Option<ConversionEntry>> {
        let now = unix_now();
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.status == ConversionStatus::Pending)
        else {
            return Ok(None);
        };
        entry.status = ConversionStatus::InProgress;
        entry.started_at = now;
        entry.updated_at = now;
        let claimed = entry.clone();
        self.save()?;
        Ok(Some(claimed))
    }

    pub fn update_progress(&mut self, input: &Path, pct: u8) -> Result<()> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.input_path == input) {
            entry.progress_pct = pct.min(100);
            entry.updated_at = unix_now();
            self.save()?;
        }
        Ok(())
    }

    pub fn mark_completed(&mut self, input: &Path) -> Result<()> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.input_path == input) {
            entry.status = ConversionStatus::Completed;
            entry.progress_pct = 100;
            entry.updated_at = unix_now();
            self.save()?;
        }
        Ok(())
    }

    /// Record a failed attempt: back to pending while retries remain, else
    /// failed. Returns the resulting status.
    pub fn mark_failed(
        &mut self,
        input: &Path,
        error: &str,
        max_retries: u32,
    ) -> Result<ConversionStatus> {
        let Some(entry) = self.entries.iter_mut().find(|e| e.input_path == input) else {
            return Ok(ConversionStatus::Failed);
        };
        entry.retry_count += 1;
        entry.last_error = Some(error.to_string());
        entry.updated_at = unix_now();
        entry.status = if entry.retry_count < max_retries {
            ConversionStatus::Pending
        } else {
            ConversionStatus::Failed
        };
        entry.progress_pct = 0;
        let status = entry.status;
        self.save()?;
        Ok(status)
    }

    /// Startup pass: conversions interrupted mid-run restart from scratch
    /// (the encoder has no checkpoints); entries whose source vanished are
    /// failed. Returns (requeued, missing) counts.
    pub fn recover_interrupted(&mut self) -> Result<(usize, usize)> {
        let mut requeued = 0;
        let mut missing = 0;
        let now = unix_now();
        for entry in &mut self.entries {
            if entry.status != ConversionStatus::InProgress {
                continue;
            }
            if entry.input_path.exists() {
                entry.status = ConversionStatus::Pending;
                entry.progress_pct = 0;
                entry.updated_at = now;
                requeued += 1;
            } else {
                entry.status = ConversionStatus::Failed;
                entry.last_error = Some("source missing after restart".to_string());
                entry.updated_at = now;
                missing += 1;
            }
        }
        if requeued + missing > 0 {
            self.save()?;
        }
        Ok((requeued, missing))
    }

    /// Drop completed entries older than `ttl_secs`.
    pub fn sweep_completed(&mut self, ttl_secs: u64) -> Result<usize> {
        let cutoff = unix_now() - ttl_secs as i64;
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.status == ConversionStatus::Completed && e.updated_at < cutoff));
        let swept = before - self.entries.len();
        if swept > 0 {
            self.save()?;
        }
        Ok(swept)
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status == ConversionStatus::Pending)
            .count()
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    /// Pending plus in-progress: work the pipeline still owes.
    pub fn active_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| {
                matches!(
                    e.status,
                    ConversionStatus::Pending | ConversionStatus::InProgress
                )
            })
            .count()
    }

    pub fn entries(&self) -> &[ConversionEntry] {
        &self.entries
    }

    pub fn get(&self, input: &Path) -> Option<&ConversionEntry> {
        self.entries.iter().find(|e| e.input_path == input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(dir: &Path) -> ConversionLedger {
        ConversionLedger::load(&dir.join("conversions.json"))
    }

    #[test]
    fn add_claim_complete_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = ledger(dir.path());
        l.add_pending(Path::new("/in/a.mkv"), Path::new("/in/a.norm.mp4"), None)
            .unwrap();
        assert!(l.has_pending());

        let claimed = l.claim_next().unwrap().unwrap();
        assert_eq!(claimed.input_path, Path::new("/in/a.mkv"));
        assert!(!l.has_pending());

        l.update_progress(Path::new("/in/a.mkv"), 40).unwrap();
        l.mark_completed(Path::new("/in/a.mkv")).unwrap();

        let reloaded = ledger(dir.path());
        let entry = reloaded.get(Path::new("/in/a.mkv")).unwrap();
        assert_eq!(entry.status, ConversionStatus::Completed);
        assert_eq!(entry.progress_pct, 100);
    }

    #[test]
    fn add_is_idempotent_on_input_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = ledger(dir.path());
        l.add_pending(Path::new("/in/a.mkv"), Path::new("/o1"), None).unwrap();
        l.add_pending(Path::new("/in/a.mkv"), Path::new("/o2"), None).unwrap();
        assert_eq!(l.entries().len(), 1);
    }

    #[test]
    fn failures_keep_pending_until_budget_runs_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = ledger(dir.path());
        l.add_pending(Path::new("/in/a.mkv"), Path::new("/o"), None).unwrap();

        let s1 = l.mark_failed(Path::new("/in/a.mkv"), "boom", 3).unwrap();
        assert_eq!(s1, ConversionStatus::Pending);
        let s2 = l.mark_failed(Path::new("/in/a.mkv"), "boom", 3).unwrap();
        assert_eq!(s2, ConversionStatus::Pending);
        let s3 = l.mark_failed(Path::new("/in/a.mkv"), "boom", 3).unwrap();
        assert_eq!(s3, ConversionStatus::Failed);
        assert!(!l.has_pending());
    }

    #[test]
    fn interrupted_with_source_requeues_without_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("alive.mkv");
        std::fs::write(&src, b"x").unwrap();

        let mut l = ledger(dir.path());
        l.add_pending(&src, &dir.path().join("alive.norm.mp4"), None).unwrap();
        l.add_pending(Path::new("/gone/dead.mkv"), Path::new("/gone/dead.norm.mp4"), None)
            .unwrap();
        l.claim_next().unwrap();
        l.claim_next().unwrap();

        let (requeued, missing) = l.recover_interrupted().unwrap();
        assert_eq!((requeued, missing), (1, 1));
        assert_eq!(l.get(&src).unwrap().status, ConversionStatus::Pending);
        assert_eq!(l.get(&src).unwrap().progress_pct, 0);
        assert_eq!(
            l.get(Path::new("/gone/dead.mkv")).unwrap().status,
            ConversionStatus::Failed
        );
    }

    #[test]
    fn sweep_removes_old_completed_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = ledger(dir.path());
        l.add_pending(Path::new("/a"), Path::new("/ao"), None).unwrap();
        l.add_pending(Path::new("/b"), Path::new("/bo"), None).unwrap();
        l.claim_next().unwrap();
        l.mark_completed(Path::new("/a")).unwrap();

        // TTL zero: the completed entry is already older than "now - 0"?
        // updated_at == now, so it survives; backdate it first.
        assert_eq!(l.sweep_completed(3600).unwrap(), 0);
        if let Some(e) = l.entries.iter_mut().find(|e| e.input_path == Path::new("/a")) {
            e.updated_at -= 10_000;
        }
        assert_eq!(l.sweep_completed(3600).unwrap(), 1);
        assert_eq!(l.entries().len(), 1);
    }

    #[test]
    fn corrupt_ledger_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversions.json");
        std::fs::write(&path, b"{{{{").unwrap();
        let l = ConversionLedger::load(&path);
        assert!(l.entries().is_empty());
    }
}
