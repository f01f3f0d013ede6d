//! Advisory in-flight snapshots and the quarantine index.
//!
//! Snapshots exist for `mim status` and operator curiosity; the journals
//! stay authoritative and restore never reads these files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::task::{unix_now, TaskRecord};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub depth: usize,
    pub in_flight: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    pub written_at: i64,
    pub download: StageSnapshot,
    pub process: StageSnapshot,
    pub upload: StageSnapshot,
    pub retry_depth: usize,
    pub deferred_pending: usize,
    pub cache_entries: usize,
}

impl PipelineSnapshot {
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)
            .with_context(|| format!("write snapshot: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("swap snapshot: {}", path.display()))?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Option<Self>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read snapshot: {}", path.display())),
        }
    }
}

/// One-line description of an in-flight task for the snapshot.
pub fn summarize(record: &TaskRecord) -> String {
    format!(
        "#{} {} ({}){}",
        record.id,
        record.task.op_name(),
        record.kind.as_str(),
        record
            .last_error_class
            .as_deref()
            .map(|c| format!(" last_error={c}"))
            .unwrap_or_default()
    )
}

/// Terminal-failure index: `state/failed.json`, an array of entries that
/// grows as tasks quarantine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub task_id: u64,
    pub op: String,
    pub class: String,
    pub detail: Option<String>,
    pub at: i64,
    /// Where the preserved inputs went.
    pub preserved: Vec<std::path::PathBuf>,
}

pub struct QuarantineIndex {
    path: std::path::PathBuf,
    entries: Vec<QuarantineEntry>,
}

impl QuarantineIndex {
    pub fn load(path: &Path) -> Self {
        let entries = std::fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    pub fn record(
        &mut self,
        record: &TaskRecord,
        class_tag: &str,
        detail: Option<String>,
        preserved: Vec<std::path::PathBuf>,
    ) -> Result<()> {
        self.entries.push(QuarantineEntry {
            task_id: record.id,
            op: record.task.op_name().to_string(),
            class: class_tag.to_string(),
            detail,
            at: unix_now(),
            preserved,
        });
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn entries(&self) -> &[QuarantineEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{MediaKind, Task};
    use std::path::PathBuf;

    #[test]
    fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("current.json");
        let snap = PipelineSnapshot {
            written_at: 123,
            download: StageSnapshot {
                depth: 2,
                in_flight: vec!["#1 download (archive)".into()],
            },
            retry_depth: 1,
            ..Default::default()
        };
        snap.write(&path).unwrap();
        let back = PipelineSnapshot::read(&path).unwrap().unwrap();
        assert_eq!(back.download.depth, 2);
        assert_eq!(back.retry_depth, 1);
    }

    #[test]
    fn quarantine_index_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.json");
        let rec = TaskRecord::new(
            4,
            Task::DirectUpload {
                path: PathBuf::from("/x/a.jpg"),
            },
            MediaKind::Image,
        );

        let mut idx = QuarantineIndex::load(&path);
        idx.record(&rec, "permanent", Some("boom".into()), vec![]).unwrap();
        drop(idx);

        let idx = QuarantineIndex::load(&path);
        assert_eq!(idx.entries().len(), 1);
        assert_eq!(idx.entries()[0].class, "permanent");
        assert_eq!(idx.entries()[0].task_id, 4);
    }

    #[test]
    fn summarize_names_op_and_kind() {
        let mut rec = TaskRecord::new(
            7,
            Task::Normalize {
                path: PathBuf::from("/x/v.mkv"),
            },
            MediaKind::Video,
        );
        rec.last_error_class = Some("stall".into());
        let s = summarize(&rec);
        assert!(s.contains("#7"));
        assert!(s.contains("normalize"));
        assert!(s.contains("last_error=stall"));
    }
}
