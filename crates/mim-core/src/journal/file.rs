//! One line-appended journal file: append, replay, compact.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::Stage;
use crate::task::{TaskId, TaskRecord};

/// Compact once this many superseded lines have accumulated.
const COMPACT_DEAD_THRESHOLD: usize = 512;

/// One journal line. `home` is carried only by retry-bin pushes so a delayed
/// record knows which stage it returns to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum JournalLine {
    Push {
        record: TaskRecord,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        home: Option<Stage>,
    },
    Done { id: TaskId },
}

/// A replayed live record and, for retry journals, its home stage.
#[derive(Debug, Clone)]
pub struct LiveRecord {
    pub record: TaskRecord,
    pub home: Option<Stage>,
}

/// Append handle plus compaction bookkeeping for one journal.
pub struct JournalFile {
    path: PathBuf,
    file: File,
    dead: usize,
}

impl JournalFile {
    /// Open (or create) the journal for appending.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create journal dir: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open journal: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            dead: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line and fsync.
    pub fn append(&mut self, line: &JournalLine) -> Result<()> {
        self.append_batch(std::slice::from_ref(line))
    }

    /// Append several lines under a single fsync.
    pub fn append_batch(&mut self, lines: &[JournalLine]) -> Result<()> {
        let mut buf = Vec::with_capacity(lines.len() * 128);
        for line in lines {
            serde_json::to_writer(&mut buf, line)?;
            buf.push(b'\n');
            if matches!(line, JournalLine::Done { .. }) {
                self.dead += 1;
            }
        }
        self.file
            .write_all(&buf)
            .with_context(|| format!("append journal: {}", self.path.display()))?;
        self.file
            .sync_data()
            .with_context(|| format!("fsync journal: {}", self.path.display()))?;
        Ok(())
    }

    /// Replay the journal into the ordered set of live records. Lines that
    /// fail to parse (corruption, unknown discriminants from a newer build)
    /// are logged and skipped.
    pub fn replay(path: &Path) -> Result<Vec<LiveRecord>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("open journal: {}", path.display())),
        };

        // Insertion-ordered: a re-push of a live id moves it to the back,
        // matching the runtime behavior of retry re-insertion.
        let mut live: Vec<LiveRecord> = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    tracing::warn!(
                        "journal {} unreadable at line {}: {}",
                        path.display(),
                        lineno + 1,
                        e
                    );
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalLine>(&line) {
                Ok(JournalLine::Push { record, home }) => {
                    live.retain(|l| l.record.id != record.id);
                    live.push(LiveRecord { record, home });
                }
                Ok(JournalLine::Done { id }) => {
                    live.retain(|l| l.record.id != id);
                }
                Err(e) => {
                    tracing::warn!(
                        "skipping journal line {} in {}: {}",
                        lineno + 1,
                        path.display(),
                        e
                    );
                }
            }
        }
        Ok(live)
    }

    /// Rewrite the journal to exactly `live`, atomically (tmp + rename),
    /// and reset the dead counter.
    pub fn compact(&mut self, live: &[LiveRecord]) -> Result<()> {
        let tmp = self.path.with_extension("log.tmp");
        {
            let mut f = File::create(&tmp)
                .with_context(|| format!("create compaction tmp: {}", tmp.display()))?;
            let mut buf = Vec::new();
            for l in live {
                serde_json::to_writer(
                    &mut buf,
                    &JournalLine::Push {
                        record: l.record.clone(),
                        home: l.home,
                    },
                )?;
                buf.push(b'\n');
            }
            f.write_all(&buf)?;
            f.sync_data()?;
        }
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("swap compacted journal: {}", self.path.display()))?;
        self.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("reopen journal: {}", self.path.display()))?;
        self.dead = 0;
        tracing::debug!(path = %self.path.display(), live = live.len(), "journal compacted");
        Ok(())
    }

    /// Compact when enough dead lines have accumulated.
    pub fn maybe_compact(&mut self, live: &[LiveRecord]) -> Result<()> {
        if self.dead >= COMPACT_DEAD_THRESHOLD {
            self.compact(live)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{MediaKind, Task};

    fn rec(id: TaskId) -> TaskRecord {
        TaskRecord::new(
            id,
            Task::DirectUpload {
                path: PathBuf::from(format!("/tmp/{id}.jpg")),
            },
            MediaKind::Image,
        )
    }

    #[test]
    fn replay_reflects_push_and_done() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        let mut j = JournalFile::open(&path).unwrap();
        j.append(&JournalLine::Push { record: rec(1), home: None }).unwrap();
        j.append(&JournalLine::Push { record: rec(2), home: None }).unwrap();
        j.append(&JournalLine::Done { id: 1 }).unwrap();
        j.append(&JournalLine::Push { record: rec(3), home: None }).unwrap();

        let live = JournalFile::replay(&path).unwrap();
        let ids: Vec<TaskId> = live.iter().map(|l| l.record.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn repush_moves_to_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        let mut j = JournalFile::open(&path).unwrap();
        j.append(&JournalLine::Push { record: rec(1), home: None }).unwrap();
        j.append(&JournalLine::Push { record: rec(2), home: None }).unwrap();
        let mut updated = rec(1);
        updated.retry_count = 3;
        j.append(&JournalLine::Push { record: updated, home: None }).unwrap();

        let live = JournalFile::replay(&path).unwrap();
        let ids: Vec<TaskId> = live.iter().map(|l| l.record.id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(live[1].record.retry_count, 3);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        let mut j = JournalFile::open(&path).unwrap();
        j.append(&JournalLine::Push { record: rec(1), home: None }).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"garbage line\n")
            .unwrap();
        let mut j = JournalFile::open(&path).unwrap();
        j.append(&JournalLine::Push { record: rec(2), home: None }).unwrap();

        let live = JournalFile::replay(&path).unwrap();
        assert_eq!(live.len(), 2);
    }

    #[test]
    fn compact_preserves_live_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        let mut j = JournalFile::open(&path).unwrap();
        for i in 1..=20 {
            j.append(&JournalLine::Push { record: rec(i), home: None }).unwrap();
        }
        for i in 1..=15 {
            j.append(&JournalLine::Done { id: i }).unwrap();
        }
        let live = JournalFile::replay(&path).unwrap();
        j.compact(&live).unwrap();

        let after = JournalFile::replay(&path).unwrap();
        let ids: Vec<TaskId> = after.iter().map(|l| l.record.id).collect();
        assert_eq!(ids, vec![16, 17, 18, 19, 20]);
        // Journal keeps accepting appends after the swap.
        j.append(&JournalLine::Push { record: rec(21), home: None }).unwrap();
        assert_eq!(JournalFile::replay(&path).unwrap().len(), 6);
    }

    #[test]
    fn missing_file_replays_empty() {
        let dir = tempfile::tempdir().unwrap();
        let live = JournalFile::replay(&dir.path().join("absent.log")).unwrap();
        assert!(live.is_empty());
    }
}
