//! Album batcher: groups media coming out of one archive into fixed-size
//! upload batches, one kind per batch.
//!
//! This is a streaming builder over the expander's yield order. Per
//! `(archive_name, extraction_root)` there are at most two open buffers
//! (images, videos), each at most `cap - 1` items before emission. Buffered
//! items keep their individual durable upload records; when a batch forms,
//! the caller swaps those records for one album dispatch.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::task::{AlbumItem, ArchiveCtx, MediaKind, Task, TaskId, TaskRecord};

type BatchKey = (String, PathBuf, MediaKind);

/// A batch ready to replace its member records.
#[derive(Debug, Clone)]
pub struct FormedBatch {
    pub kind: MediaKind,
    pub archive_ctx: ArchiveCtx,
    pub records: Vec<TaskRecord>,
    pub batch_index: usize,
    pub total_batches_estimate: usize,
}

impl FormedBatch {
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.records.iter().map(|r| r.id).collect()
    }

    /// Build the album record that supersedes the member records. Cleanup
    /// refs union so every member file is removed on terminal success.
    pub fn into_album_record(self, id: TaskId) -> TaskRecord {
        let items: Vec<AlbumItem> = self
            .records
            .iter()
            .map(|r| AlbumItem {
                path: match &r.task {
                    Task::DirectUpload { path } => path.clone(),
                    _ => unreachable!("batcher only buffers direct uploads"),
                },
                fingerprint: r.fingerprint.clone(),
            })
            .collect();
        let cleanup: Vec<PathBuf> = self
            .records
            .iter()
            .flat_map(|r| r.cleanup_refs.clone())
            .collect();
        let mut album = TaskRecord::new(
            id,
            Task::AlbumDispatch {
                items,
                batch_index: self.batch_index,
                total_batches_estimate: self.total_batches_estimate,
            },
            self.kind,
        );
        album.archive_ctx = Some(self.archive_ctx);
        album.cleanup_refs = cleanup;
        album
    }
}

struct Buffer {
    records: Vec<TaskRecord>,
    emitted: usize,
}

/// Streaming batch builder. Never mixes kinds and never exceeds the cap.
pub struct AlbumBatcher {
    cap: usize,
    buffers: HashMap<BatchKey, Buffer>,
}

impl AlbumBatcher {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            buffers: HashMap::new(),
        }
    }

    /// Offer an individual archive-media upload record. Returns a formed
    /// batch when the buffer reaches the cap. Records without an archive
    /// context (or non-media kinds) are not batched.
    pub fn insert(&mut self, record: &TaskRecord) -> Option<FormedBatch> {
        let ctx = record.archive_ctx.as_ref()?;
        if !record.kind.is_media() || !matches!(record.task, Task::DirectUpload { .. }) {
            return None;
        }
        let key: BatchKey = (
            ctx.archive_name.clone(),
            ctx.extraction_root.clone(),
            record.kind,
        );
        let buffer = self.buffers.entry(key).or_insert(Buffer {
            records: Vec::new(),
            emitted: 0,
        });
        buffer.records.push(record.clone());
        if buffer.records.len() < self.cap {
            return None;
        }

        buffer.emitted += 1;
        let records = std::mem::take(&mut buffer.records);
        Some(FormedBatch {
            kind: record.kind,
            archive_ctx: ctx.clone(),
            records,
            batch_index: buffer.emitted,
            // More entries may still stream out of the archive; the
            // estimate grows as batches emit and settles at flush.
            total_batches_estimate: buffer.emitted,
        })
    }

    /// End-of-stream for one archive: flush any non-empty buffers as
    /// trailing batches (possibly of one item).
    pub fn flush_archive(&mut self, archive_name: &str, extraction_root: &Path) -> Vec<FormedBatch> {
        let keys: Vec<BatchKey> = self
            .buffers
            .keys()
            .filter(|(name, root, _)| name == archive_name && root == extraction_root)
            .cloned()
            .collect();

        let mut out = Vec::new();
        for key in keys {
            let Some(buffer) = self.buffers.get_mut(&key) else {
                continue;
            };
            if buffer.records.is_empty() {
                self.buffers.remove(&key);
                continue;
            }
            buffer.emitted += 1;
            let records = std::mem::take(&mut buffer.records);
            let total = buffer.emitted;
            let index = buffer.emitted;
            let ctx = records[0]
                .archive_ctx
                .clone()
                .expect("buffered records carry archive context");
            out.push(FormedBatch {
                kind: key.2,
                archive_ctx: ctx,
                records,
                batch_index: index,
                total_batches_estimate: total,
            });
            self.buffers.remove(&key);
        }
        out
    }

    /// Ids of records currently buffered; the upload worker must not pop
    /// these while their batch is still forming.
    pub fn held_ids(&self) -> HashSet<TaskId> {
        self.buffers
            .values()
            .flat_map(|b| b.records.iter().map(|r| r.id))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.buffers.values().map(|b| b.records.len()).sum()
    }
}
