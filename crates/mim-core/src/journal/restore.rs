//! Startup restoration: journal replay, duplicate-id reconciliation, upload
//! regrouping, and cleanup-registry rehydration.
//!
//! Regrouping exists to survive crashes that happen mid-extraction, where
//! thousands of individual per-file upload records were persisted but their
//! albums had not formed yet. Runs of individual media records sharing
//! `(archive_name, extraction_root, kind)` collapse back into album
//! dispatches of at most the configured cap.

use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;

use super::queue::QueueSet;
use super::Stage;
use crate::paths::StateLayout;
use crate::task::{AlbumItem, MediaKind, Task, TaskId, TaskRecord};

/// What restoration found and rebuilt.
#[derive(Debug, Default)]
pub struct RestoreReport {
    /// First task id a fresh enqueue may use.
    pub next_task_id: TaskId,
    /// Individual records folded into albums.
    pub regrouped_singles: usize,
    /// Album records produced by regrouping.
    pub regrouped_albums: usize,
    /// Records dropped because their file no longer exists.
    pub skipped_missing: usize,
    /// Outstanding upload work per extraction root, for reseeding the
    /// cleanup registry.
    pub root_refcounts: HashMap<PathBuf, usize>,
}

/// Rebuild the queue set from disk and return it with the restore report.
pub fn restore_queues(layout: &StateLayout, album_cap: usize) -> Result<(QueueSet, RestoreReport)> {
    let mut qs = QueueSet::open(layout)?;
    let mut report = RestoreReport::default();

    reconcile_duplicate_ids(&mut qs);
    report.next_task_id = max_task_id(&qs) + 1;

    let before = qs.upload.depth();
    let (records, regrouped, albums, skipped, next_id) =
        regroup_upload_records(qs.upload.iter().cloned().collect(), album_cap, report.next_task_id);
    report.regrouped_singles = regrouped;
    report.regrouped_albums = albums;
    report.skipped_missing = skipped;
    report.next_task_id = next_id;
    if regrouped > 0 || skipped > 0 {
        qs.upload.replace_all(records)?;
        tracing::info!(
            before,
            after = qs.upload.depth(),
            regrouped,
            albums,
            skipped,
            "upload queue regrouped after restore"
        );
    }

    // Outstanding upload work per root: queued records plus any parked in
    // the retry bin on their way back to the upload stage.
    let parked_uploads = qs
        .retry
        .iter()
        .filter(|(home, _)| *home == Stage::Upload)
        .map(|(_, r)| r);
    for record in qs.upload.iter().chain(parked_uploads) {
        if let Some(ctx) = &record.archive_ctx {
            *report
                .root_refcounts
                .entry(ctx.extraction_root.clone())
                .or_insert(0) += 1;
        }
    }

    Ok((qs, report))
}

/// A crash between a retry-bin push and the source stage's `done` line can
/// leave the same id in two journals; the retry copy carries the updated
/// attempt metadata, so the stage copy is dropped.
fn reconcile_duplicate_ids(qs: &mut QueueSet) {
    let parked: Vec<TaskId> = qs.retry.iter().map(|(_, r)| r.id).collect();
    if parked.is_empty() {
        return;
    }
    for stage in Stage::ALL {
        let q = qs.stage_mut(stage);
        for id in &parked {
            q.drop_record(*id);
        }
    }
}

fn max_task_id(qs: &QueueSet) -> TaskId {
    let stage_max = Stage::ALL
        .iter()
        .flat_map(|s| qs.stage(*s).iter())
        .map(|r| r.id)
        .max()
        .unwrap_or(0);
    let retry_max = qs.retry.iter().map(|(_, r)| r.id).max().unwrap_or(0);
    stage_max.max(retry_max)
}

type GroupKey = (String, PathBuf, MediaKind);

fn group_key(record: &TaskRecord) -> Option<GroupKey> {
    if !record.kind.is_media() {
        return None;
    }
    let ctx = record.archive_ctx.as_ref()?;
    match &record.task {
        Task::DirectUpload { .. } => Some((
            ctx.archive_name.clone(),
            ctx.extraction_root.clone(),
            record.kind,
        )),
        _ => None,
    }
}

/// Collapse runs of >=2 individual media records with a shared key into
/// cap-sized album dispatches, preserving on-disk ordering and skipping
/// entries whose files no longer exist. Returns the rewritten record list
/// plus counters and the bumped next id.
fn regroup_upload_records(
    records: Vec<TaskRecord>,
    album_cap: usize,
    mut next_id: TaskId,
) -> (Vec<TaskRecord>, usize, usize, usize, TaskId) {
    let mut out: Vec<TaskRecord> = Vec::with_capacity(records.len());
    let mut regrouped = 0usize;
    let mut albums = 0usize;
    let mut skipped = 0usize;

    let mut i = 0;
    while i < records.len() {
        let Some(key) = group_key(&records[i]) else {
            out.push(records[i].clone());
            i += 1;
            continue;
        };

        let mut run: Vec<TaskRecord> = Vec::new();
        let mut j = i;
        while j < records.len() && group_key(&records[j]).as_ref() == Some(&key) {
            let rec = &records[j];
            let path = match &rec.task {
                Task::DirectUpload { path } => path.clone(),
                _ => unreachable!("group_key only matches direct uploads"),
            };
            if path.exists() {
                run.push(rec.clone());
            } else {
                tracing::warn!(path = %path.display(), "restored upload record points at a missing file; dropping");
                skipped += 1;
            }
            j += 1;
        }

        if run.len() < 2 {
            out.extend(run);
            i = j;
            continue;
        }

        let total_batches = run.len().div_ceil(album_cap);
        let mut batch_index = 0usize;
        let mut chunk_start = 0usize;
        while chunk_start < run.len() {
            let chunk = &run[chunk_start..(chunk_start + album_cap).min(run.len())];
            if chunk.len() == 1 {
                // A trailing single stays an individual upload.
                out.push(chunk[0].clone());
            } else {
                batch_index += 1;
                let items: Vec<AlbumItem> = chunk
                    .iter()
                    .map(|r| AlbumItem {
                        path: match &r.task {
                            Task::DirectUpload { path } => path.clone(),
                            _ => unreachable!(),
                        },
                        fingerprint: r.fingerprint.clone(),
                    })
                    .collect();
                let cleanup: Vec<PathBuf> =
                    chunk.iter().flat_map(|r| r.cleanup_refs.clone()).collect();
                let mut album = TaskRecord::new(
                    next_id,
                    Task::AlbumDispatch {
                        items,
                        batch_index,
                        total_batches_estimate: total_batches,
                    },
                    key.2,
                );
                next_id += 1;
                album.archive_ctx = chunk[0].archive_ctx.clone();
                album.cleanup_refs = cleanup;
                regrouped += chunk.len();
                albums += 1;
                out.push(album);
            }
            chunk_start += album_cap;
        }

        i = j;
    }

    (out, regrouped, albums, skipped, next_id)
}
