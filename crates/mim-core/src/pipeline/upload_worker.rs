//! Upload-stage worker: album and single-file delivery through the outbound
//! adapter, plus the recovery ladders for oversize photos and invalid media.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{process_worker, PipelineInner};
use crate::failure::FailureClass;
use crate::journal::Stage;
use crate::outbox::{MediaAttributes, OutboundFile, OutboxError};
use crate::shrink::{shrink_photo, PHOTO_BYTE_LIMIT};
use crate::task::{unix_now, AlbumItem, MediaKind, Task, TaskRecord};

pub(super) async fn run(inner: Arc<PipelineInner>) {
    loop {
        if inner.supervisor.is_shutdown() {
            break;
        }
        if inner.supervisor.auth_paused() {
            // Paused until the adapter's re-auth hook clears us.
            tokio::select! {
                _ = inner.notify.upload.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs(10)) => {}
            }
            continue;
        }

        let record = {
            let mut qs = inner.queues.lock().unwrap();
            let held = qs.batcher.held_ids();
            qs.queues.upload.pop_ready(unix_now(), &held)
        };
        let Some(record) = record else {
            wait_for_work(&inner).await;
            continue;
        };

        if let Err(e) = execute(&inner, record).await {
            tracing::error!("upload worker internal error: {e:#}");
        }
        // Upload completions can unblock the deferred worker.
        inner.notify.deferred.notify_waiters();
    }
    tracing::debug!("upload worker stopped");
}

async fn wait_for_work(inner: &Arc<PipelineInner>) {
    let sleep_secs = {
        let qs = inner.queues.lock().unwrap();
        match qs.queues.upload.next_delayed_at(unix_now()) {
            Some(at) => (at - unix_now()).clamp(1, 30) as u64,
            None => 30,
        }
    };
    tokio::select! {
        _ = inner.notify.upload.notified() => {}
        _ = tokio::time::sleep(Duration::from_secs(sleep_secs)) => {}
    }
}

async fn execute(inner: &Arc<PipelineInner>, record: TaskRecord) -> anyhow::Result<()> {
    match record.task.clone() {
        Task::AlbumDispatch {
            items,
            batch_index,
            total_batches_estimate,
        } => send_album(inner, record, items, batch_index, total_batches_estimate).await,
        Task::DirectUpload { path } => send_single(inner, record, path).await,
        other => {
            tracing::error!(op = other.op_name(), "non-upload task in upload stage");
            inner.handle_failure(
                Stage::Upload,
                record,
                FailureClass::Permanent("task routed to wrong stage".into()),
            )?;
            Ok(())
        }
    }
}

async fn send_album(
    inner: &Arc<PipelineInner>,
    record: TaskRecord,
    items: Vec<AlbumItem>,
    batch_index: usize,
    total_batches: usize,
) -> anyhow::Result<()> {
    if items.is_empty() {
        // All members were pulled out by earlier recovery passes.
        let id = record.id;
        {
            let mut qs = inner.queues.lock().unwrap();
            qs.queues.complete(Stage::Upload, id, Vec::new())?;
        }
        release_record_root(inner, &record);
        return Ok(());
    }

    let kind = record.kind;
    let caption = album_caption(&record, kind, batch_index, total_batches, items.len());
    let mut files = Vec::with_capacity(items.len());
    for item in &items {
        files.push(build_outbound(inner, &item.path, kind).await);
    }

    let target = match inner.target().await {
        Ok(t) => t,
        Err(e) => {
            inner.handle_failure(Stage::Upload, record, e.to_failure())?;
            return Ok(());
        }
    };

    tracing::info!(
        task = record.id,
        kind = kind.as_str(),
        files = files.len(),
        caption,
        "sending album"
    );
    let result = if files.len() == 1 {
        inner.outbox.send_media(&target, &files[0], &caption).await
    } else {
        inner.outbox.send_album(&target, kind, &files, &caption).await
    };

    match result {
        Ok(()) => {
            finish_upload(inner, &record, &items).await?;
            Ok(())
        }
        Err(OutboxError::PhotoTooLarge { file }) => {
            recover_photo_too_large(inner, record, items, file).await
        }
        Err(OutboxError::MediaInvalid { files }) => {
            recover_media_invalid(inner, record, items, files).await
        }
        Err(e) => {
            inner.handle_failure(Stage::Upload, record, e.to_failure())?;
            Ok(())
        }
    }
}

async fn send_single(
    inner: &Arc<PipelineInner>,
    record: TaskRecord,
    path: PathBuf,
) -> anyhow::Result<()> {
    let items = vec![AlbumItem {
        path,
        fingerprint: record.fingerprint.clone(),
    }];
    let kind = record.kind;
    let caption = items[0]
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_string();
    let file = build_outbound(inner, &items[0].path, kind).await;

    let target = match inner.target().await {
        Ok(t) => t,
        Err(e) => {
            inner.handle_failure(Stage::Upload, record, e.to_failure())?;
            return Ok(());
        }
    };

    tracing::info!(task = record.id, kind = kind.as_str(), file = %items[0].path.display(), "sending media");
    match inner.outbox.send_media(&target, &file, &caption).await {
        Ok(()) => {
            finish_upload(inner, &record, &items).await?;
            Ok(())
        }
        Err(OutboxError::PhotoTooLarge { file }) => {
            recover_photo_too_large(inner, record, items, file).await
        }
        Err(OutboxError::MediaInvalid { files }) => {
            recover_media_invalid(inner, record, items, files).await
        }
        Err(e) => {
            inner.handle_failure(Stage::Upload, record, e.to_failure())?;
            Ok(())
        }
    }
}

/// Terminal success: cache insertion commits before the journal `done`, and
/// file cleanup runs only after the terminal transition is durable.
async fn finish_upload(
    inner: &Arc<PipelineInner>,
    record: &TaskRecord,
    items: &[AlbumItem],
) -> anyhow::Result<()> {
    let fingerprints: Vec<(String, u64, Option<String>)> = items
        .iter()
        .filter_map(|item| {
            let fp = item.fingerprint.clone()?;
            let size = std::fs::metadata(&item.path).map(|m| m.len()).unwrap_or(0);
            let name = item
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string);
            Some((fp, size, name))
        })
        .collect();
    inner.insert_fingerprints(&fingerprints)?;

    let id = record.id;
    {
        let mut qs = inner.queues.lock().unwrap();
        qs.queues.complete(Stage::Upload, id, Vec::new())?;
    }

    inner.cleanup_after_success(record);
    tracing::info!(task = id, files = items.len(), "upload complete");
    Ok(())
}

/// Oversize photo: recompress the offender, substitute it into the same
/// batch, and retry. The task fails the individual only when every
/// strategy is exhausted.
async fn recover_photo_too_large(
    inner: &Arc<PipelineInner>,
    mut record: TaskRecord,
    mut items: Vec<AlbumItem>,
    offender: PathBuf,
) -> anyhow::Result<()> {
    let index = items
        .iter()
        .position(|i| i.path == offender)
        .unwrap_or(0);

    let substitute = {
        let ffmpeg = inner.cfg.transcode.ffmpeg_path.clone();
        let input = items[index].path.clone();
        tokio::task::spawn_blocking(move || shrink_photo(&ffmpeg, &input, PHOTO_BYTE_LIMIT)).await?
    };

    match substitute {
        Ok(Some(shrunk)) => {
            tracing::info!(
                original = %items[index].path.display(),
                substitute = %shrunk.display(),
                "oversize photo recompressed; retrying batch"
            );
            record.cleanup_refs.push(shrunk.clone());
            items[index].path = shrunk;
            record.task = retask(&record.task, items);
            inner.handle_failure(Stage::Upload, record, FailureClass::PhotoTooLarge)?;
            Ok(())
        }
        Ok(None) => {
            // Every strategy exhausted: fail this one file, keep the rest.
            let dropped = items.remove(index);
            tracing::error!(file = %dropped.path.display(), "photo cannot be shrunk under the limit");
            inner.quarantine_file(&dropped.path, record.id, "photo_too_large");
            record.cleanup_refs.retain(|p| p != &dropped.path);
            if items.is_empty() {
                let id = record.id;
                {
                    let mut qs = inner.queues.lock().unwrap();
                    qs.queues.complete(Stage::Upload, id, Vec::new())?;
                }
                release_record_root(inner, &record);
                return Ok(());
            }
            record.task = retask(&record.task, items);
            inner.handle_failure(Stage::Upload, record, FailureClass::PhotoTooLarge)?;
            Ok(())
        }
        Err(e) => {
            inner.handle_failure(
                Stage::Upload,
                record,
                FailureClass::Unknown(format!("photo shrink failed: {e:#}")),
            )?;
            Ok(())
        }
    }
}

/// Invalid media: split the batch. Compatible items re-queue as new
/// kind-separated albums; each incompatible item becomes a deferred
/// conversion. The batch itself never fails.
async fn recover_media_invalid(
    inner: &Arc<PipelineInner>,
    record: TaskRecord,
    items: Vec<AlbumItem>,
    invalid: Vec<PathBuf>,
) -> anyhow::Result<()> {
    if invalid.is_empty() {
        // Adapter would not name the offender; treat as a generic failure.
        inner.handle_failure(
            Stage::Upload,
            record,
            FailureClass::Unknown("media invalid without named files".into()),
        )?;
        return Ok(());
    }

    let (bad, good): (Vec<AlbumItem>, Vec<AlbumItem>) = items
        .into_iter()
        .partition(|i| invalid.contains(&i.path));
    tracing::warn!(
        task = record.id,
        invalid = bad.len(),
        requeued = good.len(),
        "splitting batch after media rejection"
    );

    let mut followups = Vec::new();

    // Compatible remainder, one album per kind; even a batch restored from
    // an older journal that mixed kinds splits cleanly here.
    let mut by_kind: std::collections::HashMap<MediaKind, Vec<AlbumItem>> = Default::default();
    for item in good {
        let kind = item
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .map(MediaKind::from_filename)
            .unwrap_or(record.kind);
        by_kind.entry(kind).or_default().push(item);
    }
    for (kind, group) in by_kind {
        let cleanup: Vec<PathBuf> = record
            .cleanup_refs
            .iter()
            .filter(|p| !bad.iter().any(|b| &&b.path == p))
            .cloned()
            .collect();
        let album = TaskRecord::new(
            inner.alloc_id(),
            Task::AlbumDispatch {
                items: group,
                batch_index: 1,
                total_batches_estimate: 1,
            },
            kind,
        )
        .with_source(record.source_ref.clone())
        .with_archive_ctx(record.archive_ctx.clone())
        .with_cleanup(cleanup);
        if let Some(ctx) = &album.archive_ctx {
            inner.registry.lock().unwrap().increment(&ctx.extraction_root);
        }
        followups.push((Stage::Upload, album));
    }

    // Each incompatible item heads for the conversion ledger, taking its
    // own hold on the extraction root.
    for item in &bad {
        if let Some(ctx) = &record.archive_ctx {
            inner.registry.lock().unwrap().increment(&ctx.extraction_root);
        }
        followups.push((
            Stage::Process,
            process_worker::deferred_record(
                inner,
                &item.path,
                record.archive_ctx.clone(),
                item.fingerprint.clone(),
            ),
        ));
    }

    inner.status_best_effort(
        record.source_ref.as_deref(),
        &format!(
            "{} item(s) rejected as invalid media; converting and re-sending the rest",
            bad.len()
        ),
    );

    let id = record.id;
    {
        let mut qs = inner.queues.lock().unwrap();
        qs.queues.complete(Stage::Upload, id, followups)?;
    }
    // The original batch's root reference hands over to the new records.
    if let Some(ctx) = &record.archive_ctx {
        let cleanup = inner.registry.lock().unwrap().decrement(&ctx.extraction_root);
        if let Some(cleanup) = cleanup {
            inner.perform_root_cleanup(cleanup);
        }
    }
    inner.wake(Stage::Upload);
    inner.wake(Stage::Process);
    Ok(())
}

/// Release the root reference an upload record held, for terminal paths
/// that bypass the normal success cleanup.
fn release_record_root(inner: &Arc<PipelineInner>, record: &TaskRecord) {
    if let Some(ctx) = &record.archive_ctx {
        let cleanup = inner.registry.lock().unwrap().decrement(&ctx.extraction_root);
        if let Some(cleanup) = cleanup {
            inner.perform_root_cleanup(cleanup);
        }
    }
}

/// Rebuild the task payload with an updated item list.
fn retask(task: &Task, items: Vec<AlbumItem>) -> Task {
    match task {
        Task::AlbumDispatch {
            batch_index,
            total_batches_estimate,
            ..
        } => Task::AlbumDispatch {
            items,
            batch_index: *batch_index,
            total_batches_estimate: *total_batches_estimate,
        },
        Task::DirectUpload { .. } => Task::DirectUpload {
            path: items
                .into_iter()
                .next()
                .map(|i| i.path)
                .unwrap_or_default(),
        },
        other => other.clone(),
    }
}

fn album_caption(
    record: &TaskRecord,
    kind: MediaKind,
    batch_index: usize,
    total_batches: usize,
    count: usize,
) -> String {
    let kind_label = match kind {
        MediaKind::Image => "Images",
        MediaKind::Video => "Videos",
        _ => "Files",
    };
    match &record.archive_ctx {
        Some(ctx) => format!(
            "{} – {} (Batch {}/{}: {} files)",
            ctx.archive_name, kind_label, batch_index, total_batches, count
        ),
        None => format!("{kind_label} (Batch {batch_index}/{total_batches}: {count} files)"),
    }
}

/// Attributes per kind: videos carry duration/dimensions/thumbnail, images
/// carry size, documents carry filename.
async fn build_outbound(inner: &Arc<PipelineInner>, path: &PathBuf, kind: MediaKind) -> OutboundFile {
    let byte_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string);
    let mut attributes = MediaAttributes {
        byte_size,
        filename,
        ..Default::default()
    };

    if kind == MediaKind::Video {
        let probe = {
            let encoder = Arc::clone(&inner.encoder);
            let path = path.clone();
            tokio::task::spawn_blocking(move || encoder.probe(&path)).await
        };
        if let Ok(Ok(probe)) = probe {
            attributes.duration_secs = probe.duration_secs;
            attributes.width = probe.width;
            attributes.height = probe.height;
        }
        let thumb = path.with_extension("thumb.jpg");
        if thumb.exists() {
            attributes.thumbnail = Some(thumb);
        }
    }

    OutboundFile {
        path: path.clone(),
        kind,
        attributes,
    }
}
