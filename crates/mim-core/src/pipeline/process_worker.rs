//! Process-stage worker: archive expansion, per-entry extraction, media
//! normalization, and deferral into the conversion ledger.
//!
//! Sequential by design: one entry extracts at a time, and at most one
//! archive can sit in the awaiting-secret state because this worker blocks
//! on it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::PipelineInner;
use crate::expander::{self, ExpandError, ExpansionManifest};
use crate::failure::FailureClass;
use crate::fetcher::ProgressThrottle;
use crate::fingerprint::fingerprint_path;
use crate::journal::Stage;
use crate::normalize::{decide, FfmpegEncoder, NormalizeDecision};
use crate::task::{unix_now, ArchiveCtx, MediaKind, Task, TaskRecord};

const LOW_DISK_POLL: Duration = Duration::from_secs(15);

pub(super) async fn run(inner: Arc<PipelineInner>) {
    loop {
        if inner.supervisor.is_shutdown() {
            break;
        }
        let record = {
            let mut qs = inner.queues.lock().unwrap();
            qs.queues.process.pop_ready(unix_now(), &HashSet::new())
        };
        let Some(record) = record else {
            wait_for_work(&inner).await;
            continue;
        };

        if let Err(e) = execute(&inner, record).await {
            tracing::error!("process worker internal error: {e:#}");
        }
    }
    tracing::debug!("process worker stopped");
}

async fn wait_for_work(inner: &Arc<PipelineInner>) {
    let sleep_secs = {
        let qs = inner.queues.lock().unwrap();
        match qs.queues.process.next_delayed_at(unix_now()) {
            Some(at) => (at - unix_now()).clamp(1, 30) as u64,
            None => 30,
        }
    };
    tokio::select! {
        _ = inner.notify.process.notified() => {}
        _ = tokio::time::sleep(Duration::from_secs(sleep_secs)) => {}
    }
}

async fn execute(inner: &Arc<PipelineInner>, record: TaskRecord) -> anyhow::Result<()> {
    match record.task.clone() {
        Task::Extract { archive_path } => run_extract(inner, record, archive_path).await,
        Task::ExpandEntry {
            archive_path,
            entry_index,
            entry_name,
        } => run_expand_entry(inner, record, archive_path, entry_index, entry_name).await,
        Task::Normalize { path } => run_normalize(inner, record, path).await,
        Task::DeferredConvert { path } => run_defer(inner, record, path).await,
        other => {
            tracing::error!(op = other.op_name(), "non-process task in process stage");
            inner.handle_failure(
                Stage::Process,
                record,
                FailureClass::Permanent("task routed to wrong stage".into()),
            )?;
            Ok(())
        }
    }
}

/// Open the archive, persist the manifest, and fan out one `ExpandEntry`
/// per unprocessed media member.
async fn run_extract(
    inner: &Arc<PipelineInner>,
    record: TaskRecord,
    archive_path: PathBuf,
) -> anyhow::Result<()> {
    let archive_name = archive_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("archive")
        .to_string();

    // A protected archive blocks here until its secret arrives.
    let secret_check = {
        let archive = archive_path.clone();
        tokio::task::spawn_blocking(move || expander::needs_secret(&archive)).await?
    };
    match secret_check {
        Ok(true) => {
            if inner.supervisor.secret_for(&archive_name).is_none() {
                inner.status_best_effort(
                    record.source_ref.as_deref(),
                    &format!("{archive_name} is password-protected; awaiting secret"),
                );
                if inner.supervisor.wait_secret(&archive_name).await.is_none() {
                    inner.handle_failure(Stage::Process, record, FailureClass::Canceled)?;
                    return Ok(());
                }
            }
        }
        Ok(false) => {}
        Err(e) => {
            inner.handle_failure(
                Stage::Process,
                record,
                FailureClass::Permanent(format!("unreadable archive: {e}")),
            )?;
            return Ok(());
        }
    }

    let members = {
        let archive = archive_path.clone();
        tokio::task::spawn_blocking(move || expander::list_members(&archive)).await?
    };
    let members = match members {
        Ok(members) => members,
        Err(ExpandError::NeedsSecret) => {
            // Listing itself is protected; retry after the secret arrives.
            inner.handle_failure(Stage::Process, record, FailureClass::Unknown("listing requires secret".into()))?;
            return Ok(());
        }
        Err(e) => {
            inner.handle_failure(
                Stage::Process,
                record,
                FailureClass::Permanent(format!("cannot list archive: {e}")),
            )?;
            return Ok(());
        }
    };

    let (manifest_id, root) = inner.extraction_root_for(&archive_path);
    std::fs::create_dir_all(&root)?;
    let manifest_path = inner.layout.manifest_file(&manifest_id);
    let mut manifest = ExpansionManifest::load(&manifest_path)?
        .unwrap_or_else(|| ExpansionManifest::new(&archive_name, &archive_path, &root, members.len()));

    inner.registry.lock().unwrap().register_root(
        &root,
        Some(&archive_path),
        Some(&manifest_id),
    );

    let ctx = ArchiveCtx {
        archive_name: archive_name.clone(),
        extraction_root: root.clone(),
        manifest_id: manifest_id.clone(),
    };

    let mut followups = Vec::new();
    let mut media = 0usize;
    for member in &members {
        if manifest.is_processed(member.index) {
            continue;
        }
        let kind = MediaKind::from_filename(&member.name);
        if member.is_dir || !kind.is_media() {
            manifest.mark_skipped(member.index);
            continue;
        }
        media += 1;
        followups.push((
            Stage::Process,
            TaskRecord::new(
                inner.alloc_id(),
                Task::ExpandEntry {
                    archive_path: archive_path.clone(),
                    entry_index: member.index,
                    entry_name: member.name.clone(),
                },
                kind,
            )
            .with_source(record.source_ref.clone())
            .with_archive_ctx(Some(ctx.clone())),
        ));
    }
    manifest.save(&manifest_path)?;

    // The archive payload itself is now accounted for: a re-sent copy adds
    // nothing, so its fingerprint and (name, size) prekey enter the cache
    // here rather than at upload time.
    if let Some(fp) = &record.fingerprint {
        let size = std::fs::metadata(&archive_path).map(|m| m.len()).unwrap_or(0);
        inner.insert_fingerprints(&[(fp.clone(), size, Some(archive_name.clone()))])?;
    }

    tracing::info!(
        archive = archive_name,
        total = members.len(),
        media,
        "archive opened for expansion"
    );
    inner.status_best_effort(
        record.source_ref.as_deref(),
        &format!("expanding {archive_name}: {media} media of {} entries", members.len()),
    );

    let finished = followups.is_empty() && manifest.is_complete();
    let id = record.id;
    {
        let mut qs = inner.queues.lock().unwrap();
        qs.queues.complete(Stage::Process, id, followups)?;
    }
    if finished {
        inner.finish_archive(&archive_name, &root)?;
    }
    inner.wake(Stage::Process);
    Ok(())
}

/// Extract one member, fingerprint it, and route it into normalization or
/// the upload batcher.
async fn run_expand_entry(
    inner: &Arc<PipelineInner>,
    record: TaskRecord,
    archive_path: PathBuf,
    entry_index: usize,
    entry_name: String,
) -> anyhow::Result<()> {
    let Some(ctx) = record.archive_ctx.clone() else {
        inner.handle_failure(
            Stage::Process,
            record,
            FailureClass::Permanent("expand entry without archive context".into()),
        )?;
        return Ok(());
    };

    // Restored roots may be tracked without metadata; (re)attach it so the
    // eventual cleanup can remove the archive and manifest too.
    inner.registry.lock().unwrap().register_root(
        &ctx.extraction_root,
        Some(&archive_path),
        Some(&ctx.manifest_id),
    );

    let manifest_path = inner.layout.manifest_file(&ctx.manifest_id);
    let mut manifest = match ExpansionManifest::load(&manifest_path)? {
        Some(m) => m,
        None => {
            // Manifest lost (operator cleanup?); rebuild a permissive one.
            tracing::warn!(manifest = %manifest_path.display(), "manifest missing; rebuilding");
            ExpansionManifest::new(&ctx.archive_name, &archive_path, &ctx.extraction_root, entry_index + 1)
        }
    };
    if manifest.is_processed(entry_index) {
        let id = record.id;
        let mut qs = inner.queues.lock().unwrap();
        qs.queues.complete(Stage::Process, id, Vec::new())?;
        return Ok(());
    }

    // Backpressure: never extract into a disk under the floor.
    let mut reported_low_disk = false;
    while !expander::has_headroom(
        &inner.layout.extraction_dir(),
        inner.cfg.free_space_floor,
        0,
    ) {
        if !reported_low_disk {
            tracing::warn!(
                floor = inner.cfg.free_space_floor,
                "expansion paused: free disk under floor"
            );
            inner.status_best_effort(
                record.source_ref.as_deref(),
                "expansion paused: low storage",
            );
            reported_low_disk = true;
        }
        if inner.supervisor.is_shutdown() {
            inner.handle_failure(Stage::Process, record, FailureClass::Canceled)?;
            return Ok(());
        }
        tokio::time::sleep(LOW_DISK_POLL).await;
    }

    // Extract, retrying through secret delivery for protected members.
    let extracted = loop {
        let secret = inner.supervisor.secret_for(&ctx.archive_name);
        let result = {
            let archive = archive_path.clone();
            let root = ctx.extraction_root.clone();
            let secret = secret.clone();
            tokio::task::spawn_blocking(move || {
                expander::extract_member(&archive, entry_index, &root, secret.as_deref())
            })
            .await?
        };
        match result {
            Ok(extracted) => break extracted,
            Err(ExpandError::NeedsSecret) => {
                inner.status_best_effort(
                    record.source_ref.as_deref(),
                    &format!("{} is password-protected; awaiting secret", ctx.archive_name),
                );
                if inner.supervisor.wait_secret(&ctx.archive_name).await.is_none() {
                    inner.handle_failure(Stage::Process, record, FailureClass::Canceled)?;
                    return Ok(());
                }
            }
            Err(ExpandError::WrongSecret) => {
                inner.supervisor.clear_secret(&ctx.archive_name);
                inner.status_best_effort(
                    record.source_ref.as_deref(),
                    &format!("secret rejected for {}; awaiting a new one", ctx.archive_name),
                );
                if inner.supervisor.wait_secret(&ctx.archive_name).await.is_none() {
                    inner.handle_failure(Stage::Process, record, FailureClass::Canceled)?;
                    return Ok(());
                }
            }
            Err(e) => {
                inner.handle_failure(
                    Stage::Process,
                    record,
                    FailureClass::Permanent(format!("extract {entry_name}: {e}")),
                )?;
                return Ok(());
            }
        }
    };

    let kind = MediaKind::from_filename(&entry_name);
    let fingerprint = {
        let path = extracted.path.clone();
        tokio::task::spawn_blocking(move || fingerprint_path(&path)).await?
    }
    .ok();

    // Deduplicate within and across archives by content hash.
    let duplicate = fingerprint
        .as_deref()
        .map(|fp| inner.cache.lock().unwrap().contains(fp))
        .unwrap_or(false);

    let mut followups = Vec::new();
    if duplicate {
        tracing::debug!(entry = entry_name, "archive entry already ingested; dropping");
        let _ = std::fs::remove_file(&extracted.path);
    } else if kind == MediaKind::Video {
        // A normalize record holds its root until it hands the file to the
        // upload stage (or defers it).
        inner.registry.lock().unwrap().increment(&ctx.extraction_root);
        followups.push((
            Stage::Process,
            TaskRecord::new(
                inner.alloc_id(),
                Task::Normalize {
                    path: extracted.path.clone(),
                },
                MediaKind::Video,
            )
            .with_source(record.source_ref.clone())
            .with_archive_ctx(Some(ctx.clone()))
            .with_fingerprint(fingerprint)
            .with_cleanup(vec![extracted.path.clone()]),
        ));
    } else {
        let upload = TaskRecord::new(
            inner.alloc_id(),
            Task::DirectUpload {
                path: extracted.path.clone(),
            },
            kind,
        )
        .with_source(record.source_ref.clone())
        .with_archive_ctx(Some(ctx.clone()))
        .with_fingerprint(fingerprint)
        .with_cleanup(vec![extracted.path.clone()]);
        inner.enqueue_media_upload(upload)?;
    }

    manifest.mark_processed(entry_index);
    manifest.save(&manifest_path)?;
    let (done, total) = manifest.progress();
    tracing::debug!(archive = ctx.archive_name, done, total, "entry processed");

    let id = record.id;
    {
        let mut qs = inner.queues.lock().unwrap();
        qs.queues.complete(Stage::Process, id, followups)?;
    }
    if manifest.is_complete() {
        inner.finish_archive(&ctx.archive_name, &ctx.extraction_root)?;
    }
    inner.wake(Stage::Process);
    Ok(())
}

/// Probe and either pass through, convert inline, or defer.
async fn run_normalize(
    inner: &Arc<PipelineInner>,
    record: TaskRecord,
    path: PathBuf,
) -> anyhow::Result<()> {
    let probe = {
        let encoder = Arc::clone(&inner.encoder);
        let path = path.clone();
        tokio::task::spawn_blocking(move || encoder.probe(&path)).await?
    };
    let probe = match probe {
        Ok(p) => p,
        Err(e) => {
            inner.handle_failure(
                Stage::Process,
                record,
                FailureClass::Unknown(format!("probe failed: {e:#}")),
            )?;
            return Ok(());
        }
    };

    match decide(&path, &probe, &inner.cfg.transcode) {
        NormalizeDecision::Passthrough => {
            let upload = TaskRecord::new(
                inner.alloc_id(),
                Task::DirectUpload { path: path.clone() },
                MediaKind::Video,
            )
            .with_source(record.source_ref.clone())
            .with_archive_ctx(record.archive_ctx.clone())
            .with_fingerprint(record.fingerprint.clone())
            .with_cleanup(record.cleanup_refs.clone());
            inner.enqueue_media_upload(upload)?;
            release_normalize_hold(inner, &record);
            let id = record.id;
            let mut qs = inner.queues.lock().unwrap();
            qs.queues.complete(Stage::Process, id, Vec::new())?;
            Ok(())
        }
        NormalizeDecision::Inline => run_inline_convert(inner, record, path, probe).await,
        NormalizeDecision::Defer => {
            tracing::info!(file = %path.display(), "video deferred for conversion");
            let defer = TaskRecord::new(
                inner.alloc_id(),
                Task::DeferredConvert { path: path.clone() },
                MediaKind::Video,
            )
            .with_source(record.source_ref.clone())
            .with_archive_ctx(record.archive_ctx.clone())
            .with_fingerprint(record.fingerprint.clone());
            // The normalize record's root hold transfers to the deferred
            // record unchanged.
            let id = record.id;
            {
                let mut qs = inner.queues.lock().unwrap();
                qs.queues
                    .complete(Stage::Process, id, vec![(Stage::Process, defer)])?;
            }
            inner.wake(Stage::Process);
            Ok(())
        }
    }
}

async fn run_inline_convert(
    inner: &Arc<PipelineInner>,
    record: TaskRecord,
    path: PathBuf,
    probe: crate::normalize::MediaProbe,
) -> anyhow::Result<()> {
    let output = FfmpegEncoder::output_path_for(&path);
    let task_id = record.id;
    let progress = ProgressThrottle::new(
        inner.cfg.progress.min_percent_step,
        Duration::from_secs(inner.cfg.progress.min_interval_secs),
        Some(Box::new(move |p| {
            tracing::debug!(task = task_id, percent = p.percent, "transcode progress");
        })),
    );

    let result = {
        let encoder = Arc::clone(&inner.encoder);
        let input = path.clone();
        let output = output.clone();
        let timeout = Duration::from_secs(inner.cfg.transcode.timeout);
        let duration = probe.duration_secs;
        let abort = inner.supervisor.cancel_flag();
        tokio::task::spawn_blocking(move || {
            let mut progress = progress;
            encoder.normalize(&input, &output, duration, timeout, &mut progress, Some(abort))
        })
        .await?
    };

    match result {
        Ok(normalized) => {
            let mut cleanup = record.cleanup_refs.clone();
            cleanup.push(normalized.path.clone());
            if let Some(thumb) = &normalized.thumbnail {
                cleanup.push(thumb.clone());
            }
            let upload = TaskRecord::new(
                inner.alloc_id(),
                Task::DirectUpload {
                    path: normalized.path.clone(),
                },
                MediaKind::Video,
            )
            .with_source(record.source_ref.clone())
            .with_archive_ctx(record.archive_ctx.clone())
            .with_fingerprint(record.fingerprint.clone())
            .with_cleanup(cleanup);
            inner.enqueue_media_upload(upload)?;
            release_normalize_hold(inner, &record);
            let id = record.id;
            let mut qs = inner.queues.lock().unwrap();
            qs.queues.complete(Stage::Process, id, Vec::new())?;
            Ok(())
        }
        Err(class) => {
            inner.handle_failure(Stage::Process, record, class)?;
            Ok(())
        }
    }
}

/// Release the root hold a normalize record has carried since creation;
/// the successor upload record took its own hold on enqueue.
fn release_normalize_hold(inner: &Arc<PipelineInner>, record: &TaskRecord) {
    if let Some(ctx) = &record.archive_ctx {
        let cleanup = inner
            .registry
            .lock()
            .unwrap()
            .decrement(&ctx.extraction_root);
        if let Some(cleanup) = cleanup {
            inner.perform_root_cleanup(cleanup);
        }
    }
}

/// Write the ledger entry for an incompatible video; the deferred worker
/// picks it up when the live queues drain.
async fn run_defer(
    inner: &Arc<PipelineInner>,
    record: TaskRecord,
    path: PathBuf,
) -> anyhow::Result<()> {
    let output = FfmpegEncoder::output_path_for(&path);
    // The root hold for this item was taken when the deferred-convert
    // record was created (defer decision, media-invalid split, or restore
    // seeding); only the ledger write happens here.
    {
        let mut ledger = inner.ledger.lock().unwrap();
        ledger.add_pending(&path, &output, record.archive_ctx.clone())?;
    }
    inner.status_best_effort(
        record.source_ref.as_deref(),
        &format!(
            "{} needs conversion; queued for when the pipeline is idle",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("video")
        ),
    );
    let id = record.id;
    {
        let mut qs = inner.queues.lock().unwrap();
        qs.queues.complete(Stage::Process, id, Vec::new())?;
    }
    inner.notify.deferred.notify_waiters();
    Ok(())
}

/// Non-worker helper shared with the uploader's media-invalid split: the
/// canonical deferred-convert record for a file pulled out of a batch.
pub(super) fn deferred_record(
    inner: &Arc<PipelineInner>,
    path: &Path,
    ctx: Option<ArchiveCtx>,
    fingerprint: Option<String>,
) -> TaskRecord {
    TaskRecord::new(
        inner.alloc_id(),
        Task::DeferredConvert {
            path: path.to_path_buf(),
        },
        MediaKind::Video,
    )
    .with_archive_ctx(ctx)
    .with_fingerprint(fingerprint)
}
