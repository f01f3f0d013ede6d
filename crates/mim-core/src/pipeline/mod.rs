//! The work orchestration kernel: owns the durable queues, the collaborator
//! adapters, and one async worker per stage.
//!
//! Control flow follows the dataflow: intake routes events into the
//! download stage; the post-download router fans out to extract, normalize,
//! or upload; the album batcher groups archive media on the way into the
//! upload stage; the deferred worker drains the conversion ledger only when
//! no live work remains.

mod deferred_worker;
mod download_worker;
mod process_worker;
mod router;
mod upload_worker;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::batcher::AlbumBatcher;
use crate::cache::ContentCache;
use crate::config::IngestConfig;
use crate::events::{extract_links, looks_like_collection, InboundEvent, Signal};
use crate::expander::manifest_id_for;
use crate::failure::FailureClass;
use crate::fetcher::{filename_from_url, sanitize_filename};
use crate::journal::{restore_queues, FailOutcome, QueueSet, Stage};
use crate::ledger::ConversionLedger;
use crate::normalize::Encoder;
use crate::outbox::{Outbox, TargetRef};
use crate::paths::StateLayout;
use crate::registry::{CleanupRegistry, RootCleanup};
use crate::retry::RetryPolicy;
use crate::supervisor::{summarize, PipelineSnapshot, QuarantineIndex, StageSnapshot, Supervisor};
use crate::task::{unix_now, MediaKind, Task, TaskId, TaskRecord};

/// Queues plus the streaming batcher, mutated under one lock so batch
/// replacement stays atomic with held-id bookkeeping.
pub(crate) struct QueueState {
    pub queues: QueueSet,
    pub batcher: AlbumBatcher,
}

pub(crate) struct StageNotifiers {
    pub download: Notify,
    pub process: Notify,
    pub upload: Notify,
    pub deferred: Notify,
}

pub(crate) struct PipelineInner {
    pub cfg: IngestConfig,
    pub layout: StateLayout,
    pub queues: Mutex<QueueState>,
    pub cache: Mutex<ContentCache>,
    pub ledger: Mutex<ConversionLedger>,
    pub quarantine: Mutex<QuarantineIndex>,
    pub registry: Mutex<CleanupRegistry>,
    pub outbox: Arc<dyn Outbox>,
    pub encoder: Arc<dyn Encoder>,
    pub supervisor: Arc<Supervisor>,
    pub policy: RetryPolicy,
    pub notify: StageNotifiers,
    next_id: AtomicU64,
    target: Mutex<Option<TargetRef>>,
    /// Abort handle for the fetch currently in flight (operator cancel).
    pub current_fetch_abort: Mutex<Option<Arc<AtomicBool>>>,
}

/// The assembled pipeline. Construction restores all durable state; `spawn`
/// starts the workers.
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    /// Restore journals, regroup the upload stage, reseed registries, and
    /// recover the conversion ledger.
    pub fn restore(
        cfg: IngestConfig,
        layout: StateLayout,
        outbox: Arc<dyn Outbox>,
        encoder: Arc<dyn Encoder>,
    ) -> Result<Self> {
        layout.ensure_dirs()?;

        let (queues, report) = restore_queues(&layout, cfg.album_size_cap)
            .context("restore stage journals")?;

        let cache = ContentCache::load(&layout.cache_file());
        let mut ledger = ConversionLedger::load(&layout.ledger_file());
        let (requeued, missing) = ledger.recover_interrupted()?;
        if requeued + missing > 0 {
            tracing::info!(requeued, missing, "conversion ledger recovered");
        }
        ledger.sweep_completed(cfg.conversion.completed_ttl)?;

        let mut registry = CleanupRegistry::new();
        registry.seed(&report.root_refcounts);
        // Pending deferred conversions hold their extraction roots alive.
        for entry in ledger.entries() {
            if let Some(ctx) = &entry.archive_ctx {
                if matches!(
                    entry.status,
                    crate::ledger::ConversionStatus::Pending
                        | crate::ledger::ConversionStatus::InProgress
                ) {
                    registry.increment(&ctx.extraction_root);
                }
            }
        }
        // Process-stage records referencing a root still need its files:
        // normalize/defer records hold a reference; expand-entry records
        // mean extraction is live again, so cleanup re-gates on it.
        let parked_process = queues
            .retry
            .iter()
            .filter(|(home, _)| *home == Stage::Process)
            .map(|(_, r)| r.clone())
            .collect::<Vec<_>>();
        for record in queues.process.iter().chain(parked_process.iter()) {
            if let Some(ctx) = &record.archive_ctx {
                match record.task {
                    Task::ExpandEntry { .. } => {
                        registry.mark_extraction_pending(&ctx.extraction_root);
                    }
                    Task::Normalize { .. } | Task::DeferredConvert { .. } => {
                        registry.increment(&ctx.extraction_root);
                    }
                    _ => {}
                }
            }
        }

        let quarantine = QuarantineIndex::load(&layout.quarantine_index());

        let admission_open = !cfg.admission.wifi_only;
        let supervisor = Arc::new(Supervisor::new(admission_open));
        let policy = RetryPolicy::new(cfg.retry.max_attempts, cfg.retry.base_seconds);
        let album_cap = cfg.album_size_cap;

        let inner = Arc::new(PipelineInner {
            cfg,
            layout,
            queues: Mutex::new(QueueState {
                queues,
                batcher: AlbumBatcher::new(album_cap),
            }),
            cache: Mutex::new(cache),
            ledger: Mutex::new(ledger),
            quarantine: Mutex::new(quarantine),
            registry: Mutex::new(registry),
            outbox,
            encoder,
            supervisor,
            policy,
            notify: StageNotifiers {
                download: Notify::new(),
                process: Notify::new(),
                upload: Notify::new(),
                deferred: Notify::new(),
            },
            next_id: AtomicU64::new(report.next_task_id),
            target: Mutex::new(None),
            current_fetch_abort: Mutex::new(None),
        });
        Ok(Self { inner })
    }

    pub fn supervisor(&self) -> Arc<Supervisor> {
        Arc::clone(&self.inner.supervisor)
    }

    /// Start all workers plus the retry pump, snapshot, and spool loops.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for _ in 0..self.inner.cfg.stage_concurrency.download {
            handles.push(tokio::spawn(download_worker::run(Arc::clone(&self.inner))));
        }
        handles.push(tokio::spawn(process_worker::run(Arc::clone(&self.inner))));
        for _ in 0..self.inner.cfg.stage_concurrency.upload {
            handles.push(tokio::spawn(upload_worker::run(Arc::clone(&self.inner))));
        }
        handles.push(tokio::spawn(deferred_worker::run(Arc::clone(&self.inner))));
        handles.push(tokio::spawn(retry_pump(Arc::clone(&self.inner))));
        handles.push(tokio::spawn(snapshot_loop(Arc::clone(&self.inner))));
        handles.push(tokio::spawn(spool_loop(Arc::clone(&self.inner))));
        handles
    }

    /// Inbound event from the messaging adapter (or the spool).
    pub fn on_message(&self, event: InboundEvent) -> Result<()> {
        self.inner.intake(event)
    }

    /// Out-of-band signal.
    pub fn on_signal(&self, signal: Signal) {
        self.inner.signal(signal)
    }

    /// Optional liveness notification from the runtime; not required for
    /// correctness.
    pub fn on_stream_advance(&self, _token: u64) {}

    /// Drive every queue to empty (tests and `--drain` runs). Returns when
    /// all stages idle and no deferred work remains.
    pub async fn drain(&self) -> Result<()> {
        loop {
            let (idle, deferred) = {
                let qs = self.inner.queues.lock().unwrap();
                let ledger = self.inner.ledger.lock().unwrap();
                (
                    qs.queues.all_idle() && qs.batcher.pending_count() == 0,
                    ledger.active_count() > 0,
                )
            };
            if idle && !deferred {
                return Ok(());
            }
            if self.inner.supervisor.is_shutdown() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl PipelineInner {
    pub(crate) fn alloc_id(&self) -> TaskId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Intake: dedup precheck, size guard, then download-stage tasks.
    fn intake(&self, event: InboundEvent) -> Result<()> {
        match event {
            InboundEvent::Document {
                name,
                size,
                fetch_url,
                source_ref,
                ..
            }
            | InboundEvent::Media {
                name,
                size,
                fetch_url,
                source_ref,
                ..
            } => {
                let kind = MediaKind::from_filename(&name);
                if self.cache.lock().unwrap().seen_prekey(&name, size) {
                    tracing::info!(name, size, "intake duplicate skipped by (name, size)");
                    self.status_best_effort(source_ref.as_deref(), &format!("skipped duplicate {name}"));
                    return Ok(());
                }
                if kind == MediaKind::Archive
                    && self.cfg.max_archive_size > 0
                    && size > self.cfg.max_archive_size
                {
                    tracing::warn!(name, size, "archive over max_archive_size rejected");
                    self.status_best_effort(
                        source_ref.as_deref(),
                        &format!("rejected {name}: over the archive size limit"),
                    );
                    return Ok(());
                }
                let destination = self.unique_download_path(&sanitize_filename(&name));
                let record = TaskRecord::new(
                    self.alloc_id(),
                    Task::Download {
                        url: fetch_url,
                        destination,
                        expected_size: Some(size),
                        auth_token: None,
                    },
                    kind,
                )
                .with_source(source_ref);
                self.enqueue_and_wake(Stage::Download, record)
            }
            InboundEvent::Text {
                text,
                source_ref,
                auth_token,
            } => {
                let links = extract_links(&text);
                if links.is_empty() {
                    return Ok(());
                }
                for link in links {
                    let record = if looks_like_collection(&link) {
                        TaskRecord::new(
                            self.alloc_id(),
                            Task::WebdavCrawl {
                                url: link,
                                auth_token: auth_token.clone(),
                            },
                            MediaKind::TextLink,
                        )
                        .with_source(source_ref.clone())
                    } else {
                        let name = filename_from_url(&link);
                        let kind = MediaKind::from_filename(&name);
                        let destination = self.unique_download_path(&name);
                        TaskRecord::new(
                            self.alloc_id(),
                            Task::Download {
                                url: link,
                                destination,
                                expected_size: None,
                                auth_token: auth_token.clone(),
                            },
                            kind,
                        )
                        .with_source(source_ref.clone())
                    };
                    self.enqueue_and_wake(Stage::Download, record)?;
                }
                Ok(())
            }
        }
    }

    fn signal(&self, signal: Signal) {
        match signal {
            Signal::NetworkChanged { on_wifi } => {
                if self.cfg.admission.wifi_only {
                    self.supervisor.admission.set_open(on_wifi);
                }
            }
            Signal::ArchiveSecret {
                archive_name,
                secret,
            } => {
                self.supervisor.store_secret(&archive_name, &secret);
            }
            Signal::CancelCurrent => {
                if let Some(abort) = self.current_fetch_abort.lock().unwrap().as_ref() {
                    abort.store(true, Ordering::Relaxed);
                    tracing::info!("operator canceled the in-flight fetch");
                }
            }
            Signal::AuthRestored => {
                self.supervisor.set_auth_paused(false);
                self.notify.upload.notify_waiters();
            }
        }
    }

    /// Unique destination under the download directory.
    fn unique_download_path(&self, name: &str) -> PathBuf {
        let dir = self.layout.download_dir();
        let candidate = dir.join(name);
        if !candidate.exists() && !crate::fetcher::part_path(&candidate).exists() {
            return candidate;
        }
        let (stem, ext) = match name.rsplit_once('.') {
            Some((s, e)) if !s.is_empty() => (s.to_string(), format!(".{e}")),
            _ => (name.to_string(), String::new()),
        };
        for n in 1..10_000 {
            let candidate = dir.join(format!("{stem}-{n}{ext}"));
            if !candidate.exists() && !crate::fetcher::part_path(&candidate).exists() {
                return candidate;
            }
        }
        dir.join(format!("{stem}-{}{ext}", unix_now()))
    }

    pub(crate) fn enqueue_and_wake(&self, stage: Stage, record: TaskRecord) -> Result<()> {
        {
            let mut qs = self.queues.lock().unwrap();
            qs.queues.enqueue(stage, record)?;
        }
        self.wake(stage);
        Ok(())
    }

    pub(crate) fn wake(&self, stage: Stage) {
        match stage {
            Stage::Download => self.notify.download.notify_waiters(),
            Stage::Process => self.notify.process.notify_waiters(),
            Stage::Upload => self.notify.upload.notify_waiters(),
        }
    }

    /// Enqueue one archive-media upload record: journal push, registry
    /// increment, batcher insert, and the cap-triggered swap of singles for
    /// an album dispatch.
    pub(crate) fn enqueue_media_upload(&self, record: TaskRecord) -> Result<()> {
        let root = record
            .archive_ctx
            .as_ref()
            .map(|c| c.extraction_root.clone());
        {
            let mut qs = self.queues.lock().unwrap();
            qs.queues.enqueue(Stage::Upload, record.clone())?;
            if let Some(root) = &root {
                self.registry.lock().unwrap().increment(root);
            }
            if let Some(batch) = qs.batcher.insert(&record) {
                self.swap_in_album(&mut qs, batch)?;
            }
        }
        self.wake(Stage::Upload);
        Ok(())
    }

    /// Replace a formed batch's member records with one album record.
    pub(crate) fn swap_in_album(
        &self,
        qs: &mut QueueState,
        batch: crate::batcher::FormedBatch,
    ) -> Result<()> {
        let ids = batch.task_ids();
        let root = batch.archive_ctx.extraction_root.clone();
        let album = batch.into_album_record(self.alloc_id());
        qs.queues.replace_upload(&ids, album)?;
        // Net refcount change: N singles out, one album in.
        let mut registry = self.registry.lock().unwrap();
        for _ in 1..ids.len() {
            let _ = registry.decrement(&root);
        }
        Ok(())
    }

    /// Flush trailing batches for a finished archive and mark its root done.
    pub(crate) fn finish_archive(&self, archive_name: &str, root: &Path) -> Result<()> {
        let batches = {
            let mut qs = self.queues.lock().unwrap();
            let batches = qs.batcher.flush_archive(archive_name, root);
            for batch in &batches {
                self.swap_in_album(&mut qs, batch.clone())?;
            }
            batches
        };
        if !batches.is_empty() {
            self.wake(Stage::Upload);
        }
        let cleanup = self.registry.lock().unwrap().mark_extraction_done(root);
        if let Some(cleanup) = cleanup {
            self.perform_root_cleanup(cleanup);
        }
        Ok(())
    }

    /// Filesystem side of a root's last reference dropping.
    pub(crate) fn perform_root_cleanup(&self, cleanup: RootCleanup) {
        tracing::info!(root = %cleanup.extraction_root.display(), "extraction root drained; cleaning up");
        let _ = std::fs::remove_dir_all(&cleanup.extraction_root);
        if let Some(manifest_id) = &cleanup.manifest_id {
            let _ = std::fs::remove_file(self.layout.manifest_file(manifest_id));
        }
        if let Some(archive) = &cleanup.archive_path {
            let _ = std::fs::remove_file(archive);
            let _ = std::fs::remove_file(crate::fetcher::part_path(archive));
        }
    }

    /// Resolved outbound target, cached after the first resolve.
    pub(crate) async fn target(&self) -> Result<TargetRef, crate::outbox::OutboxError> {
        if let Some(t) = self.target.lock().unwrap().clone() {
            return Ok(t);
        }
        let t = self.outbox.resolve_target(&self.cfg.target).await?;
        *self.target.lock().unwrap() = Some(t.clone());
        Ok(t)
    }

    /// Best-effort user-visible status line, gated on a live source ref.
    pub(crate) fn status_best_effort(&self, source_ref: Option<&str>, text: &str) {
        if source_ref.is_none() {
            // Restored tasks have no event handle to reply to.
            return;
        }
        tracing::info!(status = text, "user status");
        // Fire and forget through the adapter.
        let outbox = Arc::clone(&self.outbox);
        let handle = self.cfg.target.clone();
        let text = text.to_string();
        tokio::spawn(async move {
            if let Ok(target) = outbox.resolve_target(&handle).await {
                let _ = outbox.send_status(&target, &text).await;
            }
        });
    }

    /// Shared failure path: classify, reschedule or quarantine, and surface
    /// the first occurrence of each class to the user.
    pub(crate) fn handle_failure(
        &self,
        stage: Stage,
        record: TaskRecord,
        class: FailureClass,
    ) -> Result<FailOutcome> {
        let first_of_class = record.last_error_class.as_deref() != Some(class.tag().as_str());
        let attempt_display = record.retry_count + 1;
        let source_ref = record.source_ref.clone();
        let id = record.id;

        if matches!(class, FailureClass::Auth) {
            self.supervisor.set_auth_paused(true);
        }

        let outcome = {
            let mut qs = self.queues.lock().unwrap();
            qs.queues
                .fail(stage, record.clone(), &class, &self.policy, unix_now())?
        };

        match outcome {
            FailOutcome::Delayed { until } => {
                let wait = (until - unix_now()).max(0);
                tracing::warn!(
                    task = id,
                    class = class.tag(),
                    wait,
                    attempt = attempt_display,
                    budget = self.policy.max_attempts,
                    "task delayed for retry"
                );
                if first_of_class {
                    self.status_best_effort(
                        source_ref.as_deref(),
                        &format!(
                            "task #{id}: {} — retry in {wait}s (attempt {attempt_display}/{})",
                            class.tag(),
                            self.policy.max_attempts
                        ),
                    );
                }
            }
            FailOutcome::Requeued => {
                tracing::info!(task = id, class = class.tag(), "task requeued without budget");
            }
            FailOutcome::Quarantined => {
                self.quarantine_task(&record, &class)?;
            }
        }
        Ok(outcome)
    }

    /// Move a terminally failed task's inputs under quarantine and record it.
    pub(crate) fn quarantine_task(&self, record: &TaskRecord, class: &FailureClass) -> Result<()> {
        let final_class = match class {
            // Unknown hardens into permanent at the end of its budget.
            FailureClass::Unknown(msg) => FailureClass::Permanent(msg.clone()),
            other => other.clone(),
        };
        let dest_dir = self.layout.quarantine_dir().join(format!("task-{}", record.id));
        let mut preserved = Vec::new();
        let mut candidates: Vec<PathBuf> = record.cleanup_refs.clone();
        if let Some(path) = primary_input(&record.task) {
            if !candidates.contains(&path) {
                candidates.push(path);
            }
        }
        for path in candidates {
            if !path.exists() {
                continue;
            }
            if std::fs::create_dir_all(&dest_dir).is_ok() {
                let name = path
                    .file_name()
                    .map(|n| n.to_os_string())
                    .unwrap_or_else(|| format!("input-{}", record.id).into());
                let target = dest_dir.join(name);
                if std::fs::rename(&path, &target).is_ok() {
                    preserved.push(target);
                }
            }
        }

        tracing::error!(
            task = record.id,
            class = final_class.tag(),
            preserved = preserved.len(),
            "task quarantined"
        );
        self.status_best_effort(
            record.source_ref.as_deref(),
            &format!("task #{} failed permanently ({})", record.id, final_class.tag()),
        );

        self.quarantine.lock().unwrap().record(
            record,
            &final_class.tag(),
            Some(final_class.to_string()),
            preserved,
        )?;

        if holds_root_ref(&record.task) {
            if let Some(ctx) = &record.archive_ctx {
                let cleanup = self
                    .registry
                    .lock()
                    .unwrap()
                    .decrement(&ctx.extraction_root);
                if let Some(cleanup) = cleanup {
                    self.perform_root_cleanup(cleanup);
                }
            }
        }
        Ok(())
    }

    /// Cache insertion for a task about to commit terminal success. Runs
    /// before the journal `done` so a completed task's fingerprints are
    /// always discoverable by later intake.
    pub(crate) fn insert_fingerprints(
        &self,
        fingerprints: &[(String, u64, Option<String>)],
    ) -> Result<()> {
        let mut cache = self.cache.lock().unwrap();
        for (fp, size, name) in fingerprints {
            cache.insert(fp, *size, name.as_deref())?;
        }
        Ok(())
    }

    /// File cleanup and registry release after the terminal transition is
    /// durable. Runs only on success paths; a task that has not been
    /// acknowledged never loses a file.
    pub(crate) fn cleanup_after_success(&self, record: &TaskRecord) {
        for path in &record.cleanup_refs {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::warn!("cleanup unlink failed for {}: {}", path.display(), e);
                }
            }
        }
        if let Some(ctx) = &record.archive_ctx {
            let cleanup = self
                .registry
                .lock()
                .unwrap()
                .decrement(&ctx.extraction_root);
            if let Some(cleanup) = cleanup {
                self.perform_root_cleanup(cleanup);
            }
        }
    }

    /// Preserve one file under quarantine outside the full-task path (e.g.
    /// an unshrinkable photo pulled out of an otherwise healthy batch).
    pub(crate) fn quarantine_file(&self, path: &Path, task_id: TaskId, reason: &str) {
        let dest_dir = self.layout.quarantine_dir().join(format!("task-{task_id}"));
        if !path.exists() {
            return;
        }
        if std::fs::create_dir_all(&dest_dir).is_ok() {
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| format!("input-{task_id}").into());
            let target = dest_dir.join(name);
            if std::fs::rename(path, &target).is_ok() {
                tracing::warn!(file = %target.display(), reason, "file preserved in quarantine");
            }
        }
    }

    /// Extraction root for an archive, keyed by its manifest id.
    pub(crate) fn extraction_root_for(&self, archive_path: &Path) -> (String, PathBuf) {
        let id = manifest_id_for(archive_path);
        let root = self.layout.extraction_dir().join(&id);
        (id, root)
    }
}

/// Which task shapes carry a reference on their extraction root. Expand
/// entries do not: the extraction-done gate covers them.
fn holds_root_ref(task: &Task) -> bool {
    matches!(
        task,
        Task::DirectUpload { .. }
            | Task::AlbumDispatch { .. }
            | Task::Normalize { .. }
            | Task::DeferredConvert { .. }
    )
}

fn primary_input(task: &Task) -> Option<PathBuf> {
    match task {
        Task::Download { destination, .. } | Task::WebdavFile { destination, .. } => {
            Some(destination.clone())
        }
        Task::Extract { archive_path } | Task::ExpandEntry { archive_path, .. } => {
            Some(archive_path.clone())
        }
        Task::Normalize { path } | Task::DeferredConvert { path } | Task::DirectUpload { path } => {
            Some(path.clone())
        }
        Task::AlbumDispatch { .. } | Task::WebdavCrawl { .. } => None,
    }
}

/// Moves due retries home and sleeps until the next deadline.
async fn retry_pump(inner: Arc<PipelineInner>) {
    loop {
        if inner.supervisor.is_shutdown() {
            break;
        }
        let touched = {
            let mut qs = inner.queues.lock().unwrap();
            qs.queues.pump_retries(unix_now()).unwrap_or_default()
        };
        for stage in touched {
            inner.wake(stage);
        }
        let next_due = {
            let qs = inner.queues.lock().unwrap();
            qs.queues.retry.next_due()
        };
        let sleep_secs = match next_due {
            Some(due) => (due - unix_now()).clamp(1, 30) as u64,
            None => 5,
        };
        tokio::time::sleep(Duration::from_secs(sleep_secs)).await;
    }
}

/// Advisory snapshot writer.
async fn snapshot_loop(inner: Arc<PipelineInner>) {
    let interval = Duration::from_secs(inner.cfg.snapshot_interval.max(1));
    loop {
        if inner.supervisor.is_shutdown() {
            break;
        }
        let snapshot = {
            let qs = inner.queues.lock().unwrap();
            let ledger = inner.ledger.lock().unwrap();
            let cache = inner.cache.lock().unwrap();
            let stage = |q: &crate::journal::StageQueue| StageSnapshot {
                depth: q.depth(),
                in_flight: q.in_flight_summaries().into_iter().map(summarize).collect(),
            };
            PipelineSnapshot {
                written_at: unix_now(),
                download: stage(&qs.queues.download),
                process: stage(&qs.queues.process),
                upload: stage(&qs.queues.upload),
                retry_depth: qs.queues.retry.depth(),
                deferred_pending: ledger.pending_count(),
                cache_entries: cache.len(),
            }
        };
        if let Err(e) = snapshot.write(&inner.layout.snapshot_file()) {
            tracing::warn!("snapshot write failed: {}", e);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Picks up events the CLI dropped into the spool directory.
async fn spool_loop(inner: Arc<PipelineInner>) {
    loop {
        if inner.supervisor.is_shutdown() {
            break;
        }
        let spool = inner.layout.spool_dir();
        if let Ok(entries) = std::fs::read_dir(&spool) {
            let mut files: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
                .collect();
            files.sort();
            for file in files {
                match std::fs::read(&file)
                    .map_err(anyhow::Error::from)
                    .and_then(|b| serde_json::from_slice::<InboundEvent>(&b).map_err(Into::into))
                {
                    Ok(event) => {
                        if let Err(e) = inner.intake(event) {
                            tracing::warn!("spooled event intake failed: {e:#}");
                        }
                        let _ = std::fs::remove_file(&file);
                    }
                    Err(e) => {
                        tracing::warn!("unreadable spool file {}: {e:#}", file.display());
                        let _ = std::fs::rename(&file, file.with_extension("json.bad"));
                    }
                }
            }
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}
