//! Download-stage worker: resumable fetches and WebDAV crawls.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{router, PipelineInner};
use crate::failure::FailureClass;
use crate::fetcher::{self, FetchRequest, ProgressThrottle};
use crate::journal::Stage;
use crate::task::{unix_now, MediaKind, Task, TaskRecord};
use crate::webdav;

pub(super) async fn run(inner: Arc<PipelineInner>) {
    let cancel = inner.supervisor.cancel_flag();
    loop {
        if inner.supervisor.is_shutdown() {
            break;
        }
        // The admission gate is observed between tasks, never mid-task.
        inner.supervisor.admission.wait_open(&cancel).await;
        if inner.supervisor.is_shutdown() {
            break;
        }

        let record = {
            let mut qs = inner.queues.lock().unwrap();
            qs.queues.download.pop_ready(unix_now(), &HashSet::new())
        };
        let Some(record) = record else {
            wait_for_work(&inner).await;
            continue;
        };

        if let Err(e) = execute(&inner, record).await {
            tracing::error!("download worker internal error: {e:#}");
        }
    }
    tracing::debug!("download worker stopped");
}

async fn wait_for_work(inner: &Arc<PipelineInner>) {
    let sleep_secs = {
        let qs = inner.queues.lock().unwrap();
        match qs.queues.download.next_delayed_at(unix_now()) {
            Some(at) => (at - unix_now()).clamp(1, 30) as u64,
            None => 30,
        }
    };
    tokio::select! {
        _ = inner.notify.download.notified() => {}
        _ = tokio::time::sleep(Duration::from_secs(sleep_secs)) => {}
    }
}

async fn execute(inner: &Arc<PipelineInner>, record: TaskRecord) -> anyhow::Result<()> {
    match record.task.clone() {
        Task::Download {
            url,
            destination,
            expected_size,
            auth_token,
        }
        | Task::WebdavFile {
            url,
            destination,
            expected_size,
            auth_token,
        } => {
            run_fetch(inner, record, url, destination, expected_size, auth_token).await
        }
        Task::WebdavCrawl { url, auth_token } => run_crawl(inner, record, url, auth_token).await,
        other => {
            tracing::error!(op = other.op_name(), "non-download task in download stage");
            inner.handle_failure(
                Stage::Download,
                record,
                FailureClass::Permanent("task routed to wrong stage".into()),
            )?;
            Ok(())
        }
    }
}

async fn run_fetch(
    inner: &Arc<PipelineInner>,
    record: TaskRecord,
    url: String,
    destination: std::path::PathBuf,
    expected_size: Option<u64>,
    auth_token: Option<String>,
) -> anyhow::Result<()> {
    tracing::info!(task = record.id, url, dest = %destination.display(), "fetch starting");

    // Per-fetch abort flag: set by operator cancel or shutdown.
    let abort = Arc::new(AtomicBool::new(false));
    *inner.current_fetch_abort.lock().unwrap() = Some(Arc::clone(&abort));
    let shutdown_watch = {
        let abort = Arc::clone(&abort);
        let supervisor = Arc::clone(&inner.supervisor);
        tokio::spawn(async move {
            while !supervisor.is_shutdown() {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            abort.store(true, Ordering::Relaxed);
        })
    };

    let task_id = record.id;
    let progress = ProgressThrottle::new(
        inner.cfg.progress.min_percent_step,
        Duration::from_secs(inner.cfg.progress.min_interval_secs),
        Some(Box::new(move |p| {
            tracing::debug!(
                task = task_id,
                bytes = p.bytes_done,
                percent = p.percent,
                "fetch progress"
            );
        })),
    );

    let fetch_result = {
        let url = url.clone();
        let destination = destination.clone();
        let chunk_size = inner.cfg.fetch.chunk_size;
        let inactivity = Duration::from_secs(inner.cfg.fetch.inactivity_timeout);
        let abort = Arc::clone(&abort);
        tokio::task::spawn_blocking(move || {
            let req = FetchRequest {
                url: &url,
                destination: &destination,
                expected_size,
                chunk_size,
                inactivity_timeout: inactivity,
                auth_token: auth_token.as_deref(),
            };
            fetcher::fetch_to_path(&req, Some(abort), progress)
        })
        .await?
    };

    shutdown_watch.abort();
    *inner.current_fetch_abort.lock().unwrap() = None;

    match fetch_result {
        Ok(outcome) => {
            tracing::info!(
                task = record.id,
                bytes = outcome.final_size,
                resumed_from = outcome.resumed_from,
                "fetch complete"
            );
            router::route_downloaded(inner, record, &destination).await
        }
        Err(class) => {
            // Integrity restarts want a clean slate on the next attempt.
            if class.restart_from_zero() {
                let _ = std::fs::remove_file(fetcher::part_path(&destination));
            }
            inner.handle_failure(Stage::Download, record, class)?;
            Ok(())
        }
    }
}

async fn run_crawl(
    inner: &Arc<PipelineInner>,
    record: TaskRecord,
    url: String,
    auth_token: Option<String>,
) -> anyhow::Result<()> {
    tracing::info!(task = record.id, url, "webdav crawl starting");

    let crawl_result = {
        let url = url.clone();
        let auth = auth_token.clone();
        tokio::task::spawn_blocking(move || webdav::crawl_collection(&url, auth.as_deref())).await?
    };

    let entries = match crawl_result {
        Ok(entries) => entries,
        Err(class) => {
            inner.handle_failure(Stage::Download, record, class)?;
            return Ok(());
        }
    };

    let mut followups = Vec::new();
    let mut skipped = 0usize;
    for entry in entries {
        if entry.is_collection {
            followups.push((
                Stage::Download,
                TaskRecord::new(
                    inner.alloc_id(),
                    Task::WebdavCrawl {
                        url: entry.url,
                        auth_token: auth_token.clone(),
                    },
                    MediaKind::TextLink,
                )
                .with_source(record.source_ref.clone()),
            ));
            continue;
        }
        let kind = MediaKind::from_filename(&entry.name);
        if !kind.is_media() && kind != MediaKind::Archive {
            skipped += 1;
            continue;
        }
        if let Some(size) = entry.size {
            if inner.cache.lock().unwrap().seen_prekey(&entry.name, size) {
                tracing::debug!(name = entry.name, "crawl entry already ingested");
                continue;
            }
        }
        let destination = inner.unique_download_path(&entry.name);
        followups.push((
            Stage::Download,
            TaskRecord::new(
                inner.alloc_id(),
                Task::WebdavFile {
                    url: entry.url,
                    destination,
                    expected_size: entry.size,
                    auth_token: auth_token.clone(),
                },
                kind,
            )
            .with_source(record.source_ref.clone()),
        ));
    }

    tracing::info!(
        task = record.id,
        files = followups.len(),
        skipped,
        "webdav crawl complete"
    );
    let id = record.id;
    {
        let mut qs = inner.queues.lock().unwrap();
        qs.queues.complete(Stage::Download, id, followups)?;
    }
    inner.wake(Stage::Download);
    Ok(())
}
