//! Deferred-conversion worker: drains the ledger only when no live work
//! remains in the download or upload stages (starvation of live uploads is
//! structurally impossible).

use std::sync::Arc;
use std::time::Duration;

use super::PipelineInner;
use crate::failure::FailureClass;
use crate::fetcher::ProgressThrottle;
use crate::fingerprint::fingerprint_path;
use crate::journal::Stage;
use crate::ledger::ConversionStatus;
use crate::task::{MediaKind, Task, TaskRecord};

pub(super) async fn run(inner: Arc<PipelineInner>) {
    loop {
        if inner.supervisor.is_shutdown() {
            break;
        }

        // A download/upload task parked in the retry bin is still present
        // in its stage, just delayed; it blocks deferred work like any
        // queued task.
        let eligible = {
            let qs = inner.queues.lock().unwrap();
            qs.queues.download.is_idle()
                && qs.queues.upload.is_idle()
                && qs
                    .queues
                    .retry
                    .iter()
                    .all(|(home, _)| !matches!(home, Stage::Download | Stage::Upload))
        };
        let has_pending = inner.ledger.lock().unwrap().has_pending();
        if !eligible || !has_pending {
            tokio::select! {
                _ = inner.notify.deferred.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs(15)) => {}
            }
            continue;
        }

        let claimed = inner.ledger.lock().unwrap().claim_next();
        let entry = match claimed {
            Ok(Some(entry)) => entry,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!("ledger claim failed: {e:#}");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        if let Err(e) = convert(&inner, entry).await {
            tracing::error!("deferred conversion internal error: {e:#}");
        }
    }
    tracing::debug!("deferred worker stopped");
}

async fn convert(
    inner: &Arc<PipelineInner>,
    entry: crate::ledger::ConversionEntry,
) -> anyhow::Result<()> {
    let input = entry.input_path.clone();
    let output = entry.output_path.clone();
    tracing::info!(input = %input.display(), "deferred conversion starting");

    let duration_hint = {
        let encoder = Arc::clone(&inner.encoder);
        let input = input.clone();
        tokio::task::spawn_blocking(move || encoder.probe(&input))
            .await?
            .ok()
            .and_then(|p| p.duration_secs)
    };

    // The throttle's interval doubles as the ledger write cadence.
    let progress = {
        let inner = Arc::clone(inner);
        let input = input.clone();
        ProgressThrottle::new(
            1,
            Duration::from_secs(inner.cfg.conversion.state_save_interval),
            Some(Box::new(move |p| {
                if let Some(pct) = p.percent {
                    let _ = inner
                        .ledger
                        .lock()
                        .unwrap()
                        .update_progress(&input, pct);
                }
            })),
        )
    };

    let result = {
        let encoder = Arc::clone(&inner.encoder);
        let input = input.clone();
        let output = output.clone();
        let timeout = Duration::from_secs(inner.cfg.transcode.timeout);
        let abort = inner.supervisor.cancel_flag();
        tokio::task::spawn_blocking(move || {
            let mut progress = progress;
            encoder.normalize(&input, &output, duration_hint, timeout, &mut progress, Some(abort))
        })
        .await?
    };

    match result {
        Ok(normalized) => {
            inner.ledger.lock().unwrap().mark_completed(&input)?;

            let fingerprint = {
                let path = normalized.path.clone();
                tokio::task::spawn_blocking(move || fingerprint_path(&path)).await?
            }
            .ok();

            let mut cleanup = vec![input.clone(), normalized.path.clone()];
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
            .with_archive_ctx(entry.archive_ctx.clone())
            .with_fingerprint(fingerprint)
            .with_cleanup(cleanup);
            inner.enqueue_and_wake(Stage::Upload, upload)?;

            tracing::info!(
                input = %input.display(),
                output = %normalized.path.display(),
                "deferred conversion complete"
            );
            Ok(())
        }
        Err(FailureClass::Canceled) => {
            // Shutdown mid-encode: the entry stays in_progress and the next
            // startup's recovery pass requeues it from scratch.
            tracing::info!(input = %input.display(), "deferred conversion canceled by shutdown");
            Ok(())
        }
        Err(class) => {
            let status = inner.ledger.lock().unwrap().mark_failed(
                &input,
                &class.to_string(),
                inner.cfg.conversion.max_retries,
            )?;
            tracing::warn!(
                input = %input.display(),
                class = class.tag(),
                ?status,
                "deferred conversion failed"
            );
            if status == ConversionStatus::Failed {
                inner.quarantine_file(&input, 0, "conversion_failed");
                if let Some(ctx) = &entry.archive_ctx {
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
            Ok(())
        }
    }
}
