//! Post-download routing: fingerprint, dedup, then archive / video / direct
//! paths.

use std::path::Path;
use std::sync::Arc;

use super::PipelineInner;
use crate::failure::FailureClass;
use crate::fingerprint::fingerprint_path;
use crate::journal::Stage;
use crate::task::{MediaKind, Task, TaskRecord};

/// Route a fully materialized payload onward and complete its download
/// task. Duplicates (by content hash) terminate here with no follow-ups.
pub(super) async fn route_downloaded(
    inner: &Arc<PipelineInner>,
    record: TaskRecord,
    file: &Path,
) -> anyhow::Result<()> {
    let fingerprint = {
        let file = file.to_path_buf();
        tokio::task::spawn_blocking(move || fingerprint_path(&file)).await?
    };
    let fingerprint = match fingerprint {
        Ok(fp) => fp,
        Err(e) => {
            inner.handle_failure(
                Stage::Download,
                record,
                FailureClass::Unknown(format!("fingerprint failed: {e:#}")),
            )?;
            return Ok(());
        }
    };

    let byte_size = std::fs::metadata(file).map(|m| m.len()).unwrap_or(0);
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string);

    // Materialized duplicate: drop the payload, record the prekey, done.
    let duplicate = inner.cache.lock().unwrap().contains(&fingerprint);
    if duplicate {
        tracing::info!(task = record.id, fingerprint, "duplicate payload; skipping");
        inner.status_best_effort(
            record.source_ref.as_deref(),
            &format!("skipped duplicate content ({})", name.as_deref().unwrap_or("payload")),
        );
        let _ = std::fs::remove_file(file);
        let id = record.id;
        let mut qs = inner.queues.lock().unwrap();
        qs.queues.complete(Stage::Download, id, Vec::new())?;
        return Ok(());
    }

    // Oversize archives that lied about (or omitted) their size at intake.
    let kind = effective_kind(&record, file);
    if kind == MediaKind::Archive
        && inner.cfg.max_archive_size > 0
        && byte_size > inner.cfg.max_archive_size
    {
        inner.handle_failure(
            Stage::Download,
            record,
            FailureClass::Permanent("archive exceeds max_archive_size".into()),
        )?;
        return Ok(());
    }

    let followup = match kind {
        MediaKind::Archive => {
            let rec = TaskRecord::new(
                inner.alloc_id(),
                Task::Extract {
                    archive_path: file.to_path_buf(),
                },
                MediaKind::Archive,
            )
            .with_source(record.source_ref.clone())
            .with_fingerprint(Some(fingerprint.clone()));
            (Stage::Process, rec)
        }
        MediaKind::Video => {
            let rec = TaskRecord::new(
                inner.alloc_id(),
                Task::Normalize {
                    path: file.to_path_buf(),
                },
                MediaKind::Video,
            )
            .with_source(record.source_ref.clone())
            .with_fingerprint(Some(fingerprint.clone()))
            .with_cleanup(vec![file.to_path_buf()]);
            (Stage::Process, rec)
        }
        // Images and documents go straight to upload.
        _ => {
            let rec = TaskRecord::new(
                inner.alloc_id(),
                Task::DirectUpload {
                    path: file.to_path_buf(),
                },
                kind,
            )
            .with_source(record.source_ref.clone())
            .with_fingerprint(Some(fingerprint.clone()))
            .with_cleanup(vec![file.to_path_buf()]);
            (Stage::Upload, rec)
        }
    };

    let (stage, rec) = followup;
    let id = record.id;
    {
        let mut qs = inner.queues.lock().unwrap();
        qs.queues.complete(Stage::Download, id, vec![(stage, rec)])?;
    }
    inner.wake(stage);
    Ok(())
}

/// Intake kind, refined by the materialized filename when intake only knew
/// a generic link.
fn effective_kind(record: &TaskRecord, file: &Path) -> MediaKind {
    match record.kind {
        MediaKind::TextLink | MediaKind::Document => file
            .file_name()
            .and_then(|n| n.to_str())
            .map(MediaKind::from_filename)
            .unwrap_or(record.kind),
        kind => kind,
    }
}
