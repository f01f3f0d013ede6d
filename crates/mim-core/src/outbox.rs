//! Outbound messaging adapter seam.
//!
//! The kernel only ever talks to this trait; a concrete adapter (chat
//! runtime, etc.) maps its SDK errors onto `OutboxError` so the uploader
//! can apply the retry taxonomy. Flood waits must surface the exact number
//! of seconds the platform reported.
//!
//! `DirectoryOutbox` is the reference implementation: it delivers albums
//! into a local directory as a `message.json` plus file copies, which is
//! enough to run the whole pipeline end to end and to drive the CLI.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::failure::FailureClass;
use crate::task::MediaKind;

#[derive(Debug, Error)]
pub enum OutboxError {
    /// Platform flood-wait, in whole seconds as reported.
    #[error("rate limited for {wait_secs}s")]
    RateLimited { wait_secs: u64 },
    /// The named photo exceeds the platform byte limit.
    #[error("photo too large: {file}")]
    PhotoTooLarge { file: PathBuf },
    /// The platform rejected these media objects outright.
    #[error("media invalid: {files:?}")]
    MediaInvalid { files: Vec<PathBuf> },
    #[error("authorization expired")]
    Auth,
    #[error("transport failure: {0}")]
    Transport(String),
}

impl OutboxError {
    pub fn to_failure(&self) -> FailureClass {
        match self {
            OutboxError::RateLimited { wait_secs } => FailureClass::RateLimit {
                wait_secs: *wait_secs,
            },
            OutboxError::PhotoTooLarge { .. } => FailureClass::PhotoTooLarge,
            OutboxError::MediaInvalid { .. } => FailureClass::MediaInvalid,
            OutboxError::Auth => FailureClass::Auth,
            OutboxError::Transport(msg) => FailureClass::Unknown(msg.clone()),
        }
    }
}

/// Attributes attached to an outbound media item.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MediaAttributes {
    pub byte_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<PathBuf>,
}

/// One file handed to the adapter.
#[derive(Debug, Clone)]
pub struct OutboundFile {
    pub path: PathBuf,
    pub kind: MediaKind,
    pub attributes: MediaAttributes,
}

/// Resolved recipient entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRef(pub String);

#[async_trait]
pub trait Outbox: Send + Sync {
    /// May fail with `Auth` when the adapter's session expired.
    async fn resolve_target(&self, handle: &str) -> Result<TargetRef, OutboxError>;

    /// One multi-media message carrying files of a single kind.
    async fn send_album(
        &self,
        target: &TargetRef,
        kind: MediaKind,
        files: &[OutboundFile],
        caption: &str,
    ) -> Result<(), OutboxError>;

    async fn send_media(
        &self,
        target: &TargetRef,
        file: &OutboundFile,
        caption: &str,
    ) -> Result<(), OutboxError>;

    /// Best-effort operator-visible status line; adapters may rate-limit.
    async fn send_status(&self, target: &TargetRef, text: &str) -> Result<(), OutboxError>;
}

/// Local-directory delivery. Albums become numbered subdirectories holding
/// the files plus a `message.json` manifest.
pub struct DirectoryOutbox {
    delivery_dir: PathBuf,
    seq: AtomicU64,
}

impl DirectoryOutbox {
    pub fn new(delivery_dir: impl Into<PathBuf>) -> Self {
        Self {
            delivery_dir: delivery_dir.into(),
            seq: AtomicU64::new(1),
        }
    }

    fn next_message_dir(&self) -> PathBuf {
        loop {
            let n = self.seq.fetch_add(1, Ordering::Relaxed);
            let dir = self.delivery_dir.join(format!("msg-{n:06}"));
            if !dir.exists() {
                return dir;
            }
        }
    }

    fn deliver(
        &self,
        kind: MediaKind,
        files: &[OutboundFile],
        caption: &str,
    ) -> Result<(), OutboxError> {
        #[derive(Serialize)]
        struct Manifest<'a> {
            kind: &'a str,
            caption: &'a str,
            files: Vec<ManifestFile<'a>>,
        }
        #[derive(Serialize)]
        struct ManifestFile<'a> {
            name: String,
            attributes: &'a MediaAttributes,
        }

        let dir = self.next_message_dir();
        std::fs::create_dir_all(&dir).map_err(transport)?;

        let mut manifest_files = Vec::with_capacity(files.len());
        for file in files {
            let name = file
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("file")
                .to_string();
            std::fs::copy(&file.path, dir.join(&name)).map_err(transport)?;
            manifest_files.push(ManifestFile {
                name,
                attributes: &file.attributes,
            });
        }

        let manifest = Manifest {
            kind: kind.as_str(),
            caption,
            files: manifest_files,
        };
        let json = serde_json::to_vec_pretty(&manifest).map_err(|e| transport_str(e.to_string()))?;
        std::fs::write(dir.join("message.json"), json).map_err(transport)?;
        Ok(())
    }
}

#[async_trait]
impl Outbox for DirectoryOutbox {
    async fn resolve_target(&self, _handle: &str) -> Result<TargetRef, OutboxError> {
        std::fs::create_dir_all(&self.delivery_dir).map_err(transport)?;
        Ok(TargetRef(self.delivery_dir.display().to_string()))
    }

    async fn send_album(
        &self,
        _target: &TargetRef,
        kind: MediaKind,
        files: &[OutboundFile],
        caption: &str,
    ) -> Result<(), OutboxError> {
        self.deliver(kind, files, caption)
    }

    async fn send_media(
        &self,
        _target: &TargetRef,
        file: &OutboundFile,
        caption: &str,
    ) -> Result<(), OutboxError> {
        self.deliver(file.kind, std::slice::from_ref(file), caption)
    }

    async fn send_status(&self, _target: &TargetRef, text: &str) -> Result<(), OutboxError> {
        use std::io::Write;
        std::fs::create_dir_all(&self.delivery_dir).map_err(transport)?;
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.delivery_dir.join("status.log"))
            .map_err(transport)?;
        writeln!(f, "{text}").map_err(transport)?;
        Ok(())
    }
}

fn transport(e: std::io::Error) -> OutboxError {
    OutboxError::Transport(e.to_string())
}

fn transport_str(msg: String) -> OutboxError {
    OutboxError::Transport(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &Path) -> OutboundFile {
        OutboundFile {
            path: path.to_path_buf(),
            kind: MediaKind::Image,
            attributes: MediaAttributes {
                byte_size: 3,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn directory_outbox_delivers_album() {
        let src = tempfile::tempdir().unwrap();
        let delivery = tempfile::tempdir().unwrap();
        let a = src.path().join("a.jpg");
        let b = src.path().join("b.jpg");
        std::fs::write(&a, b"aaa").unwrap();
        std::fs::write(&b, b"bbb").unwrap();

        let outbox = DirectoryOutbox::new(delivery.path());
        let target = outbox.resolve_target("me").await.unwrap();
        outbox
            .send_album(
                &target,
                MediaKind::Image,
                &[file(&a), file(&b)],
                "A.zip – Images (Batch 1/1: 2 files)",
            )
            .await
            .unwrap();

        let msg_dir = delivery.path().join("msg-000001");
        assert!(msg_dir.join("a.jpg").exists());
        assert!(msg_dir.join("b.jpg").exists());
        let manifest = std::fs::read_to_string(msg_dir.join("message.json")).unwrap();
        assert!(manifest.contains("Batch 1/1"));
        assert!(manifest.contains("\"kind\": \"image\""));
    }

    #[tokio::test]
    async fn error_mapping_matches_taxonomy() {
        let e = OutboxError::RateLimited { wait_secs: 1678 };
        assert_eq!(e.to_failure(), FailureClass::RateLimit { wait_secs: 1678 });
        assert_eq!(OutboxError::Auth.to_failure(), FailureClass::Auth);
        assert_eq!(
            OutboxError::MediaInvalid { files: vec![] }.to_failure(),
            FailureClass::MediaInvalid
        );
    }
}
