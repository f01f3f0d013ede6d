//! Task model: the tagged variants flowing through the staged queues and
//! their persisted record form.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotone per-process task identifier, stable across restart when restored.
pub type TaskId = u64;

/// Media classification used for routing and album grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Document,
    Archive,
    TextLink,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Document => "document",
            MediaKind::Archive => "archive",
            MediaKind::TextLink => "text-link",
        }
    }

    /// Classify a filename by extension. Archives and the media classes the
    /// expander keeps; everything else is a document.
    pub fn from_filename(name: &str) -> MediaKind {
        let ext = name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" | "heic" => MediaKind::Image,
            "mp4" | "mkv" | "mov" | "avi" | "webm" | "wmv" | "flv" | "ts" | "m4v" | "3gp" => {
                MediaKind::Video
            }
            "zip" | "tar" | "gz" | "tgz" | "rar" | "7z" => MediaKind::Archive,
            _ => MediaKind::Document,
        }
    }

    pub fn is_media(self) -> bool {
        matches!(self, MediaKind::Image | MediaKind::Video)
    }
}

/// Context linking a task to the archive it came out of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveCtx {
    pub archive_name: String,
    pub extraction_root: PathBuf,
    pub manifest_id: String,
}

/// One file inside an album dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumItem {
    pub path: PathBuf,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// The work a task performs, tagged for persistence. Unknown discriminants
/// encountered during restore are skipped, so new variants can be added
/// without breaking older journals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Task {
    /// Materialize a URL into the download directory.
    Download {
        url: String,
        destination: PathBuf,
        #[serde(default)]
        expected_size: Option<u64>,
        #[serde(default)]
        auth_token: Option<String>,
    },
    /// Open an archive: count members, write the manifest, fan out entries.
    Extract { archive_path: PathBuf },
    /// Extract one member of an archive to the extraction root.
    ExpandEntry {
        archive_path: PathBuf,
        entry_index: usize,
        entry_name: String,
    },
    /// Decide passthrough / inline convert / defer for one video.
    Normalize { path: PathBuf },
    /// Record an incompatible video in the deferred conversion ledger.
    DeferredConvert { path: PathBuf },
    /// Upload one grouped album of a single kind.
    AlbumDispatch {
        items: Vec<AlbumItem>,
        batch_index: usize,
        total_batches_estimate: usize,
    },
    /// Upload a single file.
    DirectUpload { path: PathBuf },
    /// List a WebDAV collection and fan out file downloads.
    WebdavCrawl {
        url: String,
        #[serde(default)]
        auth_token: Option<String>,
    },
    /// Download one file discovered by a crawl.
    WebdavFile {
        url: String,
        destination: PathBuf,
        #[serde(default)]
        expected_size: Option<u64>,
        #[serde(default)]
        auth_token: Option<String>,
    },
}

impl Task {
    /// Discriminant name, for logs and the quarantine index.
    pub fn op_name(&self) -> &'static str {
        match self {
            Task::Download { .. } => "download",
            Task::Extract { .. } => "extract",
            Task::ExpandEntry { .. } => "expand_entry",
            Task::Normalize { .. } => "normalize",
            Task::DeferredConvert { .. } => "deferred_convert",
            Task::AlbumDispatch { .. } => "album_dispatch",
            Task::DirectUpload { .. } => "direct_upload",
            Task::WebdavCrawl { .. } => "webdav_crawl",
            Task::WebdavFile { .. } => "webdav_file",
        }
    }
}

/// Persisted task record: the task plus the common fields every stage
/// tracks. This is what journal `push` lines carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task: Task,
    pub kind: MediaKind,
    /// Opaque handle to the originating event; None for restored tasks, so
    /// every user-visible reply gated on it is best-effort.
    #[serde(default)]
    pub source_ref: Option<String>,
    #[serde(default)]
    pub archive_ctx: Option<ArchiveCtx>,
    /// Content hash of the payload once known; used for cache insertion on
    /// terminal success.
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    /// Unix seconds; 0 means ready now.
    #[serde(default)]
    pub next_attempt_at: i64,
    #[serde(default)]
    pub last_error_class: Option<String>,
    /// Files to unlink when this task's terminal step succeeds.
    #[serde(default)]
    pub cleanup_refs: Vec<PathBuf>,
}

impl TaskRecord {
    pub fn new(id: TaskId, task: Task, kind: MediaKind) -> Self {
        Self {
            id,
            task,
            kind,
            source_ref: None,
            archive_ctx: None,
            fingerprint: None,
            retry_count: 0,
            next_attempt_at: 0,
            last_error_class: None,
            cleanup_refs: Vec::new(),
        }
    }

    pub fn with_source(mut self, source_ref: Option<String>) -> Self {
        self.source_ref = source_ref;
        self
    }

    pub fn with_archive_ctx(mut self, ctx: Option<ArchiveCtx>) -> Self {
        self.archive_ctx = ctx;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: Option<String>) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    pub fn with_cleanup(mut self, refs: Vec<PathBuf>) -> Self {
        self.cleanup_refs = refs;
        self
    }

    /// Ready to run at `now` (unix seconds)?
    pub fn ready_at(&self, now: i64) -> bool {
        self.next_attempt_at <= now
    }
}

/// Current unix time in whole seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_filename() {
        assert_eq!(MediaKind::from_filename("a.JPG"), MediaKind::Image);
        assert_eq!(MediaKind::from_filename("clip.mkv"), MediaKind::Video);
        assert_eq!(MediaKind::from_filename("bundle.tar"), MediaKind::Archive);
        assert_eq!(MediaKind::from_filename("notes.txt"), MediaKind::Document);
        assert_eq!(MediaKind::from_filename("noext"), MediaKind::Document);
    }

    #[test]
    fn record_roundtrips_through_json() {
        let rec = TaskRecord::new(
            7,
            Task::Download {
                url: "https://cdn.example/file.zip".into(),
                destination: PathBuf::from("/tmp/file.zip"),
                expected_size: Some(1024),
                auth_token: None,
            },
            MediaKind::Archive,
        )
        .with_cleanup(vec![PathBuf::from("/tmp/file.zip")]);

        let json = serde_json::to_string(&rec).unwrap();
        let back: TaskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
        assert!(json.contains("\"op\":\"download\""));
    }

    #[test]
    fn legacy_record_missing_fields_fills_defaults() {
        // A minimal record as an older build would have written it.
        let json = r#"{
            "id": 3,
            "task": {"op": "direct_upload", "path": "/x/a.jpg"},
            "kind": "image"
        }"#;
        let rec: TaskRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.retry_count, 0);
        assert_eq!(rec.next_attempt_at, 0);
        assert!(rec.cleanup_refs.is_empty());
        assert!(rec.source_ref.is_none());
    }

    #[test]
    fn unknown_discriminant_fails_parse() {
        let json = r#"{
            "id": 4,
            "task": {"op": "teleport", "path": "/x"},
            "kind": "image"
        }"#;
        assert!(serde_json::from_str::<TaskRecord>(json).is_err());
    }

    #[test]
    fn readiness_follows_next_attempt() {
        let mut rec = TaskRecord::new(
            1,
            Task::DirectUpload { path: PathBuf::from("/a") },
            MediaKind::Image,
        );
        assert!(rec.ready_at(100));
        rec.next_attempt_at = 200;
        assert!(!rec.ready_at(100));
        assert!(rec.ready_at(200));
    }
}
