//! Per-archive expansion manifest: total member count plus the set of
//! members already handed downstream. Written atomically after each entry
//! so a crash resumes exactly where extraction stopped.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpansionManifest {
    pub archive_name: String,
    pub archive_path: PathBuf,
    pub extraction_root: PathBuf,
    pub total_entries: usize,
    pub processed_entries: Vec<usize>,
    /// Members skipped as non-media, recorded for progress arithmetic.
    #[serde(default)]
    pub skipped_entries: Vec<usize>,
}

impl ExpansionManifest {
    pub fn new(
        archive_name: &str,
        archive_path: &Path,
        extraction_root: &Path,
        total_entries: usize,
    ) -> Self {
        Self {
            archive_name: archive_name.to_string(),
            archive_path: archive_path.to_path_buf(),
            extraction_root: extraction_root.to_path_buf(),
            total_entries,
            processed_entries: Vec::new(),
            skipped_entries: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read manifest: {}", path.display())),
        };
        let manifest = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse manifest: {}", path.display()))?;
        Ok(Some(manifest))
    }

    /// Atomic write: tmp sibling then rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create manifest dir: {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(&tmp, json).with_context(|| format!("write manifest: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("swap manifest: {}", path.display()))?;
        Ok(())
    }

    pub fn is_processed(&self, index: usize) -> bool {
        self.processed_entries.contains(&index) || self.skipped_entries.contains(&index)
    }

    pub fn mark_processed(&mut self, index: usize) {
        if !self.processed_entries.contains(&index) {
            self.processed_entries.push(index);
        }
    }

    pub fn mark_skipped(&mut self, index: usize) {
        if !self.skipped_entries.contains(&index) {
            self.skipped_entries.push(index);
        }
    }

    /// All members accounted for?
    pub fn is_complete(&self) -> bool {
        self.processed_entries.len() + self.skipped_entries.len() >= self.total_entries
    }

    /// Handled / total, for progress reporting.
    pub fn progress(&self) -> (usize, usize) {
        (
            self.processed_entries.len() + self.skipped_entries.len(),
            self.total_entries,
        )
    }
}

/// Stable manifest id for an archive path.
pub fn manifest_id_for(archive_path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(archive_path.as_os_str().as_encoded_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        let mut m = ExpansionManifest::new(
            "A.zip",
            Path::new("/tmp/A.zip"),
            Path::new("/tmp/extract/A"),
            5,
        );
        m.mark_processed(0);
        m.mark_skipped(1);
        m.save(&path).unwrap();

        let back = ExpansionManifest::load(&path).unwrap().unwrap();
        assert_eq!(back.total_entries, 5);
        assert!(back.is_processed(0));
        assert!(back.is_processed(1));
        assert!(!back.is_processed(2));
        assert_eq!(back.progress(), (2, 5));
        assert!(!back.is_complete());
    }

    #[test]
    fn complete_when_all_accounted() {
        let mut m = ExpansionManifest::new("A.zip", Path::new("/a"), Path::new("/b"), 2);
        m.mark_processed(0);
        m.mark_skipped(1);
        assert!(m.is_complete());
    }

    #[test]
    fn missing_manifest_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ExpansionManifest::load(&dir.path().join("nope.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn manifest_id_is_stable_and_short() {
        let a = manifest_id_for(Path::new("/tmp/A.zip"));
        let b = manifest_id_for(Path::new("/tmp/A.zip"));
        let c = manifest_id_for(Path::new("/tmp/B.zip"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
