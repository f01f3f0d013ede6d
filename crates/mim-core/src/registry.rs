//! Cleanup registries: refcounts tying extraction roots to their
//! outstanding uploads, and archives to their extraction roots.
//!
//! Pure bookkeeping; the upload worker (single writer) performs the actual
//! filesystem removals from the actions returned here. At startup the
//! refcounts are reseeded from the restored upload queue so the invariant
//! "refcount == outstanding upload tasks referencing the root" holds again.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct RootState {
    refcount: usize,
    archive_path: Option<PathBuf>,
    manifest_id: Option<String>,
    /// Extraction finished; the root may be removed once refcount is zero.
    extraction_done: bool,
}

/// Filesystem work owed after a decrement hit zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootCleanup {
    pub extraction_root: PathBuf,
    pub manifest_id: Option<String>,
    /// Set when this was the archive's last outstanding root.
    pub archive_path: Option<PathBuf>,
}

#[derive(Default)]
pub struct CleanupRegistry {
    roots: HashMap<PathBuf, RootState>,
    archives: HashMap<PathBuf, HashSet<PathBuf>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new extraction root produced from `archive_path`. Existing
    /// entries keep their refcount but gain any metadata they were missing
    /// (restored roots are seeded without it).
    pub fn register_root(
        &mut self,
        root: &Path,
        archive_path: Option<&Path>,
        manifest_id: Option<&str>,
    ) {
        let state = self
            .roots
            .entry(root.to_path_buf())
            .or_insert_with(|| RootState {
                refcount: 0,
                archive_path: None,
                manifest_id: None,
                extraction_done: false,
            });
        if state.archive_path.is_none() {
            state.archive_path = archive_path.map(Path::to_path_buf);
        }
        if state.manifest_id.is_none() {
            state.manifest_id = manifest_id.map(str::to_string);
        }
        if let Some(archive) = archive_path {
            self.archives
                .entry(archive.to_path_buf())
                .or_default()
                .insert(root.to_path_buf());
        }
    }

    /// Restoration found live extraction work for this root; cleanup must
    /// wait for `mark_extraction_done` again.
    pub fn mark_extraction_pending(&mut self, root: &Path) {
        let state = self
            .roots
            .entry(root.to_path_buf())
            .or_insert_with(|| RootState {
                refcount: 0,
                archive_path: None,
                manifest_id: None,
                extraction_done: false,
            });
        state.extraction_done = false;
    }

    /// One more outstanding upload references `root`.
    pub fn increment(&mut self, root: &Path) {
        if let Some(state) = self.roots.get_mut(root) {
            state.refcount += 1;
        } else {
            self.register_root(root, None, None);
            self.roots.get_mut(root).expect("just inserted").refcount = 1;
        }
    }

    /// Upload work for `root` finished (success or quarantine). Returns the
    /// cleanup owed when the last reference drops and extraction is done.
    pub fn decrement(&mut self, root: &Path) -> Option<RootCleanup> {
        let state = self.roots.get_mut(root)?;
        state.refcount = state.refcount.saturating_sub(1);
        if state.refcount > 0 || !state.extraction_done {
            return None;
        }
        let state = self.roots.remove(root)?;

        let archive_path = state.archive_path.and_then(|archive| {
            let roots = self.archives.get_mut(&archive)?;
            roots.remove(root);
            if roots.is_empty() {
                self.archives.remove(&archive);
                Some(archive)
            } else {
                None
            }
        });

        Some(RootCleanup {
            extraction_root: root.to_path_buf(),
            manifest_id: state.manifest_id,
            archive_path,
        })
    }

    /// Extraction for `root` has yielded its last entry. Returns immediate
    /// cleanup when no uploads are outstanding (e.g. an all-duplicate
    /// archive).
    pub fn mark_extraction_done(&mut self, root: &Path) -> Option<RootCleanup> {
        let state = self.roots.get_mut(root)?;
        state.extraction_done = true;
        if state.refcount == 0 {
            // Reuse the decrement path's zero handling.
            state.refcount = 1;
            return self.decrement(root);
        }
        None
    }

    pub fn refcount(&self, root: &Path) -> usize {
        self.roots.get(root).map(|s| s.refcount).unwrap_or(0)
    }

    /// Reseed after restore: refcounts equal the outstanding upload tasks
    /// per root found in the journals. Restored roots have no live
    /// extraction, so they are immediately eligible once drained.
    pub fn seed(&mut self, counts: &HashMap<PathBuf, usize>) {
        for (root, count) in counts {
            let state = self
                .roots
                .entry(root.clone())
                .or_insert_with(|| RootState {
                    refcount: 0,
                    archive_path: None,
                    manifest_id: None,
                    extraction_done: true,
                });
            state.refcount = *count;
            state.extraction_done = true;
        }
    }

    pub fn tracked_roots(&self) -> usize {
        self.roots.len()
    }
}
