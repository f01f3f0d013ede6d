//! Content cache: insertion-only set of fingerprints for processed payloads.
//!
//! Persistence is append-plus-rebuild: one JSON entry per line, appended on
//! insert, whole file replayed on load. The loader is corruption-tolerant:
//! lines that fail to parse are logged and dropped, and an unreadable file
//! starts an empty cache. No deeper recovery is attempted.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::fingerprint::intake_prekey;
use crate::task::unix_now;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub byte_size: u64,
    pub first_seen: i64,
    pub status: String,
    /// Original payload name when known; feeds the intake prekey index.
    #[serde(default)]
    pub name: Option<String>,
}

/// In-memory view plus the append handle.
pub struct ContentCache {
    path: PathBuf,
    fingerprints: HashSet<String>,
    prekeys: HashSet<String>,
}

impl ContentCache {
    /// Load the cache from `path`, tolerating a missing or corrupt file.
    pub fn load(path: &Path) -> Self {
        let mut fingerprints = HashSet::new();
        let mut prekeys = HashSet::new();

        match File::open(path) {
            Ok(f) => {
                for (lineno, line) in BufReader::new(f).lines().enumerate() {
                    let line = match line {
                        Ok(l) => l,
                        Err(e) => {
                            tracing::warn!("cache read failed at line {}: {}", lineno + 1, e);
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<CacheEntry>(&line) {
                        Ok(entry) => {
                            if let Some(name) = &entry.name {
                                prekeys.insert(intake_prekey(name, entry.byte_size));
                            }
                            fingerprints.insert(entry.fingerprint);
                        }
                        Err(e) => {
                            tracing::warn!("skipping bad cache line {}: {}", lineno + 1, e);
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!("cache unreadable, starting empty: {}", e);
            }
        }

        tracing::debug!(entries = fingerprints.len(), "content cache loaded");
        Self {
            path: path.to_path_buf(),
            fingerprints,
            prekeys,
        }
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.fingerprints.contains(fingerprint)
    }

    /// Intake-time duplicate check on `(name, exact-size)`.
    pub fn seen_prekey(&self, name: &str, size: u64) -> bool {
        self.prekeys.contains(&intake_prekey(name, size))
    }

    /// Insert after successful end-to-end completion. Appends to disk;
    /// idempotent in memory.
    pub fn insert(&mut self, fingerprint: &str, byte_size: u64, name: Option<&str>) -> Result<()> {
        if !self.fingerprints.insert(fingerprint.to_string()) {
            return Ok(());
        }
        if let Some(name) = name {
            self.prekeys.insert(intake_prekey(name, byte_size));
        }
        let entry = CacheEntry {
            fingerprint: fingerprint.to_string(),
            byte_size,
            first_seen: unix_now(),
            status: "completed".to_string(),
            name: name.map(str::to_string),
        };
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open cache for append: {}", self.path.display()))?;
        serde_json::to_writer(&mut f, &entry)?;
        f.write_all(b"\n")?;
        f.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}
