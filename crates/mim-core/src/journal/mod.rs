//! Durable staged queues over line-appended journals.
//!
//! Each stage owns an ordered task list persisted as a journal of `push` /
//! `done` lines with periodic compaction, plus a single in-flight slot. A
//! fourth journal (`queue/retry.log`) holds delayed re-insertions so ready
//! work never queues behind a backoff.
//!
//! Durability contract:
//! - a task exists on disk before any worker executes it (push is fsynced
//!   before the worker is notified);
//! - `complete` appends follow-ups to their target journals before the
//!   `done` line hits the source journal, so a crash between the two yields
//!   a duplicate run, never a lost task (at-least-once, deduplicated by
//!   content fingerprint downstream).

mod file;
mod queue;
mod restore;

pub use file::{JournalFile, JournalLine};
pub use queue::{FailOutcome, QueueSet, RetryBin, StageQueue};
pub use restore::{restore_queues, RestoreReport};

use serde::{Deserialize, Serialize};

/// The three primary stages. Subordinate archive/conversion work flows
/// through Process; delayed retries live in the retry bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Process,
    Upload,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Process => "process",
            Stage::Upload => "upload",
        }
    }

    pub const ALL: [Stage; 3] = [Stage::Download, Stage::Process, Stage::Upload];
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
