//! In-memory stage queues over the journals, and the cross-stage operations
//! (`complete` with follow-ups, `fail` with classification, retry pumping).

use anyhow::Result;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use super::file::{JournalFile, JournalLine, LiveRecord};
use super::Stage;
use crate::failure::FailureClass;
use crate::paths::StateLayout;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::task::{TaskId, TaskRecord};

/// FIFO of pending records plus the set of records workers currently hold.
pub struct StageQueue {
    stage: Stage,
    journal: JournalFile,
    queue: VecDeque<TaskRecord>,
    in_flight: HashMap<TaskId, TaskRecord>,
}

impl StageQueue {
    pub fn open(stage: Stage, path: &Path) -> Result<Self> {
        let live = JournalFile::replay(path)?;
        let journal = JournalFile::open(path)?;
        Ok(Self {
            stage,
            journal,
            queue: live.into_iter().map(|l| l.record).collect(),
            in_flight: HashMap::new(),
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Append-persist then make visible to the worker. The fsync completes
    /// before this returns, so an executing worker always has a disk copy.
    pub fn enqueue(&mut self, record: TaskRecord) -> Result<()> {
        self.journal.append(&JournalLine::Push {
            record: record.clone(),
            home: None,
        })?;
        self.queue.push_back(record);
        Ok(())
    }

    /// Head inspection without removal.
    pub fn peek(&self) -> Option<&TaskRecord> {
        self.queue.front()
    }

    /// Pop the first record that is ready at `now` and not held back by the
    /// batcher. The record stays on disk and is tracked as in-flight.
    pub fn pop_ready(&mut self, now: i64, held: &HashSet<TaskId>) -> Option<TaskRecord> {
        let idx = self
            .queue
            .iter()
            .position(|r| r.ready_at(now) && !held.contains(&r.id))?;
        let record = self.queue.remove(idx)?;
        self.in_flight.insert(record.id, record.clone());
        Some(record)
    }

    /// Earliest `next_attempt_at` among queued-but-delayed records.
    pub fn next_delayed_at(&self, now: i64) -> Option<i64> {
        self.queue
            .iter()
            .filter(|r| !r.ready_at(now))
            .map(|r| r.next_attempt_at)
            .min()
    }

    /// True when some record is ready to pop at `now`.
    pub fn has_ready(&self, now: i64, held: &HashSet<TaskId>) -> bool {
        self.queue
            .iter()
            .any(|r| r.ready_at(now) && !held.contains(&r.id))
    }

    /// Put a popped record back at the head without touching the journal
    /// (its push line is still live). Used for cancel and auth pauses.
    pub fn release(&mut self, record: TaskRecord) {
        self.in_flight.remove(&record.id);
        self.queue.push_front(record);
    }

    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight_summaries(&self) -> Vec<&TaskRecord> {
        self.in_flight.values().collect()
    }

    /// No pending and no in-flight work.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskRecord> {
        self.queue.iter()
    }

    /// Remove a record by id (restore-time reconciliation). Appends a `done`
    /// line so the removal is durable.
    pub fn drop_record(&mut self, id: TaskId) {
        let before = self.queue.len();
        self.queue.retain(|r| r.id != id);
        if self.queue.len() != before {
            if let Err(e) = self.journal.append(&JournalLine::Done { id }) {
                tracing::warn!("journal done for dropped record {} failed: {}", id, e);
            }
        }
    }

    /// Rewrite the queue to exactly `records` (restore-time regrouping).
    /// The journal is compacted to match in one atomic swap.
    pub fn replace_all(&mut self, records: Vec<TaskRecord>) -> Result<()> {
        let live: Vec<LiveRecord> = records
            .iter()
            .map(|r| LiveRecord {
                record: r.clone(),
                home: None,
            })
            .collect();
        self.journal.compact(&live)?;
        self.queue = records.into();
        Ok(())
    }

    fn finish_in_flight(&mut self, id: TaskId) {
        self.in_flight.remove(&id);
    }

    fn live_view(&self) -> Vec<LiveRecord> {
        self.in_flight
            .values()
            .chain(self.queue.iter())
            .map(|r| LiveRecord {
                record: r.clone(),
                home: None,
            })
            .collect()
    }

    fn maybe_compact(&mut self) -> Result<()> {
        let live = self.live_view();
        self.journal.maybe_compact(&live)
    }
}

/// Delayed re-insertions waiting out a backoff, with their home stage.
pub struct RetryBin {
    journal: JournalFile,
    entries: Vec<(Stage, TaskRecord)>,
}

impl RetryBin {
    pub fn open(path: &Path) -> Result<Self> {
        let live = JournalFile::replay(path)?;
        let journal = JournalFile::open(path)?;
        let entries = live
            .into_iter()
            .map(|l| (l.home.unwrap_or(Stage::Download), l.record))
            .collect();
        Ok(Self { journal, entries })
    }

    pub fn push(&mut self, home: Stage, record: TaskRecord) -> Result<()> {
        self.journal.append(&JournalLine::Push {
            record: record.clone(),
            home: Some(home),
        })?;
        self.entries.push((home, record));
        Ok(())
    }

    /// Records whose delay has elapsed, in insertion order. Does not remove.
    pub fn peek_due(&self, now: i64) -> Vec<(Stage, TaskRecord)> {
        self.entries
            .iter()
            .filter(|(_, r)| r.ready_at(now))
            .cloned()
            .collect()
    }

    pub fn remove(&mut self, id: TaskId) -> Result<()> {
        self.entries.retain(|(_, r)| r.id != id);
        self.journal.append(&JournalLine::Done { id })?;
        let live: Vec<LiveRecord> = self
            .entries
            .iter()
            .map(|(s, r)| LiveRecord {
                record: r.clone(),
                home: Some(*s),
            })
            .collect();
        self.journal.maybe_compact(&live)?;
        Ok(())
    }

    /// Earliest wake-up among parked records.
    pub fn next_due(&self) -> Option<i64> {
        self.entries.iter().map(|(_, r)| r.next_attempt_at).min()
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Stage, TaskRecord)> {
        self.entries.iter()
    }
}

/// What `fail` did with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back at the head of its stage, untouched budget (cancel, auth pause).
    Requeued,
    /// Parked in the retry bin until the given unix time.
    Delayed { until: i64 },
    /// Non-retryable or out of budget; removed from the queue. The caller
    /// moves inputs to quarantine and records the terminal class.
    Quarantined,
}

/// The three stage queues plus the retry bin, moved as one unit.
pub struct QueueSet {
    pub download: StageQueue,
    pub process: StageQueue,
    pub upload: StageQueue,
    pub retry: RetryBin,
}

impl QueueSet {
    pub fn open(layout: &StateLayout) -> Result<Self> {
        Ok(Self {
            download: StageQueue::open(Stage::Download, &layout.stage_journal("download"))?,
            process: StageQueue::open(Stage::Process, &layout.stage_journal("process"))?,
            upload: StageQueue::open(Stage::Upload, &layout.stage_journal("upload"))?,
            retry: RetryBin::open(&layout.retry_journal())?,
        })
    }

    pub fn stage(&self, stage: Stage) -> &StageQueue {
        match stage {
            Stage::Download => &self.download,
            Stage::Process => &self.process,
            Stage::Upload => &self.upload,
        }
    }

    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageQueue {
        match stage {
            Stage::Download => &mut self.download,
            Stage::Process => &mut self.process,
            Stage::Upload => &mut self.upload,
        }
    }

    pub fn enqueue(&mut self, stage: Stage, record: TaskRecord) -> Result<()> {
        self.stage_mut(stage).enqueue(record)
    }

    /// Terminal success: persist follow-ups to their target stages, then
    /// remove the finished task. Crash between the two re-runs the task
    /// rather than losing the follow-ups.
    pub fn complete(
        &mut self,
        stage: Stage,
        id: TaskId,
        followups: Vec<(Stage, TaskRecord)>,
    ) -> Result<()> {
        for (target, record) in followups {
            self.stage_mut(target).enqueue(record)?;
        }
        let q = self.stage_mut(stage);
        q.finish_in_flight(id);
        q.journal.append(&JournalLine::Done { id })?;
        q.maybe_compact()?;
        Ok(())
    }

    /// Replace a set of individual upload records with one album record
    /// under a single fsync. Order within the journal moves the album to
    /// the append position, matching its in-memory placement.
    pub fn replace_upload(&mut self, ids: &[TaskId], album: TaskRecord) -> Result<()> {
        let mut lines: Vec<JournalLine> = ids.iter().map(|id| JournalLine::Done { id: *id }).collect();
        lines.push(JournalLine::Push {
            record: album.clone(),
            home: None,
        });
        self.upload.journal.append_batch(&lines)?;
        let remove: HashSet<TaskId> = ids.iter().copied().collect();
        self.upload.queue.retain(|r| !remove.contains(&r.id));
        self.upload.queue.push_back(album);
        self.upload.maybe_compact()?;
        Ok(())
    }

    /// Non-successful termination of an in-flight task.
    pub fn fail(
        &mut self,
        stage: Stage,
        mut record: TaskRecord,
        class: &FailureClass,
        policy: &RetryPolicy,
        now: i64,
    ) -> Result<FailOutcome> {
        record.last_error_class = Some(class.tag());

        // Cancel and auth pauses hold queue position and budget.
        if matches!(class, FailureClass::Canceled | FailureClass::Auth) {
            self.stage_mut(stage).release(record);
            return Ok(FailOutcome::Requeued);
        }

        let attempt = if class.consumes_budget() {
            record.retry_count + 1
        } else {
            record.retry_count.max(1)
        };

        match policy.decide(attempt, class) {
            RetryDecision::RetryAfter(delay) => {
                if class.consumes_budget() {
                    record.retry_count = attempt;
                }
                record.next_attempt_at = now + delay.as_secs() as i64;
                let until = record.next_attempt_at;
                let id = record.id;
                self.retry.push(stage, record)?;
                let q = self.stage_mut(stage);
                q.finish_in_flight(id);
                q.journal.append(&JournalLine::Done { id })?;
                q.maybe_compact()?;
                Ok(FailOutcome::Delayed { until })
            }
            RetryDecision::NoRetry => {
                let id = record.id;
                let q = self.stage_mut(stage);
                q.finish_in_flight(id);
                q.journal.append(&JournalLine::Done { id })?;
                q.maybe_compact()?;
                Ok(FailOutcome::Quarantined)
            }
        }
    }

    /// Move every due retry back to its home stage. Returns the stages that
    /// received work so the caller can wake their workers.
    pub fn pump_retries(&mut self, now: i64) -> Result<Vec<Stage>> {
        let due = self.retry.peek_due(now);
        let mut touched = Vec::new();
        for (home, record) in due {
            let id = record.id;
            self.stage_mut(home).enqueue(record)?;
            self.retry.remove(id)?;
            if !touched.contains(&home) {
                touched.push(home);
            }
        }
        Ok(touched)
    }

    /// All stage queues idle and nothing parked for retry.
    pub fn all_idle(&self) -> bool {
        self.download.is_idle()
            && self.process.is_idle()
            && self.upload.is_idle()
            && self.retry.depth() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{MediaKind, Task};
    use std::path::PathBuf;

    fn rec(id: TaskId) -> TaskRecord {
        TaskRecord::new(
            id,
            Task::DirectUpload {
                path: PathBuf::from(format!("/tmp/{id}.jpg")),
            },
            MediaKind::Image,
        )
    }

    fn open_set(dir: &Path) -> QueueSet {
        let layout = StateLayout::at(dir);
        layout.ensure_dirs().unwrap();
        QueueSet::open(&layout).unwrap()
    }

    #[test]
    fn fifo_pop_skips_delayed_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut qs = open_set(dir.path());

        let mut delayed = rec(1);
        delayed.next_attempt_at = 10_000;
        qs.enqueue(Stage::Upload, delayed).unwrap();
        qs.enqueue(Stage::Upload, rec(2)).unwrap();

        let held = HashSet::new();
        let popped = qs.upload.pop_ready(100, &held).unwrap();
        assert_eq!(popped.id, 2, "ready record yields past the delayed head");
        assert_eq!(qs.upload.next_delayed_at(100), Some(10_000));
    }

    #[test]
    fn complete_persists_followups_before_done() {
        let dir = tempfile::tempdir().unwrap();
        let mut qs = open_set(dir.path());
        qs.enqueue(Stage::Download, rec(1)).unwrap();
        let held = HashSet::new();
        let r = qs.download.pop_ready(0, &held).unwrap();
        qs.complete(Stage::Download, r.id, vec![(Stage::Process, rec(2))])
            .unwrap();

        // Reopen from disk: download drained, process holds the follow-up.
        drop(qs);
        let qs = open_set(dir.path());
        assert_eq!(qs.download.depth(), 0);
        assert_eq!(qs.process.depth(), 1);
        assert_eq!(qs.process.peek().unwrap().id, 2);
    }

    #[test]
    fn rate_limit_fail_schedules_exact_wait_without_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut qs = open_set(dir.path());
        qs.enqueue(Stage::Upload, rec(1)).unwrap();
        let held = HashSet::new();
        let r = qs.upload.pop_ready(0, &held).unwrap();

        let now = 1_000;
        let outcome = qs
            .fail(
                Stage::Upload,
                r,
                &FailureClass::RateLimit { wait_secs: 1678 },
                &RetryPolicy::default(),
                now,
            )
            .unwrap();
        assert_eq!(outcome, FailOutcome::Delayed { until: now + 1678 });

        let parked = qs.retry.iter().next().unwrap();
        assert_eq!(parked.1.retry_count, 0, "flood wait consumes no budget");
        assert_eq!(parked.1.next_attempt_at, now + 1678);

        // Not due yet, then due exactly at the boundary.
        assert!(qs.pump_retries(now + 1677).unwrap().is_empty());
        let touched = qs.pump_retries(now + 1678).unwrap();
        assert_eq!(touched, vec![Stage::Upload]);
        assert_eq!(qs.upload.depth(), 1);
    }

    #[test]
    fn budget_exhaustion_quarantines() {
        let dir = tempfile::tempdir().unwrap();
        let mut qs = open_set(dir.path());
        let policy = RetryPolicy::new(2, 1);

        let mut r = rec(1);
        r.retry_count = 1;
        qs.enqueue(Stage::Download, r).unwrap();
        let held = HashSet::new();
        let r = qs.download.pop_ready(0, &held).unwrap();
        let outcome = qs
            .fail(Stage::Download, r, &FailureClass::Network, &policy, 0)
            .unwrap();
        assert_eq!(outcome, FailOutcome::Quarantined);
        assert!(qs.download.is_idle());
    }

    #[test]
    fn canceled_holds_position_and_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut qs = open_set(dir.path());
        qs.enqueue(Stage::Download, rec(1)).unwrap();
        qs.enqueue(Stage::Download, rec(2)).unwrap();
        let held = HashSet::new();
        let r = qs.download.pop_ready(0, &held).unwrap();
        let outcome = qs
            .fail(
                Stage::Download,
                r,
                &FailureClass::Canceled,
                &RetryPolicy::default(),
                0,
            )
            .unwrap();
        assert_eq!(outcome, FailOutcome::Requeued);
        assert_eq!(qs.download.peek().unwrap().id, 1, "canceled task keeps its head slot");
        assert_eq!(qs.download.peek().unwrap().retry_count, 0);
    }

    #[test]
    fn replace_upload_swaps_singles_for_album() {
        let dir = tempfile::tempdir().unwrap();
        let mut qs = open_set(dir.path());
        for i in 1..=3 {
            qs.enqueue(Stage::Upload, rec(i)).unwrap();
        }
        let album = TaskRecord::new(
            10,
            Task::AlbumDispatch {
                items: vec![],
                batch_index: 1,
                total_batches_estimate: 1,
            },
            MediaKind::Image,
        );
        qs.replace_upload(&[1, 2], album).unwrap();

        let ids: Vec<TaskId> = qs.upload.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 10]);

        drop(qs);
        let qs = open_set(dir.path());
        let ids: Vec<TaskId> = qs.upload.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 10], "replacement survives restart");
    }

    #[test]
    fn held_records_are_not_popped() {
        let dir = tempfile::tempdir().unwrap();
        let mut qs = open_set(dir.path());
        qs.enqueue(Stage::Upload, rec(1)).unwrap();
        let mut held = HashSet::new();
        held.insert(1);
        assert!(qs.upload.pop_ready(0, &held).is_none());
        held.clear();
        assert!(qs.upload.pop_ready(0, &held).is_some());
    }
}
