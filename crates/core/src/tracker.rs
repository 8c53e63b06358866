//! Concurrent map from media id to job state.
//!
//! Every transition for one id happens under that id's map entry, so it is
//! atomic with respect to other callers; unrelated ids live in other shards
//! and do not contend. No entry guard is ever held across an `.await`.

use crate::error::SubmitError;
use crate::models::{JobState, MediaItem};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Point-in-time copy of a tracked job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub item: MediaItem,
    pub state: JobState,
    pub updated_at: DateTime<Utc>,
    /// Monotonic across all jobs; orders journal writes.
    pub revision: u64,
}

struct JobEntry {
    item: MediaItem,
    state: JobState,
    updated_at: DateTime<Utc>,
    revision: u64,
    cancel: CancellationToken,
    watch: watch::Sender<JobState>,
}

impl JobEntry {
    fn new(item: MediaItem, state: JobState, updated_at: DateTime<Utc>, revision: u64) -> Self {
        let (watch, _) = watch::channel(state.clone());
        Self {
            item,
            state,
            updated_at,
            revision,
            cancel: CancellationToken::new(),
            watch,
        }
    }

    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            item: self.item.clone(),
            state: self.state.clone(),
            updated_at: self.updated_at,
            revision: self.revision,
        }
    }
}

#[derive(Default)]
pub struct JobTracker {
    jobs: DashMap<String, JobEntry>,
    revision: AtomicU64,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Registers `item` as Pending. Fails with `DuplicateInFlight` when a job
    /// for the same id has not reached a terminal state; a terminal job is
    /// replaced by a fresh cycle.
    pub fn begin(&self, item: MediaItem) -> Result<(JobSnapshot, CancellationToken), SubmitError> {
        // Revisions are drawn while the entry is locked so that per-id order
        // matches the order of the writes.
        match self.jobs.entry(item.id.clone()) {
            Entry::Occupied(mut existing) => {
                if !existing.get().state.is_terminal() {
                    return Err(SubmitError::DuplicateInFlight(existing.key().clone()));
                }
                let entry = JobEntry::new(item, JobState::Pending, Utc::now(), self.next_revision());
                let out = (entry.snapshot(), entry.cancel.clone());
                existing.insert(entry);
                Ok(out)
            }
            Entry::Vacant(slot) => {
                let entry = JobEntry::new(item, JobState::Pending, Utc::now(), self.next_revision());
                let out = (entry.snapshot(), entry.cancel.clone());
                slot.insert(entry);
                Ok(out)
            }
        }
    }

    /// Moves the job to `state` and wakes its watchers. Returns `None` for an
    /// unknown id.
    pub fn transition(&self, id: &str, state: JobState) -> Option<JobSnapshot> {
        let mut entry = self.jobs.get_mut(id)?;
        entry.state = state.clone();
        entry.updated_at = Utc::now();
        entry.revision = self.next_revision();
        entry.watch.send_replace(state);
        Some(entry.snapshot())
    }

    pub fn get(&self, id: &str) -> Option<JobSnapshot> {
        self.jobs.get(id).map(|e| e.snapshot())
    }

    pub fn subscribe(&self, id: &str) -> Option<watch::Receiver<JobState>> {
        self.jobs.get(id).map(|e| e.watch.subscribe())
    }

    /// Requests cancellation of a live job. Returns false when the id is
    /// unknown or already terminal.
    pub fn cancel(&self, id: &str) -> bool {
        match self.jobs.get(id) {
            Some(entry) if !entry.state.is_terminal() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Inserts a job recovered from the journal unless the id is already
    /// tracked. Returns whether it was inserted.
    pub fn restore(&self, snapshot: JobSnapshot) -> bool {
        self.revision.fetch_max(snapshot.revision, Ordering::SeqCst);
        match self.jobs.entry(snapshot.item.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(JobEntry::new(
                    snapshot.item,
                    snapshot.state,
                    snapshot.updated_at,
                    snapshot.revision,
                ));
                true
            }
        }
    }

    /// Drops terminal jobs last updated before `cutoff`; returns their ids.
    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut purged = Vec::new();
        self.jobs.retain(|id, entry| {
            let expired = entry.state.is_terminal() && entry.updated_at < cutoff;
            if expired {
                purged.push(id.clone());
            }
            !expired
        });
        purged
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
