//! Live job registry.
//!
//! Every job in progress owns a slot holding its record behind a
//! dedicated mutex, plus lock-free mirrors of its status and priority.
//! The mirrors let the scheduler filter and order jobs without taking
//! any lock; they are refreshed each time a guard is released, so they
//! only ever lag the record, never invent a state.
//!
//! A slot is only removed by [`JobRegistry::evict`], which demands the
//! caller's own guard. Anyone blocked on the mutex at that moment will
//! acquire it, notice the slot is gone and report the job as absent.

use std::collections::HashSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::error::{Result, SchedulerError};
use crate::model::{JobId, JobPriority, JobRecord, JobStatus};

#[derive(Debug)]
struct JobSlot {
    record: Arc<Mutex<JobRecord>>,
    status: AtomicU8,
    priority: AtomicU8,
}

/// Exclusive access to one job record.
///
/// Derefs to [`JobRecord`]. Dropping the guard publishes the record's
/// current status and priority to the slot mirrors, then releases the
/// lock.
pub struct JobGuard {
    slot: Arc<JobSlot>,
    inner: ArcMutexGuard<RawMutex, JobRecord>,
}

impl JobGuard {
    pub fn id(&self) -> JobId {
        self.inner.id
    }
}

impl Deref for JobGuard {
    type Target = JobRecord;

    fn deref(&self) -> &JobRecord {
        &self.inner
    }
}

impl DerefMut for JobGuard {
    fn deref_mut(&mut self) -> &mut JobRecord {
        &mut self.inner
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.slot
            .status
            .store(self.inner.status.as_u8(), Ordering::Release);
        self.slot
            .priority
            .store(self.inner.priority.as_u8(), Ordering::Release);
    }
}

impl fmt::Debug for JobGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("JobGuard").field(&self.inner.id).finish()
    }
}

/// Outcome of a non-blocking lock attempt.
#[derive(Debug)]
pub enum TryLockJob {
    Locked(JobGuard),
    /// Someone else holds the job. Carries the mirrored priority so the
    /// scheduler can decide whether the contention matters.
    Contended(JobPriority),
    Absent,
}

/// All jobs currently alive, keyed by id.
#[derive(Debug, Default)]
pub struct JobRegistry {
    slots: DashMap<JobId, Arc<JobSlot>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a job and returns it already locked, so the caller can
    /// finish populating state before anyone else can observe it.
    pub fn register(&self, record: JobRecord) -> Result<JobGuard> {
        let id = record.id;
        let slot = Arc::new(JobSlot {
            status: AtomicU8::new(record.status.as_u8()),
            priority: AtomicU8::new(record.priority.as_u8()),
            record: Arc::new(Mutex::new(record)),
        });
        let guard = JobGuard {
            inner: slot.record.lock_arc(),
            slot: Arc::clone(&slot),
        };
        match self.slots.entry(id) {
            Entry::Occupied(_) => Err(SchedulerError::DuplicateJob(id)),
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                Ok(guard)
            }
        }
    }

    /// Blocks until the job's lock is held, or returns `None` for a job
    /// that is absent or got evicted while we waited. The slot is
    /// re-checked after acquisition: a guard is only handed out for a
    /// slot still present in the map.
    pub fn lock(&self, id: JobId) -> Option<JobGuard> {
        loop {
            let slot = Arc::clone(self.slots.get(&id)?.value());
            let inner = slot.record.lock_arc();
            match self.slots.get(&id) {
                Some(current) if Arc::ptr_eq(current.value(), &slot) => {
                    return Some(JobGuard { slot, inner });
                }
                // Replaced under us. Retry against the new slot.
                Some(_) => continue,
                None => return None,
            }
        }
    }

    /// Non-blocking variant of [`lock`](Self::lock). Contention reports
    /// the mirrored priority instead of waiting.
    pub fn try_lock(&self, id: JobId) -> TryLockJob {
        let Some(entry) = self.slots.get(&id) else {
            return TryLockJob::Absent;
        };
        let slot = Arc::clone(entry.value());
        drop(entry);
        match slot.record.try_lock_arc() {
            Some(inner) => {
                let still_live = self
                    .slots
                    .get(&id)
                    .map(|current| Arc::ptr_eq(current.value(), &slot))
                    .unwrap_or(false);
                if still_live {
                    TryLockJob::Locked(JobGuard { slot, inner })
                } else {
                    TryLockJob::Absent
                }
            }
            None => {
                let priority = JobPriority::from_u8(slot.priority.load(Ordering::Acquire));
                TryLockJob::Contended(priority)
            }
        }
    }

    /// Locks several jobs in the order given, skipping duplicates and
    /// jobs that are gone.
    pub fn lock_many(&self, ids: &[JobId]) -> Vec<JobGuard> {
        let mut seen = HashSet::new();
        ids.iter()
            .filter(|id| seen.insert(**id))
            .filter_map(|id| self.lock(*id))
            .collect()
    }

    /// Removes the job's slot. Requires the caller's guard, which
    /// proves the lock is held and names the exact slot to drop.
    pub(crate) fn evict(&self, guard: &JobGuard) {
        self.slots
            .remove_if(&guard.id(), |_, slot| Arc::ptr_eq(slot, &guard.slot));
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.slots.iter().map(|entry| *entry.key()).collect()
    }

    /// Status as of the last time the job's guard was released.
    pub fn mirrored_status(&self, id: JobId) -> Option<JobStatus> {
        self.slots
            .get(&id)
            .map(|entry| JobStatus::from_u8(entry.status.load(Ordering::Acquire)))
    }

    /// Priority as of the last time the job's guard was released.
    pub fn mirrored_priority(&self, id: JobId) -> Option<JobPriority> {
        self.slots
            .get(&id)
            .map(|entry| JobPriority::from_u8(entry.priority.load(Ordering::Acquire)))
    }

    /// Mirrored view of every live job, without taking any job lock.
    pub fn snapshot(&self) -> Vec<(JobId, JobStatus, JobPriority)> {
        self.slots
            .iter()
            .map(|entry| {
                (
                    *entry.key(),
                    JobStatus::from_u8(entry.status.load(Ordering::Acquire)),
                    JobPriority::from_u8(entry.priority.load(Ordering::Acquire)),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn job() -> JobRecord {
        JobRecord::new("demo", "alice")
    }

    #[test]
    fn register_then_lock_round_trips() {
        let registry = JobRegistry::new();
        let record = job();
        let id = record.id;

        let guard = registry.register(record).unwrap();
        assert_eq!(guard.id(), id);
        drop(guard);

        let guard = registry.lock(id).unwrap();
        assert_eq!(guard.name, "demo");
        assert_eq!(registry.mirrored_status(id), Some(JobStatus::Pending));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = JobRegistry::new();
        let record = job();
        let copy = record.clone();

        let guard = registry.register(record).unwrap();
        drop(guard);
        assert!(matches!(
            registry.register(copy),
            Err(SchedulerError::DuplicateJob(_))
        ));
    }

    #[test]
    fn lock_of_unknown_job_is_none() {
        let registry = JobRegistry::new();
        assert!(registry.lock(JobId::new()).is_none());
        assert!(matches!(registry.try_lock(JobId::new()), TryLockJob::Absent));
    }

    #[test]
    fn evict_requires_guard_and_removes_slot() {
        let registry = JobRegistry::new();
        let record = job();
        let id = record.id;

        let guard = registry.register(record).unwrap();
        registry.evict(&guard);
        drop(guard);

        assert!(!registry.contains(id));
        assert!(registry.lock(id).is_none());
    }

    #[test]
    fn mirrors_refresh_when_guard_drops() {
        let registry = JobRegistry::new();
        let record = job();
        let id = record.id;

        let mut guard = registry.register(record).unwrap();
        guard.status = JobStatus::Running;
        guard.priority = JobPriority::Highest;
        // Still the registration-time values while the guard is held.
        assert_eq!(registry.mirrored_status(id), Some(JobStatus::Pending));
        drop(guard);

        assert_eq!(registry.mirrored_status(id), Some(JobStatus::Running));
        assert_eq!(registry.mirrored_priority(id), Some(JobPriority::Highest));
    }

    #[test]
    fn try_lock_reports_contention_with_priority() {
        let registry = JobRegistry::new();
        let record = job().with_priority(JobPriority::High);
        let id = record.id;

        let _held = registry.register(record).unwrap();
        match registry.try_lock(id) {
            TryLockJob::Contended(priority) => assert_eq!(priority, JobPriority::High),
            other => panic!("expected contention, got {other:?}"),
        }
    }

    #[test]
    fn waiter_observes_eviction_as_absence() {
        let registry = Arc::new(JobRegistry::new());
        let record = job();
        let id = record.id;

        let guard = registry.register(record).unwrap();
        let waiter = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.lock(id).is_none())
        };

        thread::sleep(Duration::from_millis(50));
        registry.evict(&guard);
        drop(guard);

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn lock_many_dedupes_and_skips_absent() {
        let registry = JobRegistry::new();
        let first = job();
        let second = job();
        let first_id = first.id;
        let second_id = second.id;

        drop(registry.register(first).unwrap());
        drop(registry.register(second).unwrap());

        let guards = registry.lock_many(&[first_id, second_id, first_id, JobId::new()]);
        assert_eq!(guards.len(), 2);
        assert_eq!(guards[0].id(), first_id);
        assert_eq!(guards[1].id(), second_id);
    }

    #[test]
    fn snapshot_reflects_mirrors() {
        let registry = JobRegistry::new();
        let record = job().with_priority(JobPriority::Low);
        let id = record.id;
        drop(registry.register(record).unwrap());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0], (id, JobStatus::Pending, JobPriority::Low));
    }
}
