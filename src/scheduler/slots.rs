use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

/// In-memory admission control: the set of jobs currently executing.
///
/// The set never grows beyond `ceiling`. Acquisition hands out a
/// [`SlotGuard`] that gives the slot back when dropped, so a slot is
/// released on every exit path of the task holding it.
#[derive(Debug, Clone)]
pub struct AdmissionSlots {
    inner: Arc<Mutex<HashSet<Uuid>>>,
    ceiling: usize,
}

impl AdmissionSlots {
    pub fn new(ceiling: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashSet::new())),
            ceiling,
        }
    }

    // A poisoned lock only means a holder panicked between two set
    // operations; the set itself is still coherent.
    fn lock(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim a slot for `job_id`. Returns `None` when the ceiling is
    /// reached or the job already holds a slot.
    pub fn try_acquire(&self, job_id: Uuid) -> Option<SlotGuard> {
        let mut active = self.lock();
        if active.len() >= self.ceiling || !active.insert(job_id) {
            return None;
        }
        tracing::debug!(job_id = %job_id, active = active.len(), "Admission slot acquired");
        Some(SlotGuard {
            slots: self.clone(),
            job_id,
        })
    }

    fn release(&self, job_id: &Uuid) {
        let mut active = self.lock();
        active.remove(job_id);
        tracing::debug!(job_id = %job_id, active = active.len(), "Admission slot released");
    }

    pub fn has_capacity(&self) -> bool {
        self.lock().len() < self.ceiling
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn contains(&self, job_id: &Uuid) -> bool {
        self.lock().contains(job_id)
    }

    /// Snapshot of the occupied slots, sorted for stable output.
    pub fn active(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.lock().iter().copied().collect();
        ids.sort();
        ids
    }
}

/// One occupied admission slot.
#[derive(Debug)]
pub struct SlotGuard {
    slots: AdmissionSlots,
    job_id: Uuid,
}

impl SlotGuard {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.release(&self.job_id);
    }
}
