use std::collections::{HashMap, VecDeque};

use serde_json::Value;
use tracing::debug;

use crate::job::Job;

/// FIFO queue with O(1) lookup by `id_hash`.
///
/// Ordering lives in a deque of ids; the jobs themselves live in the index
/// map. The two always agree — `len() == index.len()` is checked by tests
/// and relied on by queue views.
#[derive(Debug, Default)]
pub struct FifoQueue {
    order: VecDeque<String>,
    index: HashMap<String, Job>,
    push_counter: u64,
    last_size: usize,
    accepting_jobs: bool,
    focus_mode: bool,
    blocking_object: Option<Value>,
}

impl FifoQueue {
    pub fn new() -> Self {
        Self {
            accepting_jobs: true,
            focus_mode: true,
            ..Self::default()
        }
    }

    // ── Focus mode / blocking object ─────────────────────────────────────────

    /// Park a blocking object and stop draining until it is popped.
    pub fn push_blocking_object(&mut self, blocking_object: Value) {
        self.blocking_object = Some(blocking_object);
        self.accepting_jobs = false;
    }

    pub fn pop_blocking_object(&mut self) -> Option<Value> {
        self.accepting_jobs = true;
        self.blocking_object.take()
    }

    pub fn is_accepting_jobs(&self) -> bool {
        self.accepting_jobs
    }

    pub fn is_in_focus_mode(&self) -> bool {
        self.focus_mode
    }

    // ── Queue operations ─────────────────────────────────────────────────────

    pub fn push(&mut self, job: Job) {
        debug!(id_hash = %job.id_hash, "queue push");
        self.order.push_back(job.id_hash.clone());
        self.index.insert(job.id_hash.clone(), job);
        self.push_counter += 1;
    }

    pub fn pop(&mut self) -> Option<Job> {
        let id_hash = self.order.pop_front()?;
        self.index.remove(&id_hash)
    }

    pub fn head(&self) -> Option<&Job> {
        self.order.front().and_then(|id| self.index.get(id))
    }

    pub fn get(&self, id_hash: &str) -> Option<&Job> {
        self.index.get(id_hash)
    }

    pub fn get_mut(&mut self, id_hash: &str) -> Option<&mut Job> {
        self.index.get_mut(id_hash)
    }

    pub fn contains(&self, id_hash: &str) -> bool {
        self.index.contains_key(id_hash)
    }

    /// Remove by id. Unknown ids are a clean `false` with no mutation.
    pub fn delete(&mut self, id_hash: &str) -> bool {
        if self.index.remove(id_hash).is_none() {
            debug!(id_hash, "queue delete: not found");
            return false;
        }
        self.order.retain(|queued| queued != id_hash);
        true
    }

    /// Remove by id and hand the job back (for stage transitions).
    pub fn take(&mut self, id_hash: &str) -> Option<Job> {
        let job = self.index.remove(id_hash)?;
        self.order.retain(|queued| queued != id_hash);
        Some(job)
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    pub fn push_counter(&self) -> u64 {
        self.push_counter
    }

    /// True when the size changed since the last call; updates the watermark.
    pub fn has_changed(&mut self) -> bool {
        if self.len() != self.last_size {
            self.last_size = self.len();
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) -> usize {
        let cleared = self.len();
        self.order.clear();
        self.index.clear();
        self.push_counter = 0;
        self.blocking_object = None;
        self.accepting_jobs = true;
        cleared
    }

    /// Jobs in queue order.
    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.order.iter().filter_map(|id| self.index.get(id))
    }

    pub fn jobs_for_user(&self, user_id: &str) -> Vec<&Job> {
        self.iter().filter(|job| job.user_id == user_id).collect()
    }
}
