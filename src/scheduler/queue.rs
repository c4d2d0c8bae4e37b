use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use ulid::Ulid;

use crate::model::{JobStatus, ScheduledJob, Ts};

/// Jobs by id plus a min-heap on `(scheduled_time, id)`.
///
/// Heap entries are never removed in place. A popped entry is live only if its job still
/// exists, is PENDING and still carries that exact `scheduled_time`; anything else is a
/// leftover from a cancel or reschedule and is dropped.
///
/// Status changes go through `take_due`, `requeue` and `finish` so `pending` stays exact.
#[derive(Default)]
pub(super) struct JobQueue {
    jobs: HashMap<Ulid, ScheduledJob>,
    heap: BinaryHeap<Reverse<(Ts, Ulid)>>,
    pending: usize,
}

impl JobQueue {
    pub fn insert(&mut self, job: ScheduledJob) {
        if job.status == JobStatus::Pending {
            self.heap.push(Reverse((job.scheduled_time, job.job_id)));
            self.pending += 1;
        }
        if let Some(old) = self.jobs.insert(job.job_id, job)
            && old.status == JobStatus::Pending
        {
            self.pending -= 1;
        }
    }

    pub fn get(&self, id: &Ulid) -> Option<&ScheduledJob> {
        self.jobs.get(id)
    }

    /// Bookkeeping fields only; never change `status` through this.
    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut ScheduledJob> {
        self.jobs.get_mut(id)
    }

    /// Move a job into a finished status. False if it is unknown or already finished.
    pub fn finish(&mut self, id: &Ulid, status: JobStatus, now: Ts) -> bool {
        let Some(job) = self.jobs.get_mut(id) else {
            return false;
        };
        if job.status.is_finished() {
            return false;
        }
        if job.status == JobStatus::Pending {
            self.pending -= 1;
        }
        job.status = status;
        job.completed_at = Some(now);
        true
    }

    /// Pop every live due entry, mark those jobs RUNNING and return snapshots of them.
    pub fn take_due(&mut self, now: Ts) -> Vec<ScheduledJob> {
        let mut due = Vec::new();
        while let Some(Reverse((at, id))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if job.status != JobStatus::Pending || job.scheduled_time != at {
                continue;
            }
            job.status = JobStatus::Running;
            job.started_at = Some(now);
            self.pending -= 1;
            due.push(job.clone());
        }
        due
    }

    /// Put a job back in PENDING at a new time.
    pub fn requeue(&mut self, id: &Ulid, at: Ts) -> bool {
        let Some(job) = self.jobs.get_mut(id) else {
            return false;
        };
        if job.status != JobStatus::Pending {
            self.pending += 1;
        }
        job.status = JobStatus::Pending;
        job.scheduled_time = at;
        self.heap.push(Reverse((at, *id)));
        true
    }

    /// Drop finished jobs whose completion is older than `cutoff`.
    pub fn purge_finished(&mut self, cutoff: Ts) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| {
            !(job.status.is_finished() && job.completed_at.is_some_and(|at| at < cutoff))
        });
        let purged = before - self.jobs.len();

        // Rebuild once leftovers dominate the heap.
        let pending = self.pending_count();
        if self.heap.len() > 64 && self.heap.len() > pending * 2 {
            self.heap = self
                .jobs
                .values()
                .filter(|j| j.status == JobStatus::Pending)
                .map(|j| Reverse((j.scheduled_time, j.job_id)))
                .collect();
        }
        purged
    }

    pub fn pending(&self) -> Vec<ScheduledJob> {
        let mut out: Vec<ScheduledJob> = self
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();
        out.sort_by_key(|j| (j.scheduled_time, j.job_id));
        out
    }

    pub fn pending_count(&self) -> usize {
        self.pending
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[cfg(test)]
    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }
}
