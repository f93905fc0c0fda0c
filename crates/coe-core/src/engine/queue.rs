//! Per-identity deduplicating task queue
//!
//! At most one task is outstanding per identity. A task arriving for an
//! identity that already has one merges into it (latest wins) and keeps the
//! original queue position:
//!
//! - Create + Update: Create with the newer payload
//! - anything + Delete: Delete
//! - Delete + Create/Update: the Create/Update
//! - payload task + Verify: the payload task is kept
//! - Verify + anything: the newer task
//!
//! Tasks carrying a sequence number that is not newer than the last one
//! accepted for the same identity are dropped as stale.
//!
//! The watermark never passes the highest resume point reported by the
//! feed, so a sequence number that can still arrive is never checkpointed.

use crate::model::{EndpointId, WorkloadEndpoint};
use std::collections::{HashMap, VecDeque};

/// What the engine must do for one identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAction {
    Create(WorkloadEndpoint),
    Update(WorkloadEndpoint),
    Delete,
    /// Compare the datastore with the table and repair
    Verify,
}

impl TaskAction {
    pub fn name(&self) -> &'static str {
        match self {
            TaskAction::Create(_) => "create",
            TaskAction::Update(_) => "update",
            TaskAction::Delete => "delete",
            TaskAction::Verify => "verify",
        }
    }

    fn carries_intent(&self) -> bool {
        !matches!(self, TaskAction::Verify)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationTask {
    pub id: EndpointId,
    pub action: TaskAction,
    /// Orchestration sequence number (`None` for engine-generated tasks)
    pub seq: Option<u64>,
}

impl ReconciliationTask {
    pub fn verify(id: EndpointId) -> Self {
        Self {
            id,
            action: TaskAction::Verify,
            seq: None,
        }
    }
}

/// Result of [`TaskQueue::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// New outstanding task for the identity
    Queued,
    /// Folded into the outstanding task
    Merged,
    /// Not newer than what was already accepted; dropped
    Stale { last_accepted: u64 },
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    order: VecDeque<EndpointId>,
    pending: HashMap<EndpointId, ReconciliationTask>,
    last_accepted: HashMap<EndpointId, u64>,
    highest_seen: Option<u64>,
    resume_floor: Option<u64>,
    in_flight: Option<u64>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: ReconciliationTask) -> PushOutcome {
        if let Some(seq) = task.seq {
            self.highest_seen = Some(self.highest_seen.map_or(seq, |h| h.max(seq)));

            if let Some(&last) = self.last_accepted.get(&task.id) {
                if seq <= last {
                    return PushOutcome::Stale {
                        last_accepted: last,
                    };
                }
            }
            self.last_accepted.insert(task.id.clone(), seq);
        }

        match self.pending.get_mut(&task.id) {
            Some(existing) => {
                merge(existing, task);
                PushOutcome::Merged
            }
            None => {
                self.order.push_back(task.id.clone());
                self.pending.insert(task.id.clone(), task);
                PushOutcome::Queued
            }
        }
    }

    /// Record where the feed could resume after the event being pushed
    pub fn observe_resume_point(&mut self, point: u64) {
        self.resume_floor = Some(self.resume_floor.map_or(point, |f| f.max(point)));
    }

    /// Take the oldest outstanding task
    ///
    /// Its sequence number keeps holding the watermark back until
    /// [`TaskQueue::finish`] is called.
    pub fn pop(&mut self) -> Option<ReconciliationTask> {
        while let Some(id) = self.order.pop_front() {
            if let Some(task) = self.pending.remove(&id) {
                self.in_flight = task.seq;
                return Some(task);
            }
        }
        None
    }

    /// Mark the last popped task as done
    pub fn finish(&mut self) {
        self.in_flight = None;
    }

    /// Remove and return everything still outstanding, oldest first
    pub fn drain(&mut self) -> Vec<ReconciliationTask> {
        let mut tasks = Vec::with_capacity(self.pending.len());
        while let Some(task) = self.pop() {
            tasks.push(task);
        }
        self.in_flight = None;
        tasks
    }

    /// Every event with a sequence number at or below the result is done
    pub fn watermark(&self) -> Option<u64> {
        let oldest_open = self
            .pending
            .values()
            .filter_map(|task| task.seq)
            .chain(self.in_flight)
            .min();

        let done = match oldest_open {
            Some(seq) => seq.checked_sub(1),
            None => self.highest_seen,
        };

        match (done, self.resume_floor) {
            (Some(done), Some(floor)) => Some(done.min(floor)),
            (done, _) => done,
        }
    }

    /// Last sequence number accepted for `id`
    pub fn last_accepted(&self, id: &EndpointId) -> Option<u64> {
        self.last_accepted.get(id).copied()
    }

    pub fn pending(&self, id: &EndpointId) -> Option<&ReconciliationTask> {
        self.pending.get(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn merge(existing: &mut ReconciliationTask, incoming: ReconciliationTask) {
    let seq = match (existing.seq, incoming.seq) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };

    let action = match (&existing.action, incoming.action) {
        (current, TaskAction::Verify) if current.carries_intent() => return,
        (TaskAction::Create(_), TaskAction::Update(endpoint)) => TaskAction::Create(endpoint),
        (_, newer) => newer,
    };

    existing.action = action;
    existing.seq = seq;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> EndpointId {
        EndpointId::pod("a", name)
    }

    fn task(name: &str, action: TaskAction, seq: u64) -> ReconciliationTask {
        ReconciliationTask {
            id: id(name),
            action,
            seq: Some(seq),
        }
    }

    fn endpoint(name: &str, ip: &str) -> WorkloadEndpoint {
        WorkloadEndpoint::active(id(name)).with_ip(ip.parse().unwrap())
    }

    #[test]
    fn create_then_update_keeps_create_with_latest_payload() {
        let mut queue = TaskQueue::new();
        queue.push(task("w1", TaskAction::Create(endpoint("w1", "10.0.0.1")), 1));
        let outcome = queue.push(task("w1", TaskAction::Update(endpoint("w1", "10.0.0.2")), 2));

        assert_eq!(outcome, PushOutcome::Merged);
        assert_eq!(queue.len(), 1);
        let popped = queue.pop().unwrap();
        assert_eq!(popped.action, TaskAction::Create(endpoint("w1", "10.0.0.2")));
        assert_eq!(popped.seq, Some(2));
    }

    #[test]
    fn delete_wins_over_anything() {
        let mut queue = TaskQueue::new();
        queue.push(task("w1", TaskAction::Create(endpoint("w1", "10.0.0.1")), 1));
        queue.push(task("w1", TaskAction::Update(endpoint("w1", "10.0.0.2")), 2));
        queue.push(task("w1", TaskAction::Delete, 3));

        assert_eq!(queue.pop().unwrap().action, TaskAction::Delete);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn verify_never_displaces_payload() {
        let mut queue = TaskQueue::new();
        queue.push(task("w1", TaskAction::Delete, 1));
        queue.push(ReconciliationTask::verify(id("w1")));

        assert_eq!(queue.pop().unwrap().action, TaskAction::Delete);

        queue.push(ReconciliationTask::verify(id("w2")));
        queue.push(task("w2", TaskAction::Update(endpoint("w2", "10.0.0.9")), 2));
        assert!(matches!(queue.pop().unwrap().action, TaskAction::Update(_)));
    }

    #[test]
    fn stale_seq_is_dropped() {
        let mut queue = TaskQueue::new();
        queue.push(task("w1", TaskAction::Delete, 4));

        let outcome = queue.push(task("w1", TaskAction::Create(endpoint("w1", "10.0.0.1")), 1));
        assert_eq!(outcome, PushOutcome::Stale { last_accepted: 4 });

        // Still stale once the delete has been processed
        queue.pop();
        queue.finish();
        let outcome = queue.push(task("w1", TaskAction::Update(endpoint("w1", "10.0.0.1")), 3));
        assert!(matches!(outcome, PushOutcome::Stale { .. }));
    }

    #[test]
    fn identities_are_fifo_by_first_arrival() {
        let mut queue = TaskQueue::new();
        queue.push(task("w1", TaskAction::Delete, 1));
        queue.push(task("w2", TaskAction::Delete, 2));
        queue.push(task("w1", TaskAction::Create(endpoint("w1", "10.0.0.1")), 3));

        assert_eq!(queue.pop().unwrap().id, id("w1"));
        assert_eq!(queue.pop().unwrap().id, id("w2"));
    }

    #[test]
    fn watermark_trails_oldest_open_task() {
        let mut queue = TaskQueue::new();
        assert_eq!(queue.watermark(), None);

        queue.push(task("w1", TaskAction::Delete, 5));
        queue.push(task("w2", TaskAction::Delete, 6));
        assert_eq!(queue.watermark(), Some(4));

        queue.pop();
        // In flight still holds the watermark
        assert_eq!(queue.watermark(), Some(4));
        queue.finish();
        assert_eq!(queue.watermark(), Some(5));

        queue.pop();
        queue.finish();
        assert_eq!(queue.watermark(), Some(6));
    }

    #[test]
    fn watermark_holds_at_resume_floor() {
        let mut queue = TaskQueue::new();

        // Pods listed at 105 and services at 106 in one poll
        queue.observe_resume_point(105);
        queue.push(task("svc", TaskAction::Delete, 101));
        queue.observe_resume_point(105);
        queue.push(task("pod", TaskAction::Delete, 106));

        queue.pop();
        queue.finish();
        assert_eq!(queue.watermark(), Some(105));
        queue.pop();
        queue.finish();
        assert_eq!(queue.watermark(), Some(105));

        // Next poll moves the floor
        queue.observe_resume_point(110);
        queue.push(task("pod", TaskAction::Delete, 108));
        queue.pop();
        queue.finish();
        assert_eq!(queue.watermark(), Some(108));
    }

    #[test]
    fn drain_empties_queue() {
        let mut queue = TaskQueue::new();
        queue.push(task("w1", TaskAction::Delete, 1));
        queue.push(ReconciliationTask::verify(id("w2")));

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
    }
}
