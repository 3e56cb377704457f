//! Owned collection of worker channels plus the policy that picks the next one.
//!
//! The pool is injected into the session rather than held as process state,
//! and selection is a separate object so the order can change without
//! touching the pool.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::channel::{WorkerChannel, WorkerId, WorkerState};

#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: BTreeMap<WorkerId, WorkerChannel>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a channel, returning any previous channel with the same id.
    pub fn insert(&mut self, channel: WorkerChannel) -> Option<WorkerChannel> {
        self.workers.insert(channel.id(), channel)
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerChannel> {
        self.workers.get(&id)
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut WorkerChannel> {
        self.workers.get_mut(&id)
    }

    pub fn remove(&mut self, id: WorkerId) -> Option<WorkerChannel> {
        self.workers.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Channels in id order.
    pub fn iter(&self) -> impl Iterator<Item = &WorkerChannel> {
        self.workers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkerChannel> {
        self.workers.values_mut()
    }

    pub fn active_ids(&self) -> Vec<WorkerId> {
        self.active_from(Bound::Unbounded).map(WorkerChannel::id).collect()
    }

    fn active_from(&self, start: Bound<WorkerId>) -> impl Iterator<Item = &WorkerChannel> {
        self.workers
            .range((start, Bound::Unbounded))
            .map(|(_, channel)| channel)
            .filter(|channel| channel.state() == WorkerState::Active)
    }

    /// Shut every channel down. Crashed channels keep their state.
    pub fn terminate_all(&mut self) {
        for channel in self.workers.values_mut() {
            if let Some(status) = channel.terminate() {
                tracing::info!(worker = %channel.id(), %status, "Worker stopped");
            }
        }
    }
}

/// Chooses which worker receives the next job.
pub trait SelectionPolicy {
    /// `None` when no worker can take a job.
    fn select(&mut self, pool: &WorkerPool) -> Option<WorkerId>;
}

/// Cycles over active workers in id order, skipping any that are not active.
#[derive(Debug, Default)]
pub struct RoundRobin {
    last: Option<WorkerId>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionPolicy for RoundRobin {
    fn select(&mut self, pool: &WorkerPool) -> Option<WorkerId> {
        let after = match self.last {
            Some(last) => Bound::Excluded(last),
            None => Bound::Unbounded,
        };
        let next = pool
            .active_from(after)
            .next()
            .or_else(|| pool.active_from(Bound::Unbounded).next())?
            .id();
        self.last = Some(next);
        Some(next)
    }
}
