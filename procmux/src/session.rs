//! Controller session and its event loop.
//!
//! A [`Session`] is the loop context every broker handler receives: it owns
//! the worker pool, the selection policy, the result consumer and the
//! bookkeeping that decides when the loop is done. [`run_event_loop`] drives
//! an [`EventBroker`] over it until the work drains, a worker crashes, the
//! session is cancelled or nothing is left to watch.

use std::collections::{BTreeMap, BTreeSet};
use std::os::fd::RawFd;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bridge::kvvec::KvVec;
use crate::broker::{Disposition, EventBroker, EventHandler, Readiness};
use crate::channel::{ReadOutcome, ResultConsumer, WorkerChannel, WorkerId, WorkerState};
use crate::error::{MuxError, Result};
use crate::pool::{RoundRobin, SelectionPolicy, WorkerPool};

/// Why the event loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Input finished and every dispatched job has a result.
    Drained,
    /// The cancellation token fired (SIGINT/SIGTERM).
    Cancelled,
    /// A worker closed its channel, exited, or failed I/O.
    WorkerCrashed(WorkerId),
    /// No descriptors left to watch.
    Idle,
}

impl LoopExit {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::WorkerCrashed(_) => 1,
            Self::Drained | Self::Cancelled | Self::Idle => 0,
        }
    }
}

pub struct Session<R> {
    pool: WorkerPool,
    policy: Box<dyn SelectionPolicy>,
    consumer: R,
    pending: BTreeSet<(WorkerId, u64)>,
    /// Worker sockets currently registered with the broker.
    sockets: BTreeMap<WorkerId, RawFd>,
    input_done: bool,
    crashed: Option<WorkerId>,
    cancel: CancellationToken,
}

impl<R: ResultConsumer> Session<R> {
    pub fn new(consumer: R) -> Self {
        Self {
            pool: WorkerPool::new(),
            policy: Box::new(RoundRobin::new()),
            consumer,
            pending: BTreeSet::new(),
            sockets: BTreeMap::new(),
            input_done: false,
            crashed: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: impl SelectionPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn consumer(&self) -> &R {
        &self.consumer
    }

    pub fn consumer_mut(&mut self) -> &mut R {
        &mut self.consumer
    }

    /// Insert `channel` into the pool and register its socket. The channel
    /// becomes `Active`.
    pub fn attach(&mut self, broker: &mut EventBroker<Self>, mut channel: WorkerChannel) -> Result<WorkerId> {
        let id = channel.id();
        let fd = channel
            .raw_fd()
            .ok_or(MuxError::ChannelClosed(id, channel.state()))?;
        channel.mark_active();
        self.pool.insert(channel);
        self.sockets.insert(id, fd);
        broker.register(fd, WorkerEvents { id });
        tracing::info!(worker = %id, fd, "Worker attached");
        Ok(id)
    }

    /// Send a command to the worker the policy picks.
    pub fn dispatch_job(&mut self, command: &[u8], timeout: Duration) -> Result<(WorkerId, u64)> {
        let id = self.policy.select(&self.pool).ok_or(MuxError::NoWorkers)?;
        let channel = self.pool.get_mut(id).ok_or(MuxError::UnknownWorker(id))?;
        match channel.send_job(command, timeout) {
            Ok(job_id) => {
                self.pending.insert((id, job_id));
                Ok((id, job_id))
            }
            Err(e) => {
                if channel.state() == WorkerState::Crashed {
                    self.record_crash(id);
                }
                Err(e)
            }
        }
    }

    /// No more jobs will be dispatched; the loop drains once every
    /// outstanding job has a result.
    pub fn finish_when_idle(&mut self) {
        self.input_done = true;
    }

    /// Token checked once per loop iteration. Cancelling it ends the loop
    /// after the current cycle.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// First worker that crashed, if any.
    pub fn crashed(&self) -> Option<WorkerId> {
        self.crashed
    }

    pub fn pending_jobs(&self) -> usize {
        self.pending.len()
    }

    pub fn is_drained(&self) -> bool {
        self.input_done && self.pending.is_empty()
    }

    /// Mark every worker whose process has exited as crashed. Returns the
    /// ids that changed state.
    pub fn reap_children(&mut self) -> Vec<WorkerId> {
        let mut exited = Vec::new();
        for channel in self.pool.iter_mut() {
            if channel.state().is_terminal() {
                continue;
            }
            if let Some(status) = channel.try_reap() {
                tracing::error!(worker = %channel.id(), %status, "Worker process exited");
                channel.mark_crashed();
                exited.push(channel.id());
            }
        }
        for &id in &exited {
            self.record_crash(id);
        }
        exited
    }

    /// Deregister and close the socket of every crashed worker that is
    /// still registered. Crashes seen outside the worker's own callback
    /// (a failed dispatch, a reaped process) are cleaned up here.
    pub fn release_crashed(&mut self, broker: &mut EventBroker<Self>) -> usize {
        let stale: Vec<RawFd> = self
            .sockets
            .iter()
            .filter(|&(&id, _)| self.pool.get(id).is_none_or(|c| c.state() == WorkerState::Crashed))
            .map(|(_, &fd)| fd)
            .collect();
        for &fd in &stale {
            broker.deregister_and_close(fd, self);
        }
        stale.len()
    }

    /// Deregister every worker socket and stop every worker process.
    pub fn shutdown(&mut self, broker: &mut EventBroker<Self>) {
        let fds: Vec<RawFd> = self.sockets.values().copied().collect();
        for fd in fds {
            broker.deregister_and_close(fd, self);
        }
        self.pool.terminate_all();
        if !self.pending.is_empty() {
            tracing::warn!(pending = self.pending.len(), "Shut down with jobs outstanding");
        }
    }

    fn record_crash(&mut self, id: WorkerId) {
        if self.crashed.is_none() {
            self.crashed = Some(id);
        }
    }

    fn on_worker_event(&mut self, id: WorkerId, readiness: Readiness) -> Result<Disposition> {
        let Self {
            pool,
            consumer,
            pending,
            ..
        } = self;
        let channel = pool.get_mut(id).ok_or(MuxError::UnknownWorker(id))?;

        let mut deliver = |worker: WorkerId, record: KvVec<'static>| {
            match record.get_str("job_id").and_then(|s| s.parse::<u64>().ok()) {
                Some(job_id) => {
                    if !pending.remove(&(worker, job_id)) {
                        tracing::warn!(%worker, job_id, "Result for unknown job");
                    }
                }
                None => tracing::warn!(%worker, "Result without job_id"),
            }
            consumer.consume(worker, record);
        };

        let failure = match channel.on_readable(&mut deliver) {
            Ok(ReadOutcome::Frames { .. }) => return Ok(Disposition::Keep),
            Ok(ReadOutcome::WouldBlock) => {
                if readiness.is_error() {
                    MuxError::Io(std::io::Error::other("error condition on worker socket"))
                } else {
                    return Ok(Disposition::Keep);
                }
            }
            // Frames are drained on every read, so a full cache holds one
            // frame larger than the ceiling.
            Ok(ReadOutcome::Stalled) => MuxError::CapacityExceeded {
                requested: channel.cache().capacity().saturating_mul(2),
                max: channel.cache().max_capacity(),
            },
            Err(e) => e,
        };

        channel.mark_crashed();
        if channel.state() == WorkerState::Crashed {
            self.record_crash(id);
        }
        Err(failure)
    }
}

/// Broker handler for one worker socket. The socket itself stays owned by
/// the channel in the pool.
struct WorkerEvents {
    id: WorkerId,
}

impl<R: ResultConsumer> EventHandler<Session<R>> for WorkerEvents {
    fn handle_event(&mut self, readiness: Readiness, session: &mut Session<R>) -> Result<Disposition> {
        session.on_worker_event(self.id, readiness)
    }

    fn on_deregister(&mut self, session: &mut Session<R>) {
        session.sockets.remove(&self.id);
        if let Some(channel) = session.pool.get_mut(self.id) {
            channel.release();
        }
    }
}

/// Drive `broker` until the session is finished.
///
/// Each iteration first releases crashed workers' sockets, then checks, in
/// order: a recorded crash, the cancellation token, drain, and whether
/// anything is still registered; then waits for
/// readiness with no timeout. Interrupted waits are retried. Handler
/// failures are logged with their descriptor and kind; the broker has
/// already deregistered them.
pub fn run_event_loop<R: ResultConsumer>(
    broker: &mut EventBroker<Session<R>>,
    session: &mut Session<R>,
) -> Result<LoopExit> {
    loop {
        session.release_crashed(broker);
        if let Some(id) = session.crashed() {
            tracing::error!(worker = %id, "Stopping after worker crash");
            return Ok(LoopExit::WorkerCrashed(id));
        }
        if session.cancel.is_cancelled() {
            tracing::info!(pending = session.pending_jobs(), "Event loop cancelled");
            return Ok(LoopExit::Cancelled);
        }
        if session.is_drained() {
            tracing::info!("All jobs complete");
            return Ok(LoopExit::Drained);
        }
        if broker.count() == 0 {
            tracing::info!("No descriptors registered");
            return Ok(LoopExit::Idle);
        }

        let report = match broker.poll(session, None) {
            Ok(report) => report,
            Err(MuxError::Interrupted) => {
                tracing::trace!("Poll interrupted, retrying");
                continue;
            }
            Err(e) => return Err(e),
        };
        tracing::trace!(ready = report.ready, dispatched = report.dispatched, "Poll cycle");

        for (fd, error) in &report.failures {
            tracing::error!(fd, kind = error.kind(), error = %error, "Channel failed");
        }
    }
}
