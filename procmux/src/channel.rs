//! One worker process as seen from the controller.
//!
//! A [`WorkerChannel`] pairs the parent end of a worker's socket with the
//! [`ByteCache`] that reassembles its frames and the counter that numbers the
//! jobs sent to it. Readiness dispatch is the broker's job; the channel only
//! turns a readable socket into decoded records and a command into a write.

use std::fmt;
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::process::{Child, ExitStatus};
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, poll};
use serde::Serialize;

use crate::bridge::kvvec::{KvVec, Ownership};
use crate::broker::poll_timeout;
use crate::bridge::protocol::{self, Job, MSG_DELIM};
use crate::error::{MuxError, Result};
use crate::iocache::ByteCache;

/// How long `send_job` waits for a full socket to drain before giving up.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity of a worker: its process id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct WorkerId(u32);

impl WorkerId {
    pub const fn new(pid: u32) -> Self {
        Self(pid)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a worker channel.
///
/// ```text
/// Spawned ──attach──► Active ──EOF / I/O error──► Crashed
///    │                  │
///    └────shutdown──────┴──────────────────────► Terminated
/// ```
///
/// `Crashed` and `Terminated` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Spawned,
    Active,
    Crashed,
    Terminated,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Crashed | Self::Terminated)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Spawned => "spawned",
            Self::Active => "active",
            Self::Crashed => "crashed",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Cumulative per-channel counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub jobs_sent: u64,
    pub bytes_read: u64,
    pub frames: u64,
    pub malformed: u64,
}

/// Result of one [`WorkerChannel::on_readable`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Nothing to read right now; try again next cycle.
    WouldBlock,
    /// The cache is full at its ceiling and holds no complete frame.
    Stalled,
    Frames {
        bytes: usize,
        frames: usize,
        malformed: usize,
    },
}

/// Receives every record decoded from a worker, in the order the worker wrote them.
pub trait ResultConsumer {
    fn consume(&mut self, worker: WorkerId, record: KvVec<'static>);
}

impl<F> ResultConsumer for F
where
    F: FnMut(WorkerId, KvVec<'static>),
{
    fn consume(&mut self, worker: WorkerId, record: KvVec<'static>) {
        self(worker, record)
    }
}

pub struct WorkerChannel {
    id: WorkerId,
    stream: Option<UnixStream>,
    child: Option<Child>,
    cache: ByteCache,
    job_counter: u64,
    state: WorkerState,
    stats: ChannelStats,
    write_timeout: Duration,
}

impl WorkerChannel {
    /// Wrap the parent end of a worker socket. The stream must already be
    /// non-blocking.
    pub fn new(id: WorkerId, stream: UnixStream, cache: ByteCache) -> Self {
        Self {
            id,
            stream: Some(stream),
            child: None,
            cache,
            job_counter: 0,
            state: WorkerState::Spawned,
            stats: ChannelStats::default(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Longest `send_job` blocks on a full socket. Running out crashes the
    /// channel, since a partly written frame cannot be taken back.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Attach the child process so shutdown can kill and reap it.
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    /// Id the next job will carry.
    pub fn next_job_id(&self) -> u64 {
        self.job_counter
    }

    pub fn cache(&self) -> &ByteCache {
        &self.cache
    }

    /// Descriptor to register with the broker, while the socket is open.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// `Spawned → Active`. No effect in any other state.
    pub fn mark_active(&mut self) {
        if self.state == WorkerState::Spawned {
            self.state = WorkerState::Active;
        }
    }

    /// Move to `Crashed`. Returns `false` if the channel was already terminal.
    ///
    /// The socket stays open until [`release`](Self::release), so a broker
    /// registration never outlives the descriptor it names.
    pub fn mark_crashed(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        tracing::error!(worker = %self.id, state = %self.state, "Worker channel crashed");
        self.state = WorkerState::Crashed;
        true
    }

    /// Close the socket without changing state.
    pub fn release(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!(worker = %self.id, "Released worker socket");
        }
    }

    /// Encode and write one job. Returns the job id it was given.
    ///
    /// The counter advances even if encoding fails, so ids are never reused.
    pub fn send_job(&mut self, command: &[u8], timeout: Duration) -> Result<u64> {
        if self.state.is_terminal() {
            return Err(MuxError::ChannelClosed(self.id, self.state));
        }
        let job_id = self.job_counter;
        self.job_counter += 1;

        let frame = protocol::encode_frame(&Job::new(job_id, command, timeout).to_kvvec())?;
        if let Err(e) = self.write_frame(&frame) {
            self.mark_crashed();
            return Err(e);
        }

        self.stats.jobs_sent += 1;
        tracing::debug!(worker = %self.id, job_id, bytes = frame.len(), "Sent job");
        Ok(job_id)
    }

    fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let Some(stream) = self.stream.as_ref() else {
            return Err(MuxError::ChannelClosed(self.id, self.state));
        };
        let mut writer = stream;
        let deadline = Instant::now().checked_add(self.write_timeout);
        let mut written = 0;
        while written < frame.len() {
            match writer.write(&frame[written..]) {
                Ok(0) => return Err(MuxError::PeerClosed(self.id)),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tracing::trace!(worker = %self.id, written, "Socket full, waiting for writability");
                    if !wait_writable(stream, deadline)? {
                        return Err(MuxError::WriteTimeout {
                            id: self.id,
                            waited: self.write_timeout,
                        });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Handle a readiness event: fill the cache once, then hand every
    /// complete frame to `consumer`.
    ///
    /// A zero-length read moves the channel to `Crashed` and returns
    /// [`MuxError::PeerClosed`]; after that the socket is never read again.
    pub fn on_readable(&mut self, consumer: &mut dyn ResultConsumer) -> Result<ReadOutcome> {
        if self.state.is_terminal() {
            return Err(MuxError::ChannelClosed(self.id, self.state));
        }

        if self.cache.available() == 0 {
            match self.cache.double() {
                Ok(capacity) => {
                    tracing::debug!(worker = %self.id, capacity, "Grew worker cache");
                }
                Err(e) => {
                    tracing::warn!(worker = %self.id, error = %e, "Worker cache full");
                    return Ok(ReadOutcome::Stalled);
                }
            }
        }

        let Some(stream) = self.stream.as_ref() else {
            return Err(MuxError::ChannelClosed(self.id, self.state));
        };
        let mut reader = stream;
        let bytes = match self.cache.read_from(&mut reader) {
            Ok(0) => {
                self.mark_crashed();
                return Err(MuxError::PeerClosed(self.id));
            }
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return Ok(ReadOutcome::WouldBlock);
            }
            Err(e) => {
                self.mark_crashed();
                return Err(e.into());
            }
        };

        let mut frames = 0;
        let mut malformed = 0;
        while let Some(payload) = self.cache.extract_frame(MSG_DELIM) {
            match protocol::decode_payload(payload, Ownership::Borrow) {
                Ok(record) => {
                    consumer.consume(self.id, record.into_owned());
                    frames += 1;
                }
                Err(e) => {
                    tracing::warn!(worker = %self.id, error = %e, "Skipping malformed frame");
                    malformed += 1;
                }
            }
        }

        self.stats.bytes_read += bytes as u64;
        self.stats.frames += frames as u64;
        self.stats.malformed += malformed as u64;
        tracing::trace!(worker = %self.id, bytes, frames, buffered = self.cache.size(), "Read from worker");

        Ok(ReadOutcome::Frames {
            bytes,
            frames,
            malformed,
        })
    }

    /// Exit status if the worker process has exited, without blocking.
    pub fn try_reap(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(worker = %self.id, error = %e, "Failed to poll worker status");
                None
            }
        }
    }

    /// Explicit shutdown: close the socket, kill the process and reap it.
    ///
    /// A crashed channel stays `Crashed`; any other state becomes `Terminated`.
    pub fn terminate(&mut self) -> Option<ExitStatus> {
        if !self.state.is_terminal() {
            self.state = WorkerState::Terminated;
        }
        self.release();

        let mut child = self.child.take()?;
        if let Ok(Some(status)) = child.try_wait() {
            return Some(status);
        }
        if let Err(e) = child.kill() {
            tracing::debug!(worker = %self.id, error = %e, "Kill failed");
        }
        match child.wait() {
            Ok(status) => {
                tracing::debug!(worker = %self.id, %status, "Reaped worker");
                Some(status)
            }
            Err(e) => {
                tracing::warn!(worker = %self.id, error = %e, "Failed to reap worker");
                None
            }
        }
    }
}

impl fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("fd", &self.raw_fd())
            .field("next_job_id", &self.job_counter)
            .field("buffered", &self.cache.size())
            .finish()
    }
}

/// `false` if `deadline` passed first. No deadline waits indefinitely.
fn wait_writable(stream: &UnixStream, deadline: Option<Instant>) -> Result<bool> {
    let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLOUT)];
    loop {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        match poll(&mut fds, poll_timeout(remaining)) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
