//! procmux: single-threaded multiplexer for external worker processes.
//!
//! The controller side is synchronous: an [`EventBroker`] waits on
//! `poll(2)` and dispatches readiness to handlers, each [`WorkerChannel`]
//! accumulates partial reads in a bounded [`ByteCache`] and decodes
//! delimiter-framed key/value records, and a [`Session`] ties them together
//! with a worker pool and a cancellation token. The worker side
//! ([`worker::run_worker`]) is a small tokio runtime speaking the same framing.

pub mod bridge;
pub mod broker;
pub mod channel;
pub mod config;
pub mod error;
pub mod iocache;
pub mod pool;
pub mod session;
#[cfg(target_os = "linux")]
pub mod signals;
pub mod spawn;
pub mod worker;

pub use bridge::{Job, JobResult, KeyValue, KvVec, Ownership};
pub use broker::{Disposition, EventBroker, EventHandler, PollReport, Readiness};
pub use channel::{ChannelStats, ReadOutcome, ResultConsumer, WorkerChannel, WorkerId, WorkerState};
pub use config::{MuxConfig, WorkerConfig};
pub use error::{MuxError, Result};
pub use iocache::ByteCache;
pub use pool::{RoundRobin, SelectionPolicy, WorkerPool};
pub use session::{LoopExit, Session, run_event_loop};
#[cfg(target_os = "linux")]
pub use signals::SignalWatch;
pub use spawn::{CommandSpawner, SpawnError, SpawnedWorker, WorkerSpawner};

pub use tokio_util::sync::CancellationToken;

/// Crate version, for `--version` output and startup logs.
pub const PROCMUX_VERSION: &str = env!("CARGO_PKG_VERSION");
