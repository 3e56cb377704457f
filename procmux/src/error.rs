//! Error types for procmux.

use std::time::Duration;

use thiserror::Error;

use crate::channel::{WorkerId, WorkerState};

/// Main error type for broker, cache, codec and channel operations.
#[derive(Debug, Error)]
pub enum MuxError {
    /// Buffer growth would exceed the configured ceiling. Capacity is unchanged.
    #[error("buffer growth to {requested} bytes exceeds the {max} byte limit")]
    CapacityExceeded { requested: usize, max: usize },

    /// A record in a frame payload has no key separator.
    #[error("malformed record {index}: missing key separator")]
    MalformedRecord { index: usize },

    /// A key or value contains a reserved separator and cannot be encoded.
    #[error("{field} of pair {index} contains a reserved separator")]
    ReservedSequence { index: usize, field: &'static str },

    /// A typed view (job, job result) is missing a required key.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A typed view has a key whose value does not parse.
    #[error("invalid value for {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },

    /// Zero-length read: the worker closed its end of the channel.
    #[error("worker {0} closed its channel")]
    PeerClosed(WorkerId),

    /// A full socket did not drain in time; the frame may be half written.
    #[error("worker {id} did not accept input within {waited:?}")]
    WriteTimeout { id: WorkerId, waited: Duration },

    /// Operation on a channel that already reached a terminal state.
    #[error("worker {0} is {1}")]
    ChannelClosed(WorkerId, WorkerState),

    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    #[error("no active workers")]
    NoWorkers,

    /// The readiness wait was interrupted by a signal; retry.
    #[error("poll interrupted by signal")]
    Interrupted,

    /// The readiness wait itself failed.
    #[error("poll failed: {0}")]
    Poll(nix::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Startup failure before the event loop is entered, such as signal
    /// masking or `signalfd` creation.
    #[error("setup failed: {0}")]
    Setup(String),
}

impl MuxError {
    /// Conditions that are retried on the next cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Interrupted => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Short category name used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::MalformedRecord { .. }
            | Self::ReservedSequence { .. }
            | Self::MissingField(_)
            | Self::InvalidField { .. } => "malformed_record",
            Self::PeerClosed(_) => "peer_closed",
            Self::WriteTimeout { .. } => "write_timeout",
            Self::ChannelClosed(..) => "channel_closed",
            Self::UnknownWorker(_) | Self::NoWorkers => "no_worker",
            Self::Interrupted => "signal_interrupted",
            Self::Poll(_) => "poll",
            Self::Io(_) if self.is_transient() => "transient_io",
            Self::Io(_) => "io",
            Self::Setup(_) => "setup",
        }
    }

    /// Conditions that end the controlling process.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::PeerClosed(_) | Self::WriteTimeout { .. } | Self::Setup(_) => true,
            Self::Poll(_) => true,
            Self::Io(_) => !self.is_transient(),
            _ => false,
        }
    }
}

impl From<nix::Error> for MuxError {
    fn from(errno: nix::Error) -> Self {
        match errno {
            nix::errno::Errno::EINTR => Self::Interrupted,
            other => Self::Poll(other),
        }
    }
}

/// Result type alias using MuxError.
pub type Result<T> = std::result::Result<T, MuxError>;
