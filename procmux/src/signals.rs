//! Process signals delivered as broker events.
//!
//! Signals are blocked on the calling thread and read from a `signalfd`, so
//! they arrive through the same dispatch as socket readiness instead of an
//! asynchronous handler. SIGCHLD becomes a reap pass over the pool; every
//! other watched signal cancels the session.
//!
//! Create the watch after spawning workers: children inherit the blocked mask.

use std::os::fd::{AsRawFd, RawFd};

use nix::errno::Errno;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use crate::broker::{Disposition, EventHandler, Readiness};
use crate::channel::ResultConsumer;
use crate::error::{MuxError, Result};
use crate::session::Session;

/// Signals the controller reacts to.
pub const WATCHED_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGCHLD];

pub struct SignalWatch {
    fd: SignalFd,
    mask: SigSet,
}

impl SignalWatch {
    /// Block `signals` on this thread and open a non-blocking signalfd for them.
    pub fn new(signals: &[Signal]) -> Result<Self> {
        let mut mask = SigSet::empty();
        for &signal in signals {
            mask.add(signal);
        }
        mask.thread_block()
            .map_err(|e| MuxError::Setup(format!("blocking signals: {e}")))?;
        let fd = match SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC) {
            Ok(fd) => fd,
            Err(e) => {
                if let Err(restore) = mask.thread_unblock() {
                    tracing::warn!(error = %restore, "Failed to restore signal mask");
                }
                return Err(MuxError::Setup(format!("creating signalfd: {e}")));
            }
        };
        tracing::debug!(?signals, "Watching signals");
        Ok(Self { fd, mask })
    }

    /// SIGINT, SIGTERM and SIGCHLD.
    pub fn standard() -> Result<Self> {
        Self::new(&WATCHED_SIGNALS)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Read every pending signal.
    pub fn drain(&mut self) -> Result<Vec<Signal>> {
        let mut signals = Vec::new();
        loop {
            match self.fd.read_signal() {
                Ok(Some(info)) => match Signal::try_from(info.ssi_signo as i32) {
                    Ok(signal) => signals.push(signal),
                    Err(_) => tracing::warn!(signo = info.ssi_signo, "Unknown signal"),
                },
                Ok(None) => return Ok(signals),
                Err(Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for SignalWatch {
    fn drop(&mut self) {
        if let Err(e) = self.mask.thread_unblock() {
            tracing::warn!(error = %e, "Failed to restore signal mask");
        }
    }
}

impl<R: ResultConsumer> EventHandler<Session<R>> for SignalWatch {
    fn handle_event(&mut self, _readiness: Readiness, session: &mut Session<R>) -> Result<Disposition> {
        for signal in self.drain()? {
            match signal {
                Signal::SIGCHLD => {
                    let exited = session.reap_children();
                    tracing::debug!(exited = exited.len(), "SIGCHLD");
                }
                other => {
                    tracing::info!(signal = %other, "Shutdown requested");
                    session.cancellation().cancel();
                }
            }
        }
        Ok(Disposition::Keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::raise;

    #[test]
    fn blocked_signal_is_read_from_fd() {
        let mut watch = SignalWatch::new(&[Signal::SIGUSR1]).unwrap();
        assert!(watch.drain().unwrap().is_empty());

        raise(Signal::SIGUSR1).unwrap();
        assert_eq!(watch.drain().unwrap(), vec![Signal::SIGUSR1]);
        assert!(watch.drain().unwrap().is_empty());
    }

    #[test]
    fn interrupt_cancels_the_session() {
        let mut watch = SignalWatch::new(&[Signal::SIGUSR2]).unwrap();
        let mut session = Session::new(|_: crate::WorkerId, _: crate::KvVec<'static>| {});
        raise(Signal::SIGUSR2).unwrap();

        let disposition = watch
            .handle_event(Readiness::readable(), &mut session)
            .unwrap();
        assert_eq!(disposition, Disposition::Keep);
        assert!(session.cancellation().is_cancelled());
    }
}
