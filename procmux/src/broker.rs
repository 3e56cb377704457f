//! Readiness dispatch over `poll(2)`.
//!
//! The [`EventBroker`] owns one handler per registered descriptor. Each call
//! to [`EventBroker::poll`] blocks until something is ready, then runs every
//! ready descriptor's handler exactly once with the readiness flags and a
//! mutable loop context shared by all handlers.
//!
//! Handlers own their descriptors: dropping a handler closes whatever it
//! holds. Deregistration therefore closes the descriptor by dropping the
//! handler after notifying it.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::error::{MuxError, Result};

/// Readiness flags reported for one descriptor.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Readiness(PollFlags);

impl Readiness {
    pub fn from_flags(flags: PollFlags) -> Self {
        Self(flags)
    }

    /// Plain `POLLIN`, for driving handlers by hand.
    pub fn readable() -> Self {
        Self(PollFlags::POLLIN)
    }

    pub fn flags(self) -> PollFlags {
        self.0
    }

    pub fn is_readable(self) -> bool {
        self.0.intersects(PollFlags::POLLIN | PollFlags::POLLPRI)
    }

    /// The peer hung up. Buffered data may still be readable.
    pub fn is_hangup(self) -> bool {
        self.0.contains(PollFlags::POLLHUP)
    }

    pub fn is_error(self) -> bool {
        self.0.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL)
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Readiness({:?})", self.0)
    }
}

/// What the broker should do with a registration after its handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    /// Deregister and close; not reported as a failure.
    Remove,
}

/// Callback for one registered descriptor.
///
/// Returning `Err` makes the broker deregister and close the descriptor and
/// report the error in [`PollReport::failures`].
pub trait EventHandler<C> {
    fn handle_event(&mut self, readiness: Readiness, ctx: &mut C) -> Result<Disposition>;

    /// Called once when the registration is removed, before the handler is dropped.
    fn on_deregister(&mut self, _ctx: &mut C) {}
}

impl<C, F> EventHandler<C> for F
where
    F: FnMut(Readiness, &mut C) -> Result<Disposition>,
{
    fn handle_event(&mut self, readiness: Readiness, ctx: &mut C) -> Result<Disposition> {
        self(readiness, ctx)
    }
}

struct Registration<C> {
    handler: Box<dyn EventHandler<C>>,
}

/// Summary of one poll cycle.
#[derive(Debug, Default)]
pub struct PollReport {
    /// Descriptors the kernel reported ready.
    pub ready: usize,
    /// Handlers actually invoked.
    pub dispatched: usize,
    /// Handlers that failed this cycle, with their descriptor. Each has
    /// already been deregistered.
    pub failures: Vec<(RawFd, MuxError)>,
}

pub struct EventBroker<C> {
    registry: HashMap<RawFd, Registration<C>>,
}

impl<C> Default for EventBroker<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> EventBroker<C> {
    pub fn new() -> Self {
        Self {
            registry: HashMap::new(),
        }
    }

    /// Add or replace the handler for `fd`. A replaced handler is returned
    /// without being notified.
    ///
    /// The descriptor must stay open for as long as it is registered.
    pub fn register<H>(&mut self, fd: RawFd, handler: H) -> Option<Box<dyn EventHandler<C>>>
    where
        H: EventHandler<C> + 'static,
    {
        tracing::trace!(fd, "Registering descriptor");
        self.registry
            .insert(
                fd,
                Registration {
                    handler: Box::new(handler),
                },
            )
            .map(|old| old.handler)
    }

    /// Remove the registration for `fd`, notify its handler and drop it.
    /// Returns `false` if nothing was registered.
    pub fn deregister_and_close(&mut self, fd: RawFd, ctx: &mut C) -> bool {
        let Some(mut registration) = self.registry.remove(&fd) else {
            return false;
        };
        tracing::trace!(fd, "Deregistering descriptor");
        registration.handler.on_deregister(ctx);
        true
    }

    pub fn count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registry.contains_key(&fd)
    }

    /// Wait for readiness and dispatch.
    ///
    /// `None` waits indefinitely; `Some(Duration::ZERO)` only checks. With
    /// nothing registered this returns at once with an empty report.
    ///
    /// Errors: [`MuxError::Interrupted`] if a signal interrupted the wait
    /// (retry), [`MuxError::Poll`] for any other wait failure.
    pub fn poll(&mut self, ctx: &mut C, timeout: Option<Duration>) -> Result<PollReport> {
        let mut report = PollReport::default();
        if self.registry.is_empty() {
            return Ok(report);
        }

        let fds: Vec<RawFd> = self.registry.keys().copied().collect();
        let ready: Vec<(RawFd, PollFlags)> = {
            let mut pollfds: Vec<PollFd<'_>> = fds
                .iter()
                .map(|&fd| {
                    // SAFETY: a registered fd stays open until its registration
                    // is removed. Handlers either own it or, like worker
                    // sockets, close it only from `on_deregister`. Nothing is
                    // deregistered while these borrows exist.
                    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                    PollFd::new(borrowed, PollFlags::POLLIN)
                })
                .collect();

            report.ready = usize::try_from(poll(&mut pollfds, poll_timeout(timeout))?).unwrap_or(0);

            fds.iter()
                .zip(&pollfds)
                .filter_map(|(&fd, pollfd)| {
                    pollfd
                        .revents()
                        .filter(|flags| !flags.is_empty())
                        .map(|flags| (fd, flags))
                })
                .collect()
        };

        for (fd, flags) in ready {
            // An earlier handler this cycle may have removed it.
            let Some(registration) = self.registry.get_mut(&fd) else {
                continue;
            };
            report.dispatched += 1;
            match registration.handler.handle_event(Readiness(flags), ctx) {
                Ok(Disposition::Keep) => {}
                Ok(Disposition::Remove) => {
                    self.deregister_and_close(fd, ctx);
                }
                Err(e) => {
                    tracing::debug!(fd, error = %e, "Handler failed, deregistering");
                    self.deregister_and_close(fd, ctx);
                    report.failures.push((fd, e));
                }
            }
        }

        Ok(report)
    }
}

/// `None` blocks indefinitely. Partial milliseconds round up, so a nonzero
/// wait never turns into a non-blocking check.
pub(crate) fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(d) => i32::try_from(timeout_millis(d))
            .ok()
            .and_then(|ms| PollTimeout::try_from(ms).ok())
            .unwrap_or(PollTimeout::MAX),
    }
}

fn timeout_millis(d: Duration) -> u128 {
    d.as_nanos().div_ceil(1_000_000)
}
