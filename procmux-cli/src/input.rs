//! Newline-terminated commands read from stdin through the broker.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::time::Duration;

use procmux::{ByteCache, Disposition, EventHandler, MuxError, Readiness, ResultConsumer, Session};

/// Longest accepted command line.
const MAX_LINE: usize = 1024 * 1024;

/// Reads commands and dispatches each to the next worker. On EOF it tells
/// the session no more jobs are coming and removes itself.
pub struct CommandInput {
    source: File,
    cache: ByteCache,
    timeout: Duration,
    dispatched: u64,
}

impl CommandInput {
    /// Uses a duplicate of fd 0, so deregistering closes only the copy.
    pub fn stdin(timeout: Duration) -> io::Result<Self> {
        let fd = io::stdin().as_fd().try_clone_to_owned()?;
        Ok(Self::new(File::from(fd), timeout))
    }

    pub fn new(source: File, timeout: Duration) -> Self {
        Self {
            source,
            cache: ByteCache::new(4096, MAX_LINE),
            timeout,
            dispatched: 0,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.source.as_raw_fd()
    }

    fn dispatch_lines<R: ResultConsumer>(&mut self, session: &mut Session<R>) {
        while let Some(line) = self.cache.extract_frame(b"\n") {
            let command = line.strip_suffix(b"\r").unwrap_or(line);
            if command.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match session.dispatch_job(command, self.timeout) {
                Ok((worker, job_id)) => {
                    self.dispatched += 1;
                    tracing::debug!(%worker, job_id, "Dispatched command");
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        command = %String::from_utf8_lossy(command),
                        "Command not dispatched"
                    );
                }
            }
        }
    }

    /// Treat unterminated trailing bytes as a last line.
    fn terminate_last_line(&mut self) {
        if self.cache.is_empty() {
            return;
        }
        if self.cache.available() == 0 && self.cache.double().is_err() {
            tracing::warn!(bytes = self.cache.size(), "Dropping oversized last line");
            self.cache.clear();
            return;
        }
        if let Err(e) = self.cache.extend_from_slice(b"\n") {
            tracing::warn!(error = %e, "Dropping last line");
            self.cache.clear();
        }
    }
}

impl<R: ResultConsumer> EventHandler<Session<R>> for CommandInput {
    fn handle_event(&mut self, _readiness: Readiness, session: &mut Session<R>) -> procmux::Result<Disposition> {
        if self.cache.available() == 0 {
            self.cache.double().map_err(|_| MuxError::CapacityExceeded {
                requested: self.cache.capacity().saturating_mul(2),
                max: self.cache.max_capacity(),
            })?;
        }

        let n = match self.cache.read_from(&mut self.source) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                return Ok(Disposition::Keep);
            }
            Err(e) => return Err(e.into()),
        };

        if n == 0 {
            self.terminate_last_line();
            self.dispatch_lines(session);
            tracing::debug!(dispatched = self.dispatched, "Input closed");
            return Ok(Disposition::Remove);
        }

        self.dispatch_lines(session);
        Ok(Disposition::Keep)
    }

    fn on_deregister(&mut self, session: &mut Session<R>) {
        session.finish_when_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procmux::{EventBroker, KvVec, WorkerChannel, WorkerId};
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    fn pipe_with(contents: &[u8]) -> File {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut writer = theirs;
        io::Write::write_all(&mut writer, contents).unwrap();
        drop(writer);
        File::from(std::os::fd::OwnedFd::from(ours))
    }

    #[test]
    fn dispatches_lines_and_finishes_on_eof() {
        let mut broker = EventBroker::new();
        let mut session = Session::new(|_: WorkerId, _: KvVec<'static>| {});
        let (parent, mut worker) = UnixStream::pair().unwrap();
        parent.set_nonblocking(true).unwrap();
        session
            .attach(&mut broker, WorkerChannel::new(WorkerId::new(1), parent, ByteCache::default()))
            .unwrap();

        let mut input = CommandInput::new(pipe_with(b"echo a\r\n\n  \necho b"), Duration::from_secs(3));
        let readable = Readiness::readable();
        assert_eq!(input.handle_event(readable, &mut session).unwrap(), Disposition::Keep);
        assert_eq!(input.handle_event(readable, &mut session).unwrap(), Disposition::Remove);
        input.on_deregister(&mut session);

        assert_eq!(input.dispatched, 2);
        assert_eq!(session.pending_jobs(), 2);
        assert!(!session.is_drained());

        let mut wire = vec![0u8; 256];
        let n = worker.read(&mut wire).unwrap();
        let wire = &wire[..n];
        assert!(wire.starts_with(b"job_id=0\0command=echo a\0timeout=3\x01\0\0"));
        assert!(wire.ends_with(b"job_id=1\0command=echo b\0timeout=3\x01\0\0"));
    }
}
