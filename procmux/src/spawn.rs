//! Worker process creation.
//!
//! A spawned worker talks to the controller over one end of a Unix socket
//! pair, used as both its stdin and stdout. Stderr is inherited so worker
//! logs reach the controller's terminal without touching the protocol.

use std::ffi::OsString;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::os::unix::net::UnixStream;
use std::process::{Child, Command, Stdio};

use crate::channel::{WorkerChannel, WorkerId};
use crate::iocache::ByteCache;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
}

/// A freshly started worker and the parent end of its socket.
#[derive(Debug)]
pub struct SpawnedWorker {
    pub child: Child,
    /// Non-blocking.
    pub stream: UnixStream,
}

impl SpawnedWorker {
    pub fn id(&self) -> WorkerId {
        WorkerId::new(self.child.id())
    }

    pub fn into_channel(self, cache: ByteCache) -> WorkerChannel {
        WorkerChannel::new(self.id(), self.stream, cache).with_child(self.child)
    }
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner {
    fn spawn(&self) -> Result<SpawnedWorker, SpawnError>;
}

/// Runs an external program with the socket as stdin and stdout.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self) -> Result<SpawnedWorker, SpawnError> {
        let (parent, worker_end) = UnixStream::pair()?;
        let worker_out = worker_end.try_clone()?;

        // The Command owns the child's ends and closes them once spawned, so
        // the parent sees EOF when the worker exits.
        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::from(OwnedFd::from(worker_end)))
            .stdout(Stdio::from(OwnedFd::from(worker_out)))
            .stderr(Stdio::inherit())
            // Terminal signals reach only the controller, which stops workers itself.
            .process_group(0)
            .spawn()?;

        parent.set_nonblocking(true)?;
        tracing::debug!(pid = child.id(), program = ?self.program, "Spawned worker");
        Ok(SpawnedWorker {
            child,
            stream: parent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::kvvec::KvVec;
    use crate::channel::{ReadOutcome, WorkerState};
    use std::time::Duration;

    #[test]
    fn spawned_cat_echoes_jobs_back() {
        let spawned = CommandSpawner::new("cat").spawn().unwrap();
        let id = spawned.id();
        let mut channel = spawned.into_channel(ByteCache::default());
        channel.mark_active();
        channel.send_job(b"echo hi", Duration::from_secs(5)).unwrap();

        let mut records = Vec::new();
        let mut consumer = |_: WorkerId, record: KvVec<'static>| records.push(record);
        let mut frames = 0;
        for _ in 0..200 {
            if let ReadOutcome::Frames { frames: n, .. } = channel.on_readable(&mut consumer).unwrap() {
                frames += n;
            }
            if frames > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(frames, 1);
        assert_eq!(records[0].get("command"), Some(&b"echo hi"[..]));
        assert_eq!(channel.id(), id);

        let status = channel.terminate();
        assert!(status.is_some());
        assert_eq!(channel.state(), WorkerState::Terminated);
    }

    #[test]
    fn worker_exit_is_seen_as_eof() {
        let spawned = CommandSpawner::new("sh").with_args(["-c", "exit 0"]).spawn().unwrap();
        let mut channel = spawned.into_channel(ByteCache::default());
        channel.mark_active();

        let mut consumer = |_: WorkerId, _: KvVec<'static>| {};
        let mut result = channel.on_readable(&mut consumer);
        for _ in 0..200 {
            if result.is_err() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
            result = channel.on_readable(&mut consumer);
        }
        assert!(matches!(result, Err(crate::MuxError::PeerClosed(_))));
        assert_eq!(channel.state(), WorkerState::Crashed);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = CommandSpawner::new("/nonexistent/procmux-worker")
            .spawn()
            .unwrap_err();
        assert!(matches!(err, SpawnError::Spawn(_)));
    }

    #[test]
    fn env_is_passed_through() {
        let spawned = CommandSpawner::new("sh")
            .with_arg("-c")
            .with_arg("printf 'v=%s\\001\\000\\000' \"$PROCMUX_TEST_VALUE\"")
            .with_env("PROCMUX_TEST_VALUE", "42")
            .spawn()
            .unwrap();
        let mut channel = spawned.into_channel(ByteCache::default());

        let mut records = Vec::new();
        let mut consumer = |_: WorkerId, record: KvVec<'static>| records.push(record);
        let mut frames = 0;
        for _ in 0..200 {
            match channel.on_readable(&mut consumer) {
                Ok(ReadOutcome::Frames { frames: n, .. }) => frames += n,
                Ok(_) => {}
                Err(_) => break,
            }
            if frames > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("v"), Some(&b"42"[..]));
    }
}
