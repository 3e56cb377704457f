//! Controller and worker configuration.
//!
//! Defaults come from built-in values overridden by environment variables;
//! callers (the CLI) override both with the `with_*` setters. Invalid
//! environment values are ignored with a warning.

use std::str::FromStr;
use std::time::Duration;

use crate::channel::DEFAULT_WRITE_TIMEOUT;
use crate::iocache::{DEFAULT_CACHE_SIZE, MAX_CACHE_SIZE};

pub const ENV_WORKERS: &str = "PROCMUX_WORKERS";
pub const ENV_JOB_TIMEOUT: &str = "PROCMUX_JOB_TIMEOUT";
pub const ENV_INITIAL_CACHE: &str = "PROCMUX_INITIAL_CACHE";
pub const ENV_MAX_CACHE: &str = "PROCMUX_MAX_CACHE";
pub const ENV_SHELL: &str = "PROCMUX_SHELL";
pub const ENV_WRITE_TIMEOUT_MS: &str = "PROCMUX_WRITE_TIMEOUT_MS";

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SHELL: &str = "/bin/sh";

fn parse_env<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring invalid environment value");
            None
        }
    }
}

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    pub workers: usize,
    /// Sent with every job; the worker enforces it.
    pub job_timeout: Duration,
    pub initial_cache: usize,
    pub max_cache: usize,
    /// Longest the controller blocks on a worker socket that is not draining.
    pub write_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self::from_lookup(process_env)
    }
}

impl MuxConfig {
    /// Built-in defaults overridden by whatever `lookup` returns for the
    /// `PROCMUX_*` keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let max_cache = parse_env(&lookup, ENV_MAX_CACHE)
            .filter(|&n: &usize| n > 0)
            .unwrap_or(MAX_CACHE_SIZE);
        let initial_cache = parse_env(&lookup, ENV_INITIAL_CACHE)
            .filter(|&n: &usize| n > 0)
            .unwrap_or(DEFAULT_CACHE_SIZE)
            .min(max_cache);
        Self {
            workers: parse_env(&lookup, ENV_WORKERS)
                .filter(|&n: &usize| n > 0)
                .unwrap_or(DEFAULT_WORKERS),
            job_timeout: parse_env(&lookup, ENV_JOB_TIMEOUT)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_JOB_TIMEOUT),
            initial_cache,
            max_cache,
            write_timeout: parse_env(&lookup, ENV_WRITE_TIMEOUT_MS)
                .filter(|&ms: &u64| ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_WRITE_TIMEOUT),
        }
    }

    pub fn with_workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Also lowers the initial size if it would exceed the new ceiling.
    pub fn with_max_cache(mut self, bytes: usize) -> Self {
        self.max_cache = bytes;
        self.initial_cache = self.initial_cache.min(bytes);
        self
    }

    pub fn with_initial_cache(mut self, bytes: usize) -> Self {
        self.initial_cache = bytes.min(self.max_cache);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Interpreter that runs each command as `<shell> -c <command>`.
    pub shell: String,
    /// Largest frame the worker accepts from the controller.
    pub max_frame: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_lookup(process_env)
    }
}

impl WorkerConfig {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            shell: lookup(ENV_SHELL)
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SHELL.to_string()),
            max_frame: parse_env(&lookup, ENV_MAX_CACHE)
                .filter(|&n: &usize| n > 0)
                .unwrap_or(MAX_CACHE_SIZE),
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_max_frame(mut self, bytes: usize) -> Self {
        self.max_frame = bytes;
        self
    }
}
