//! Wire protocol between the controller and its workers.
//!
//! A channel carries frames, each `payload || MSG_DELIM`. A payload is a
//! key/value vector encoded with [`KEY_SEP`] and [`PAIR_SEP`]. The three
//! reserved sequences are distinct and never appear inside keys; values may
//! contain `KEY_SEP` but not `PAIR_SEP` (and therefore never `MSG_DELIM`,
//! which contains it).
//!
//! | Name        | Bytes            |
//! |-------------|------------------|
//! | `KEY_SEP`   | `=`              |
//! | `PAIR_SEP`  | `\0`             |
//! | `MSG_DELIM` | `\x01\0\0`       |
//!
//! Two message shapes travel over a channel:
//! - **Job** (controller → worker): `job_id`, `command`, `timeout`
//! - **JobResult** (worker → controller): `job_id`, `wait_status`,
//!   `exited_ok`, `timed_out`, `runtime`, `outstd`, `outerr`, `error_msg`

use std::borrow::Cow;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use super::kvvec::{self, KvVec, Ownership};
use crate::error::{MuxError, Result};

pub const KEY_SEP: &[u8] = b"=";
pub const PAIR_SEP: &[u8] = b"\0";
pub const MSG_DELIM: &[u8] = b"\x01\0\0";

/// Encode a vector and terminate it with [`MSG_DELIM`].
pub fn encode_frame(kvv: &KvVec<'_>) -> Result<Vec<u8>> {
    let mut frame = kvvec::encode(kvv, KEY_SEP, PAIR_SEP)?;
    frame.extend_from_slice(MSG_DELIM);
    Ok(frame)
}

/// Decode a frame payload (delimiter already stripped).
pub fn decode_payload(payload: &[u8], ownership: Ownership) -> Result<KvVec<'_>> {
    kvvec::decode(payload, KEY_SEP, PAIR_SEP, ownership)
}

fn parse_field<T: FromStr>(kvv: &KvVec<'_>, field: &'static str) -> Result<Option<T>> {
    match kvv.get_str(field) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| MuxError::InvalidField {
                field,
                value: raw.into_owned(),
            }),
    }
}

fn flag(value: bool) -> &'static [u8] {
    if value { b"1" } else { b"0" }
}

/// A command for a worker to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub job_id: u64,
    pub command: Vec<u8>,
    /// Advisory; enforced by the worker, never by the controller.
    pub timeout: Duration,
}

impl Job {
    pub fn new(job_id: u64, command: impl Into<Vec<u8>>, timeout: Duration) -> Self {
        Self {
            job_id,
            command: command.into(),
            timeout,
        }
    }

    /// Wire form: `job_id`, `command`, `timeout` (whole seconds), in that order.
    pub fn to_kvvec(&self) -> KvVec<'_> {
        KvVec::with_capacity(3)
            .with(&b"job_id"[..], self.job_id.to_string().into_bytes())
            .with(&b"command"[..], &self.command[..])
            .with(&b"timeout"[..], self.timeout.as_secs().to_string().into_bytes())
    }

    pub fn from_kvvec(kvv: &KvVec<'_>) -> Result<Self> {
        let job_id = parse_field(kvv, "job_id")?.ok_or(MuxError::MissingField("job_id"))?;
        let command = kvv
            .get("command")
            .ok_or(MuxError::MissingField("command"))?
            .to_vec();
        let timeout = parse_field::<u64>(kvv, "timeout")?
            .map(Duration::from_secs)
            .ok_or(MuxError::MissingField("timeout"))?;
        Ok(Self {
            job_id,
            command,
            timeout,
        })
    }
}

/// Outcome of a job as reported by a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobResult {
    /// Absent only when the worker could not parse the job at all.
    pub job_id: Option<u64>,
    /// Raw wait status of the command's shell (`None` if it never ran).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_status: Option<i32>,
    pub exited_ok: bool,
    pub timed_out: bool,
    /// Wall-clock seconds.
    pub runtime: f64,
    pub outstd: String,
    pub outerr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl JobResult {
    pub fn for_job(job_id: u64) -> Self {
        Self {
            job_id: Some(job_id),
            ..Self::default()
        }
    }

    pub fn failed(job_id: Option<u64>, error: impl Into<String>) -> Self {
        Self {
            job_id,
            error_msg: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn to_kvvec(&self) -> KvVec<'_> {
        let mut kvv = KvVec::with_capacity(8);
        if let Some(job_id) = self.job_id {
            kvv.push(&b"job_id"[..], job_id.to_string().into_bytes());
        }
        if let Some(status) = self.wait_status {
            kvv.push(&b"wait_status"[..], status.to_string().into_bytes());
        }
        kvv.push(&b"exited_ok"[..], flag(self.exited_ok));
        kvv.push(&b"timed_out"[..], flag(self.timed_out));
        kvv.push(&b"runtime"[..], format!("{:.6}", self.runtime).into_bytes());
        kvv.push(&b"outstd"[..], strip_reserved(&self.outstd));
        kvv.push(&b"outerr"[..], strip_reserved(&self.outerr));
        if let Some(error) = &self.error_msg {
            kvv.push(&b"error_msg"[..], strip_reserved(error));
        }
        kvv
    }

    /// Lenient parse: only a malformed `job_id` is an error; other fields
    /// fall back to their defaults.
    pub fn from_kvvec(kvv: &KvVec<'_>) -> Result<Self> {
        let job_id = parse_field(kvv, "job_id")?;
        let text = |key: &str| {
            kvv.get_str(key)
                .map(Cow::into_owned)
                .unwrap_or_default()
        };
        Ok(Self {
            job_id,
            wait_status: parse_field(kvv, "wait_status").ok().flatten(),
            exited_ok: kvv.get("exited_ok") == Some(&b"1"[..]),
            timed_out: kvv.get("timed_out") == Some(&b"1"[..]),
            runtime: parse_field(kvv, "runtime").ok().flatten().unwrap_or(0.0),
            outstd: text("outstd"),
            outerr: text("outerr"),
            error_msg: kvv.get_str("error_msg").map(Cow::into_owned),
        })
    }
}

/// Drop NUL bytes so arbitrary text can travel as a value.
fn strip_reserved(text: &str) -> Cow<'_, [u8]> {
    let bytes = text.as_bytes();
    if bytes.contains(&0) {
        Cow::Owned(bytes.iter().copied().filter(|&b| b != 0).collect())
    } else {
        Cow::Borrowed(bytes)
    }
}
