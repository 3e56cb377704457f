//! Worker process runtime.
//!
//! This is the other end of a [`WorkerChannel`](crate::channel::WorkerChannel):
//! jobs arrive as frames on stdin, results leave as frames on stdout. Stderr
//! is free for logs.
//!
//! Architecture:
//! - One reader decodes job frames and spawns a task per job
//! - Job tasks run `<shell> -c <command>` and send their result to an mpsc channel
//! - One writer task drains the channel onto stdout, so frames never interleave
//!
//! On stdin EOF the worker waits for running jobs, flushes their results and exits.

use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use nix::sys::signal::{SigSet, Signal};
use tokio::io::{AsyncRead, AsyncWrite, stdin, stdout};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::KvFrameCodec;
use crate::bridge::protocol::{Job, JobResult};
use crate::config::WorkerConfig;

/// Serve jobs on stdin/stdout until stdin closes.
pub async fn run_worker(config: WorkerConfig) -> io::Result<()> {
    tracing::info!(shell = %config.shell, pid = std::process::id(), "Worker starting");
    serve(stdin(), stdout(), config).await
}

/// Serve jobs read from `reader`, writing results to `writer`.
pub async fn serve<R, W>(reader: R, writer: W, config: WorkerConfig) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut jobs_in = FramedRead::new(reader, KvFrameCodec::with_max_frame(config.max_frame));
    let mut results_out = FramedWrite::new(writer, KvFrameCodec::new());

    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<JobResult>();
    let writer_task = tokio::spawn(async move {
        while let Some(result) = result_rx.recv().await {
            if let Err(e) = results_out.send(result.to_kvvec()).await {
                tracing::error!(error = %e, job_id = ?result.job_id, "Failed to write result");
                return Err(e);
            }
            tracing::trace!(job_id = ?result.job_id, "Result written");
        }
        Ok(())
    });

    let shell: Arc<str> = Arc::from(config.shell.as_str());
    let mut running = JoinSet::new();

    while let Some(frame) = jobs_in.next().await {
        let record = match frame {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(error = %e, "Job stream failed");
                break;
            }
        };
        match Job::from_kvvec(&record) {
            Ok(job) => {
                tracing::debug!(job_id = job.job_id, "Job received");
                let tx = result_tx.clone();
                let shell = Arc::clone(&shell);
                running.spawn(async move {
                    let result = execute(&shell, job).await;
                    if tx.send(result).is_err() {
                        tracing::warn!("Result writer gone, dropping result");
                    }
                });
            }
            Err(e) => {
                let job_id = record.get_str("job_id").and_then(|s| s.parse().ok());
                tracing::warn!(error = %e, ?job_id, "Rejecting invalid job");
                if result_tx.send(JobResult::failed(job_id, e.to_string())).is_err() {
                    tracing::warn!(?job_id, "Result writer gone, dropping rejection");
                }
            }
        }
    }

    tracing::debug!(running = running.len(), "Input closed, waiting for jobs");
    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Job task failed");
        }
    }
    drop(result_tx);

    writer_task.await.map_err(io::Error::other)??;
    tracing::info!("Worker exiting");
    Ok(())
}

/// Run one job to completion or timeout. A zero timeout means no limit.
pub async fn execute(shell: &str, job: Job) -> JobResult {
    let started = Instant::now();
    let mut result = JobResult::for_job(job.job_id);

    let child = Command::new(shell)
        .arg("-c")
        .arg(OsStr::from_bytes(&job.command))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(e) => {
            result.error_msg = Some(format!("failed to start {shell}: {e}"));
            result.runtime = started.elapsed().as_secs_f64();
            return result;
        }
    };

    let output = if job.timeout.is_zero() {
        Ok(child.wait_with_output().await)
    } else {
        tokio::time::timeout(job.timeout, child.wait_with_output()).await
    };

    match output {
        Ok(Ok(output)) => {
            result.wait_status = Some(output.status.into_raw());
            result.exited_ok = output.status.success();
            result.outstd = printable(&output.stdout);
            result.outerr = printable(&output.stderr);
        }
        Ok(Err(e)) => {
            result.error_msg = Some(format!("failed to collect output: {e}"));
        }
        Err(_) => {
            // Dropping the wait future dropped the child, which kills it.
            result.timed_out = true;
            result.error_msg = Some(format!("timed out after {}s", job.timeout.as_secs()));
        }
    }
    result.runtime = started.elapsed().as_secs_f64();
    tracing::debug!(
        job_id = job.job_id,
        exited_ok = result.exited_ok,
        timed_out = result.timed_out,
        runtime = result.runtime,
        "Job finished"
    );
    result
}

/// Lossy UTF-8 with NUL removed, so output never collides with the separators.
fn printable(bytes: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    text.retain(|c| c != '\0');
    text
}

/// Clear signals a controller may have left blocked in our inherited mask.
/// The process runtime relies on SIGCHLD to notice job exits.
pub fn unblock_inherited_signals() -> io::Result<()> {
    let mut mask = SigSet::empty();
    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGCHLD] {
        mask.add(signal);
    }
    mask.thread_unblock().map_err(io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::kvvec::KvVec;
    use crate::bridge::protocol::{self, MSG_DELIM};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn sh() -> WorkerConfig {
        WorkerConfig::from_lookup(|_| None)
    }

    #[tokio::test]
    async fn echo_hi() {
        let result = execute("/bin/sh", Job::new(0, "echo hi", Duration::from_secs(10))).await;
        assert_eq!(result.job_id, Some(0));
        assert_eq!(result.outstd, "hi\n");
        assert!(result.exited_ok);
        assert!(!result.timed_out);
        assert_eq!(result.wait_status, Some(0));
        assert!(result.error_msg.is_none());
    }

    #[tokio::test]
    async fn failing_command_reports_status() {
        let result = execute("/bin/sh", Job::new(3, "echo oops >&2; exit 1", Duration::from_secs(10))).await;
        assert!(!result.exited_ok);
        assert_eq!(result.wait_status, Some(256));
        assert_eq!(result.outerr, "oops\n");
    }

    #[tokio::test]
    async fn timeout_kills_the_job() {
        let result = execute("/bin/sh", Job::new(1, "sleep 30", Duration::from_secs(1))).await;
        assert!(result.timed_out);
        assert!(!result.exited_ok);
        assert!(result.runtime < 10.0);
    }

    #[tokio::test]
    async fn nul_bytes_are_stripped() {
        let result = execute("/bin/sh", Job::new(2, r"printf 'a\000b'", Duration::from_secs(10))).await;
        assert_eq!(result.outstd, "ab");
    }

    #[tokio::test]
    async fn missing_shell_is_reported() {
        let result = execute("/nonexistent/shell", Job::new(4, "true", Duration::from_secs(1))).await;
        assert!(!result.exited_ok);
        assert!(result.error_msg.unwrap().contains("failed to start"));
    }

    #[tokio::test]
    async fn lost_result_writer_ends_serve_with_error() {
        let (results_side, unread) = tokio::io::duplex(1024);
        drop(unread);

        let mut input = Vec::new();
        for id in 0..4 {
            input.extend_from_slice(format!("job_id={id}\0command=true").as_bytes());
            input.extend_from_slice(MSG_DELIM);
        }
        let served = tokio::time::timeout(
            Duration::from_secs(5),
            serve(input.as_slice(), results_side, sh()),
        )
        .await
        .expect("serve should finish once its writer is gone");
        assert!(served.is_err());
    }

    #[tokio::test]
    async fn serve_answers_every_frame() {
        let (controller, worker) = tokio::io::duplex(64 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker);
        let server = tokio::spawn(serve(worker_read, worker_write, sh()));

        let (ctrl_read, mut ctrl_write) = tokio::io::split(controller);
        for job in [
            Job::new(0, "echo one", Duration::from_secs(10)),
            Job::new(1, "echo two", Duration::from_secs(10)),
        ] {
            let frame = protocol::encode_frame(&job.to_kvvec()).unwrap();
            ctrl_write.write_all(&frame).await.unwrap();
        }
        ctrl_write.write_all(b"job_id=2\0command=true").await.unwrap();
        ctrl_write.write_all(MSG_DELIM).await.unwrap();
        ctrl_write.shutdown().await.unwrap();

        let mut results_in = FramedRead::new(ctrl_read, KvFrameCodec::new());
        let mut results: Vec<JobResult> = Vec::new();
        for _ in 0..3 {
            let record: KvVec<'static> = results_in.next().await.unwrap().unwrap();
            results.push(JobResult::from_kvvec(&record).unwrap());
        }
        results.sort_by_key(|r| r.job_id);

        assert_eq!(results[0].outstd, "one\n");
        assert_eq!(results[1].outstd, "two\n");
        assert_eq!(results[2].job_id, Some(2));
        assert_eq!(results[2].error_msg.as_deref(), Some("missing field: timeout"));

        server.await.unwrap().unwrap();
    }
}
