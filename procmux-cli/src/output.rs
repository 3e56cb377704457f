//! Result printing for `procmux run`.

use std::io::{self, Write};

use procmux::{JobResult, KvVec, ResultConsumer, WorkerId};
use serde::Serialize;

#[derive(Serialize)]
struct JsonLine<'a> {
    worker: WorkerId,
    #[serde(flatten)]
    result: &'a JobResult,
}

/// Prints each result to stdout as it arrives, as text or one JSON object per line.
pub struct PrintConsumer {
    json: bool,
    printed: u64,
}

impl PrintConsumer {
    pub fn new(json: bool) -> Self {
        Self { json, printed: 0 }
    }

    pub fn printed(&self) -> u64 {
        self.printed
    }

    fn render(&self, worker: WorkerId, result: &JobResult) -> String {
        if self.json {
            render_json(worker, result)
        } else {
            render_text(worker, result)
        }
    }
}

impl ResultConsumer for PrintConsumer {
    fn consume(&mut self, worker: WorkerId, record: KvVec<'static>) {
        let result = match JobResult::from_kvvec(&record) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(%worker, error = %e, ?record, "Unreadable result");
                return;
            }
        };
        let rendered = self.render(worker, &result);
        let mut out = io::stdout().lock();
        if let Err(e) = out.write_all(rendered.as_bytes()).and_then(|()| out.flush()) {
            tracing::warn!(error = %e, "Failed to print result");
            return;
        }
        self.printed += 1;
    }
}

fn render_json(worker: WorkerId, result: &JobResult) -> String {
    match serde_json::to_string(&JsonLine { worker, result }) {
        Ok(mut line) => {
            line.push('\n');
            line
        }
        Err(e) => {
            tracing::warn!(error = %e, "Result serialization failed");
            String::new()
        }
    }
}

fn render_text(worker: WorkerId, result: &JobResult) -> String {
    let job = result
        .job_id
        .map_or_else(|| "?".to_string(), |id| id.to_string());
    let status = if result.timed_out {
        "timed out".to_string()
    } else if let Some(error) = &result.error_msg {
        format!("error: {error}")
    } else if result.exited_ok {
        "ok".to_string()
    } else {
        match result.wait_status {
            Some(raw) => format!("failed (wait status {raw})"),
            None => "failed".to_string(),
        }
    };

    let mut text = format!(
        "[worker {worker} job {job}] {status} in {:.3}s\n",
        result.runtime
    );
    for (label, body) in [("", &result.outstd), ("stderr: ", &result.outerr)] {
        for line in body.lines() {
            text.push_str("  ");
            text.push_str(label);
            text.push_str(line);
            text.push('\n');
        }
    }
    text
}
