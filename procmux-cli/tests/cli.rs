//! End-to-end runs of the `procmux` binary.

use std::io::Write;
use std::process::{Command, Output, Stdio};

fn procmux(args: &[&str], stdin: &str) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_procmux"))
        .args(args)
        .env("PROCMUX_LOG", "error")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("procmux should start");
    child
        .stdin
        .take()
        .unwrap()
        .write_all(stdin.as_bytes())
        .unwrap();
    child.wait_with_output().unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn runs_a_command_and_exits_cleanly() {
    let output = procmux(&["run", "--workers", "2"], "echo hi\n");
    assert_eq!(output.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let text = stdout(&output);
    assert!(text.contains("] ok in "), "{text}");
    assert!(text.contains("\n  hi\n"), "{text}");
}

#[test]
fn json_output_has_one_object_per_command() {
    let output = procmux(&["--workers", "2", "--json"], "echo one\necho two\nexit 3");
    assert_eq!(output.status.code(), Some(0));

    let mut results: Vec<serde_json::Value> = stdout(&output)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(results.len(), 3);
    results.sort_by_key(|r| r["outstd"].as_str().unwrap_or_default().to_string());

    let failed = &results[0];
    assert_eq!(failed["exited_ok"], false);
    assert_eq!(failed["wait_status"], 3 << 8);

    let outputs: Vec<_> = results[1..].iter().map(|r| r["outstd"].clone()).collect();
    assert_eq!(outputs, vec!["one\n", "two\n"]);
    for result in &results {
        assert!(result["worker"].as_u64().is_some());
        assert_eq!(result["timed_out"], false);
    }
}

#[test]
fn timeout_is_reported() {
    let output = procmux(&["--workers", "1", "--timeout", "1", "--json"], "sleep 30\n");
    assert_eq!(output.status.code(), Some(0));

    let result: serde_json::Value = serde_json::from_str(stdout(&output).trim()).unwrap();
    assert_eq!(result["timed_out"], true);
    assert_eq!(result["exited_ok"], false);
}

#[test]
fn worker_crash_exits_1() {
    // The job shell's parent is the worker process.
    let output = procmux(&["--workers", "1"], "kill -KILL $PPID\n");
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
}

#[test]
fn empty_input_exits_without_output() {
    let output = procmux(&["--workers", "1"], "");
    assert_eq!(output.status.code(), Some(0));
    assert!(output.stdout.is_empty());
}

#[test]
fn usage_errors_exit_2() {
    let output = procmux(&["--bogus"], "");
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown flag: --bogus"));

    let output = procmux(&["--workers", "none"], "");
    assert_eq!(output.status.code(), Some(2));
}
