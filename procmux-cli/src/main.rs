use std::process;
use std::time::Duration;

use anyhow::Context;
use procmux::{
    ByteCache, CommandSpawner, EventBroker, MuxConfig, Session, WorkerConfig, WorkerSpawner,
    run_event_loop,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod input;
mod output;

use input::CommandInput;
use output::PrintConsumer;

const USAGE: &str = "\
Usage: procmux [run] [--workers <n>] [--timeout <secs>] [--json]
       procmux worker

Reads one shell command per line from stdin and runs each on a pool of
worker processes, printing results as they complete.

Options:
  --workers <n>      Number of worker processes [default: $PROCMUX_WORKERS or 4]
  --timeout <secs>   Per-command timeout, 0 for none [default: $PROCMUX_JOB_TIMEOUT or 10]
  --json             Print one JSON object per result
  --version          Print version and exit";

#[derive(Debug, PartialEq, Eq)]
enum Mode {
    Run(RunArgs),
    Worker,
    Version,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct RunArgs {
    workers: Option<usize>,
    timeout: Option<Duration>,
    json: bool,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mode = match parse_args(&args) {
        Ok(mode) => mode,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    let result = match mode {
        Mode::Version => {
            println!("procmux {}", procmux::PROCMUX_VERSION);
            return;
        }
        Mode::Worker => {
            init_tracing("worker");
            run_worker()
        }
        Mode::Run(args) => {
            init_tracing("controller");
            run(args)
        }
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn parse_args(args: &[String]) -> Result<Mode, String> {
    let mut rest = args.get(1..).unwrap_or_default();
    match rest.first().map(String::as_str) {
        Some("worker") => {
            if let Some(extra) = rest.get(1) {
                return Err(format!("unexpected argument: {extra}"));
            }
            return Ok(Mode::Worker);
        }
        Some("run") => rest = &rest[1..],
        _ => {}
    }

    let mut run = RunArgs::default();
    let mut i = 0;
    while i < rest.len() {
        match rest[i].as_str() {
            "--workers" | "-w" => {
                i += 1;
                let raw = rest.get(i).ok_or("--workers requires a value")?;
                let n: usize = raw
                    .parse()
                    .map_err(|_| format!("invalid worker count: {raw}"))?;
                if n == 0 {
                    return Err("--workers must be at least 1".to_string());
                }
                run.workers = Some(n);
            }
            "--timeout" | "-t" => {
                i += 1;
                let raw = rest.get(i).ok_or("--timeout requires a value")?;
                let secs: u64 = raw
                    .parse()
                    .map_err(|_| format!("invalid timeout: {raw}"))?;
                run.timeout = Some(Duration::from_secs(secs));
            }
            "--json" => run.json = true,
            "--version" | "-V" => return Ok(Mode::Version),
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }
    Ok(Mode::Run(run))
}

/// Logs go to stderr; stdout carries results (controller) or frames (worker).
fn init_tracing(role: &str) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PROCMUX_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("procmux={level},procmux_cli={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");
    let registry = tracing_subscriber::registry().with(filter);
    let _ = if use_json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    tracing::debug!(role, version = procmux::PROCMUX_VERSION, "Logging initialized");
}

fn run(args: RunArgs) -> anyhow::Result<i32> {
    let mut config = MuxConfig::default();
    if let Some(n) = args.workers {
        config = config.with_workers(n);
    }
    if let Some(timeout) = args.timeout {
        config = config.with_job_timeout(timeout);
    }
    tracing::info!(
        workers = config.workers,
        timeout_secs = config.job_timeout.as_secs(),
        max_cache = config.max_cache,
        "Starting controller"
    );

    let exe = std::env::current_exe().context("locating procmux executable")?;
    let spawner = CommandSpawner::new(exe).with_arg("worker");

    let mut broker = EventBroker::new();
    let mut session = Session::new(PrintConsumer::new(args.json));

    let setup = start_workers(&spawner, &config, &mut broker, &mut session)
        .and_then(|()| watch_inputs(&config, &mut broker));
    if let Err(e) = setup {
        session.shutdown(&mut broker);
        return Err(e);
    }

    let exit = run_event_loop(&mut broker, &mut session);
    session.shutdown(&mut broker);
    let exit = exit?;

    tracing::info!(
        ?exit,
        printed = session.consumer().printed(),
        "Controller finished"
    );
    Ok(exit.exit_code())
}

fn start_workers(
    spawner: &impl WorkerSpawner,
    config: &MuxConfig,
    broker: &mut EventBroker<Session<PrintConsumer>>,
    session: &mut Session<PrintConsumer>,
) -> anyhow::Result<()> {
    for _ in 0..config.workers {
        let spawned = spawner.spawn().context("spawning worker")?;
        let channel = spawned
            .into_channel(ByteCache::new(config.initial_cache, config.max_cache))
            .with_write_timeout(config.write_timeout);
        session.attach(broker, channel).context("registering worker")?;
    }
    Ok(())
}

/// Signals, then stdin. Must follow `start_workers` so the workers do not
/// inherit the blocked signal mask.
fn watch_inputs(config: &MuxConfig, broker: &mut EventBroker<Session<PrintConsumer>>) -> anyhow::Result<()> {
    #[cfg(target_os = "linux")]
    {
        let watch = procmux::SignalWatch::standard().context("watching signals")?;
        broker.register(watch.raw_fd(), watch);
    }

    let input = CommandInput::stdin(config.job_timeout).context("reading stdin")?;
    broker.register(input.raw_fd(), input);
    Ok(())
}

fn run_worker() -> anyhow::Result<i32> {
    procmux::worker::unblock_inherited_signals().context("restoring signal mask")?;
    let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
    runtime.block_on(procmux::worker::run_worker(WorkerConfig::default()))?;
    Ok(0)
}
