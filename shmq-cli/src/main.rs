use std::process::ExitCode;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use shmq::orchestrator::DEFAULT_REQUEST;
use shmq::{
    AppendSuffix, HostSession, ResourceNames, Role, RunMode, SessionConfig, SessionState,
    SessionSummary, ShutdownFlag, TERMINATION_SIGNALS, WorkerSession, install_signal_handlers,
};

const USAGE: &str = "\
Usage: shmq [--host] [options]

Runs one side of a shared-memory request/response exchange.
Without --host the process acts as the worker.

Options:
  --host                      Act as the host (sends requests, reads replies)
  --payload <text>            Request to send; repeatable [default: \"payload of task-1\"]
  --continuous                Host: send every --payload. Worker: serve until SIGTERM/SIGINT
  --suffix <text>             Worker: text appended to each request [default: \" processed\"]
  --unlink                    Worker: also remove the named objects on exit
  --min-segment-size <bytes>  Minimum size of a newly created segment [default: 512]
  -h, --help                  Print this help

Environment:
  SHMQ_SEGMENT, SHMQ_HOST_QUEUE, SHMQ_WORKER_QUEUE   Kernel object names
  SHMQ_LOG (debug|info|warn|error), RUST_LOG         Log filter
  LOG_FORMAT=json                                    JSON logs on stderr";

#[derive(Debug, PartialEq)]
struct Args {
    host: bool,
    payloads: Vec<String>,
    continuous: bool,
    suffix: Option<String>,
    unlink: bool,
    min_segment_size: Option<usize>,
}

#[derive(Debug, PartialEq)]
enum Command {
    Help,
    Run(Args),
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(Command::Run(args)) => args,
        Ok(Command::Help) => {
            println!("{USAGE}");
            return ExitCode::SUCCESS;
        }
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    init_tracing();

    match run(&args) {
        Ok(summary) => {
            match serde_json::to_string_pretty(&summary) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("error: JSON serialization failed: {e}");
                    return ExitCode::FAILURE;
                }
            }
            if summary.state == SessionState::Completed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr; stdout carries the session summary.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("SHMQ_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("shmq={base_level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut parsed = Args {
        host: false,
        payloads: Vec::new(),
        continuous: false,
        suffix: None,
        unlink: false,
        min_segment_size: None,
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--host" => parsed.host = true,
            "--continuous" => parsed.continuous = true,
            "--unlink" => parsed.unlink = true,
            "--payload" => {
                i += 1;
                let payload = args.get(i).ok_or("--payload requires a value")?;
                parsed.payloads.push(payload.clone());
            }
            "--suffix" => {
                i += 1;
                parsed.suffix = Some(args.get(i).ok_or("--suffix requires a value")?.clone());
            }
            "--min-segment-size" => {
                i += 1;
                let raw = args.get(i).ok_or("--min-segment-size requires a value")?;
                let bytes = raw
                    .parse::<usize>()
                    .map_err(|_| format!("invalid --min-segment-size '{raw}'"))?;
                parsed.min_segment_size = Some(bytes);
            }
            "--help" | "-h" => return Ok(Command::Help),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    if parsed.host && parsed.suffix.is_some() {
        return Err("--suffix only applies to the worker".to_string());
    }
    if !parsed.host && !parsed.payloads.is_empty() {
        return Err("--payload only applies with --host".to_string());
    }

    Ok(Command::Run(parsed))
}

fn run(args: &Args) -> anyhow::Result<SessionSummary> {
    let shutdown = ShutdownFlag::new();
    install_signal_handlers(&shutdown, &TERMINATION_SIGNALS)
        .context("failed to install termination handlers")?;

    let names = ResourceNames::from_env().context("invalid resource names")?;
    let role = Role::from_host_flag(args.host);
    let run_mode = if args.continuous {
        RunMode::Continuous
    } else {
        RunMode::SingleShot
    };

    let mut config = SessionConfig::new(role)
        .with_names(names)
        .with_run_mode(run_mode);
    if args.unlink {
        config = config.with_unlink_on_teardown(true);
    }
    if let Some(bytes) = args.min_segment_size {
        config = config.with_min_segment_size(bytes);
    }

    tracing::info!(
        role = %role,
        segment = %config.names.segment,
        host_queue = %config.names.host_queue,
        worker_queue = %config.names.worker_queue,
        "Starting session"
    );

    // Session errors are reported through the summary's state; the error itself
    // is logged here.
    let summary = match role {
        Role::Host => {
            let requests = if args.payloads.is_empty() {
                vec![DEFAULT_REQUEST.as_bytes().to_vec()]
            } else {
                args.payloads.iter().map(|p| p.as_bytes().to_vec()).collect()
            };
            let mut host = HostSession::new(config, shutdown, requests)?;
            if let Err(e) = host.run() {
                tracing::error!(error = %e, "Host session failed");
            }
            host.summary()
        }
        Role::Worker => {
            let handler = match &args.suffix {
                Some(suffix) => AppendSuffix::new(suffix.as_bytes()),
                None => AppendSuffix::default(),
            };
            let mut worker = WorkerSession::new(config, shutdown, handler)?;
            if let Err(e) = worker.run() {
                tracing::error!(error = %e, "Worker session failed");
            }
            worker.summary()
        }
    };

    Ok(summary)
}
