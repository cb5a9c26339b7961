use anyhow::{Context, Result};
use display_commander::{log_info, log_warn, AddonRuntime, StateManager};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Args {
    stream_logs: bool,
    duration: Option<Duration>,
    no_etw: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        stream_logs: false,
        duration: None,
        no_etw: false,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--stream-logs" => args.stream_logs = true,
            "--no-etw" => args.no_etw = true,
            "--duration" => {
                let secs: u64 = iter
                    .next()
                    .context("--duration needs a value in seconds")?
                    .parse()
                    .context("--duration must be a whole number of seconds")?;
                args.duration = Some(Duration::from_secs(secs));
            }
            other => anyhow::bail!("unknown argument: {}", other),
        }
    }
    Ok(args)
}

fn main() -> Result<()> {
    let result = run();
    let _ = display_commander::logger::finalize_logs();
    result
}

fn run() -> Result<()> {
    let args = parse_args()?;

    if args.stream_logs {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_max_level(tracing::Level::DEBUG)
            .init();
    }

    let state = match StateManager::new() {
        Ok(state) => Arc::new(state),
        Err(e) => {
            eprintln!("Settings store unavailable ({:#}); using defaults", e);
            Arc::new(StateManager::in_memory(Default::default()))
        }
    };
    if args.no_etw {
        state.update(|s| s.etw_enabled = false);
    }

    let stream = args.stream_logs || state.read(|s| s.stream_logs);
    if let Some(log_dir) = state.logs_dir() {
        let retention = state.read(|s| s.log_retention_count);
        display_commander::logger::init_logger(log_dir, "display_commander", retention, stream)?;
    }

    log_info!("=== Display Commander Starting ===");
    if let Some(log_path) = display_commander::logger::get_log_path() {
        log_info!("Log file: {}", log_path.display());
    }
    if stream {
        log_info!("Streaming mode enabled");
    } else {
        log_info!("Buffered mode - logs will be written to file on exit");
    }

    let runtime = AddonRuntime::attach(Arc::clone(&state))?;

    let started = Instant::now();
    let mut etw_error_reported = false;
    loop {
        std::thread::sleep(Duration::from_secs(1));

        let perf = runtime.perf().text();
        let flip = runtime
            .etw()
            .and_then(|etw| etw.flip_state())
            .map(|f| format!("{} ({}={})", f.mode.label(), f.property, f.raw_value))
            .unwrap_or_else(|| "(No data yet)".to_string());
        println!(
            "{} | Flip Mode: {}",
            if perf.is_empty() { "FPS: (no frames)" } else { perf.as_str() },
            flip
        );

        if !etw_error_reported {
            if let Some(error) = runtime.etw().and_then(|etw| etw.last_error()) {
                log_warn!("ETW: {}", error);
                etw_error_reported = true;
            }
        }

        if args.duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
    }

    if let Some(report) = runtime.detach() {
        log_info!(
            "Restored {} displays ({} failed)",
            report.restored.len(),
            report.failed.len()
        );
    }
    log_info!("=== Display Commander Stopped ===");
    Ok(())
}
