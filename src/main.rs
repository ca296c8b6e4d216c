use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use spectrum_courier::args::{convert_filter, Args};
use spectrum_courier::controller::{Controller, CycleError};
use spectrum_courier::corrector::Corrector;
use spectrum_courier::delivery::{Delivery, HttpPoster};
use spectrum_courier::engine::{EngineLink, EngineReply, EngineServer};
use spectrum_courier::retry::RetryProcessor;
use spectrum_courier::store::FileStore;
use tracing::{error, info, warn};

/// Backoff after a cycle that should succeed on the next try.
const TRANSIENT_BACKOFF: Duration = Duration::from_secs(10);
/// Backoff while waiting for fresh configuration or a restarted bridge.
const PERMANENT_BACKOFF: Duration = Duration::from_secs(60);

fn main() -> io::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || flag.store(false, Ordering::Relaxed))
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    // The engine bridge owns the radio; we only hold our end of the link
    let (link, server) = EngineLink::pair(1, args.device_id.clone(), args.campaign.clone());
    let _bridge = spawn_engine_bridge(&args.engine_cmd, server)?;

    let poster = HttpPoster::new().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let controller = Controller {
        params_endpoint: args.params.clone(),
        corrector: Corrector::default(),
        delivery: Delivery::new(
            args.collector.clone(),
            args.queue_dir.clone(),
            args.historic_dir.clone(),
        ),
        store: FileStore::new(&args.store),
    };

    // Redelivery runs on its own thread with its own client; the queue
    // directory is safe for this single writer + single reader split
    let retry = RetryProcessor::new(args.queue_dir.clone(), args.collector.clone());
    let retry_flag = running.clone();
    let retry_interval = Duration::from_secs(args.retry_interval);
    let retry_handle = thread::spawn(move || {
        let poster = match HttpPoster::new() {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "could not build retry client");
                return;
            }
        };
        while retry_flag.load(Ordering::Relaxed) {
            match retry.run(&poster) {
                Ok(report) => info!(
                    delivered = report.delivered,
                    purged = report.purged,
                    remaining = report.remaining,
                    stopped_on = report.stopped_on.as_deref().unwrap_or(""),
                    "retry pass finished"
                ),
                Err(e) => warn!(error = %e, "retry pass failed"),
            }
            sleep_while(retry_interval, &retry_flag);
        }
    });

    info!(
        collector = %args.collector,
        device = %args.device_id,
        cadence_s = args.cadence,
        "spectrum courier up"
    );

    let cadence = Duration::from_secs(args.cadence);
    while running.load(Ordering::Relaxed) {
        match controller.run_cycle(&link, &poster) {
            Ok(outcome) => {
                info!(?outcome, "cycle finished");
                sleep_while(cadence, &running);
            }
            Err(CycleError::Transient(e)) => {
                warn!(error = %e, "cycle failed, backing off");
                sleep_while(TRANSIENT_BACKOFF, &running);
            }
            Err(CycleError::Permanent(e)) => {
                error!(error = %e, "cycle rejected, waiting for fresh configuration");
                sleep_while(PERMANENT_BACKOFF, &running);
            }
        }
    }

    info!("shutting down");
    drop(link);
    let _ = retry_handle.join();
    Ok(())
}

/// Launch the external acquisition engine and shuttle the serialized
/// request/reply pairs over its stdio, one JSON document per line.
fn spawn_engine_bridge(cmd: &str, server: EngineServer) -> io::Result<thread::JoinHandle<()>> {
    let mut parts = cmd.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty engine command"))?
        .to_string();
    let argv: Vec<String> = parts.map(str::to_string).collect();

    let mut child: Child = Command::new(&program)
        .args(&argv)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "engine stdin unavailable"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "engine stdout unavailable"))?;

    Ok(thread::spawn(move || {
        let mut lines = BufReader::new(stdout).lines();
        for request in server.requests.iter() {
            let encoded = match serde_json::to_string(&request) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "could not encode engine request");
                    break;
                }
            };
            if writeln!(stdin, "{encoded}").is_err() {
                error!("engine stdin closed");
                break;
            }
            let reply = match lines.next() {
                Some(Ok(line)) => match serde_json::from_str::<EngineReply>(&line) {
                    Ok(reply) => reply,
                    Err(e) => {
                        error!(error = %e, "malformed engine reply");
                        break;
                    }
                },
                _ => {
                    error!("engine stdout closed");
                    break;
                }
            };
            if server.replies.send(reply).is_err() {
                break;
            }
        }
        let _ = child.kill();
        let _ = child.wait();
    }))
}

/// Sleep in short steps so a shutdown request is honored promptly.
fn sleep_while(total: Duration, running: &AtomicBool) {
    let step = Duration::from_millis(250);
    let mut slept = Duration::ZERO;
    while slept < total && running.load(Ordering::Relaxed) {
        let chunk = step.min(total - slept);
        thread::sleep(chunk);
        slept += chunk;
    }
}
