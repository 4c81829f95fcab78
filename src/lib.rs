// System
use std::future::Future;

// Third Party
use tracing::{error, info, warn};

// Local
use crate::config::Settings;
use crate::error::BootstrapError;
use crate::pump::{EventPump, PumpOptions, PumpOutcome};
use crate::shutdown::{ShutdownCoordinator, ShutdownListener};
use crate::sink::{LineSink, Sink};
use crate::source::KubeEventSource;
use crate::watcher::{Backoff, Cursor, WatchSession};

pub mod client;
pub mod config;
pub mod error;
pub mod pump;
pub mod record;
pub mod shutdown;
pub mod sink;
pub mod source;
pub mod utils;
pub mod watcher;

/// Run `future` unless shutdown begins first.
async fn unless_shutdown<F: Future>(
    listener: &mut ShutdownListener,
    future: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = listener.requested() => None,
        output = future => Some(output),
    }
}

/// Flush and close the sink, then report the process exit code.
fn finish<K: Sink>(coordinator: &ShutdownCoordinator, sink: &mut K, code: i32) -> i32 {
    match coordinator.drain(sink) {
        Ok(()) => {
            info!("Log sink flushed and closed");
            code
        }
        Err(e) => {
            error!("Error occurred while closing log sink: {}", e);
            1
        }
    }
}

/// Open the sink, obtain a client, subscribe to events and pump them into
/// the sink until the stream ends or shutdown is requested.
///
/// Returns the process exit code. Errors are bootstrap failures: nothing has
/// been watched yet when one is returned.
pub async fn run(
    settings: &Settings,
    coordinator: &ShutdownCoordinator,
) -> Result<i32, BootstrapError> {
    let mut listener = coordinator.listener();
    let mut sink = LineSink::open(&settings.log.destination, settings.log.format)?;

    let client = match unless_shutdown(&mut listener, client::obtain_client(&settings.auth)).await
    {
        Some(client) => client?,
        None => return Ok(finish(coordinator, &mut sink, 0)),
    };

    let source = KubeEventSource::new(client, &settings.target);
    let cursor = Cursor::parse(&settings.target.list_options.resource_version);
    let opened = WatchSession::open(source, cursor, Backoff::default());
    let session = match unless_shutdown(&mut listener, opened).await {
        Some(session) => session?,
        None => return Ok(finish(coordinator, &mut sink, 0)),
    };
    info!(
        "Watching events in {}",
        settings
            .target
            .namespace
            .as_deref()
            .unwrap_or("all namespaces")
    );

    let pump = EventPump::new(session, sink, PumpOptions::from_settings(settings));
    let mut report = pump.run(listener).await;
    match &report.outcome {
        PumpOutcome::EndOfStream => warn!("Event stream ended, Logbook will be shutdown."),
        PumpOutcome::Failed(e) => error!("Event stream failed, Logbook will be shutdown: {}", e),
        PumpOutcome::Interrupted(reason) => info!("Shutdown requested: {:?}", reason),
        PumpOutcome::SinkFailed(e) => error!("Log sink unusable, Logbook will be shutdown: {}", e),
    }
    info!(
        "Received {} events, emitted {}, filtered {}, skipped {}, failed {}",
        report.stats.received,
        report.stats.emitted,
        report.stats.filtered,
        report.stats.skipped,
        report.stats.failed
    );
    let code = report.outcome.exit_code();
    Ok(finish(coordinator, &mut report.sink, code))
}
