// Third Party
use tracing::{debug, error, warn};

// Local
use crate::config::Settings;
use crate::error::{SinkError, WatchError};
use crate::record::{EventType, WatchedEvent, WireRecord};
use crate::shutdown::{ShutdownListener, ShutdownReason};
use crate::sink::Sink;
use crate::source::EventSource;
use crate::watcher::WatchSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpOptions {
    /// Forward every event type. When false only ADDED, MODIFIED and ERROR are emitted.
    pub emit_all: bool,
    /// Give up after this many consecutive sink failures. `None` never gives up.
    pub max_consecutive_failures: Option<u32>,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self {
            emit_all: true,
            max_consecutive_failures: None,
        }
    }
}

impl PumpOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            emit_all: settings.target.emit_all,
            max_consecutive_failures: settings.log.max_consecutive_failures.filter(|max| *max > 0),
        }
    }

    pub fn forwards(&self, event_type: EventType) -> bool {
        self.emit_all
            || matches!(
                event_type,
                EventType::Added | EventType::Modified | EventType::Error
            )
    }
}

/// Why the pump stopped.
#[derive(Debug)]
pub enum PumpOutcome {
    /// The peer closed the stream cleanly.
    EndOfStream,
    /// The session reported a fatal error.
    Failed(WatchError),
    /// Shutdown was requested while the pump was waiting for events.
    Interrupted(ShutdownReason),
    /// Consecutive sink failures reached the configured limit.
    SinkFailed(SinkError),
}

impl PumpOutcome {
    /// Only giving up on the sink is a failure of the process; the other
    /// outcomes are logged and exit cleanly.
    pub fn exit_code(&self) -> i32 {
        match self {
            PumpOutcome::SinkFailed(_) => 1,
            _ => 0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpStats {
    pub received: u64,
    pub emitted: u64,
    pub filtered: u64,
    /// Events that could not be serialized.
    pub skipped: u64,
    /// Records the sink failed to write.
    pub failed: u64,
}

/// What [`EventPump::run`] hands back: the outcome, counters, and the sink
/// so the caller can flush and close it.
pub struct PumpReport<K> {
    pub outcome: PumpOutcome,
    pub stats: PumpStats,
    pub sink: K,
}

/// Drains the watch session into the sink, in delivery order.
pub struct EventPump<S: EventSource, K: Sink> {
    session: WatchSession<S>,
    sink: K,
    options: PumpOptions,
    stats: PumpStats,
    consecutive_failures: u32,
}

impl<S: EventSource, K: Sink> EventPump<S, K> {
    pub fn new(session: WatchSession<S>, sink: K, options: PumpOptions) -> Self {
        Self {
            session,
            sink,
            options,
            stats: PumpStats::default(),
            consecutive_failures: 0,
        }
    }

    pub async fn run(mut self, mut shutdown: ShutdownListener) -> PumpReport<K> {
        let outcome = loop {
            let next = tokio::select! {
                biased;
                reason = shutdown.requested() => break PumpOutcome::Interrupted(reason),
                next = self.session.next() => next,
            };
            match next {
                Ok(Some(event)) => {
                    if let Err(error) = self.forward(event) {
                        error!(
                            "Giving up after {} consecutive log write failures",
                            self.consecutive_failures
                        );
                        break PumpOutcome::SinkFailed(error);
                    }
                }
                Ok(None) => {
                    warn!("Event watcher result channel closed.");
                    break PumpOutcome::EndOfStream;
                }
                Err(error) => {
                    error!("Event watcher stopped: {}", error);
                    break PumpOutcome::Failed(error);
                }
            }
        };
        debug!("Event pump stopped: {:?}", self.stats);
        PumpReport {
            outcome,
            stats: self.stats,
            sink: self.sink,
        }
    }

    /// Serialize and emit one event. Only a sink failure past the configured
    /// limit is returned; everything else is logged and the event dropped.
    fn forward(&mut self, event: WatchedEvent<S::Object>) -> Result<(), SinkError> {
        self.stats.received += 1;
        let event_type = event.event_type();
        if !self.options.forwards(event_type) {
            self.stats.filtered += 1;
            return Ok(());
        }

        let record = match WireRecord::from_event(&event) {
            Ok(record) => record,
            Err(error) => {
                error!(
                    "Error occurred while marshalling {} event, skipping it: {}",
                    event_type, error
                );
                self.stats.skipped += 1;
                return Ok(());
            }
        };

        match self.sink.emit(&record) {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.stats.emitted += 1;
                Ok(())
            }
            Err(error) => {
                self.consecutive_failures += 1;
                self.stats.failed += 1;
                error!(
                    "Error occurred while writing {} record ({} in a row): {}",
                    event_type, self.consecutive_failures, error
                );
                match self.options.max_consecutive_failures {
                    Some(max) if self.consecutive_failures >= max => Err(error),
                    _ => Ok(()),
                }
            }
        }
    }
}
