//! Signal-aware, once-only shutdown: `Running -> Draining -> Terminated`.

// System
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

// Third Party
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use tokio::sync::watch;
use tracing::{debug, info};

// Local
use crate::error::SinkError;
use crate::sink::Sink;

/// Termination signals that drive an orderly stop.
pub const TERM_SIGNALS: [i32; 3] = [SIGINT, SIGTERM, SIGQUIT];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Terminated,
}

impl ShutdownState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ShutdownState::Running,
            1 => ShutdownState::Draining,
            _ => ShutdownState::Terminated,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ShutdownState::Running => 0,
            ShutdownState::Draining => 1,
            ShutdownState::Terminated => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(i32),
    /// The process decided to stop on its own (stream ended, fatal error).
    Requested,
}

fn signal_name(signal: i32) -> &'static str {
    match signal {
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        SIGQUIT => "SIGQUIT",
        _ => "unknown",
    }
}

struct Shared {
    state: AtomicU8,
    reason: watch::Sender<Option<ShutdownReason>>,
}

impl Shared {
    /// Move from Running to Draining. Only the first caller wins.
    fn begin(&self, reason: ShutdownReason) -> bool {
        let won = self
            .state
            .compare_exchange(
                ShutdownState::Running.as_u8(),
                ShutdownState::Draining.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if won {
            self.reason.send_replace(Some(reason));
        }
        won
    }
}

/// Owns the process-wide shutdown flag and the signal listener thread.
pub struct ShutdownCoordinator {
    shared: Arc<Shared>,
    signals: Option<(Handle, JoinHandle<()>)>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    /// A coordinator that is only triggered programmatically.
    pub fn new() -> Self {
        let (reason, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(ShutdownState::Running.as_u8()),
                reason,
            }),
            signals: None,
        }
    }

    /// Register SIGINT, SIGTERM and SIGQUIT. Must happen before any event is consumed.
    pub fn install() -> std::io::Result<Self> {
        let mut coordinator = Self::new();
        let mut signals = Signals::new(TERM_SIGNALS)?;
        let handle = signals.handle();
        let shared = coordinator.shared.clone();
        let thread = thread::Builder::new()
            .name("logbook-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    if shared.begin(ShutdownReason::Signal(signal)) {
                        info!("Signal {} received. Logbook will be shutdown.", signal_name(signal));
                    } else {
                        debug!("Signal {} ignored, already shutting down", signal_name(signal));
                    }
                }
            })?;
        coordinator.signals = Some((handle, thread));
        Ok(coordinator)
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// Begin draining. Returns false when shutdown was already under way.
    pub fn request(&self) -> bool {
        self.shared.begin(ShutdownReason::Requested)
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            reason: self.shared.reason.subscribe(),
        }
    }

    /// Flush and close the sink, then mark the process Terminated. Enters
    /// Draining first if nothing has triggered shutdown yet.
    pub fn drain<K: Sink + ?Sized>(&self, sink: &mut K) -> Result<(), SinkError> {
        self.shared.begin(ShutdownReason::Requested);
        let result = sink.flush_and_close();
        self.shared
            .state
            .store(ShutdownState::Terminated.as_u8(), Ordering::SeqCst);
        result
    }
}

impl Drop for ShutdownCoordinator {
    fn drop(&mut self) {
        if let Some((handle, thread)) = self.signals.take() {
            handle.close();
            let _ = thread.join();
        }
    }
}

/// Awaitable view of the shutdown flag, handed to the tasks it interrupts.
#[derive(Clone)]
pub struct ShutdownListener {
    reason: watch::Receiver<Option<ShutdownReason>>,
}

impl ShutdownListener {
    pub fn is_requested(&self) -> bool {
        self.reason.borrow().is_some()
    }

    /// Resolve once shutdown begins. Never resolves if the coordinator is gone.
    pub async fn requested(&mut self) -> ShutdownReason {
        let reason = match self.reason.wait_for(Option::is_some).await {
            Ok(reason) => *reason,
            Err(_) => None,
        };
        match reason {
            Some(reason) => reason,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    // Third Party
    use serde_json::json;
    use serial_test::serial;
    use tokio::time::{timeout, Duration};

    // Local
    use super::*;
    use crate::record::{EventType, WireRecord};
    use crate::sink::testing::RecordingSink;

    #[test]
    fn test_request_transitions_once() {
        let coordinator = ShutdownCoordinator::new();
        assert_eq!(coordinator.state(), ShutdownState::Running);
        assert!(coordinator.request());
        assert_eq!(coordinator.state(), ShutdownState::Draining);
        assert!(!coordinator.request());
        assert_eq!(coordinator.state(), ShutdownState::Draining);
    }

    #[tokio::test]
    async fn test_listener_sees_earlier_request() {
        let coordinator = ShutdownCoordinator::new();
        let mut listener = coordinator.listener();
        assert!(!listener.is_requested());
        coordinator.request();
        let mut late = coordinator.listener();
        assert_eq!(listener.requested().await, ShutdownReason::Requested);
        assert_eq!(late.requested().await, ShutdownReason::Requested);
    }

    #[tokio::test]
    async fn test_listener_pends_while_running() {
        let coordinator = ShutdownCoordinator::new();
        let mut listener = coordinator.listener();
        let waited = timeout(Duration::from_millis(20), listener.requested()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn test_drain_flushes_every_pending_record() {
        let coordinator = ShutdownCoordinator::new();
        let mut sink = RecordingSink::default();
        for id in 0..3 {
            sink.emit(&WireRecord {
                event_type: EventType::Added,
                object: json!({ "id": id }),
            })
            .unwrap();
        }
        assert_eq!(sink.buffered(), 3);
        coordinator.drain(&mut sink).unwrap();
        assert_eq!(sink.records().len(), 3);
        assert!(sink.closed());
        assert_eq!(coordinator.state(), ShutdownState::Terminated);
    }

    #[tokio::test]
    #[serial]
    async fn test_signal_starts_draining() {
        let coordinator = ShutdownCoordinator::install().unwrap();
        let mut listener = coordinator.listener();
        signal_hook::low_level::raise(SIGTERM).unwrap();
        let reason = timeout(Duration::from_secs(5), listener.requested())
            .await
            .unwrap();
        assert_eq!(reason, ShutdownReason::Signal(SIGTERM));
        assert_eq!(coordinator.state(), ShutdownState::Draining);

        // A second signal is ignored.
        signal_hook::low_level::raise(SIGINT).unwrap();
        assert_eq!(coordinator.state(), ShutdownState::Draining);
        assert_eq!(listener.requested().await, ShutdownReason::Signal(SIGTERM));
    }
}
