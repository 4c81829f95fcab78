// System
use std::collections::VecDeque;
use std::fmt;

// Third Party
use futures::StreamExt;
use rand::Rng;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info, warn};

// Local
use crate::error::WatchError;
use crate::record::WatchedEvent;
use crate::source::{EventSource, EventStream};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const MAX_JITTER: Duration = Duration::from_millis(500);
/// Upper bound on how early a server-side watch expiry may be observed.
const EXPIRY_SLACK: Duration = Duration::from_secs(5);

/// Where a session resumes the stream from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// List the current objects first, then watch from the list's resource version.
    FromStart,
    /// Watch for changes after this resource version.
    At(String),
}

impl Cursor {
    /// An empty value or the sentinel `"1"` mean "from start".
    pub fn parse(resource_version: &str) -> Self {
        match resource_version {
            "" | "1" => Cursor::FromStart,
            rv => Cursor::At(rv.to_string()),
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::FromStart => f.write_str("start"),
            Cursor::At(rv) => f.write_str(rv),
        }
    }
}

/// How a stream disruption is recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The cursor fell out of the server's history; fetch a fresh one, then reconnect.
    Expired,
    /// Reconnect at the current cursor.
    Transient,
    /// Not retried.
    Fatal,
}

pub fn classify_status(code: u16) -> ErrorClass {
    match code {
        410 => ErrorClass::Expired,
        429 | 500 | 502 | 503 | 504 => ErrorClass::Transient,
        _ => ErrorClass::Fatal,
    }
}

pub fn classify(error: &kube::Error) -> ErrorClass {
    match error {
        kube::Error::Api(status) => classify_status(status.code),
        kube::Error::HyperError(_)
        | kube::Error::Service(_)
        | kube::Error::ReadEvents(_)
        | kube::Error::SerdeError(_) => ErrorClass::Transient,
        _ => ErrorClass::Fatal,
    }
}

/// Exponential backoff with jitter between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_jitter: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: INITIAL_BACKOFF,
            max: MAX_BACKOFF,
            max_jitter: MAX_JITTER,
        }
    }
}

impl Backoff {
    /// Delay before the given (1-based) retry, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial.saturating_mul(factor).min(self.max)
    }

    fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = rand::thread_rng().gen_range(0..=self.max_jitter.as_millis() as u64);
        self.base_delay(attempt) + Duration::from_millis(jitter_ms)
    }
}

enum State {
    Live,
    /// The peer ended the stream cleanly.
    Closed,
    /// A fatal error that is reported once by the next call.
    Failed(Option<WatchError>),
}

/// One logical subscription to the event stream.
///
/// Transient failures of the underlying watch are absorbed: the session
/// re-opens the stream from the cursor of the last delivered event, backing
/// off between attempts without bound. Only fatal errors and a clean close by
/// the peer end the session.
pub struct WatchSession<S: EventSource> {
    source: S,
    backoff: Backoff,
    cursor: Cursor,
    /// Cursor of the last event handed out; committed on the following call.
    pending: Option<String>,
    replay: VecDeque<S::Object>,
    stream: Option<EventStream<S::Object>>,
    /// When the current watch request was sent.
    opened_at: Instant,
    relist: bool,
    retries: u32,
    last_error: Option<String>,
    state: State,
}

impl<S: EventSource> WatchSession<S> {
    /// Establish the subscription. Transient failures are retried; a fatal
    /// one fails the open.
    pub async fn open(source: S, cursor: Cursor, backoff: Backoff) -> Result<Self, WatchError> {
        let mut session = Self {
            source,
            backoff,
            cursor,
            pending: None,
            replay: VecDeque::new(),
            stream: None,
            opened_at: Instant::now(),
            relist: false,
            retries: 0,
            last_error: None,
            state: State::Live,
        };
        if session.cursor == Cursor::FromStart {
            session.list_from_start().await?;
        }
        session.connect().await?;
        Ok(session)
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Wait for the next event. `Ok(None)` means the peer closed the stream.
    pub async fn next(&mut self) -> Result<Option<WatchedEvent<S::Object>>, WatchError> {
        if let Some(rv) = self.pending.take() {
            self.cursor = Cursor::At(rv);
        }
        loop {
            match &mut self.state {
                State::Live => {}
                State::Closed => return Ok(None),
                State::Failed(error) => {
                    return match error.take() {
                        Some(error) => Err(error),
                        None => Ok(None),
                    }
                }
            }

            if let Some(object) = self.replay.pop_front() {
                return Ok(Some(WatchedEvent::Added(object)));
            }

            if self.stream.is_none() {
                if let Err(error) = self.connect().await {
                    self.state = State::Failed(None);
                    return Err(error);
                }
                continue;
            }
            let item = match self.stream.as_mut() {
                Some(stream) => stream.next().await,
                None => continue,
            };

            match item {
                Some(Ok(WatchedEvent::Error(status))) => match classify_status(status.code) {
                    ErrorClass::Fatal => {
                        error!("Event stream rejected: {}", status);
                        self.stream = None;
                        self.state = State::Failed(Some(WatchError::Rejected(status.clone())));
                        return Ok(Some(WatchedEvent::Error(status)));
                    }
                    class => self.disrupt(class, status.to_string()),
                },
                Some(Ok(event)) => {
                    if let Some(rv) = event.resource_version() {
                        self.pending = Some(rv);
                    }
                    return Ok(Some(event));
                }
                Some(Err(error)) => match classify(&error) {
                    ErrorClass::Fatal => {
                        error!("Event stream failed: {}", error);
                        self.stream = None;
                        self.state = State::Failed(None);
                        return Err(WatchError::Stream(error));
                    }
                    class => self.disrupt(class, error.to_string()),
                },
                None => {
                    self.stream = None;
                    if self.request_expired() {
                        debug!("Watch request expired, re-opening from {}", self.cursor);
                    } else {
                        warn!("Event stream closed by the API server");
                        self.state = State::Closed;
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// The server times a watch request out from when it received it, which
    /// is observed here slightly early; allow for that.
    fn request_expired(&self) -> bool {
        let timeout = self.source.request_timeout();
        let slack = EXPIRY_SLACK.min(timeout / 10);
        self.opened_at.elapsed() + slack >= timeout
    }

    fn disrupt(&mut self, class: ErrorClass, reason: String) {
        warn!("Watch connection broken at {}: {}", self.cursor, reason);
        self.stream = None;
        self.relist |= class == ErrorClass::Expired;
        self.retries += 1;
        self.last_error = Some(reason);
    }

    async fn pause(&mut self) {
        if self.retries == 0 {
            return;
        }
        let delay = self.backoff.delay(self.retries);
        warn!(
            "Retrying watch in {} ms (attempt {})...",
            delay.as_millis(),
            self.retries
        );
        time::sleep(delay).await;
    }

    async fn list_from_start(&mut self) -> Result<(), WatchError> {
        loop {
            self.pause().await;
            match self.source.list().await {
                Ok(snapshot) => {
                    info!(
                        "Listed {} existing events at {}",
                        snapshot.items.len(),
                        snapshot.resource_version
                    );
                    self.retries = 0;
                    self.cursor = Cursor::At(snapshot.resource_version);
                    self.replay = snapshot.items.into();
                    return Ok(());
                }
                Err(error) => match classify(&error) {
                    ErrorClass::Fatal => return Err(WatchError::Connect(error)),
                    _ => self.disrupt(ErrorClass::Transient, error.to_string()),
                },
            }
        }
    }

    async fn connect(&mut self) -> Result<(), WatchError> {
        loop {
            self.pause().await;
            if self.relist {
                match self.source.latest_resource_version().await {
                    Ok(rv) => {
                        warn!(
                            "Resource version {} expired, resuming from {}; events in between are lost",
                            self.cursor, rv
                        );
                        self.cursor = Cursor::At(rv);
                        self.relist = false;
                    }
                    Err(error) => match classify(&error) {
                        ErrorClass::Fatal => return Err(WatchError::Connect(error)),
                        _ => {
                            self.disrupt(ErrorClass::Expired, error.to_string());
                            continue;
                        }
                    },
                }
            }

            let from = match &self.cursor {
                Cursor::At(rv) => rv.clone(),
                Cursor::FromStart => "0".to_string(),
            };
            info!("Starting event watcher from resource version {}...", from);
            let requested_at = Instant::now();
            match self.source.watch(&from).await {
                Ok(stream) => {
                    // Successfully connected, so reset the backoff
                    self.stream = Some(stream);
                    self.opened_at = requested_at;
                    self.retries = 0;
                    return Ok(());
                }
                Err(error) => match classify(&error) {
                    ErrorClass::Fatal => {
                        error!("Watch request rejected: {}", error);
                        return Err(WatchError::Connect(error));
                    }
                    class => self.disrupt(class, error.to_string()),
                },
            }
        }
    }
}

#[cfg(test)]
impl Backoff {
    pub(crate) fn immediate() -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }
}
