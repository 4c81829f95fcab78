// System
use std::fmt;

// Third Party
use k8s_openapi::api::core::v1::Event;
use kube::error::ErrorResponse;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// An object the session can watch: it must serialize into a record and
/// expose the resource version used as the resume cursor.
pub trait Watched: Clone + Serialize + Send + Sync + 'static {
    fn resource_version(&self) -> Option<String>;
}

impl Watched for Event {
    fn resource_version(&self) -> Option<String> {
        self.metadata.resource_version.clone()
    }
}

/// The type tag of a delivered event, rendered as the `type` field of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
            EventType::Bookmark => "BOOKMARK",
            EventType::Error => "ERROR",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bookmark carries only a fresh cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookmarkMarker {
    pub api_version: String,
    pub kind: String,
    pub resource_version: String,
}

/// One event delivered by the watch session.
#[derive(Debug, Clone)]
pub enum WatchedEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    Bookmark(BookmarkMarker),
    Error(ErrorResponse),
}

impl<K: Watched> WatchedEvent<K> {
    pub fn event_type(&self) -> EventType {
        match self {
            WatchedEvent::Added(_) => EventType::Added,
            WatchedEvent::Modified(_) => EventType::Modified,
            WatchedEvent::Deleted(_) => EventType::Deleted,
            WatchedEvent::Bookmark(_) => EventType::Bookmark,
            WatchedEvent::Error(_) => EventType::Error,
        }
    }

    /// The cursor this event advances the session to, if any.
    pub fn resource_version(&self) -> Option<String> {
        match self {
            WatchedEvent::Added(obj) | WatchedEvent::Modified(obj) | WatchedEvent::Deleted(obj) => {
                obj.resource_version()
            }
            WatchedEvent::Bookmark(marker) => Some(marker.resource_version.clone()),
            WatchedEvent::Error(_) => None,
        }
    }
}

/// The wire record logged per event: `{"type": ..., "object": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRecord {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub object: serde_json::Value,
}

impl WireRecord {
    /// Serialize a delivered event. Fails when the payload is not representable as JSON.
    pub fn from_event<K: Watched>(event: &WatchedEvent<K>) -> Result<Self, serde_json::Error> {
        let object = match event {
            WatchedEvent::Added(obj) | WatchedEvent::Modified(obj) | WatchedEvent::Deleted(obj) => {
                serde_json::to_value(obj)?
            }
            WatchedEvent::Bookmark(marker) => json!({
                "apiVersion": marker.api_version,
                "kind": marker.kind,
                "metadata": { "resourceVersion": marker.resource_version },
            }),
            WatchedEvent::Error(status) => serde_json::to_value(status)?,
        };
        Ok(Self {
            event_type: event.event_type(),
            object,
        })
    }
}
