//! The list-then-watch primitive the watch session is built on.

// Third Party
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Event;
use kube::{
    api::{Api, ListParams, WatchEvent, WatchParams},
    Client,
};
use tokio::time::Duration;

// Local
use crate::config::TargetSettings;
use crate::record::{BookmarkMarker, Watched, WatchedEvent};
use crate::utils::status_error;

/// The client library rejects watch request timeouts of 295s or more.
pub const MAX_WATCH_TIMEOUT_SECS: u64 = 290;

pub type EventStream<K> = BoxStream<'static, Result<WatchedEvent<K>, kube::Error>>;

/// Result of a list request: the current objects and the cursor they were read at.
#[derive(Debug, Clone)]
pub struct Snapshot<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

#[async_trait]
pub trait EventSource: Send + Sync {
    type Object: Watched;

    /// List the current objects in scope.
    async fn list(&self) -> Result<Snapshot<Self::Object>, kube::Error>;

    /// Fetch only the current cursor of the collection.
    async fn latest_resource_version(&self) -> Result<String, kube::Error>;

    /// Open one underlying watch stream starting after `resource_version`.
    async fn watch(&self, resource_version: &str)
        -> Result<EventStream<Self::Object>, kube::Error>;

    /// Time after which the server ends a watch request on its own.
    fn request_timeout(&self) -> Duration;
}

impl<K> From<WatchEvent<K>> for WatchedEvent<K> {
    fn from(event: WatchEvent<K>) -> Self {
        match event {
            WatchEvent::Added(obj) => WatchedEvent::Added(obj),
            WatchEvent::Modified(obj) => WatchedEvent::Modified(obj),
            WatchEvent::Deleted(obj) => WatchedEvent::Deleted(obj),
            WatchEvent::Bookmark(bookmark) => WatchedEvent::Bookmark(BookmarkMarker {
                api_version: bookmark.types.api_version,
                kind: bookmark.types.kind,
                resource_version: bookmark.metadata.resource_version,
            }),
            WatchEvent::Error(status) => WatchedEvent::Error(status),
        }
    }
}

/// Watches core/v1 Events, in one namespace or cluster-wide.
pub struct KubeEventSource {
    api: Api<Event>,
    list_params: ListParams,
    watch_params: WatchParams,
    request_timeout: Duration,
}

impl KubeEventSource {
    pub fn new(client: Client, target: &TargetSettings) -> Self {
        let api: Api<Event> = match &target.namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        };
        let timeout = target
            .list_options
            .timeout_seconds
            .min(MAX_WATCH_TIMEOUT_SECS);
        let mut list_params = ListParams::default();
        let mut watch_params = WatchParams::default().timeout(timeout as u32);
        if let Some(labels) = &target.list_options.label_selector {
            list_params = list_params.labels(labels);
            watch_params = watch_params.labels(labels);
        }
        if let Some(fields) = &target.list_options.field_selector {
            list_params = list_params.fields(fields);
            watch_params = watch_params.fields(fields);
        }
        Self {
            api,
            list_params,
            watch_params,
            request_timeout: Duration::from_secs(timeout),
        }
    }
}

fn missing_resource_version() -> kube::Error {
    status_error(500, "MissingResourceVersion", "list response carried no resourceVersion")
}

#[async_trait]
impl EventSource for KubeEventSource {
    type Object = Event;

    async fn list(&self) -> Result<Snapshot<Event>, kube::Error> {
        let list = self.api.list(&self.list_params).await?;
        let resource_version = list
            .metadata
            .resource_version
            .ok_or_else(missing_resource_version)?;
        Ok(Snapshot {
            items: list.items,
            resource_version,
        })
    }

    async fn latest_resource_version(&self) -> Result<String, kube::Error> {
        let list = self.api.list(&self.list_params.clone().limit(1)).await?;
        list.metadata
            .resource_version
            .ok_or_else(missing_resource_version)
    }

    async fn watch(&self, resource_version: &str) -> Result<EventStream<Event>, kube::Error> {
        let stream = self.api.watch(&self.watch_params, resource_version).await?;
        Ok(stream.map(|item| item.map(WatchedEvent::from)).boxed())
    }

    fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted in-memory source for exercising the session and the pump.

    // System
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    // Third Party
    use futures::{future, stream};
    use serde::ser::{Error as _, SerializeStruct};
    use serde::{Serialize, Serializer};
    use tokio::time;

    // Local
    use super::*;

    /// A minimal watched object. A poisoned probe refuses to serialize.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Probe {
        pub id: u32,
        pub resource_version: String,
        pub poisoned: bool,
    }

    impl Serialize for Probe {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            if self.poisoned {
                return Err(S::Error::custom("payload not representable"));
            }
            let mut state = serializer.serialize_struct("Probe", 2)?;
            state.serialize_field("id", &self.id)?;
            state.serialize_field("resourceVersion", &self.resource_version)?;
            state.end()
        }
    }

    impl Watched for Probe {
        fn resource_version(&self) -> Option<String> {
            Some(self.resource_version.clone())
        }
    }

    pub fn probe(id: u32, resource_version: &str) -> Probe {
        Probe {
            id,
            resource_version: resource_version.to_string(),
            poisoned: false,
        }
    }

    pub type Item = Result<WatchedEvent<Probe>, kube::Error>;

    pub fn added(id: u32, rv: &str) -> Item {
        Ok(WatchedEvent::Added(probe(id, rv)))
    }

    pub fn modified(id: u32, rv: &str) -> Item {
        Ok(WatchedEvent::Modified(probe(id, rv)))
    }

    pub fn deleted(id: u32, rv: &str) -> Item {
        Ok(WatchedEvent::Deleted(probe(id, rv)))
    }

    pub fn bookmark(rv: &str) -> Item {
        Ok(WatchedEvent::Bookmark(BookmarkMarker {
            api_version: "v1".to_string(),
            kind: "Event".to_string(),
            resource_version: rv.to_string(),
        }))
    }

    pub fn status_event(code: u16, reason: &str) -> Item {
        match status_error(code, reason, reason) {
            kube::Error::Api(status) => Ok(WatchedEvent::Error(status)),
            other => Err(other),
        }
    }

    pub fn connection_reset() -> kube::Error {
        kube::Error::ReadEvents(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ))
    }

    /// What one call to `watch` does.
    pub enum Attempt {
        /// The watch request itself fails.
        Fail(kube::Error),
        /// Yields the items, then the stream ends cleanly.
        Close(Vec<Item>),
        /// Yields the items, then stays open without further events.
        Hang(Vec<Item>),
        /// Responds after `latency`, yields the items, then ends cleanly once
        /// the request timeout has passed since the request was received.
        Expire { latency: Duration, items: Vec<Item> },
    }

    #[derive(Default)]
    pub struct Script {
        pub snapshot: Vec<Probe>,
        pub snapshot_version: String,
        pub list_failures: VecDeque<kube::Error>,
        pub latest_version: String,
        pub attempts: VecDeque<Attempt>,
        pub watched_from: Vec<String>,
        pub lists: usize,
        pub latest_lookups: usize,
    }

    #[derive(Clone)]
    pub struct ScriptedSource {
        pub script: Arc<Mutex<Script>>,
        pub request_timeout: Duration,
    }

    impl ScriptedSource {
        pub fn new(attempts: Vec<Attempt>) -> Self {
            let script = Script {
                snapshot_version: "1".to_string(),
                latest_version: "1".to_string(),
                attempts: attempts.into(),
                ..Default::default()
            };
            Self {
                script: Arc::new(Mutex::new(script)),
                request_timeout: Duration::from_secs(MAX_WATCH_TIMEOUT_SECS),
            }
        }

        pub fn with_snapshot(self, items: Vec<Probe>, resource_version: &str) -> Self {
            {
                let mut script = self.script.lock().unwrap();
                script.snapshot = items;
                script.snapshot_version = resource_version.to_string();
            }
            self
        }

        pub fn with_latest_version(self, resource_version: &str) -> Self {
            self.script.lock().unwrap().latest_version = resource_version.to_string();
            self
        }

        pub fn with_list_failure(self, error: kube::Error) -> Self {
            self.script.lock().unwrap().list_failures.push_back(error);
            self
        }

        pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
            self.request_timeout = timeout;
            self
        }

        /// Cursors every watch request was opened with, in order.
        pub fn watched_from(&self) -> Vec<String> {
            self.script.lock().unwrap().watched_from.clone()
        }

        pub fn lists(&self) -> usize {
            self.script.lock().unwrap().lists
        }

        pub fn latest_lookups(&self) -> usize {
            self.script.lock().unwrap().latest_lookups
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        type Object = Probe;

        async fn list(&self) -> Result<Snapshot<Probe>, kube::Error> {
            let mut script = self.script.lock().unwrap();
            script.lists += 1;
            if let Some(error) = script.list_failures.pop_front() {
                return Err(error);
            }
            Ok(Snapshot {
                items: script.snapshot.clone(),
                resource_version: script.snapshot_version.clone(),
            })
        }

        async fn latest_resource_version(&self) -> Result<String, kube::Error> {
            let mut script = self.script.lock().unwrap();
            script.latest_lookups += 1;
            Ok(script.latest_version.clone())
        }

        async fn watch(&self, resource_version: &str) -> Result<EventStream<Probe>, kube::Error> {
            let attempt = {
                let mut script = self.script.lock().unwrap();
                script.watched_from.push(resource_version.to_string());
                script.attempts.pop_front()
            };
            match attempt {
                Some(Attempt::Fail(error)) => Err(error),
                Some(Attempt::Close(items)) => Ok(stream::iter(items).boxed()),
                Some(Attempt::Hang(items)) => {
                    Ok(stream::iter(items).chain(stream::pending()).boxed())
                }
                Some(Attempt::Expire { latency, items }) => {
                    let deadline = time::Instant::now() + self.request_timeout;
                    time::sleep(latency).await;
                    let expiry = stream::once(time::sleep_until(deadline))
                        .filter_map(|()| future::ready(None::<Item>));
                    Ok(stream::iter(items).chain(expiry).boxed())
                }
                None => Ok(stream::pending().boxed()),
            }
        }

        fn request_timeout(&self) -> Duration {
            self.request_timeout
        }
    }
}
