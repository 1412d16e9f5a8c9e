//! A live watch on one namespace for one resource kind.
//!
//! # How It Works
//!
//! 1. Lists the application's objects and remembers the list's resource version
//! 2. Opens a watch at that version; the spawned task then emits the initial
//!    snapshot as `Added`
//! 3. Folds every native event into a per-object address map and emits the
//!    full address set after each change
//! 4. When the stream closes, errors, reports an expired version, or the
//!    resync interval elapses, re-lists, emits the recovered snapshot as
//!    `Modified` and resumes watching at the new version
//!
//! Only cancellation ends the loop; failed recoveries are retried with
//! exponential backoff.

use std::collections::{BTreeSet, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::ResourceExt;
use tokio::sync::mpsc::Sender;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::client::{ClusterClient, NativeEvent, NativeEventStream, ResourceList};
use crate::error::{BoxError, Error, Result};
use crate::event::{AddressEvent, EventType};
use crate::resource::{AddressSource, Selector, WatchTarget};
use crate::watcher_app::Shared;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Consecutive failed recoveries before an `Error` event is emitted.
const FAILURE_THRESHOLD: u32 = 3;

/// HTTP 410: the requested resource version is too old.
const GONE: u16 = 410;

/// What the loop should do after folding one native event into the state.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Emit(EventType),
    Skip,
    Resync,
}

/// The addresses known for one namespace plus the cursor to resume from.
#[derive(Debug, Default)]
struct NamespaceState {
    resource_version: String,
    objects: HashMap<String, BTreeSet<String>>,
}

impl NamespaceState {
    fn from_list<K: AddressSource>(list: ResourceList<K>) -> Self {
        let objects = list
            .items
            .iter()
            .map(|obj| (obj.name_any(), obj.addresses()))
            .collect();

        Self {
            resource_version: list.resource_version,
            objects,
        }
    }

    fn apply<K: AddressSource>(&mut self, event: NativeEvent<K>) -> Step {
        match event {
            NativeEvent::Added(obj) => {
                self.track(&obj);
                self.objects.insert(obj.name_any(), obj.addresses());
                Step::Emit(EventType::Added)
            }

            NativeEvent::Modified(obj) => {
                self.track(&obj);
                self.objects.insert(obj.name_any(), obj.addresses());
                Step::Emit(EventType::Modified)
            }

            NativeEvent::Deleted(obj) => {
                self.track(&obj);
                self.objects.remove(&obj.name_any());
                Step::Emit(EventType::Deleted)
            }

            NativeEvent::Bookmark(version) => {
                self.resource_version = version;
                Step::Skip
            }

            NativeEvent::Error { code, message } => {
                if code == GONE {
                    tracing::debug!(
                        "resource version {} expired: {message}",
                        self.resource_version
                    );
                } else {
                    tracing::warn!("watch error event ({code}): {message}");
                }

                Step::Resync
            }
        }
    }

    fn track<K: AddressSource>(&mut self, obj: &K) {
        if let Some(version) = obj.resource_version() {
            self.resource_version = version;
        }
    }

    fn snapshot(&self) -> BTreeSet<String> {
        self.objects.values().flatten().cloned().collect()
    }
}

/// Owns the watch stream for a single [`WatchTarget`].
pub(crate) struct NamespaceWatcher<C, K> {
    shared: Arc<Shared<C>>,
    target: WatchTarget,
    selector: Selector,
    state: NamespaceState,
    tx: Sender<AddressEvent>,
    cancel: CancellationToken,
    _kind: PhantomData<fn() -> K>,
}

impl<C: ClusterClient, K: AddressSource> NamespaceWatcher<C, K> {
    /// Performs the initial list and watch for `namespace`.
    ///
    /// Returns the connected watcher and its stream without touching the event
    /// channel; [`run`](Self::run) emits the initial snapshot.
    pub(crate) async fn start(
        shared: Arc<Shared<C>>,
        namespace: &str,
        tx: Sender<AddressEvent>,
        cancel: CancellationToken,
    ) -> Result<(Self, NativeEventStream<K>)> {
        let selector = K::selector(&shared.app_name, &shared.deployment_prefix);
        let mut watcher = Self {
            shared,
            target: WatchTarget::new(namespace, K::KIND),
            selector,
            state: NamespaceState::default(),
            tx,
            cancel,
            _kind: PhantomData,
        };

        watcher
            .relist()
            .await
            .map_err(|e| Error::namespace(namespace, "list", K::KIND, e))?;

        let stream = watcher
            .open()
            .await
            .map_err(|e| Error::namespace(namespace, "watch", K::KIND, e))?;

        tracing::debug!(
            "Starting Kubernetes watch for {} ({}) at version {}",
            watcher.target,
            watcher.shared.app_name,
            watcher.state.resource_version
        );

        Ok((watcher, stream))
    }

    /// Emits the initial snapshot as `Added`, then drives the watch until
    /// cancelled or the event receiver goes away.
    pub(crate) async fn run(mut self, mut stream: NativeEventStream<K>) {
        if !self.emit(EventType::Added).await {
            tracing::debug!(
                "Kubernetes watch for {} stopped before first event",
                self.target
            );
            return;
        }

        let cancel = self.cancel.clone();
        let period = self.shared.resync_interval;
        let mut resync = time::interval_at(Instant::now() + period, period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reason = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = resync.tick() => "periodic resync",
                next = stream.next() => match next {
                    Some(Ok(event)) => match self.state.apply(event) {
                        Step::Emit(event_type) => {
                            if self.emit(event_type).await {
                                continue;
                            }

                            break;
                        }
                        Step::Skip => continue,
                        Step::Resync => "watch error event",
                    },
                    Some(Err(e)) => {
                        tracing::warn!("watch stream for {} failed: {e}", self.target);
                        "watch stream error"
                    }
                    None => "watch stream closed",
                },
            };

            // never resume on the old cursor
            drop(stream);
            match self.recover(reason).await {
                Some(next) => stream = next,
                None => break,
            }

            resync.reset();
        }

        tracing::debug!("Kubernetes watch for {} stopped", self.target);
    }

    /// Re-lists and reopens the watch until it succeeds or the watcher is cancelled.
    async fn recover(&mut self, reason: &str) -> Option<NativeEventStream<K>> {
        tracing::debug!("resyncing {}: {reason}", self.target);

        let cancel = self.cancel.clone();
        let mut delay = INITIAL_BACKOFF;
        let mut failures = 0u32;

        loop {
            let attempt = tokio::select! {
                biased;
                () = cancel.cancelled() => return None,
                attempt = self.resync() => attempt,
            };

            match attempt {
                Ok(stream) => {
                    if failures > 0 {
                        tracing::info!(
                            "resync of {} recovered after {failures} failures",
                            self.target
                        );
                    }

                    return self.emit(EventType::Modified).await.then_some(stream);
                }

                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        "resync of {} failed (attempt {failures}), retrying in {}s: {e}",
                        self.target,
                        delay.as_secs()
                    );

                    if failures == FAILURE_THRESHOLD && !self.emit(EventType::Error).await {
                        return None;
                    }

                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return None,
                        () = time::sleep(delay) => {}
                    }

                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn resync(&mut self) -> std::result::Result<NativeEventStream<K>, BoxError> {
        self.relist().await?;
        self.open().await
    }

    /// Replaces the state and cursor with a fresh list snapshot.
    async fn relist(&mut self) -> std::result::Result<(), BoxError> {
        let list = self
            .shared
            .client
            .list::<K>(&self.target.namespace, &self.selector.list_params())
            .await?;

        self.state = NamespaceState::from_list(list);
        Ok(())
    }

    async fn open(&self) -> std::result::Result<NativeEventStream<K>, BoxError> {
        self.shared
            .client
            .watch::<K>(
                &self.target.namespace,
                &self.selector.watch_params(),
                &self.state.resource_version,
            )
            .await
    }

    /// Publishes the current address set; returns `false` once nobody can receive it.
    async fn emit(&self, event_type: EventType) -> bool {
        let ips = self.state.snapshot();
        if event_type != EventType::Error {
            self.shared.publish(&self.target.namespace, &ips).await;
        }

        let event = AddressEvent::new(self.target.namespace.clone(), ips, event_type);
        tracing::trace!("{} {event_type}: {:?}", self.target, event.ips);

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => {
                if sent.is_err() {
                    tracing::warn!(
                        "event channel closed, stopping Kubernetes watch for {}",
                        self.target
                    );
                }

                sent.is_ok()
            }
        }
    }
}
