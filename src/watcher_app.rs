//! Fan-in of per-namespace watchers into a single event channel.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Endpoints, Pod};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::client::ClusterClient;
use crate::config::{Config, DEFAULT_EVENT_BUFFER, DEFAULT_RESYNC_INTERVAL};
use crate::error::{Error, Result};
use crate::event::AddressEvent;
use crate::namespace_watcher::NamespaceWatcher;
use crate::resource::{AddressSource, Kind};

/// Tuning shared by every watcher of one [`WatcherApp`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatcherSettings {
    /// Interval between unconditional resyncs.
    pub resync_interval: Duration,
    /// Capacity of the merged event channel.
    pub event_buffer: usize,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl From<&Config> for WatcherSettings {
    fn from(config: &Config) -> Self {
        Self {
            resync_interval: config.resync_interval(),
            event_buffer: config.event_buffer,
        }
    }
}

/// Immutable snapshot shared by every watcher of one app, plus the address cache.
pub(crate) struct Shared<C> {
    pub(crate) client: Arc<C>,
    pub(crate) app_name: String,
    pub(crate) deployment_prefix: String,
    pub(crate) resync_interval: Duration,
    addresses: RwLock<HashMap<String, Vec<String>>>,
}

impl<C> Shared<C> {
    pub(crate) async fn publish(&self, namespace: &str, ips: &BTreeSet<String>) {
        self.addresses
            .write()
            .await
            .insert(namespace.to_string(), ips.iter().cloned().collect());
    }
}

struct Child {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Watches one application across namespaces and merges the results.
///
/// Every namespace gets its own watcher task; all of them write into one
/// bounded channel read with [`recv`](Self::recv). Events from one namespace
/// arrive in order; events from different namespaces interleave freely.
///
/// Cancelling the token passed to [`new`](Self::new), calling
/// [`shutdown`](Self::shutdown) or dropping the app stops every watcher. The
/// channel reports closure only after the last watcher has exited.
pub struct WatcherApp<C> {
    shared: Arc<Shared<C>>,
    kind: Kind,
    namespaces: Vec<String>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    sender: Arc<Mutex<Option<Sender<AddressEvent>>>>,
    // held across a whole (re)start so a namespace never has two streams
    restart: Mutex<()>,
    children: RwLock<HashMap<String, Child>>,
    events: Option<Receiver<AddressEvent>>,
}

impl<C: ClusterClient> WatcherApp<C> {
    /// Creates an app that is not yet watching anything; call [`watch`](Self::watch) per namespace.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<C>,
        app_name: impl Into<String>,
        kind: Kind,
        deployment_prefix: impl Into<String>,
        namespaces: Vec<String>,
        settings: WatcherSettings,
        cancel: &CancellationToken,
    ) -> Self {
        let resync_interval = if settings.resync_interval.is_zero() {
            DEFAULT_RESYNC_INTERVAL
        } else {
            settings.resync_interval
        };

        let (tx, rx) = mpsc::channel(settings.event_buffer.max(1));
        let cancel = cancel.child_token();
        let tracker = TaskTracker::new();
        let sender = Arc::new(Mutex::new(Some(tx)));

        // once cancelled, the only remaining senders belong to the watchers
        tokio::spawn({
            let cancel = cancel.clone();
            let tracker = tracker.clone();
            let sender = Arc::clone(&sender);
            async move {
                cancel.cancelled().await;
                sender.lock().await.take();
                tracker.close();
            }
        });

        Self {
            shared: Arc::new(Shared {
                client,
                app_name: app_name.into(),
                deployment_prefix: deployment_prefix.into(),
                resync_interval,
                addresses: RwLock::new(HashMap::new()),
            }),
            kind,
            namespaces,
            cancel,
            tracker,
            sender,
            restart: Mutex::new(()),
            children: RwLock::new(HashMap::new()),
            events: Some(rx),
        }
    }

    /// Starts, or restarts, the watcher for `namespace`.
    ///
    /// Returns once the initial list and watch succeeded; the initial `Added`
    /// snapshot is sent by the watcher task, so a full event channel never
    /// blocks this call. A previous watcher for the same namespace is stopped
    /// and joined first, so there is never more than one stream per
    /// namespace. Other namespaces are unaffected by a failure here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Namespace`] if the initial list or watch fails, or
    /// [`Error::Stopped`] if the app has been shut down.
    pub async fn watch(&self, namespace: &str) -> Result<()> {
        let _restart = self.restart.lock().await;

        let previous = self.children.write().await.remove(namespace);
        if let Some(previous) = previous {
            tracing::debug!("restarting Kubernetes watch for {namespace}/{}", self.kind);
            previous.cancel.cancel();
            if let Err(e) = previous.handle.await {
                tracing::warn!("previous watcher for {namespace} ended abnormally: {e}");
            }
        }

        if self.cancel.is_cancelled() {
            return Err(Error::Stopped);
        }

        let Some(tx) = self.sender.lock().await.clone() else {
            return Err(Error::Stopped);
        };

        let cancel = self.cancel.child_token();
        let handle = match self.kind {
            Kind::Pods => self.spawn::<Pod>(namespace, tx, cancel.clone()).await,
            Kind::Endpoints => self.spawn::<Endpoints>(namespace, tx, cancel.clone()).await,
        }?;

        self.children
            .write()
            .await
            .insert(namespace.to_string(), Child { cancel, handle });

        Ok(())
    }

    async fn spawn<K: AddressSource>(
        &self,
        namespace: &str,
        tx: Sender<AddressEvent>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let (watcher, stream) =
            NamespaceWatcher::<C, K>::start(Arc::clone(&self.shared), namespace, tx, cancel).await?;

        Ok(self.tracker.spawn(watcher.run(stream)))
    }
}

impl<C> WatcherApp<C> {
    /// Receives the next event; `None` once every watcher has stopped.
    pub async fn recv(&mut self) -> Option<AddressEvent> {
        match &mut self.events {
            Some(events) => events.recv().await,
            None => None,
        }
    }

    /// Takes the receiving end of the event channel, e.g. to move it into another task.
    ///
    /// Returns `None` if it was already taken.
    pub fn take_events(&mut self) -> Option<Receiver<AddressEvent>> {
        self.events.take()
    }

    /// Returns the last known addresses of every namespace that has reported.
    pub async fn addresses(&self) -> HashMap<String, Vec<String>> {
        self.shared.addresses.read().await.clone()
    }

    /// Returns the last known addresses in `namespace`.
    pub async fn addresses_in(&self, namespace: &str) -> Option<Vec<String>> {
        self.shared.addresses.read().await.get(namespace).cloned()
    }

    /// Returns the namespaces currently being watched.
    pub async fn active_namespaces(&self) -> Vec<String> {
        let mut active: Vec<_> = self
            .children
            .read()
            .await
            .iter()
            .filter(|(_, child)| !child.handle.is_finished())
            .map(|(ns, _)| ns.clone())
            .collect();

        active.sort();
        active
    }

    /// Stops every watcher.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Waits until the app has been cancelled and every watcher has exited.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await;
        self.tracker.wait().await;
    }

    /// The application whose addresses are watched.
    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.shared.app_name
    }

    /// The resource kind being watched.
    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// The namespaces this app was configured with.
    #[must_use]
    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }
}

impl<C> Drop for WatcherApp<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<C> fmt::Debug for WatcherApp<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherApp")
            .field("app_name", &self.shared.app_name)
            .field("kind", &self.kind)
            .field("namespaces", &self.namespaces)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// A watcher app that could not watch every configured namespace.
///
/// `app` keeps running for the namespaces that did start; dropping it stops them.
pub struct PartialStart<C> {
    /// The app, if it got far enough to be constructed.
    pub app: Option<WatcherApp<C>>,
    /// The first failure.
    pub error: Error,
}

impl<C> PartialStart<C> {
    /// Splits into the partially started app and the error.
    #[must_use]
    pub fn into_parts(self) -> (Option<WatcherApp<C>>, Error) {
        (self.app, self.error)
    }
}

impl<C> From<Error> for PartialStart<C> {
    fn from(error: Error) -> Self {
        Self { app: None, error }
    }
}

impl<C> fmt::Debug for PartialStart<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialStart")
            .field("app", &self.app)
            .field("error", &self.error)
            .finish()
    }
}

impl<C> fmt::Display for PartialStart<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl<C> std::error::Error for PartialStart<C> {}
