//! Feeding address events into a Tonic balance channel.
//!
//! The watchers report complete address sets and never deduplicate. This
//! module keeps the last set seen per namespace and turns each event into the
//! minimal `Change::Insert` / `Change::Remove` sequence for
//! [`Channel::balance_channel`](tonic::transport::Channel::balance_channel).
//!
//! # Example
//!
//! ```ignore
//! use std::net::SocketAddr;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use tonic::transport::{Channel, Endpoint};
//! use kube_watch_registry::{Config, Kind, Registry, balance};
//!
//! let registry = Registry::connect(Config::default())?;
//! let mut app = registry
//!     .new_watcher_app(&CancellationToken::new(), "my-grpc-service", Kind::Endpoints)
//!     .await?;
//!
//! let (channel, tx) = Channel::balance_channel::<SocketAddr>(1024);
//! balance::forward(app.take_events().unwrap(), 50051, tx, |addr| {
//!     Endpoint::from_shared(format!("http://{addr}"))
//!         .unwrap()
//!         .connect_timeout(Duration::from_secs(5))
//! });
//! ```

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};

use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinHandle;
use tonic::transport::Endpoint;
use tonic::transport::channel::Change;

use crate::event::{AddressEvent, EventType};

/// Spawns a task that applies address events to a balance channel.
///
/// Every address is combined with `port`; `build` creates the [`Endpoint`]
/// for each newly seen address. The task ends when either channel closes.
pub fn forward<F>(
    events: Receiver<AddressEvent>,
    port: u16,
    tx: Sender<Change<SocketAddr, Endpoint>>,
    build: F,
) -> JoinHandle<()>
where
    F: Fn(SocketAddr) -> Endpoint + Send + 'static,
{
    tokio::spawn(forward_loop(events, port, tx, build))
}

async fn forward_loop<F>(
    mut events: Receiver<AddressEvent>,
    port: u16,
    tx: Sender<Change<SocketAddr, Endpoint>>,
    build: F,
) where
    F: Fn(SocketAddr) -> Endpoint,
{
    let mut known = KnownAddresses::default();

    while let Some(event) = events.recv().await {
        for action in known.apply(&event, port) {
            let change = match action {
                EndpointAction::Insert(addr) => Change::Insert(addr, build(addr)),
                EndpointAction::Remove(addr) => Change::Remove(addr),
            };

            if tx.send(change).await.is_err() {
                tracing::warn!("balance channel closed, stopping address forwarding");
                return;
            }
        }

        tracing::debug!(
            "Kubernetes discovery: {} endpoints after {} in {}",
            known.len(),
            event.event_type,
            event.namespace
        );
    }

    tracing::debug!("address event stream ended");
}

/// Represents an endpoint change action.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EndpointAction {
    Insert(SocketAddr),
    Remove(SocketAddr),
}

/// Last address set reported per namespace.
#[derive(Debug, Default)]
struct KnownAddresses {
    by_namespace: HashMap<String, BTreeSet<SocketAddr>>,
}

impl KnownAddresses {
    /// Replaces the namespace's set and returns what changed in the union of all namespaces.
    fn apply(&mut self, event: &AddressEvent, port: u16) -> Vec<EndpointAction> {
        if event.event_type == EventType::Error {
            tracing::warn!(
                "address resync failing in {}, keeping {} stale endpoints",
                event.namespace,
                self.by_namespace.get(&event.namespace).map_or(0, BTreeSet::len)
            );

            return Vec::new();
        }

        let current: BTreeSet<SocketAddr> = event
            .ips
            .iter()
            .filter_map(|ip| ip.parse::<IpAddr>().ok())
            .map(|ip| SocketAddr::new(ip, port))
            .collect();

        let before = self.union();
        if current.is_empty() {
            self.by_namespace.remove(&event.namespace);
        } else {
            self.by_namespace.insert(event.namespace.clone(), current);
        }

        let after = self.union();

        let mut actions = Vec::new();
        for addr in before.difference(&after) {
            tracing::debug!("removing endpoint: {addr}");
            actions.push(EndpointAction::Remove(*addr));
        }

        for addr in after.difference(&before) {
            tracing::debug!("adding endpoint: {addr}");
            actions.push(EndpointAction::Insert(*addr));
        }

        actions
    }

    fn union(&self) -> BTreeSet<SocketAddr> {
        self.by_namespace.values().flatten().copied().collect()
    }

    fn len(&self) -> usize {
        self.union().len()
    }
}
