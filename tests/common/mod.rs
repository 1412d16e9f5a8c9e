//! In-memory cluster client for integration tests.
//!
//! Objects are kept as JSON and deserialized into the requested kind, watch
//! streams are unbounded channels the test pushes into, and every call is
//! recorded for assertions.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use kube::api::{ListParams, WatchParams};
use kube_watch_registry::{
    AddressEvent, AddressSource, BoxError, ClusterClient, Kind, NativeEvent, NativeEventStream,
    ResourceList,
};
use serde::Serialize;
use serde_json::Value;

/// How long a test waits for something that should happen promptly.
pub const PROMPTLY: Duration = Duration::from_secs(5);

type Target = (Kind, String);
type FakeEvent = Result<NativeEvent<Value>, String>;

/// A recorded client call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    List {
        kind: Kind,
        namespace: String,
        labels: Option<String>,
        fields: Option<String>,
    },
    Get {
        kind: Kind,
        namespace: String,
        name: String,
    },
    Watch {
        kind: Kind,
        namespace: String,
        resource_version: String,
        labels: Option<String>,
        fields: Option<String>,
    },
}

impl Call {
    pub fn namespace(&self) -> &str {
        match self {
            Self::List { namespace, .. }
            | Self::Get { namespace, .. }
            | Self::Watch { namespace, .. } => namespace,
        }
    }
}

#[derive(Default)]
struct Inner {
    version: u64,
    objects: HashMap<Target, BTreeMap<String, Value>>,
    watchers: HashMap<Target, Vec<UnboundedSender<FakeEvent>>>,
    failing_reads: HashMap<String, usize>,
    failing_watches: HashMap<String, usize>,
    calls: Vec<Call>,
}

impl Inner {
    fn bump(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn take_failure(counters: &mut HashMap<String, usize>, namespace: &str) -> bool {
        match counters.get_mut(namespace) {
            Some(0) | None => false,
            Some(remaining) => {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }

                true
            }
        }
    }
}

/// Shared handle to the fake cluster; clones observe the same state.
#[derive(Clone, Default)]
pub struct FakeCluster {
    inner: Arc<Mutex<Inner>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Stores `obj` (stamped with a fresh resource version) without notifying watchers.
    pub fn put<K: AddressSource + Serialize>(&self, namespace: &str, mut obj: K) -> K {
        let mut inner = self.lock();
        obj.meta_mut().resource_version = Some(inner.bump());
        let name = obj.meta().name.clone().unwrap_or_default();
        inner
            .objects
            .entry((K::KIND, namespace.to_string()))
            .or_default()
            .insert(name, serde_json::to_value(&obj).unwrap());

        obj
    }

    /// Removes the object named `name` without notifying watchers.
    pub fn remove<K: AddressSource + Serialize>(&self, namespace: &str, name: &str) -> Option<K> {
        let mut inner = self.lock();
        let version = inner.bump();
        let value = inner
            .objects
            .get_mut(&(K::KIND, namespace.to_string()))?
            .remove(name)?;

        let mut obj: K = serde_json::from_value(value).unwrap();
        obj.meta_mut().resource_version = Some(version);
        Some(obj)
    }

    /// Delivers an event to every open watch on the target; returns how many received it.
    pub fn push<K: AddressSource + Serialize>(
        &self,
        namespace: &str,
        event: NativeEvent<K>,
    ) -> usize {
        let event = match event {
            NativeEvent::Added(obj) => NativeEvent::Added(serde_json::to_value(obj).unwrap()),
            NativeEvent::Modified(obj) => NativeEvent::Modified(serde_json::to_value(obj).unwrap()),
            NativeEvent::Deleted(obj) => NativeEvent::Deleted(serde_json::to_value(obj).unwrap()),
            NativeEvent::Bookmark(version) => NativeEvent::Bookmark(version),
            NativeEvent::Error { code, message } => NativeEvent::Error { code, message },
        };

        self.send(K::KIND, namespace, &Ok(event))
    }

    /// Makes every open watch on the target yield a transport error.
    pub fn break_watches(&self, kind: Kind, namespace: &str) -> usize {
        self.send(kind, namespace, &Err("connection reset by peer".to_string()))
    }

    fn send(&self, kind: Kind, namespace: &str, event: &FakeEvent) -> usize {
        let mut inner = self.lock();
        let Some(senders) = inner.watchers.get_mut(&(kind, namespace.to_string())) else {
            return 0;
        };

        senders.retain(|tx| tx.unbounded_send(event.clone()).is_ok());
        senders.len()
    }

    /// Ends every open watch stream on the target, as the API server does on timeout.
    pub fn close_watches(&self, kind: Kind, namespace: &str) {
        self.lock().watchers.remove(&(kind, namespace.to_string()));
    }

    /// Number of watch streams on the target whose consumer is still alive.
    pub fn live_watches(&self, kind: Kind, namespace: &str) -> usize {
        self.lock()
            .watchers
            .get(&(kind, namespace.to_string()))
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Fails the next `count` list and get calls in `namespace` (`usize::MAX`: until healed).
    pub fn fail_reads(&self, namespace: &str, count: usize) {
        self.lock().failing_reads.insert(namespace.to_string(), count);
    }

    /// Fails the next `count` watch calls in `namespace` (`usize::MAX`: until healed).
    pub fn fail_watches(&self, namespace: &str, count: usize) {
        self.lock().failing_watches.insert(namespace.to_string(), count);
    }

    /// Clears every injected failure for `namespace`.
    pub fn heal(&self, namespace: &str) {
        let mut inner = self.lock();
        inner.failing_reads.remove(namespace);
        inner.failing_watches.remove(namespace);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn list_calls(&self, kind: Kind, namespace: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| {
                matches!(call, Call::List { kind: k, namespace: ns, .. }
                    if *k == kind && ns == namespace)
            })
            .count()
    }

    pub fn watch_calls(&self, kind: Kind, namespace: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| {
                matches!(call, Call::Watch { kind: k, namespace: ns, .. }
                    if *k == kind && ns == namespace)
            })
            .collect()
    }
}

fn convert<K: AddressSource>(event: FakeEvent) -> Result<NativeEvent<K>, BoxError> {
    Ok(match event? {
        NativeEvent::Added(value) => NativeEvent::Added(serde_json::from_value(value)?),
        NativeEvent::Modified(value) => NativeEvent::Modified(serde_json::from_value(value)?),
        NativeEvent::Deleted(value) => NativeEvent::Deleted(serde_json::from_value(value)?),
        NativeEvent::Bookmark(version) => NativeEvent::Bookmark(version),
        NativeEvent::Error { code, message } => NativeEvent::Error { code, message },
    })
}

impl ClusterClient for FakeCluster {
    async fn list<K: AddressSource>(
        &self,
        namespace: &str,
        params: &ListParams,
    ) -> Result<ResourceList<K>, BoxError> {
        let mut inner = self.lock();
        inner.calls.push(Call::List {
            kind: K::KIND,
            namespace: namespace.to_string(),
            labels: params.label_selector.clone(),
            fields: params.field_selector.clone(),
        });

        if Inner::take_failure(&mut inner.failing_reads, namespace) {
            return Err(format!("list {} in {namespace}: connection refused", K::KIND).into());
        }

        let items = inner
            .objects
            .get(&(K::KIND, namespace.to_string()))
            .into_iter()
            .flat_map(BTreeMap::values)
            .map(|value| serde_json::from_value(value.clone()))
            .collect::<Result<Vec<K>, _>>()?;

        Ok(ResourceList {
            resource_version: inner.version.to_string(),
            items,
        })
    }

    async fn get<K: AddressSource>(&self, namespace: &str, name: &str) -> Result<K, BoxError> {
        let mut inner = self.lock();
        inner.calls.push(Call::Get {
            kind: K::KIND,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });

        if Inner::take_failure(&mut inner.failing_reads, namespace) {
            return Err(format!("get {} in {namespace}: connection refused", K::KIND).into());
        }

        let value = inner
            .objects
            .get(&(K::KIND, namespace.to_string()))
            .and_then(|objects| objects.get(name))
            .ok_or_else(|| format!("{} \"{name}\" not found", K::KIND))?;

        Ok(serde_json::from_value(value.clone())?)
    }

    async fn watch<K: AddressSource>(
        &self,
        namespace: &str,
        params: &WatchParams,
        resource_version: &str,
    ) -> Result<NativeEventStream<K>, BoxError> {
        let mut inner = self.lock();
        inner.calls.push(Call::Watch {
            kind: K::KIND,
            namespace: namespace.to_string(),
            resource_version: resource_version.to_string(),
            labels: params.label_selector.clone(),
            fields: params.field_selector.clone(),
        });

        if Inner::take_failure(&mut inner.failing_watches, namespace) {
            return Err(format!("watch {} in {namespace}: forbidden", K::KIND).into());
        }

        let (tx, rx) = unbounded();
        inner
            .watchers
            .entry((K::KIND, namespace.to_string()))
            .or_default()
            .push(tx);

        Ok(rx.map(convert::<K>).boxed())
    }
}

pub fn pod(name: &str, ip: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some(ip.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn endpoints(name: &str, ready: &[&str], not_ready: &[&str]) -> Endpoints {
    let to_addrs = |ips: &[&str]| {
        ips.iter()
            .map(|ip| EndpointAddress {
                ip: (*ip).to_string(),
                ..Default::default()
            })
            .collect::<Vec<_>>()
    };

    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(to_addrs(ready)),
            not_ready_addresses: Some(to_addrs(not_ready)),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Receives events until one for `namespace` arrives.
pub async fn next_in(
    app: &mut kube_watch_registry::WatcherApp<FakeCluster>,
    namespace: &str,
) -> AddressEvent {
    tokio::time::timeout(PROMPTLY, async {
        loop {
            let event = app.recv().await.expect("event channel closed");
            if event.namespace == namespace {
                return event;
            }
        }
    })
    .await
    .expect("no event in time")
}

/// Polls `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(PROMPTLY, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
