//! Watched resource kinds and their translation into address sets.
//!
//! Only two kinds are supported: `Pod` (one address per running pod) and
//! core/v1 `Endpoints` (every ready address of every subset).

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::{Endpoints, Pod};
use kube::Resource;
use kube::api::{ListParams, WatchParams};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::Error;

/// Label selecting the pods of an application.
pub const APP_LABEL: &str = "app";

const RUNNING_PHASE: &str = "Running";

/// The resource kind a watcher follows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// Pods labelled with the application name.
    Pods,
    /// The `Endpoints` object named after the (prefixed) application.
    Endpoints,
}

impl Kind {
    /// Returns the lowercase plural name used by the Kubernetes API.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pods => "pods",
            Self::Endpoints => "endpoints",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pods" => Ok(Self::Pods),
            "endpoints" => Ok(Self::Endpoints),
            other => Err(Error::Config(format!("unknown resource kind: {other}"))),
        }
    }
}

/// Identifies a single watch stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WatchTarget {
    /// Namespace being watched.
    pub namespace: String,
    /// Resource kind being watched.
    pub kind: Kind,
}

impl WatchTarget {
    /// Creates a new watch target.
    #[must_use]
    pub fn new(namespace: impl Into<String>, kind: Kind) -> Self {
        Self {
            namespace: namespace.into(),
            kind,
        }
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.kind)
    }
}

/// Label and field selectors restricting a list or watch to one application.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    /// Label selector, e.g. `app=orders`.
    pub labels: Option<String>,
    /// Field selector, e.g. `metadata.name=prod-orders`.
    pub fields: Option<String>,
}

impl Selector {
    /// Builds list parameters carrying this selector.
    #[must_use]
    pub fn list_params(&self) -> ListParams {
        let mut params = ListParams::default();
        if let Some(labels) = &self.labels {
            params = params.labels(labels);
        }

        if let Some(fields) = &self.fields {
            params = params.fields(fields);
        }

        params
    }

    /// Builds watch parameters carrying this selector.
    #[must_use]
    pub fn watch_params(&self) -> WatchParams {
        let mut params = WatchParams::default();
        if let Some(labels) = &self.labels {
            params = params.labels(labels);
        }

        if let Some(fields) = &self.fields {
            params = params.fields(fields);
        }

        params
    }
}

/// A namespaced resource that can be reduced to a set of routable addresses.
pub trait AddressSource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + DeserializeOwned
    + fmt::Debug
    + Send
    + Sync
    + 'static
{
    /// The kind this type is watched as.
    const KIND: Kind;

    /// Selects the objects belonging to `app_name`.
    fn selector(app_name: &str, deployment_prefix: &str) -> Selector;

    /// Extracts the routable addresses of this object.
    fn addresses(&self) -> BTreeSet<String>;
}

impl AddressSource for Pod {
    const KIND: Kind = Kind::Pods;

    fn selector(app_name: &str, _deployment_prefix: &str) -> Selector {
        Selector {
            labels: Some(format!("{APP_LABEL}={app_name}")),
            fields: None,
        }
    }

    fn addresses(&self) -> BTreeSet<String> {
        let mut addrs = BTreeSet::new();
        if self.metadata.deletion_timestamp.is_some() {
            return addrs;
        }

        let Some(status) = &self.status else {
            return addrs;
        };

        if status.phase.as_deref() != Some(RUNNING_PHASE) {
            return addrs;
        }

        if let Some(ip) = status.pod_ip.as_deref().and_then(normalize_ip) {
            addrs.insert(ip);
        }

        addrs
    }
}

impl AddressSource for Endpoints {
    const KIND: Kind = Kind::Endpoints;

    fn selector(app_name: &str, deployment_prefix: &str) -> Selector {
        Selector {
            labels: None,
            fields: Some(format!("metadata.name={deployment_prefix}{app_name}")),
        }
    }

    // notReadyAddresses are never routed to
    fn addresses(&self) -> BTreeSet<String> {
        self.subsets
            .iter()
            .flatten()
            .flat_map(|subset| subset.addresses.iter().flatten())
            .filter_map(|addr| normalize_ip(&addr.ip))
            .collect()
    }
}

fn normalize_ip(raw: &str) -> Option<String> {
    match raw.parse::<IpAddr>() {
        Ok(ip) => Some(ip.to_string()),
        Err(_) => {
            tracing::debug!("skipping invalid address: {raw}");
            None
        }
    }
}
