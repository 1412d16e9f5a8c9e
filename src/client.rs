//! The cluster client boundary.
//!
//! Everything the watchers and the registry need from Kubernetes goes through
//! [`ClusterClient`]. [`KubeClusterClient`] is the production implementation
//! on top of [`kube::Client`]; tests substitute their own.

use std::future::Future;

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use kube::api::{ListParams, WatchEvent, WatchParams};
use kube::{Api, Client};

use crate::config::Config;
use crate::error::{BoxError, Result};
use crate::resource::AddressSource;

/// A stream of native watch events for one namespace.
pub type NativeEventStream<K> = BoxStream<'static, std::result::Result<NativeEvent<K>, BoxError>>;

/// The result of a list call: the objects plus the version to resume watching from.
#[derive(Clone, Debug)]
pub struct ResourceList<K> {
    /// Resource version of the list snapshot.
    pub resource_version: String,
    /// Objects matching the list parameters.
    pub items: Vec<K>,
}

/// A raw watch event as delivered by the API server.
#[derive(Clone, Debug)]
pub enum NativeEvent<K> {
    /// An object was created.
    Added(K),
    /// An object was updated.
    Modified(K),
    /// An object was deleted.
    Deleted(K),
    /// A progress marker carrying only a resource version.
    Bookmark(String),
    /// The server reported an error inside the stream (410 means the version expired).
    Error {
        /// HTTP status code of the error.
        code: u16,
        /// Human readable description.
        message: String,
    },
}

impl<K> From<WatchEvent<K>> for NativeEvent<K> {
    fn from(event: WatchEvent<K>) -> Self {
        match event {
            WatchEvent::Added(obj) => Self::Added(obj),
            WatchEvent::Modified(obj) => Self::Modified(obj),
            WatchEvent::Deleted(obj) => Self::Deleted(obj),
            WatchEvent::Bookmark(bookmark) => Self::Bookmark(bookmark.metadata.resource_version),
            WatchEvent::Error(err) => Self::Error {
                code: err.code,
                message: err.message.clone(),
            },
        }
    }
}

/// Read-only access to the cluster state this crate observes.
pub trait ClusterClient: Send + Sync + 'static {
    /// Lists objects of kind `K` in `namespace`.
    fn list<K: AddressSource>(
        &self,
        namespace: &str,
        params: &ListParams,
    ) -> impl Future<Output = std::result::Result<ResourceList<K>, BoxError>> + Send;

    /// Fetches the object of kind `K` named `name` in `namespace`.
    fn get<K: AddressSource>(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = std::result::Result<K, BoxError>> + Send;

    /// Opens a watch on kind `K` in `namespace`, starting after `resource_version`.
    fn watch<K: AddressSource>(
        &self,
        namespace: &str,
        params: &WatchParams,
        resource_version: &str,
    ) -> impl Future<Output = std::result::Result<NativeEventStream<K>, BoxError>> + Send;
}

/// [`ClusterClient`] backed by a [`kube::Client`].
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wraps an existing client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client from the ambient environment (in-cluster or kubeconfig).
    ///
    /// # Errors
    ///
    /// Returns an error if no usable Kubernetes configuration is found.
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    /// Builds a client from the registry configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or the client cannot be built.
    pub fn try_from_config(config: &Config) -> Result<Self> {
        let client = Client::try_from(config.to_kube_config()?)?;
        Ok(Self::new(client))
    }

    fn api<K: AddressSource>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl ClusterClient for KubeClusterClient {
    async fn list<K: AddressSource>(
        &self,
        namespace: &str,
        params: &ListParams,
    ) -> std::result::Result<ResourceList<K>, BoxError> {
        let list = self.api::<K>(namespace).list(params).await?;
        Ok(ResourceList {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn get<K: AddressSource>(
        &self,
        namespace: &str,
        name: &str,
    ) -> std::result::Result<K, BoxError> {
        Ok(self.api::<K>(namespace).get(name).await?)
    }

    async fn watch<K: AddressSource>(
        &self,
        namespace: &str,
        params: &WatchParams,
        resource_version: &str,
    ) -> std::result::Result<NativeEventStream<K>, BoxError> {
        let stream = self
            .api::<K>(namespace)
            .watch(params, resource_version)
            .await?;

        Ok(stream
            .map_ok(NativeEvent::from)
            .map_err(|e| Box::new(e) as BoxError)
            .boxed())
    }
}
