//! One-shot listing across namespaces and the entry point for watching.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Endpoints, Pod};
use kube::api::ListParams;
use tokio_util::sync::CancellationToken;

use crate::client::{ClusterClient, KubeClusterClient, ResourceList};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::resource::{AddressSource, Kind};
use crate::watcher_app::{PartialStart, WatcherApp, WatcherSettings};

/// Options accepted by the list operations.
pub type ListOptions = ListParams;

/// Read-only view of an application's Pods and Endpoints across the configured namespaces.
///
/// Built with `enable = false` the registry is inert: every operation returns
/// [`Error::Disabled`] and the cluster client is never called.
pub struct Registry<C> {
    config: Arc<Config>,
    client: Option<Arc<C>>,
}

impl Registry<KubeClusterClient> {
    /// Connects to the cluster described by `config`.
    ///
    /// No I/O happens when `config.enable` is `false`. Must be called from
    /// within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the client cannot be built.
    pub fn connect(config: Config) -> Result<Self> {
        if !config.enable {
            tracing::info!("Kubernetes component disabled, all operations will fail");
            return Ok(Self::disabled(config));
        }

        let client = KubeClusterClient::try_from_config(&config)?;
        Self::with_client(config, client)
    }
}

impl<C: ClusterClient> Registry<C> {
    /// Creates a registry on top of an existing cluster client.
    ///
    /// The client is discarded when `config.enable` is `false`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if an enabled configuration fails validation.
    pub fn with_client(config: Config, client: C) -> Result<Self> {
        if !config.enable {
            return Ok(Self::disabled(config));
        }

        config.validate()?;
        tracing::debug!(
            "Kubernetes registry for namespaces {:?} (prefix {:?})",
            config.namespaces,
            config.deployment_prefix
        );

        Ok(Self {
            config: Arc::new(config),
            client: Some(Arc::new(client)),
        })
    }

    /// Lists the pods matching `options` in every namespace.
    ///
    /// # Errors
    ///
    /// Fails on the first namespace whose list call fails; earlier results are discarded.
    pub async fn list_pods(&self, options: &ListOptions) -> Result<Vec<ResourceList<Pod>>> {
        self.list_all(options).await
    }

    /// Lists the endpoints matching `options` in every namespace.
    ///
    /// # Errors
    ///
    /// Fails on the first namespace whose list call fails; earlier results are discarded.
    pub async fn list_endpoints(
        &self,
        options: &ListOptions,
    ) -> Result<Vec<ResourceList<Endpoints>>> {
        self.list_all(options).await
    }

    /// Fetches the pod named after the deployment of `name` in every namespace.
    ///
    /// # Errors
    ///
    /// Fails on the first namespace whose get call fails; earlier results are discarded.
    pub async fn list_pods_by_name(&self, name: &str) -> Result<Vec<Pod>> {
        self.get_all(name).await
    }

    /// Fetches the endpoints named after the deployment of `name` in every namespace.
    ///
    /// # Errors
    ///
    /// Fails on the first namespace whose get call fails; earlier results are discarded.
    pub async fn list_endpoints_by_name(&self, name: &str) -> Result<Vec<Endpoints>> {
        self.get_all(name).await
    }

    /// Creates a [`WatcherApp`] for `app_name` and starts watching every namespace in order.
    ///
    /// # Errors
    ///
    /// Stops at the first namespace that fails to start and returns the
    /// partially started app along with the error; namespaces started before
    /// it keep running. A disabled registry returns a [`PartialStart`] without an app.
    pub async fn new_watcher_app(
        &self,
        cancel: &CancellationToken,
        app_name: &str,
        kind: Kind,
    ) -> Result<WatcherApp<C>, PartialStart<C>> {
        let client = self.client()?;
        let app = WatcherApp::new(
            Arc::clone(client),
            app_name,
            kind,
            self.config.deployment_prefix.as_str(),
            self.config.namespaces.clone(),
            WatcherSettings::from(self.config.as_ref()),
            cancel,
        );

        for namespace in &self.config.namespaces {
            if let Err(error) = app.watch(namespace).await {
                tracing::error!("Kubernetes watch for {app_name} failed to start: {error}");
                return Err(PartialStart {
                    app: Some(app),
                    error,
                });
            }
        }

        tracing::info!(
            "Watching {kind} of {app_name} in {} namespaces",
            self.config.namespaces.len()
        );

        Ok(app)
    }

    async fn list_all<K: AddressSource>(
        &self,
        options: &ListOptions,
    ) -> Result<Vec<ResourceList<K>>> {
        let client = self.client()?;
        let mut lists = Vec::with_capacity(self.config.namespaces.len());
        for namespace in &self.config.namespaces {
            let list = client
                .list::<K>(namespace, options)
                .await
                .map_err(|e| Error::namespace(namespace, "list", K::KIND, e))?;

            lists.push(list);
        }

        Ok(lists)
    }

    async fn get_all<K: AddressSource>(&self, name: &str) -> Result<Vec<K>> {
        let client = self.client()?;
        let name = self.config.deployment_name(name);
        let mut objects = Vec::with_capacity(self.config.namespaces.len());
        for namespace in &self.config.namespaces {
            let obj = client
                .get::<K>(namespace, &name)
                .await
                .map_err(|e| Error::namespace(namespace, "get", K::KIND, e))?;

            objects.push(obj);
        }

        Ok(objects)
    }
}

impl<C> Registry<C> {
    /// Creates a registry that refuses every operation.
    #[must_use]
    pub fn disabled(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            client: None,
        }
    }

    /// Returns `true` unless the registry was built disabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// The configuration snapshot this registry was built from.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn client(&self) -> Result<&Arc<C>> {
        self.client.as_ref().ok_or(Error::Disabled)
    }
}
