//! Registry configuration.
//!
//! Defaults target in-cluster operation: the API server address comes from
//! `KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT` and the bearer token and
//! namespace from the mounted service account.

use std::env;
use std::fs;
use std::time::Duration;

use config::{Environment, File};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Default interval between unconditional resyncs.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default capacity of a watcher app's event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

const TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
const ENV_PREFIX: &str = "KUBE_WATCH";

/// Configuration for the registry and its watchers.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Kubernetes API server URL, e.g. `https://10.0.0.1:443`.
    pub addr: String,

    /// Static bearer token.
    pub token: String,

    /// Bearer token file, re-read by the client. Takes precedence over `token`.
    pub token_file: String,

    /// Namespaces to list and watch, in order.
    pub namespaces: Vec<String>,

    /// Prefix prepended to application names to form deployment/service names.
    pub deployment_prefix: String,

    /// Skip TLS verification of the API server certificate.
    pub tls_insecure: bool,

    /// When `false` the registry never touches the network and every operation
    /// fails with [`Error::Disabled`].
    pub enable: bool,

    /// Log resolved configuration and per-event details.
    pub debug: bool,

    /// Seconds between unconditional resyncs of every watch.
    pub resync_interval_in_secs: u64,

    /// Capacity of each watcher app's event channel.
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: in_cluster_addr(),
            token: read_trimmed(TOKEN_FILE),
            token_file: String::new(),
            namespaces: vec![read_trimmed(NAMESPACE_FILE)]
                .into_iter()
                .filter(|ns| !ns.is_empty())
                .collect(),
            deployment_prefix: String::new(),
            tls_insecure: true,
            enable: true,
            debug: false,
            resync_interval_in_secs: DEFAULT_RESYNC_INTERVAL.as_secs(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl Config {
    /// Loads the configuration stored under `key` in `path`, with environment overrides.
    ///
    /// Any field may be overridden by `KUBE_WATCH_<KEY>__<FIELD>`; `namespaces`
    /// accepts a comma separated list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Load`] if the file cannot be read or does not deserialize.
    pub fn load(path: &str, key: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key(&format!("{key}.namespaces"))
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = config.get(key)?;
        if loaded.debug {
            tracing::debug!(
                "loaded kubernetes config {key}: addr={} namespaces={:?} prefix={:?}",
                loaded.addr,
                loaded.namespaces,
                loaded.deployment_prefix
            );
        }

        Ok(loaded)
    }

    /// Sets the API server address.
    #[must_use]
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// Sets a static bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Sets a bearer token file.
    #[must_use]
    pub fn with_token_file(mut self, token_file: impl Into<String>) -> Self {
        self.token_file = token_file.into();
        self
    }

    /// Sets the namespaces to list and watch.
    #[must_use]
    pub fn with_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the deployment name prefix.
    #[must_use]
    pub fn with_deployment_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.deployment_prefix = prefix.into();
        self
    }

    /// Enables or disables TLS verification bypass.
    #[must_use]
    pub fn with_tls_insecure(mut self, insecure: bool) -> Self {
        self.tls_insecure = insecure;
        self
    }

    /// Enables or disables the component.
    #[must_use]
    pub fn with_enable(mut self, enable: bool) -> Self {
        self.enable = enable;
        self
    }

    /// Sets the resync interval (rounded down to whole seconds, at least one).
    #[must_use]
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval_in_secs = interval.as_secs().max(1);
        self
    }

    /// Sets the capacity of each watcher app's event channel.
    #[must_use]
    pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer;
        self
    }

    /// Returns the resync interval.
    #[must_use]
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_in_secs)
    }

    /// Maps an application name to its deployment name.
    #[must_use]
    pub fn deployment_name(&self, name: &str) -> String {
        format!("{}{name}", self.deployment_prefix)
    }

    /// Checks the settings the watchers depend on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.namespaces.is_empty() {
            return Err(Error::Config("at least one namespace is required".into()));
        }

        if let Some(ns) = self.namespaces.iter().find(|ns| ns.trim().is_empty()) {
            return Err(Error::Config(format!("invalid namespace: {ns:?}")));
        }

        if self.resync_interval_in_secs == 0 {
            return Err(Error::Config("resync interval must be > 0".into()));
        }

        if self.event_buffer == 0 {
            return Err(Error::Config("event buffer must be > 0".into()));
        }

        Ok(())
    }

    /// Builds the [`kube::Config`] for this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the address is missing or not a valid URI.
    pub fn to_kube_config(&self) -> Result<kube::Config> {
        if self.addr.is_empty() {
            return Err(Error::Config("kubernetes api address is empty".into()));
        }

        let cluster_url = http::Uri::try_from(self.addr.as_str()).map_err(|e| {
            Error::Config(format!("invalid kubernetes api address {}: {e}", self.addr))
        })?;

        let mut config = kube::Config::new(cluster_url);
        config.accept_invalid_certs = self.tls_insecure;
        if let Some(ns) = self.namespaces.first() {
            config.default_namespace.clone_from(ns);
        }

        // the token file is refreshed by the client, so it wins over a static token
        if !self.token_file.is_empty() {
            config.auth_info.token_file = Some(self.token_file.clone());
        } else if !self.token.is_empty() {
            config.auth_info.token = Some(self.token.clone().into());
        }

        Ok(config)
    }
}

fn in_cluster_addr() -> String {
    match (
        env::var("KUBERNETES_SERVICE_HOST"),
        env::var("KUBERNETES_SERVICE_PORT"),
    ) {
        (Ok(host), Ok(port)) if !host.is_empty() && !port.is_empty() => {
            format!("https://{host}:{port}")
        }
        _ => String::new(),
    }
}

fn read_trimmed(path: &str) -> String {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn base() -> Config {
        Config::default()
            .with_addr("https://10.0.0.1:6443")
            .with_namespaces(["ns-a", "ns-b"])
    }

    #[test]
    fn builder_sets_fields() {
        let config = base()
            .with_token("secret")
            .with_deployment_prefix("prod-")
            .with_tls_insecure(false)
            .with_enable(false)
            .with_resync_interval(Duration::from_secs(30))
            .with_event_buffer(16);

        assert_eq!(config.namespaces, vec!["ns-a", "ns-b"]);
        assert_eq!(config.token, "secret");
        assert!(!config.tls_insecure);
        assert!(!config.enable);
        assert_eq!(config.resync_interval(), Duration::from_secs(30));
        assert_eq!(config.event_buffer, 16);
        assert_eq!(config.deployment_name("svc"), "prod-svc");
    }

    #[test]
    fn default_resync_is_five_minutes() {
        assert_eq!(Config::default().resync_interval(), Duration::from_secs(300));
    }

    #[test]
    fn resync_interval_is_at_least_one_second() {
        let config = base().with_resync_interval(Duration::from_millis(10));
        assert_eq!(config.resync_interval_in_secs, 1);
    }

    #[test]
    fn validate_rejects_missing_namespaces() {
        let config = base().with_namespaces(Vec::<String>::new());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_blank_namespace() {
        let config = base().with_namespaces(["ns-a", " "]);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_buffer() {
        assert!(base().with_event_buffer(0).validate().is_err());
        assert!(base().validate().is_ok());
    }

    #[test]
    fn kube_config_requires_addr() {
        let config = base().with_addr("");
        assert!(matches!(config.to_kube_config(), Err(Error::Config(_))));
    }

    #[test]
    fn kube_config_rejects_bad_uri() {
        let config = base().with_addr("http://bad uri");
        assert!(matches!(config.to_kube_config(), Err(Error::Config(_))));
    }

    #[test]
    fn kube_config_prefers_token_file() {
        let config = base()
            .with_token("static")
            .with_token_file("/tmp/token")
            .to_kube_config()
            .unwrap();

        assert_eq!(config.auth_info.token_file.as_deref(), Some("/tmp/token"));
        assert!(config.auth_info.token.is_none());
        assert_eq!(config.default_namespace, "ns-a");
        assert!(config.accept_invalid_certs);
    }

    #[test]
    fn kube_config_uses_static_token() {
        let config = base().with_token("static").to_kube_config().unwrap();

        assert!(config.auth_info.token.is_some());
        assert!(config.auth_info.token_file.is_none());
    }

    #[test]
    fn load_reads_keyed_section() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[k8s]
addr = "https://127.0.0.1:6443"
namespaces = ["default", "prod"]
deployment_prefix = "svc-"
enable = false
resync_interval_in_secs = 60
"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap(), "k8s").unwrap();

        assert_eq!(config.addr, "https://127.0.0.1:6443");
        assert_eq!(config.namespaces, vec!["default", "prod"]);
        assert_eq!(config.deployment_prefix, "svc-");
        assert!(!config.enable);
        assert_eq!(config.resync_interval(), Duration::from_secs(60));
        assert_eq!(config.event_buffer, DEFAULT_EVENT_BUFFER);
    }

    #[test]
    fn load_missing_file_fails() {
        let err = Config::load("/nonexistent/kube-watch", "k8s").unwrap_err();
        assert!(matches!(err, Error::Load(_)));
    }
}
