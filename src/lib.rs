#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Multi-namespace Kubernetes watch aggregation for client-side load balancing.
//!
//! Applications that balance RPC traffic themselves need to know which
//! backend addresses are routable right now. This crate watches the `Pod`s or
//! `Endpoints` of an application in every configured namespace and merges the
//! changes into one stream of [`AddressEvent`]s, each carrying the complete
//! address set of a namespace after the change.
//!
//! # Features
//!
//! - **Multi-namespace fan-in**: one watch task per namespace, one event channel
//! - **Self-healing**: re-lists and resumes after disconnects, expired
//!   resource versions and every resync interval
//! - **Fail-fast listing**: point-in-time queries across all namespaces
//! - **Disabled mode**: `enable = false` yields an inert registry that never
//!   touches the network
//! - **Tonic integration**: [`balance::forward`] feeds a balance channel
//!
//! # Usage
//!
//! ```ignore
//! use tokio_util::sync::CancellationToken;
//! use kube_watch_registry::{Config, Kind, Registry};
//!
//! let config = Config::default().with_deployment_prefix("prod-");
//! let registry = Registry::connect(config)?;
//!
//! let cancel = CancellationToken::new();
//! let mut app = registry
//!     .new_watcher_app(&cancel, "orders", Kind::Pods)
//!     .await?;
//!
//! while let Some(event) = app.recv().await {
//!     println!("{} {}: {:?}", event.namespace, event.event_type, event.ips);
//! }
//! ```

pub mod balance;
mod client;
mod config;
mod error;
mod event;
mod namespace_watcher;
mod registry;
mod resource;
mod watcher_app;

pub use client::{ClusterClient, KubeClusterClient, NativeEvent, NativeEventStream, ResourceList};
pub use crate::config::{Config, DEFAULT_EVENT_BUFFER, DEFAULT_RESYNC_INTERVAL};
pub use error::{BoxError, Error, Result};
pub use event::{AddressEvent, EventType};
pub use registry::{ListOptions, Registry};
pub use resource::{APP_LABEL, AddressSource, Kind, Selector, WatchTarget};
pub use watcher_app::{PartialStart, WatcherApp, WatcherSettings};

pub use kube::api::WatchParams;
