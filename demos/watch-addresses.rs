//! Prints the address events of one application across namespaces.
//!
//! # Running in Kubernetes
//!
//! Without a config file the in-cluster service account is used and only the
//! pod's own namespace is watched.
//!
//! # Environment Variables
//!
//! - `APP_NAME`: application to watch (default: greeter-server)
//! - `WATCH_KIND`: `pods` or `endpoints` (default: endpoints)
//! - `CONFIG_FILE`: optional TOML file with a `[kubernetes]` table
//! - `KUBE_WATCH_KUBERNETES__NAMESPACES`: comma separated namespaces, overrides the file

use std::env;

use kube_watch_registry::{Config, EventType, Kind, Registry};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let app_name = env::var("APP_NAME").unwrap_or_else(|_| "greeter-server".to_string());
    let kind: Kind = env::var("WATCH_KIND")
        .unwrap_or_else(|_| "endpoints".to_string())
        .parse()?;

    let config = match env::var("CONFIG_FILE") {
        Ok(path) => Config::load(&path, "kubernetes")?,
        Err(_) => Config::default(),
    };

    info!(
        "Watching {kind} of {app_name} in {:?} via {}",
        config.namespaces, config.addr
    );

    let registry = Registry::connect(config)?;
    let cancel = CancellationToken::new();

    let mut app = match registry.new_watcher_app(&cancel, &app_name, kind).await {
        Ok(app) => app,
        Err(partial) => {
            let (app, e) = partial.into_parts();
            let Some(app) = app else {
                return Err(e.into());
            };

            warn!("Some namespaces failed to start: {e}");
            app
        }
    };

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down");
                cancel.cancel();
            }
        }
    });

    while let Some(event) = app.recv().await {
        match event.event_type {
            EventType::Error => error!(
                "{}: resync failing, last known addresses {:?}",
                event.namespace, event.ips
            ),
            event_type => info!("{} {event_type}: {:?}", event.namespace, event.ips),
        }
    }

    app.stopped().await;
    Ok(())
}
