//! Instance agent binary

use std::net::SocketAddr;
use std::sync::Arc;
use timeshard_core::agent::{InstanceAgent, InstanceAgentConfig, Renderer, SignalReloader};
use timeshard_core::config::AgentSettings;
use timeshard_core::runtime::{install_os_handlers, ShutdownSignal};
#[cfg(feature = "kubernetes")]
use timeshard_core::store::ConfigMapStore;
use timeshard_core::store::MountedDocument;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting timeshard agent");

    let settings = match AgentSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid agent settings: {}", e);
            return Err(e.into());
        }
    };

    let shutdown = ShutdownSignal::new();
    install_os_handlers(shutdown.clone());

    let metrics_addr: SocketAddr = std::env::var("METRICS_ADDR")
        .unwrap_or_else(|_| timeshard_core::DEFAULT_METRICS_ADDR.into())
        .parse()?;
    let metrics_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = timeshard_core::metrics::serve(metrics_addr, metrics_shutdown).await {
            warn!("Metrics server error: {}", e);
        }
    });

    let documents = match &settings.document_configmap {
        #[cfg(feature = "kubernetes")]
        Some(name) => {
            let client = kube::Client::try_default().await?;
            ConfigMapStore::new(client, &settings.namespace, name.clone()).watch(shutdown.clone())
        }
        #[cfg(not(feature = "kubernetes"))]
        Some(name) => {
            warn!(
                "DOCUMENT_CONFIGMAP={} needs the kubernetes feature; polling {} instead",
                name,
                settings.document_path.display()
            );
            MountedDocument::new(&settings.document_path, settings.poll_interval)
                .spawn(shutdown.clone())
        }
        None => MountedDocument::new(&settings.document_path, settings.poll_interval)
            .spawn(shutdown.clone()),
    };
    let reloader = Arc::new(SignalReloader::new(
        settings.process_pattern.clone(),
        settings.ready_url.clone(),
    ));
    let agent = InstanceAgent::open(
        InstanceAgentConfig::from_settings(&settings),
        Renderer::new(&settings.worker_config_path),
        reloader,
    )
    .await;

    agent.run(documents, shutdown).await?;
    Ok(())
}
