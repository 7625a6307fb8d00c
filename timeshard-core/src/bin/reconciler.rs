//! Reconciler service binary

use std::net::SocketAddr;
use std::sync::Arc;
use timeshard_core::config::{OperatorConfig, DEFAULT_OPERATOR_CONFIG_PATH};
use timeshard_core::coordinator::{Reconciler, ReconcilerConfig, SystemClock};
use timeshard_core::runtime::{install_os_handlers, ShutdownSignal};
use timeshard_core::store::ConfigMapStore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting timeshard reconciler");

    let config_path = std::env::var("OPERATOR_CONFIG_PATH")
        .unwrap_or_else(|_| DEFAULT_OPERATOR_CONFIG_PATH.into());
    let config = match OperatorConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Cannot load {}: {}", config_path, e);
            return Err(e.into());
        }
    };

    let client = kube::Client::try_default().await?;
    let store = Arc::new(ConfigMapStore::new(
        client,
        &config.operator.namespace,
        config.operator.configmap_name.clone(),
    ));

    let reconciler = Reconciler::new(
        store,
        config.sharding,
        ReconcilerConfig::from_operator(&config),
        Arc::new(SystemClock),
    )?
    .with_worker_settings(&config.thanos)?;

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

    info!(
        "Managing {}/{} for statefulset {}",
        config.operator.namespace, config.operator.configmap_name, config.operator.statefulset_name
    );
    reconciler.run(shutdown).await?;

    Ok(())
}
