//! Rivulet cluster manager.
//!
//! The cluster manager is the control-plane core of a rivulet job: it
//! requests container-sized resources from the cluster broker, places
//! stream processors onto them with host-affinity preferences, and
//! orchestrates standby-aware failover when actives die.

use std::sync::Arc;

use anyhow::Result;
use rivulet_cluster_manager::broker::MockBroker;
use rivulet_cluster_manager::config::Config;
use rivulet_cluster_manager::job_model::StaticJobModel;
use rivulet_cluster_manager::manager::ClusterManager;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting rivulet cluster manager");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        processor_count = config.processor_count,
        standby_replication_factor = config.standby_replication_factor,
        host_affinity = config.host_affinity,
        coordinator_url = %config.coordinator_url,
        "Configuration loaded"
    );

    let job_model = Arc::new(StaticJobModel::with_replication(
        config.processor_count,
        config.standby_replication_factor,
        &config.coordinator_url,
    ));

    // The mock broker stands in until a concrete cluster adapter is
    // wired through the callback surface.
    let broker = Arc::new(MockBroker::new());

    let manager = ClusterManager::new(config, job_model, broker)?;
    let allocator_handle = manager.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    manager.stop();
    allocator_handle.await??;

    Ok(())
}
