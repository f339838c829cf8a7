//! Cluster resource broker interface and mock implementation.
//!
//! The broker grants and revokes host-backed compute allocations and
//! carries out container launch and stop. Grants, stops, and launch
//! outcomes flow back asynchronously through the `ClusterManager`
//! callback surface.
//!
//! A mock implementation is provided for testing and development.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::command::LaunchSpec;
use crate::resource::Resource;

/// Cluster resource broker interface.
#[async_trait]
pub trait ResourceBroker: Send + Sync {
    /// Launch a worker on an allocated resource. Asynchronous: the
    /// outcome arrives later as a launch-succeeded or launch-failed
    /// event.
    async fn launch(&self, resource: &Resource, spec: LaunchSpec) -> Result<()>;

    /// Stop a running container. Idempotent: stopping a container that
    /// already exited is not an error.
    async fn stop(&self, resource: &Resource) -> Result<()>;

    /// Return an unused allocation to the cluster.
    async fn release(&self, resource: &Resource) -> Result<()>;
}

/// Mock broker for testing and development.
#[derive(Default)]
pub struct MockBroker {
    launches: Mutex<Vec<(Resource, LaunchSpec)>>,
    stops: Mutex<Vec<Resource>>,
    releases: Mutex<Vec<Resource>>,
    fail_launches: AtomicBool,
}

impl MockBroker {
    /// Create a new mock broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock broker that fails all launches.
    pub fn failing() -> Self {
        let broker = Self::default();
        broker.fail_launches.store(true, Ordering::Relaxed);
        broker
    }

    /// Launches issued so far, in order.
    pub fn launches(&self) -> Vec<(Resource, LaunchSpec)> {
        self.launches.lock().clone()
    }

    /// Stops issued so far, in order.
    pub fn stops(&self) -> Vec<Resource> {
        self.stops.lock().clone()
    }

    /// Releases issued so far, in order.
    pub fn releases(&self) -> Vec<Resource> {
        self.releases.lock().clone()
    }
}

#[async_trait]
impl ResourceBroker for MockBroker {
    async fn launch(&self, resource: &Resource, spec: LaunchSpec) -> Result<()> {
        if self.fail_launches.load(Ordering::Relaxed) {
            anyhow::bail!("mock broker configured to fail launches");
        }
        info!(
            resource_id = %resource.resource_id,
            processor_id = %spec.processor_id,
            host = %resource.host,
            "[MOCK] Launching worker"
        );
        self.launches.lock().push((resource.clone(), spec));
        Ok(())
    }

    async fn stop(&self, resource: &Resource) -> Result<()> {
        info!(
            resource_id = %resource.resource_id,
            host = %resource.host,
            "[MOCK] Stopping container"
        );
        self.stops.lock().push(resource.clone());
        Ok(())
    }

    async fn release(&self, resource: &Resource) -> Result<()> {
        debug!(
            resource_id = %resource.resource_id,
            host = %resource.host,
            "[MOCK] Releasing resource"
        );
        self.releases.lock().push(resource.clone());
        Ok(())
    }
}
