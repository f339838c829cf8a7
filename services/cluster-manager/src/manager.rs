//! Cluster manager front: lifecycle and broker callback surface.
//!
//! Owns the wiring between the allocator loop, the failover
//! coordinator, and the shared state, and translates broker events into
//! coordinator and allocator actions. Broker callbacks never block on
//! the allocator loop.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use rivulet_id::{Host, ProcessorId, ResourceId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::allocator::{ContainerAllocator, PlacementPolicy};
use crate::broker::ResourceBroker;
use crate::command::CommandBuilderRegistry;
use crate::config::Config;
use crate::constraints::PlacementConstraints;
use crate::error::ClusterError;
use crate::job_model::JobModel;
use crate::request_state::ResourceRequestState;
use crate::resource::{ExitStatus, PreferredHost, Resource, ResourceRequest};
use crate::standby::StandbyCoordinator;
use crate::state::AppState;

/// The control-plane core: allocator, coordinator, and callback
/// surface, built once from configuration.
pub struct ClusterManager {
    config: Config,
    state: Arc<AppState>,
    request_state: Arc<ResourceRequestState>,
    allocator: Arc<ContainerAllocator>,
    standby: Option<Arc<StandbyCoordinator>>,
    broker: Arc<dyn ResourceBroker>,
    job_model: Arc<dyn JobModel>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ClusterManager {
    pub fn new(
        config: Config,
        job_model: Arc<dyn JobModel>,
        broker: Arc<dyn ResourceBroker>,
    ) -> Result<Self> {
        if config.standby_enabled() && !config.host_affinity {
            anyhow::bail!("standby failover requires host affinity to be enabled");
        }

        let state = Arc::new(AppState::new());
        let request_state = Arc::new(ResourceRequestState::new(broker.clone(), state.clone()));

        let standby = if config.standby_enabled() {
            let constraints = PlacementConstraints::from_processors(&job_model.processors());
            Some(Arc::new(StandbyCoordinator::new(
                state.clone(),
                constraints,
                job_model.clone(),
                broker.clone(),
                request_state.clone(),
                config.preferred_host_retry_delay,
            )))
        } else {
            None
        };

        let command_builder = CommandBuilderRegistry::builtin().resolve(
            &config.command_builder,
            &config,
            job_model.coordinator_url(),
        )?;

        let allocator = Arc::new(ContainerAllocator::new(
            broker.clone(),
            request_state.clone(),
            state.clone(),
            command_builder,
            standby.clone(),
            &config,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            state,
            request_state,
            allocator,
            standby,
            broker,
            job_model,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Issue the initial resource requests and spawn the allocator
    /// loop.
    pub fn start(&self) -> JoinHandle<Result<(), ClusterError>> {
        info!(
            standby_enabled = self.standby.is_some(),
            policy = ?self.allocator.policy(),
            "Starting cluster manager"
        );
        self.request_initial_resources();
        self.spawn_allocator()
    }

    /// Issue one request per processor in the job model, preferring the
    /// last-known host under the host-aware policy.
    pub fn request_initial_resources(&self) {
        let mapping: HashMap<ProcessorId, Option<Host>> = self
            .job_model
            .processors()
            .into_iter()
            .map(|processor| {
                let host = self.job_model.last_known_host(&processor);
                (processor, host)
            })
            .collect();
        self.allocator.request_initial_resources(&mapping);
    }

    /// Spawn the allocator loop task.
    pub fn spawn_allocator(&self) -> JoinHandle<Result<(), ClusterError>> {
        let allocator = self.allocator.clone();
        let shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move { allocator.run(shutdown).await })
    }

    /// Signal the allocator loop to exit at its next iteration
    /// boundary.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// The broker granted a resource.
    pub fn on_resource_allocated(&self, resource: Resource) {
        info!(
            resource_id = %resource.resource_id,
            host = %resource.host,
            "Resource allocated by broker"
        );
        self.request_state.add_resource(resource);
    }

    /// A container stopped.
    pub async fn on_container_stopped(
        &self,
        processor_id: ProcessorId,
        resource_id: ResourceId,
        host: Host,
        exit_status: ExitStatus,
    ) -> Result<(), ClusterError> {
        self.state.pending_processors.write().await.remove(&processor_id);
        self.state.running_processors.write().await.remove(&processor_id);

        if exit_status == ExitStatus::Success {
            info!(processor_id = %processor_id, "Processor completed");
            self.state
                .completed_processors
                .fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        warn!(
            processor_id = %processor_id,
            resource_id = %resource_id,
            host = %host,
            exit_status = ?exit_status,
            "Container stopped"
        );
        self.state.failed_processors.fetch_add(1, Ordering::Relaxed);

        match &self.standby {
            Some(coordinator) => {
                coordinator
                    .handle_container_stop(
                        &processor_id,
                        &resource_id,
                        &host,
                        exit_status,
                        &self.allocator,
                    )
                    .await
            }
            None => {
                // No standby tracking: plain restart, on the previous
                // host when affinity is on.
                match self.allocator.policy() {
                    PlacementPolicy::HostAware => self.allocator.request_processor_with_delay(
                        processor_id,
                        PreferredHost::Host(host),
                        self.config.preferred_host_retry_delay,
                    ),
                    PlacementPolicy::AnyHost => self
                        .allocator
                        .request_processor(processor_id, PreferredHost::Any),
                }
                Ok(())
            }
        }
    }

    /// The broker confirmed a launched processor as running.
    pub async fn on_launch_succeeded(&self, processor_id: &ProcessorId) {
        let resource = self
            .state
            .pending_processors
            .write()
            .await
            .remove(processor_id);
        match resource {
            Some(resource) => {
                info!(
                    processor_id = %processor_id,
                    resource_id = %resource.resource_id,
                    host = %resource.host,
                    "Processor running"
                );
                self.state
                    .running_processors
                    .write()
                    .await
                    .insert(processor_id.clone(), resource);
                if let Some(coordinator) = &self.standby {
                    if !processor_id.is_standby() {
                        // A confirmed active closes out its failovers.
                        coordinator.evict_completed(processor_id);
                    }
                }
            }
            None => {
                warn!(
                    processor_id = %processor_id,
                    "Running confirmation for a processor that was never pending"
                );
            }
        }
    }

    /// A launch failed before the container ever ran.
    pub async fn on_launch_failed(
        &self,
        processor_id: ProcessorId,
        resource_id: ResourceId,
    ) -> Result<(), ClusterError> {
        warn!(
            processor_id = %processor_id,
            resource_id = %resource_id,
            "Container launch failed"
        );
        self.state.failed_launches.fetch_add(1, Ordering::Relaxed);

        // The resource was consumed at assignment; hand it back.
        let resource = self
            .state
            .pending_processors
            .write()
            .await
            .remove(&processor_id);
        if let Some(resource) = resource {
            if let Err(e) = self.broker.release(&resource).await {
                warn!(
                    resource_id = %resource.resource_id,
                    error = %e,
                    "Failed to release resource of failed launch"
                );
            }
        }

        match &self.standby {
            Some(coordinator) => {
                coordinator
                    .handle_container_launch_fail(&processor_id, &resource_id, &self.allocator)
                    .await
            }
            None => {
                self.allocator
                    .request_processor(processor_id, PreferredHost::Any);
                Ok(())
            }
        }
    }

    /// A resource request expired upstream. Brokers that track expiry
    /// themselves deliver it here; the host-aware loop also detects
    /// expiry on its own.
    pub async fn on_resource_request_expired(
        &self,
        request: ResourceRequest,
    ) -> Result<(), ClusterError> {
        self.state.expired_requests.fetch_add(1, Ordering::Relaxed);
        let alternative = self.request_state.peek_resource(&PreferredHost::Any);
        match &self.standby {
            Some(coordinator) => {
                coordinator
                    .handle_expired_request(&request, alternative, &self.allocator)
                    .await
            }
            None => {
                self.request_state.cancel_request(&request);
                self.allocator
                    .request_processor(request.processor_id, PreferredHost::Any);
                Ok(())
            }
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn request_state(&self) -> &Arc<ResourceRequestState> {
        &self.request_state
    }

    pub fn allocator(&self) -> &Arc<ContainerAllocator> {
        &self.allocator
    }

    pub fn standby(&self) -> Option<&Arc<StandbyCoordinator>> {
        self.standby.as_ref()
    }
}
