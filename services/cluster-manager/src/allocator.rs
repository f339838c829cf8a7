//! The container allocator loop.
//!
//! Matches ready resource requests against broker-granted resources,
//! applies the placement policy, launches workers on matches, and
//! expires stale preferred-host requests. Runs as a single task until
//! the shutdown channel flips.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rivulet_id::{Host, ProcessorId};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::ResourceBroker;
use crate::command::CommandBuilder;
use crate::config::Config;
use crate::error::ClusterError;
use crate::request_state::ResourceRequestState;
use crate::resource::{PreferredHost, Resource, ResourceRequest};
use crate::standby::StandbyCoordinator;
use crate::state::AppState;

/// How ready requests are matched to resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementPolicy {
    /// Any allocated resource satisfies any request.
    AnyHost,
    /// Requests wait for their preferred host until the expiry deadline.
    HostAware,
}

/// Requests container-sized resources from the broker's grant pool and
/// runs processors on them.
pub struct ContainerAllocator {
    broker: Arc<dyn ResourceBroker>,
    request_state: Arc<ResourceRequestState>,
    state: Arc<AppState>,
    command_builder: Arc<dyn CommandBuilder>,
    standby: Option<Arc<StandbyCoordinator>>,
    policy: PlacementPolicy,
    sleep_interval: Duration,
    request_expiry: Duration,
    preferred_host_retry_delay: Duration,
    container_cpu_cores: u32,
    container_memory_mb: u64,
}

impl ContainerAllocator {
    pub fn new(
        broker: Arc<dyn ResourceBroker>,
        request_state: Arc<ResourceRequestState>,
        state: Arc<AppState>,
        command_builder: Arc<dyn CommandBuilder>,
        standby: Option<Arc<StandbyCoordinator>>,
        config: &Config,
    ) -> Self {
        let policy = if config.host_affinity {
            PlacementPolicy::HostAware
        } else {
            PlacementPolicy::AnyHost
        };
        Self {
            broker,
            request_state,
            state,
            command_builder,
            standby,
            policy,
            sleep_interval: config.allocator_sleep,
            request_expiry: config.request_expiry,
            preferred_host_retry_delay: config.preferred_host_retry_delay,
            container_cpu_cores: config.container_cpu_cores,
            container_memory_mb: config.container_memory_mb,
        }
    }

    /// Run the allocator loop until shutdown is signaled or a fatal
    /// invariant violation surfaces.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ClusterError> {
        info!(
            interval_ms = self.sleep_interval.as_millis() as u64,
            policy = ?self.policy,
            "Starting container allocator"
        );

        let mut interval = tokio::time::interval(self.sleep_interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        if e.is_fatal() {
                            error!(error = %e, "Fatal error in allocator loop");
                            return Err(e);
                        }
                        error!(error = %e, "Allocator pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Container allocator shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// A single allocator pass: assign, promote delayed requests,
    /// release extras.
    pub async fn run_once(&self) -> Result<(), ClusterError> {
        self.assign_resource_requests().await?;

        let promoted = self.request_state.promote_delayed();
        if promoted > 0 {
            debug!(promoted, "Promoted delayed resource requests");
        }

        self.request_state
            .release_extra_resources()
            .await
            .map_err(ClusterError::Broker)?;
        Ok(())
    }

    async fn assign_resource_requests(&self) -> Result<(), ClusterError> {
        match self.policy {
            PlacementPolicy::AnyHost => self.assign_any_host().await,
            PlacementPolicy::HostAware => self.assign_host_aware().await,
        }
    }

    /// Match every ready request to whatever resource arrived first.
    async fn assign_any_host(&self) -> Result<(), ClusterError> {
        while let Some(request) = self.request_state.peek_ready_request() {
            if self.request_state.peek_resource(&PreferredHost::Any).is_none() {
                debug!(
                    processor_id = %request.processor_id,
                    "No allocated resource available, leaving request pending"
                );
                break;
            }
            self.run_processor(&request, &PreferredHost::Any).await?;
        }
        Ok(())
    }

    /// Match ready requests to their preferred hosts, expiring requests
    /// whose host never materialized.
    async fn assign_host_aware(&self) -> Result<(), ClusterError> {
        while let Some(request) = self.request_state.peek_ready_request() {
            match request.preferred_host.clone() {
                PreferredHost::Any => {
                    let Some(resource) = self.request_state.peek_resource(&PreferredHost::Any)
                    else {
                        debug!(
                            processor_id = %request.processor_id,
                            "No allocated resource available, leaving request pending"
                        );
                        break;
                    };
                    self.check_constraints_and_run(&request, PreferredHost::Any, resource)
                        .await?;
                }
                PreferredHost::Host(host) => {
                    let preferred = PreferredHost::Host(host.clone());
                    if let Some(resource) = self.request_state.peek_resource(&preferred) {
                        self.check_constraints_and_run(&request, preferred, resource)
                            .await?;
                    } else if request.is_expired(Instant::now(), self.request_expiry) {
                        warn!(
                            processor_id = %request.processor_id,
                            host = %host,
                            "Resource request expired waiting for preferred host"
                        );
                        self.state.expired_requests.fetch_add(1, Ordering::Relaxed);
                        self.handle_expired_request(&request).await?;
                    } else {
                        debug!(
                            processor_id = %request.processor_id,
                            host = %host,
                            "Preferred host not allocated yet, leaving request pending"
                        );
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn check_constraints_and_run(
        &self,
        request: &ResourceRequest,
        preferred: PreferredHost,
        resource: Resource,
    ) -> Result<(), ClusterError> {
        match &self.standby {
            Some(coordinator) => {
                coordinator
                    .check_constraints_and_run(request, &preferred, &resource, self)
                    .await
            }
            None => self.run_processor(request, &preferred).await,
        }
    }

    async fn handle_expired_request(&self, request: &ResourceRequest) -> Result<(), ClusterError> {
        let alternative = self.request_state.peek_resource(&PreferredHost::Any);
        match &self.standby {
            Some(coordinator) => {
                coordinator
                    .handle_expired_request(request, alternative, self)
                    .await
            }
            None => {
                // No standby tracking: fall back to an immediate
                // any-host request.
                self.request_state.cancel_request(request);
                self.request_processor(request.processor_id.clone(), PreferredHost::Any);
                Ok(())
            }
        }
    }

    /// Update the request state and launch a processor on the given
    /// preference. The caller must have verified that a resource is
    /// allocated there.
    pub async fn run_processor(
        &self,
        request: &ResourceRequest,
        preferred: &PreferredHost,
    ) -> Result<(), ClusterError> {
        let Some(resource) = self.request_state.peek_resource(preferred) else {
            return Err(ClusterError::ResourceUnavailable {
                processor_id: request.processor_id.clone(),
                preferred_host: preferred.to_string(),
            });
        };
        if let PreferredHost::Host(host) = preferred {
            if resource.host != *host {
                return Err(ClusterError::HostMismatch {
                    resource_id: resource.resource_id.clone(),
                    expected: host.clone(),
                    actual: resource.host.clone(),
                });
            }
        }

        self.request_state
            .update_after_assignment(request, preferred, &resource);

        info!(
            resource_id = %resource.resource_id,
            processor_id = %request.processor_id,
            host = %resource.host,
            "Assigning processor to resource"
        );

        // Record the pending entry before issuing the launch: the
        // running callback can arrive before launch() returns.
        self.state
            .pending_processors
            .write()
            .await
            .insert(request.processor_id.clone(), resource.clone());

        let spec = self.command_builder.build(&request.processor_id);
        self.broker
            .launch(&resource, spec)
            .await
            .map_err(ClusterError::Broker)?;
        Ok(())
    }

    /// Build a request carrying the configured container sizing, ready
    /// after `delay`.
    pub fn new_request(
        &self,
        processor_id: ProcessorId,
        preferred: PreferredHost,
        delay: Duration,
    ) -> ResourceRequest {
        ResourceRequest::new(
            processor_id,
            preferred,
            self.container_cpu_cores,
            self.container_memory_mb,
            delay,
        )
    }

    /// Place a constructed request into the request state.
    pub fn issue_request(&self, request: ResourceRequest) {
        self.state.container_requests.fetch_add(1, Ordering::Relaxed);
        match &request.preferred_host {
            PreferredHost::Any => {
                self.state.any_host_requests.fetch_add(1, Ordering::Relaxed);
            }
            PreferredHost::Host(_) => {
                self.state
                    .preferred_host_requests
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        info!(
            processor_id = %request.processor_id,
            preferred_host = %request.preferred_host,
            "Issuing resource request"
        );
        self.request_state.add_request(request);
    }

    /// Request a resource for a processor with no delay.
    pub fn request_processor(&self, processor_id: ProcessorId, preferred: PreferredHost) {
        self.request_processor_with_delay(processor_id, preferred, Duration::ZERO);
    }

    /// Request a resource for a processor, ready after `delay`.
    pub fn request_processor_with_delay(
        &self,
        processor_id: ProcessorId,
        preferred: PreferredHost,
        delay: Duration,
    ) {
        let request = self.new_request(processor_id, preferred, delay);
        self.issue_request(request);
    }

    /// Issue the initial resource requests for a processor-to-host
    /// mapping, in processor order.
    pub fn request_initial_resources(&self, mapping: &HashMap<ProcessorId, Option<Host>>) {
        let mut processors: Vec<&ProcessorId> = mapping.keys().collect();
        processors.sort();
        for processor_id in processors {
            let preferred = match (self.policy, &mapping[processor_id]) {
                (PlacementPolicy::HostAware, Some(host)) => PreferredHost::Host(host.clone()),
                _ => PreferredHost::Any,
            };
            self.request_processor(processor_id.clone(), preferred);
        }
    }

    /// Retry delay applied to preferred-host restart requests.
    pub fn preferred_host_retry_delay(&self) -> Duration {
        self.preferred_host_retry_delay
    }

    /// The placement policy in effect.
    pub fn policy(&self) -> PlacementPolicy {
        self.policy
    }
}
