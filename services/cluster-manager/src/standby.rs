//! Standby-aware failover coordination.
//!
//! When an active processor dies, its replacement is preferentially
//! placed on a host that already runs a warm standby replica of its
//! state. The coordinator drives that placement: it selects the standby
//! host to steal, stops the standby, and sequences the follow-up
//! requests. Completion of every action arrives asynchronously through
//! the broker callbacks and the allocator, so each entry point below is
//! one transition of a distributed state machine keyed by the failed
//! active's resource ID.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rivulet_id::{Host, ProcessorId, ResourceId};
use tracing::{debug, info, warn};

use crate::allocator::ContainerAllocator;
use crate::broker::ResourceBroker;
use crate::constraints::PlacementConstraints;
use crate::error::ClusterError;
use crate::job_model::JobModel;
use crate::request_state::ResourceRequestState;
use crate::resource::{ExitStatus, PreferredHost, Resource, ResourceRequest};
use crate::state::AppState;

/// Metadata for one failover attempt, keyed by the resource ID the
/// active held when it failed.
pub struct FailoverMetadata {
    pub active_processor_id: ProcessorId,
    pub active_resource_id: ResourceId,
    records: Mutex<FailoverRecords>,
}

#[derive(Default)]
struct FailoverRecords {
    /// Standby resources stopped (or targeted) in this failover, with
    /// the host each one vacated. Append-only.
    selected_standbys: HashMap<ResourceId, Host>,
    /// Requests issued while driving this failover.
    resource_requests: Vec<ResourceRequest>,
}

impl FailoverMetadata {
    fn new(active_processor_id: ProcessorId, active_resource_id: ResourceId) -> Self {
        Self {
            active_processor_id,
            active_resource_id,
            records: Mutex::new(FailoverRecords::default()),
        }
    }

    /// Whether this standby resource was stopped in this failover.
    pub fn is_standby_resource_used(&self, standby_resource_id: &ResourceId) -> bool {
        self.records
            .lock()
            .selected_standbys
            .contains_key(standby_resource_id)
    }

    /// The host a selected standby vacated.
    pub fn standby_host(&self, standby_resource_id: &ResourceId) -> Option<Host> {
        self.records
            .lock()
            .selected_standbys
            .get(standby_resource_id)
            .cloned()
    }

    /// Record a standby resource targeted by this failover.
    pub fn record_selected_standby(&self, standby_resource_id: ResourceId, host: Host) {
        self.records
            .lock()
            .selected_standbys
            .insert(standby_resource_id, host);
    }

    /// Record a request issued while driving this failover. Must happen
    /// before the request reaches the request state, so the allocator
    /// can never observe a failover-owned request the coordinator does
    /// not yet know about.
    pub fn record_request(&self, request: &ResourceRequest) {
        self.records.lock().resource_requests.push(request.clone());
    }

    /// Whether this request was issued for this failover.
    pub fn contains_request(&self, request: &ResourceRequest) -> bool {
        self.records
            .lock()
            .resource_requests
            .iter()
            .any(|r| r == request)
    }

    /// Whether this host was already used in this failover: either a
    /// selected standby vacated it, or a request targeting it was
    /// issued. Both fields are read under one lock so the answer is
    /// consistent.
    pub fn is_standby_host_used(&self, host: &Host) -> bool {
        let records = self.records.lock();
        records.selected_standbys.values().any(|h| h == host)
            || records
                .resource_requests
                .iter()
                .any(|r| r.preferred_host.host() == Some(host))
    }

    /// Snapshot of the selected standbys.
    pub fn selected_standbys(&self) -> HashMap<ResourceId, Host> {
        self.records.lock().selected_standbys.clone()
    }

    /// Snapshot of the recorded requests.
    pub fn requests(&self) -> Vec<ResourceRequest> {
        self.records.lock().resource_requests.clone()
    }
}

/// Decides, on every container stop / launch failure / expired request
/// / constraint violation, whether and how to fail an active processor
/// over to a standby's host.
pub struct StandbyCoordinator {
    state: Arc<AppState>,
    constraints: PlacementConstraints,
    job_model: Arc<dyn JobModel>,
    broker: Arc<dyn ResourceBroker>,
    request_state: Arc<ResourceRequestState>,
    preferred_host_retry_delay: Duration,
    failovers: Mutex<HashMap<ResourceId, Arc<FailoverMetadata>>>,
}

impl StandbyCoordinator {
    pub fn new(
        state: Arc<AppState>,
        constraints: PlacementConstraints,
        job_model: Arc<dyn JobModel>,
        broker: Arc<dyn ResourceBroker>,
        request_state: Arc<ResourceRequestState>,
        preferred_host_retry_delay: Duration,
    ) -> Self {
        Self {
            state,
            constraints,
            job_model,
            broker,
            request_state,
            preferred_host_retry_delay,
            failovers: Mutex::new(HashMap::new()),
        }
    }

    /// Handle a stopped container.
    ///
    /// Standby stops route to the standby-stop path. For actives the
    /// exit status decides: node-level failures trigger an immediate
    /// standby-aware failover; any other exit restarts the active on
    /// its previous host, with the request recorded so a later expiry
    /// can still drive a full failover.
    pub async fn handle_container_stop(
        &self,
        processor_id: &ProcessorId,
        resource_id: &ResourceId,
        preferred_host: &Host,
        exit_status: ExitStatus,
        allocator: &ContainerAllocator,
    ) -> Result<(), ClusterError> {
        if processor_id.is_standby() {
            self.handle_standby_container_stop(processor_id, resource_id, preferred_host, allocator);
            return Ok(());
        }

        if exit_status.is_node_failure() {
            return self
                .initiate_standby_aware_allocation(processor_id, resource_id, allocator)
                .await;
        }

        info!(
            processor_id = %processor_id,
            host = %preferred_host,
            "Requesting resource on previous host for stopped active"
        );
        let request = allocator.new_request(
            processor_id.clone(),
            PreferredHost::Host(preferred_host.clone()),
            self.preferred_host_retry_delay,
        );
        let metadata = self.register_active_failure(processor_id, resource_id);
        metadata.record_request(&request);
        allocator.issue_request(request);
        Ok(())
    }

    /// Handle a failed container launch: actives fail over, standbys
    /// are re-requested anywhere.
    pub async fn handle_container_launch_fail(
        &self,
        processor_id: &ProcessorId,
        resource_id: &ResourceId,
        allocator: &ContainerAllocator,
    ) -> Result<(), ClusterError> {
        if processor_id.is_standby() {
            info!(
                processor_id = %processor_id,
                "Launch failed for standby, requesting any-host placement"
            );
            allocator.request_processor(processor_id.clone(), PreferredHost::Any);
            Ok(())
        } else {
            self.initiate_standby_aware_allocation(processor_id, resource_id, allocator)
                .await
        }
    }

    /// Handle a stopped standby. When the stop was part of a failover,
    /// the vacated host goes to the active and the standby is
    /// re-requested anywhere; otherwise this is an ordinary restart on
    /// the standby's own host.
    fn handle_standby_container_stop(
        &self,
        standby_id: &ProcessorId,
        resource_id: &ResourceId,
        preferred_host: &Host,
        allocator: &ContainerAllocator,
    ) {
        if let Some((metadata, standby_host)) = self.failover_using_standby_resource(resource_id) {
            let active_id = metadata.active_processor_id.clone();
            info!(
                active = %active_id,
                host = %standby_host,
                standby = %standby_id,
                "Standby vacated its host for failover, requesting swap placements"
            );

            // The active takes the vacated host, after the retry delay.
            let request_for_active = allocator.new_request(
                active_id,
                PreferredHost::Host(standby_host),
                self.preferred_host_retry_delay,
            );
            metadata.record_request(&request_for_active);
            allocator.issue_request(request_for_active);

            // The standby itself restarts wherever there is room.
            let request_for_standby =
                allocator.new_request(standby_id.clone(), PreferredHost::Any, Duration::ZERO);
            metadata.record_request(&request_for_standby);
            allocator.issue_request(request_for_standby);
        } else {
            info!(
                standby = %standby_id,
                host = %preferred_host,
                "Standby stopped outside a failover, requesting its own host"
            );
            allocator.request_processor_with_delay(
                standby_id.clone(),
                PreferredHost::Host(preferred_host.clone()),
                self.preferred_host_retry_delay,
            );
        }
    }

    /// Drive a standby-aware allocation for a failed active: pick a
    /// standby host, stop whatever standby still runs there, and
    /// request the active onto it. The stop's completion re-enters
    /// through the standby-stop path.
    pub async fn initiate_standby_aware_allocation(
        &self,
        active_id: &ProcessorId,
        active_resource_id: &ResourceId,
        allocator: &ContainerAllocator,
    ) -> Result<(), ClusterError> {
        let standby_host = self.select_standby_host(active_id, active_resource_id).await;
        let PreferredHost::Host(host) = standby_host else {
            info!(
                processor_id = %active_id,
                resource_id = %active_resource_id,
                "No standby host available, requesting any-host placement for active"
            );
            self.state
                .failovers_to_any_host
                .fetch_add(1, Ordering::Relaxed);
            allocator.request_processor(active_id.clone(), PreferredHost::Any);
            return Ok(());
        };

        // Standbys of this active still running on the selected host.
        let running = self.state.running_snapshot().await;
        let running_standbys: Vec<(ProcessorId, Resource)> = self
            .constraints
            .siblings(active_id)
            .iter()
            .filter_map(|sibling| {
                running
                    .get(sibling)
                    .filter(|resource| resource.host == host)
                    .map(|resource| (sibling.clone(), resource.clone()))
            })
            .collect();

        if running_standbys.is_empty() {
            info!(
                host = %host,
                processor_id = %active_id,
                "No running standby to stop, requesting standby host directly"
            );
            let metadata = self.register_active_failure(active_id, active_resource_id);
            let request =
                allocator.new_request(active_id.clone(), PreferredHost::Host(host), Duration::ZERO);
            metadata.record_request(&request);
            allocator.issue_request(request);
            self.state
                .failovers_to_standby
                .fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let metadata = self.register_active_failure(active_id, active_resource_id);
        for (standby_id, resource) in &running_standbys {
            info!(
                standby = %standby_id,
                resource_id = %resource.resource_id,
                host = %host,
                active = %active_id,
                "Stopping standby container for failover"
            );
            metadata.record_selected_standby(resource.resource_id.clone(), resource.host.clone());
            self.state
                .failovers_to_standby
                .fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.broker.stop(resource).await {
                warn!(
                    resource_id = %resource.resource_id,
                    error = %e,
                    "Broker failed to stop standby container"
                );
            }
        }

        // Two family members on one host means placement constraints
        // were already violated upstream.
        if running_standbys.len() > 1 {
            return Err(ClusterError::MultipleStandbysOnHost {
                host,
                standbys: running_standbys.into_iter().map(|(id, _)| id).collect(),
            });
        }
        Ok(())
    }

    /// Select a host for a failed active, in three passes:
    /// 1. a running standby whose current resource has not been used in
    ///    this failover,
    /// 2. a last-known standby host not already used in this failover,
    /// 3. no preference.
    async fn select_standby_host(
        &self,
        active_id: &ProcessorId,
        active_resource_id: &ResourceId,
    ) -> PreferredHost {
        let metadata = self.failover_metadata(active_resource_id);
        let running = self.state.running_snapshot().await;

        for standby_id in self.constraints.siblings(active_id) {
            if let Some(resource) = running.get(standby_id) {
                let used = metadata
                    .as_ref()
                    .is_some_and(|m| m.is_standby_resource_used(&resource.resource_id));
                if !used {
                    info!(
                        standby = %standby_id,
                        host = %resource.host,
                        active = %active_id,
                        "Selected running standby for failover"
                    );
                    return PreferredHost::Host(resource.host.clone());
                }
            }
        }
        debug!(processor_id = %active_id, "No unused running standby found");

        for standby_id in self.constraints.siblings(active_id) {
            match self.job_model.last_known_host(standby_id) {
                None => {
                    debug!(standby = %standby_id, "No last known host for standby");
                }
                Some(host) => {
                    if metadata.as_ref().is_some_and(|m| m.is_standby_host_used(&host)) {
                        debug!(
                            host = %host,
                            active = %active_id,
                            "Skipping standby host already used in this failover"
                        );
                    } else {
                        info!(
                            host = %host,
                            active = %active_id,
                            "Selected last-known standby host for failover"
                        );
                        return PreferredHost::Host(host);
                    }
                }
            }
        }

        info!(processor_id = %active_id, "No standby host found, falling back to any-host");
        PreferredHost::Any
    }

    /// Whether placing `processor_id` on `host` violates no placement
    /// constraint: no family member may be pending or running there.
    async fn check_constraints(&self, processor_id: &ProcessorId, host: &Host) -> bool {
        let pending = self.state.pending_snapshot().await;
        let running = self.state.running_snapshot().await;
        for sibling in self.constraints.siblings(processor_id) {
            if pending
                .get(sibling)
                .is_some_and(|resource| resource.host == *host)
            {
                info!(
                    processor_id = %processor_id,
                    host = %host,
                    sibling = %sibling,
                    "Cannot start processor, family member already scheduled on host"
                );
                return false;
            }
            if running
                .get(sibling)
                .is_some_and(|resource| resource.host == *host)
            {
                info!(
                    processor_id = %processor_id,
                    host = %host,
                    sibling = %sibling,
                    "Cannot start processor, family member already running on host"
                );
                return false;
            }
        }
        true
    }

    /// Attempt to run `request` on `resource` if doing so violates no
    /// placement constraint; otherwise release the resource, cancel the
    /// request, and re-drive placement for the processor.
    pub async fn check_constraints_and_run(
        &self,
        request: &ResourceRequest,
        preferred: &PreferredHost,
        resource: &Resource,
        allocator: &ContainerAllocator,
    ) -> Result<(), ClusterError> {
        let processor_id = &request.processor_id;

        if self.check_constraints(processor_id, &resource.host).await {
            debug!(
                processor_id = %processor_id,
                host = %resource.host,
                preferred_host = %preferred,
                "Placement meets standby constraints"
            );
            return allocator.run_processor(request, preferred).await;
        }

        if processor_id.is_standby() {
            info!(
                processor_id = %processor_id,
                host = %resource.host,
                "Standby placement violates constraints, re-requesting any host"
            );
            self.request_state
                .release_unstartable(resource, preferred)
                .await
                .map_err(ClusterError::Broker)?;
            self.request_state.cancel_request(request);
            allocator.request_processor(processor_id.clone(), PreferredHost::Any);
            self.state
                .failed_standby_allocations
                .fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            warn!(
                processor_id = %processor_id,
                host = %resource.host,
                "Active placement violates constraints, initiating failover"
            );
            self.request_state
                .release_unstartable(resource, preferred)
                .await
                .map_err(ClusterError::Broker)?;
            self.request_state.cancel_request(request);

            let last_known_resource_id = self
                .failover_owning_request(request)
                .map(|m| m.active_resource_id.clone())
                .unwrap_or_else(|| ResourceId::unknown_for(processor_id));
            self.initiate_standby_aware_allocation(processor_id, &last_known_resource_id, allocator)
                .await?;
            self.state
                .failed_standby_allocations
                .fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    /// Handle a request that expired waiting for its preferred host.
    pub async fn handle_expired_request(
        &self,
        request: &ResourceRequest,
        alternative: Option<Resource>,
        allocator: &ContainerAllocator,
    ) -> Result<(), ClusterError> {
        let processor_id = &request.processor_id;

        if processor_id.is_standby() {
            match alternative {
                Some(resource) => {
                    info!(
                        processor_id = %processor_id,
                        resource_id = %resource.resource_id,
                        "Expired standby request can start on an alternative resource"
                    );
                    self.check_constraints_and_run(request, &PreferredHost::Any, &resource, allocator)
                        .await
                }
                None => {
                    info!(
                        processor_id = %processor_id,
                        "Expired standby request has no alternative, requesting any host"
                    );
                    self.request_state.cancel_request(request);
                    allocator.request_processor(processor_id.clone(), PreferredHost::Any);
                    Ok(())
                }
            }
        } else {
            let last_known_resource_id = self
                .failover_owning_request(request)
                .map(|m| m.active_resource_id.clone())
                .unwrap_or_else(|| ResourceId::unknown_for(processor_id));
            info!(
                processor_id = %processor_id,
                resource_id = %last_known_resource_id,
                "Expired active request, initiating standby-aware allocation"
            );
            self.request_state.cancel_request(request);
            self.initiate_standby_aware_allocation(processor_id, &last_known_resource_id, allocator)
                .await
        }
    }

    /// Register (or fetch) the failover metadata for a failed active.
    /// Repeated registration for the same resource ID returns the same
    /// entry.
    pub fn register_active_failure(
        &self,
        active_id: &ProcessorId,
        active_resource_id: &ResourceId,
    ) -> Arc<FailoverMetadata> {
        let mut failovers = self.failovers.lock();
        failovers
            .entry(active_resource_id.clone())
            .or_insert_with(|| {
                Arc::new(FailoverMetadata::new(
                    active_id.clone(),
                    active_resource_id.clone(),
                ))
            })
            .clone()
    }

    /// Failover metadata keyed by an active's resource ID.
    pub fn failover_metadata(&self, active_resource_id: &ResourceId) -> Option<Arc<FailoverMetadata>> {
        self.failovers.lock().get(active_resource_id).cloned()
    }

    /// The failover (if any) that stopped this standby resource, with
    /// the host it vacated.
    fn failover_using_standby_resource(
        &self,
        standby_resource_id: &ResourceId,
    ) -> Option<(Arc<FailoverMetadata>, Host)> {
        let failovers = self.failovers.lock();
        for metadata in failovers.values() {
            if let Some(host) = metadata.standby_host(standby_resource_id) {
                info!(
                    resource_id = %standby_resource_id,
                    active = %metadata.active_processor_id,
                    "Standby resource was selected for a failover"
                );
                return Some((metadata.clone(), host));
            }
        }
        None
    }

    /// The failover (if any) that issued this request.
    fn failover_owning_request(&self, request: &ResourceRequest) -> Option<Arc<FailoverMetadata>> {
        let failovers = self.failovers.lock();
        failovers
            .values()
            .find(|metadata| metadata.contains_request(request))
            .cloned()
    }

    /// Evict failover entries that referred to older incarnations of a
    /// processor that is confirmed running again.
    pub fn evict_completed(&self, active_id: &ProcessorId) {
        let mut failovers = self.failovers.lock();
        let before = failovers.len();
        failovers.retain(|_, metadata| metadata.active_processor_id != *active_id);
        let evicted = before - failovers.len();
        if evicted > 0 {
            debug!(
                processor_id = %active_id,
                evicted,
                "Evicted completed failover metadata"
            );
        }
    }

    /// Number of tracked failovers.
    pub fn failover_count(&self) -> usize {
        self.failovers.lock().len()
    }
}
