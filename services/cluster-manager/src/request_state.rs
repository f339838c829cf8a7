//! Registry of outstanding resource requests and broker-granted
//! resources.
//!
//! Requests are held in a time-ordered queue (priority by request
//! timestamp, ties by issue order); requests whose timestamp lies in
//! the future wait in a delayed buffer until promoted. Resources are
//! stored once, keyed by ID, with a per-host FIFO index plus an
//! arrival-order index that serves any-host requests. Every structural
//! mutation happens under one internal lock; broker calls are made
//! after the lock is dropped.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use parking_lot::Mutex;
use rivulet_id::{Host, ResourceId};
use tracing::{debug, info, warn};

use crate::broker::ResourceBroker;
use crate::resource::{PreferredHost, Resource, ResourceRequest};
use crate::state::AppState;

/// Queue key: readiness time, then issue order.
type RequestKey = (Instant, u64);

#[derive(Default)]
struct Inner {
    /// Requests whose timestamp has been reached.
    ready: BTreeMap<RequestKey, ResourceRequest>,
    /// Requests whose timestamp lies in the future.
    delayed: BTreeMap<RequestKey, ResourceRequest>,
    /// Every live allocation, by ID.
    resources: HashMap<ResourceId, Resource>,
    /// Arrival-order index per host.
    by_host: HashMap<Host, VecDeque<ResourceId>>,
    /// Arrival-order index across all hosts, for any-host requests.
    arrival: VecDeque<ResourceId>,
}

/// Thread-safe registry of unfulfilled requests and allocated
/// resources.
pub struct ResourceRequestState {
    broker: Arc<dyn ResourceBroker>,
    state: Arc<AppState>,
    inner: Mutex<Inner>,
}

impl ResourceRequestState {
    pub fn new(broker: Arc<dyn ResourceBroker>, state: Arc<AppState>) -> Self {
        Self {
            broker,
            state,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Enqueue a request; future-dated requests land in the delayed
    /// buffer until `promote_delayed` moves them.
    pub fn add_request(&self, request: ResourceRequest) {
        let key = (request.request_time, request.request_id());
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if request.is_ready(now) {
            inner.ready.insert(key, request);
        } else {
            debug!(
                processor_id = %request.processor_id,
                preferred_host = %request.preferred_host,
                "Buffering delayed resource request"
            );
            inner.delayed.insert(key, request);
        }
    }

    /// Move delayed requests whose timestamp has arrived into the ready
    /// queue. Returns how many were promoted.
    pub fn promote_delayed(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let ripe: Vec<RequestKey> = inner
            .delayed
            .iter()
            .take_while(|((time, _), _)| *time <= now)
            .map(|(key, _)| *key)
            .collect();
        for key in &ripe {
            if let Some(request) = inner.delayed.remove(key) {
                inner.ready.insert(*key, request);
            }
        }
        ripe.len()
    }

    /// The earliest ready request, without removing it.
    pub fn peek_ready_request(&self) -> Option<ResourceRequest> {
        self.inner.lock().ready.values().next().cloned()
    }

    /// Remove a request from the queues. Returns whether it was still
    /// outstanding.
    pub fn cancel_request(&self, request: &ResourceRequest) -> bool {
        let key = (request.request_time, request.request_id());
        let mut inner = self.inner.lock();
        let removed = inner.ready.remove(&key).is_some() || inner.delayed.remove(&key).is_some();
        drop(inner);
        if removed {
            info!(
                processor_id = %request.processor_id,
                preferred_host = %request.preferred_host,
                "Cancelled resource request"
            );
        }
        removed
    }

    /// Record an allocation granted by the broker.
    pub fn add_resource(&self, resource: Resource) {
        let mut inner = self.inner.lock();
        if inner.resources.contains_key(&resource.resource_id) {
            warn!(resource_id = %resource.resource_id, "Ignoring duplicate resource grant");
            return;
        }
        debug!(
            resource_id = %resource.resource_id,
            host = %resource.host,
            "Recording allocated resource"
        );
        inner
            .by_host
            .entry(resource.host.clone())
            .or_default()
            .push_back(resource.resource_id.clone());
        inner.arrival.push_back(resource.resource_id.clone());
        inner.resources.insert(resource.resource_id.clone(), resource);
    }

    /// The first allocation satisfying the preference, without removing
    /// it.
    pub fn peek_resource(&self, preferred: &PreferredHost) -> Option<Resource> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match preferred {
            PreferredHost::Any => peek_queue(&inner.resources, &mut inner.arrival),
            PreferredHost::Host(host) => inner
                .by_host
                .get_mut(host)
                .and_then(|queue| peek_queue(&inner.resources, queue)),
        }
    }

    /// Atomically consume a matched (request, resource) pair.
    pub fn update_after_assignment(
        &self,
        request: &ResourceRequest,
        preferred: &PreferredHost,
        resource: &Resource,
    ) {
        let key = (request.request_time, request.request_id());
        let mut inner = self.inner.lock();
        inner.ready.remove(&key);
        inner.resources.remove(&resource.resource_id);
        drop(inner);
        self.state.matched_requests.fetch_add(1, Ordering::Relaxed);
        debug!(
            processor_id = %request.processor_id,
            resource_id = %resource.resource_id,
            preferred_host = %preferred,
            "Consumed request and resource after assignment"
        );
    }

    /// Release an allocation back to the cluster by ID.
    pub async fn release_resource(&self, resource_id: &ResourceId) -> Result<()> {
        let resource = self.inner.lock().resources.remove(resource_id);
        let Some(resource) = resource else {
            return Ok(());
        };
        info!(
            resource_id = %resource.resource_id,
            host = %resource.host,
            "Releasing resource"
        );
        self.broker.release(&resource).await?;
        self.state.released_resources.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Release an allocation that could not be used for the request it
    /// was matched to.
    pub async fn release_unstartable(
        &self,
        resource: &Resource,
        preferred: &PreferredHost,
    ) -> Result<()> {
        self.inner.lock().resources.remove(&resource.resource_id);
        warn!(
            resource_id = %resource.resource_id,
            host = %resource.host,
            preferred_host = %preferred,
            "Releasing unstartable container"
        );
        self.broker.release(resource).await?;
        self.state.released_resources.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Release allocations beyond what the outstanding requests need: a
    /// resource is extra when no pending request prefers its host and
    /// it is not needed as an any-host candidate.
    pub async fn release_extra_resources(&self) -> Result<()> {
        let extra = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            let mut prefer_counts: HashMap<Host, usize> = HashMap::new();
            let mut any_needed = 0usize;
            for request in inner.ready.values().chain(inner.delayed.values()) {
                match &request.preferred_host {
                    PreferredHost::Any => any_needed += 1,
                    PreferredHost::Host(host) => {
                        *prefer_counts.entry(host.clone()).or_default() += 1;
                    }
                }
            }

            let mut hosts: Vec<Host> = inner.by_host.keys().cloned().collect();
            hosts.sort();

            let mut keep_any = any_needed;
            let mut to_release = Vec::new();
            for host in hosts {
                let live: Vec<ResourceId> = inner
                    .by_host
                    .get(&host)
                    .map(|queue| {
                        queue
                            .iter()
                            .filter(|id| inner.resources.contains_key(*id))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                let preferred = prefer_counts.get(&host).copied().unwrap_or(0);
                for resource_id in live.into_iter().skip(preferred) {
                    if keep_any > 0 {
                        // Retained to serve an outstanding any-host request.
                        keep_any -= 1;
                        continue;
                    }
                    if let Some(resource) = inner.resources.remove(&resource_id) {
                        to_release.push(resource);
                    }
                }
            }
            to_release
        };

        for resource in extra {
            info!(
                resource_id = %resource.resource_id,
                host = %resource.host,
                "Releasing extra resource"
            );
            self.broker.release(&resource).await?;
            self.state.released_resources.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Outstanding requests (ready and delayed) in timestamp order.
    pub fn pending_requests(&self) -> Vec<ResourceRequest> {
        let inner = self.inner.lock();
        inner
            .ready
            .values()
            .chain(inner.delayed.values())
            .cloned()
            .collect()
    }

    /// Number of outstanding requests, ready and delayed.
    pub fn pending_request_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.ready.len() + inner.delayed.len()
    }

    /// Number of unconsumed allocations.
    pub fn resource_count(&self) -> usize {
        self.inner.lock().resources.len()
    }
}

/// Front of `queue` that still exists in `resources`; entries consumed
/// through the other index are discarded along the way.
fn peek_queue(
    resources: &HashMap<ResourceId, Resource>,
    queue: &mut VecDeque<ResourceId>,
) -> Option<Resource> {
    while let Some(front) = queue.front() {
        if let Some(resource) = resources.get(front) {
            return Some(resource.clone());
        }
        queue.pop_front();
    }
    None
}
