//! Shared observable cluster-manager state.
//!
//! One `AppState` value is constructed at startup and passed by `Arc`
//! into the allocator, the failover coordinator, and the callback
//! surface. No global storage.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;

use rivulet_id::ProcessorId;
use tokio::sync::RwLock;

use crate::resource::Resource;

/// Maps and counters shared by the allocator loop, the failover
/// coordinator, and the broker callback tasks.
///
/// A processor appears in at most one of `pending_processors` /
/// `running_processors` at any instant. Readers that need to reason
/// over multiple entries take a snapshot and act on the clone; the
/// coordinator tolerates the races this admits.
#[derive(Default)]
pub struct AppState {
    /// Processors that have been issued a launch and are awaiting the
    /// running confirmation.
    pub pending_processors: RwLock<HashMap<ProcessorId, Resource>>,

    /// Processors confirmed running by the broker.
    pub running_processors: RwLock<HashMap<ProcessorId, Resource>>,

    pub container_requests: AtomicU64,
    pub preferred_host_requests: AtomicU64,
    pub any_host_requests: AtomicU64,
    pub matched_requests: AtomicU64,
    pub expired_requests: AtomicU64,
    pub released_resources: AtomicU64,
    pub failovers_to_standby: AtomicU64,
    pub failovers_to_any_host: AtomicU64,
    pub failed_standby_allocations: AtomicU64,
    pub failed_launches: AtomicU64,
    pub completed_processors: AtomicU64,
    pub failed_processors: AtomicU64,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of the running-processor map.
    pub async fn running_snapshot(&self) -> HashMap<ProcessorId, Resource> {
        self.running_processors.read().await.clone()
    }

    /// Clone of the pending-processor map.
    pub async fn pending_snapshot(&self) -> HashMap<ProcessorId, Resource> {
        self.pending_processors.read().await.clone()
    }
}
