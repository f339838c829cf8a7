//! Read-side interface to the embedded job coordinator's model.
//!
//! The job model is owned by the coordinator process; the cluster
//! manager only consumes a narrow slice of it: which processors exist,
//! where they last ran, and the URL launched workers dial back to.

use std::collections::HashMap;

use rivulet_id::{Host, ProcessorId};

/// The slice of the job model the cluster manager reads.
pub trait JobModel: Send + Sync {
    /// Every processor ID in the job, actives and standbys.
    fn processors(&self) -> Vec<ProcessorId>;

    /// Last-known host for a processor. `None` when the job has never
    /// run or no mapping was recorded for this processor.
    fn last_known_host(&self, processor: &ProcessorId) -> Option<Host>;

    /// URL of the embedded coordinator endpoint handed to workers.
    fn coordinator_url(&self) -> &str;
}

/// In-memory job model used at bootstrap and in tests.
pub struct StaticJobModel {
    processors: Vec<ProcessorId>,
    last_known_hosts: HashMap<ProcessorId, Host>,
    coordinator_url: String,
}

impl StaticJobModel {
    pub fn new(processors: Vec<ProcessorId>, coordinator_url: impl Into<String>) -> Self {
        Self {
            processors,
            last_known_hosts: HashMap::new(),
            coordinator_url: coordinator_url.into(),
        }
    }

    /// A job of `actives` processors, each with `replication - 1`
    /// standby replicas.
    pub fn with_replication(
        actives: u32,
        replication: u32,
        coordinator_url: impl Into<String>,
    ) -> Self {
        let mut processors = Vec::new();
        for index in 0..u64::from(actives) {
            let active = ProcessorId::active(index);
            for replica in 0..u64::from(replication.saturating_sub(1)) {
                processors.push(active.standby_replica(replica));
            }
            processors.push(active);
        }
        processors.sort();
        Self::new(processors, coordinator_url)
    }

    /// Record a last-known host mapping.
    pub fn with_last_known_host(mut self, processor: ProcessorId, host: Host) -> Self {
        self.last_known_hosts.insert(processor, host);
        self
    }
}

impl JobModel for StaticJobModel {
    fn processors(&self) -> Vec<ProcessorId> {
        self.processors.clone()
    }

    fn last_known_host(&self, processor: &ProcessorId) -> Option<Host> {
        self.last_known_hosts.get(processor).cloned()
    }

    fn coordinator_url(&self) -> &str {
        &self.coordinator_url
    }
}
