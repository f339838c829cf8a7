//! Error types for the cluster manager core.

use rivulet_id::{Host, ProcessorId, ResourceId};
use thiserror::Error;

/// Errors raised by the allocator loop and the failover coordinator.
///
/// Fatal variants are programmer errors: the loop re-raises them to the
/// host process, which should abort and restart the job. Everything
/// else is logged and retried on the next control-loop pass.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// `run_processor` was invoked without an allocated resource on the
    /// preferred host. The caller must verify availability first.
    #[error("no allocated resource for processor {processor_id} on host {preferred_host}")]
    ResourceUnavailable {
        processor_id: ProcessorId,
        preferred_host: String,
    },

    /// A matched resource does not live on the request's preferred host.
    #[error("resource {resource_id} is on host {actual}, expected {expected}")]
    HostMismatch {
        resource_id: ResourceId,
        expected: Host,
        actual: Host,
    },

    /// More than one member of a placement family was found running on
    /// one host.
    #[error("invalid state: multiple standby containers {standbys:?} running on host {host}")]
    MultipleStandbysOnHost {
        host: Host,
        standbys: Vec<ProcessorId>,
    },

    /// The configured command builder name is not registered.
    #[error("unknown command builder {0:?}")]
    UnknownCommandBuilder(String),

    /// A broker operation failed; retried on the next loop pass.
    #[error("broker operation failed: {0}")]
    Broker(#[source] anyhow::Error),
}

impl ClusterError {
    /// Whether this error must abort the allocator loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::ResourceUnavailable { .. }
                | ClusterError::HostMismatch { .. }
                | ClusterError::MultipleStandbysOnHost { .. }
        )
    }
}
