//! Resource and resource-request types exchanged with the broker.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rivulet_id::{Host, ProcessorId, ResourceId};

/// Host preference attached to a resource request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PreferredHost {
    /// No preference; any host the broker offers will do.
    Any,
    /// The request should be satisfied on this specific host.
    Host(Host),
}

impl PreferredHost {
    /// Whether this preference accepts any host.
    pub fn is_any(&self) -> bool {
        matches!(self, PreferredHost::Any)
    }

    /// The specific host, if one is preferred.
    pub fn host(&self) -> Option<&Host> {
        match self {
            PreferredHost::Any => None,
            PreferredHost::Host(host) => Some(host),
        }
    }
}

impl fmt::Display for PreferredHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreferredHost::Any => write!(f, "ANY_HOST"),
            PreferredHost::Host(host) => write!(f, "{host}"),
        }
    }
}

impl From<Host> for PreferredHost {
    fn from(host: Host) -> Self {
        PreferredHost::Host(host)
    }
}

/// A physical allocation handed back by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub resource_id: ResourceId,
    pub host: Host,
    pub cpu_cores: u32,
    pub memory_mb: u64,
}

/// Exit status reported for a stopped container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Clean exit; the processor finished its work.
    Success,
    /// The container's disk failed.
    DiskFail,
    /// The node manager aborted the container.
    Aborted,
    /// The scheduler preempted the container.
    Preempted,
    /// Any other exit code; the cause is unknown.
    Unknown(i32),
}

impl ExitStatus {
    /// Statuses that signal node-level failure and warrant immediate
    /// standby-aware failover.
    pub fn is_node_failure(&self) -> bool {
        matches!(
            self,
            ExitStatus::DiskFail | ExitStatus::Aborted | ExitStatus::Preempted
        )
    }
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(0);

/// An outstanding request for one container-sized resource.
///
/// Two structurally identical requests are distinct: equality and
/// hashing use the process-unique `request_id` assigned at
/// construction. `request_time` may lie in the future for delayed
/// requests; the request becomes ready once the clock reaches it.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    request_id: u64,
    pub processor_id: ProcessorId,
    pub preferred_host: PreferredHost,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub request_time: Instant,
}

impl ResourceRequest {
    pub fn new(
        processor_id: ProcessorId,
        preferred_host: PreferredHost,
        cpu_cores: u32,
        memory_mb: u64,
        delay: Duration,
    ) -> Self {
        Self {
            request_id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            processor_id,
            preferred_host,
            cpu_cores,
            memory_mb,
            request_time: Instant::now() + delay,
        }
    }

    /// The identity of this request.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        now >= self.request_time
    }

    /// Whether the preferred host failed to materialize within `expiry`
    /// of the request becoming ready.
    pub fn is_expired(&self, now: Instant, expiry: Duration) -> bool {
        now >= self.request_time + expiry
    }
}

impl PartialEq for ResourceRequest {
    fn eq(&self, other: &Self) -> bool {
        self.request_id == other.request_id
    }
}

impl Eq for ResourceRequest {}

impl std::hash::Hash for ResourceRequest {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.request_id.hash(state);
    }
}
