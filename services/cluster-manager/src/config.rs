//! Configuration for the cluster manager.

use std::time::Duration;

use anyhow::Result;

/// Cluster manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Interval between allocator loop passes.
    pub allocator_sleep: Duration,

    /// Memory granted to each container, in MiB.
    pub container_memory_mb: u64,

    /// CPU cores granted to each container.
    pub container_cpu_cores: u32,

    /// How long a preferred-host request may stay unfulfilled before it
    /// is treated as expired.
    pub request_expiry: Duration,

    /// Delay applied to restart requests that target a specific host.
    pub preferred_host_retry_delay: Duration,

    /// Whether to place processors back on their last-known hosts.
    pub host_affinity: bool,

    /// Replicas per processor, counting the active. Standby failover is
    /// enabled when this exceeds 1.
    pub standby_replication_factor: u32,

    /// Name of the registered command builder to launch workers with.
    pub command_builder: String,

    /// URL of the embedded job coordinator handed to launched workers.
    pub coordinator_url: String,

    /// Number of active processors in the job.
    pub processor_count: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allocator_sleep: Duration::from_millis(3600),
            container_memory_mb: 1024,
            container_cpu_cores: 1,
            request_expiry: Duration::from_millis(5000),
            preferred_host_retry_delay: Duration::from_millis(1000),
            host_affinity: true,
            standby_replication_factor: 1,
            command_builder: "shell".to_string(),
            coordinator_url: "http://127.0.0.1:8080".to_string(),
            processor_count: 1,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        Ok(Self {
            allocator_sleep: Duration::from_millis(env_u64(
                "RIVULET_ALLOCATOR_SLEEP_MS",
                defaults.allocator_sleep.as_millis() as u64,
            )?),
            container_memory_mb: env_u64(
                "RIVULET_CONTAINER_MEMORY_MB",
                defaults.container_memory_mb,
            )?,
            container_cpu_cores: env_u64(
                "RIVULET_CONTAINER_CPU_CORES",
                u64::from(defaults.container_cpu_cores),
            )? as u32,
            request_expiry: Duration::from_millis(env_u64(
                "RIVULET_REQUEST_EXPIRY_MS",
                defaults.request_expiry.as_millis() as u64,
            )?),
            preferred_host_retry_delay: Duration::from_millis(env_u64(
                "RIVULET_PREFERRED_HOST_RETRY_DELAY_MS",
                defaults.preferred_host_retry_delay.as_millis() as u64,
            )?),
            host_affinity: env_bool("RIVULET_HOST_AFFINITY", defaults.host_affinity),
            standby_replication_factor: env_u64(
                "RIVULET_STANDBY_REPLICATION_FACTOR",
                u64::from(defaults.standby_replication_factor),
            )? as u32,
            command_builder: env_string("RIVULET_COMMAND_BUILDER", &defaults.command_builder),
            coordinator_url: env_string("RIVULET_COORDINATOR_URL", &defaults.coordinator_url),
            processor_count: env_u64(
                "RIVULET_PROCESSOR_COUNT",
                u64::from(defaults.processor_count),
            )? as u32,
            log_level: env_string("RIVULET_LOG_LEVEL", &defaults.log_level),
        })
    }

    /// Whether standby-aware failover is in effect.
    pub fn standby_enabled(&self) -> bool {
        self.standby_replication_factor > 1
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(value) => Ok(value
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}"))?),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}
