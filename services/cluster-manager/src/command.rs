//! Worker launch-command construction.
//!
//! Builders are registered by name and resolved once at startup from
//! configuration; each launch materializes a `LaunchSpec` the broker
//! consumes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rivulet_id::ProcessorId;
use serde::Serialize;

use crate::config::Config;
use crate::error::ClusterError;

/// Opaque launch command handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchSpec {
    pub processor_id: ProcessorId,
    pub program: String,
    pub args: Vec<String>,
    pub environment: BTreeMap<String, String>,
}

/// Materializes the launch command for a processor.
pub trait CommandBuilder: Send + Sync {
    fn build(&self, processor_id: &ProcessorId) -> LaunchSpec;
}

/// Default builder: shell-execs the worker entrypoint with the
/// processor ID and coordinator URL in the environment.
pub struct ShellCommandBuilder {
    coordinator_url: String,
}

impl ShellCommandBuilder {
    pub fn new(coordinator_url: impl Into<String>) -> Self {
        Self {
            coordinator_url: coordinator_url.into(),
        }
    }
}

impl CommandBuilder for ShellCommandBuilder {
    fn build(&self, processor_id: &ProcessorId) -> LaunchSpec {
        let mut environment = BTreeMap::new();
        environment.insert(
            "RIVULET_PROCESSOR_ID".to_string(),
            processor_id.to_string(),
        );
        environment.insert(
            "RIVULET_COORDINATOR_URL".to_string(),
            self.coordinator_url.clone(),
        );
        LaunchSpec {
            processor_id: processor_id.clone(),
            program: "bin/run-worker.sh".to_string(),
            args: Vec::new(),
            environment,
        }
    }
}

type BuilderConstructor = fn(&Config, &str) -> Arc<dyn CommandBuilder>;

/// Name-keyed registry of command-builder constructors.
///
/// Resolution happens once at startup; an unknown name is a
/// configuration error.
pub struct CommandBuilderRegistry {
    constructors: HashMap<String, BuilderConstructor>,
}

impl CommandBuilderRegistry {
    /// Registry preloaded with the built-in builders.
    pub fn builtin() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
        };
        registry.register("shell", |_config, coordinator_url| {
            Arc::new(ShellCommandBuilder::new(coordinator_url))
        });
        registry
    }

    pub fn register(&mut self, name: &str, constructor: BuilderConstructor) {
        self.constructors.insert(name.to_string(), constructor);
    }

    pub fn resolve(
        &self,
        name: &str,
        config: &Config,
        coordinator_url: &str,
    ) -> Result<Arc<dyn CommandBuilder>, ClusterError> {
        self.constructors
            .get(name)
            .map(|constructor| constructor(config, coordinator_url))
            .ok_or_else(|| ClusterError::UnknownCommandBuilder(name.to_string()))
    }
}
