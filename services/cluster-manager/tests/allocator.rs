//! Integration tests for the allocator loop and placement policies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rivulet_cluster_manager::broker::{MockBroker, ResourceBroker};
use rivulet_cluster_manager::command::LaunchSpec;
use rivulet_cluster_manager::config::Config;
use rivulet_cluster_manager::job_model::StaticJobModel;
use rivulet_cluster_manager::manager::ClusterManager;
use rivulet_cluster_manager::resource::{ExitStatus, PreferredHost, Resource};
use rivulet_cluster_manager::state::AppState;
use rivulet_id::{Host, ProcessorId, ResourceId};

const COORDINATOR_URL: &str = "http://127.0.0.1:8080";

fn id(s: &str) -> ProcessorId {
    ProcessorId::parse(s).unwrap()
}

fn rid(s: &str) -> ResourceId {
    ResourceId::parse(s).unwrap()
}

fn host(s: &str) -> Host {
    Host::parse(s).unwrap()
}

fn resource(resource_id: &str, host_name: &str) -> Resource {
    Resource {
        resource_id: rid(resource_id),
        host: host(host_name),
        cpu_cores: 1,
        memory_mb: 1024,
    }
}

fn manager_with(model: StaticJobModel, config: Config) -> (Arc<MockBroker>, ClusterManager) {
    let broker = Arc::new(MockBroker::new());
    let manager = ClusterManager::new(config, Arc::new(model), broker.clone()).unwrap();
    (broker, manager)
}

#[tokio::test]
async fn any_host_policy_matches_requests_to_any_resource() {
    let model = StaticJobModel::with_replication(1, 1, COORDINATOR_URL);
    let config = Config {
        host_affinity: false,
        ..Config::default()
    };
    let (broker, manager) = manager_with(model, config);

    manager.request_initial_resources();
    manager.on_resource_allocated(resource("r0", "h1"));
    manager.allocator().run_once().await.unwrap();

    let launches = broker.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].1.processor_id, id("0"));
    assert!(manager
        .state()
        .pending_snapshot()
        .await
        .contains_key(&id("0")));
    assert_eq!(manager.request_state().pending_request_count(), 0);
}

#[tokio::test]
async fn host_aware_policy_waits_for_the_preferred_host() {
    let model = StaticJobModel::with_replication(1, 1, COORDINATOR_URL)
        .with_last_known_host(id("0"), host("h2"));
    let (broker, manager) = manager_with(model, Config::default());

    manager.request_initial_resources();
    manager.on_resource_allocated(resource("r0", "h1"));
    manager.allocator().run_once().await.unwrap();

    // Wrong host: nothing launches, the request stays pending, and the
    // unwanted resource is released as extra.
    assert!(broker.launches().is_empty());
    assert_eq!(manager.request_state().pending_request_count(), 1);
    let released: Vec<ResourceId> = broker
        .releases()
        .into_iter()
        .map(|r| r.resource_id)
        .collect();
    assert_eq!(released, vec![rid("r0")]);
}

#[tokio::test]
async fn host_aware_policy_launches_on_the_preferred_host() {
    let model = StaticJobModel::with_replication(1, 1, COORDINATOR_URL)
        .with_last_known_host(id("0"), host("h2"));
    let (broker, manager) = manager_with(model, Config::default());

    manager.request_initial_resources();
    manager.on_resource_allocated(resource("r1", "h2"));
    manager.allocator().run_once().await.unwrap();

    let launches = broker.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].0.host, host("h2"));
    assert_eq!(launches[0].1.processor_id, id("0"));
}

#[tokio::test]
async fn expired_request_without_standby_falls_back_to_any_host() {
    let model = StaticJobModel::with_replication(1, 1, COORDINATOR_URL)
        .with_last_known_host(id("0"), host("h2"));
    let config = Config {
        request_expiry: Duration::ZERO,
        ..Config::default()
    };
    let (broker, manager) = manager_with(model, config);

    manager.request_initial_resources();
    manager.on_resource_allocated(resource("r0", "h1"));
    manager.allocator().run_once().await.unwrap();

    // The preferred-host request expired immediately and was replaced
    // by an any-host request, which matched the h1 resource.
    assert_eq!(manager.state().expired_requests.load(Ordering::Relaxed), 1);
    let launches = broker.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].0.host, host("h1"));
}

#[tokio::test]
async fn launch_success_moves_pending_to_running() {
    let model = StaticJobModel::with_replication(1, 1, COORDINATOR_URL);
    let config = Config {
        host_affinity: false,
        ..Config::default()
    };
    let (_broker, manager) = manager_with(model, config);

    manager.request_initial_resources();
    manager.on_resource_allocated(resource("r0", "h1"));
    manager.allocator().run_once().await.unwrap();

    manager.on_launch_succeeded(&id("0")).await;

    assert!(manager.state().pending_snapshot().await.is_empty());
    assert_eq!(
        manager
            .state()
            .running_snapshot()
            .await
            .get(&id("0"))
            .map(|r| r.resource_id.clone()),
        Some(rid("r0"))
    );
}

#[tokio::test]
async fn stop_without_standby_requests_the_previous_host() {
    let model = StaticJobModel::with_replication(1, 1, COORDINATOR_URL);
    let config = Config {
        preferred_host_retry_delay: Duration::from_secs(60),
        ..Config::default()
    };
    let (_broker, manager) = manager_with(model, config);

    manager
        .on_container_stopped(id("0"), rid("r0"), host("h1"), ExitStatus::Unknown(1))
        .await
        .unwrap();

    let pending = manager.request_state().pending_requests();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].preferred_host, PreferredHost::Host(host("h1")));
    // Delayed by the retry delay.
    assert!(manager.request_state().peek_ready_request().is_none());
}

#[tokio::test]
async fn successful_exit_is_not_restarted() {
    let model = StaticJobModel::with_replication(1, 1, COORDINATOR_URL);
    let (_broker, manager) = manager_with(model, Config::default());

    manager
        .state()
        .running_processors
        .write()
        .await
        .insert(id("0"), resource("r0", "h1"));
    manager
        .on_container_stopped(id("0"), rid("r0"), host("h1"), ExitStatus::Success)
        .await
        .unwrap();

    assert_eq!(
        manager
            .state()
            .completed_processors
            .load(Ordering::Relaxed),
        1
    );
    assert_eq!(manager.request_state().pending_request_count(), 0);
    assert!(manager.state().running_snapshot().await.is_empty());
}

#[tokio::test]
async fn failed_launch_without_standby_releases_and_rerequests() {
    let model = StaticJobModel::with_replication(1, 1, COORDINATOR_URL);
    let (broker, manager) = manager_with(model, Config::default());

    manager
        .state()
        .pending_processors
        .write()
        .await
        .insert(id("0"), resource("r0", "h1"));

    manager.on_launch_failed(id("0"), rid("r0")).await.unwrap();

    let released: Vec<ResourceId> = broker
        .releases()
        .into_iter()
        .map(|r| r.resource_id)
        .collect();
    assert_eq!(released, vec![rid("r0")]);
    let pending = manager.request_state().pending_requests();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].preferred_host, PreferredHost::Any);
    assert_eq!(manager.state().failed_launches.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn allocator_loop_runs_and_shuts_down_cleanly() {
    let model = StaticJobModel::with_replication(1, 1, COORDINATOR_URL);
    let config = Config {
        host_affinity: false,
        allocator_sleep: Duration::from_millis(10),
        ..Config::default()
    };
    let (broker, manager) = manager_with(model, config);

    let handle = manager.start();
    manager.on_resource_allocated(resource("r0", "h1"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.launches().len(), 1);

    manager.stop();
    handle.await.unwrap().unwrap();
}

/// Broker that checks the pending map already holds the processor when
/// the launch call arrives.
#[derive(Default)]
struct AssertingBroker {
    state: Mutex<Option<Arc<AppState>>>,
    saw_pending: AtomicBool,
    launched: AtomicBool,
}

#[async_trait]
impl ResourceBroker for AssertingBroker {
    async fn launch(&self, _resource: &Resource, spec: LaunchSpec) -> Result<()> {
        let state = self.state.lock().unwrap().clone().expect("state wired");
        let pending = state.pending_snapshot().await;
        self.saw_pending
            .store(pending.contains_key(&spec.processor_id), Ordering::Relaxed);
        self.launched.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn stop(&self, _resource: &Resource) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _resource: &Resource) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn pending_entry_is_recorded_before_the_launch_call() {
    let model = StaticJobModel::with_replication(1, 1, COORDINATOR_URL);
    let config = Config {
        host_affinity: false,
        ..Config::default()
    };
    let broker = Arc::new(AssertingBroker::default());
    let manager = ClusterManager::new(config, Arc::new(model), broker.clone()).unwrap();
    *broker.state.lock().unwrap() = Some(manager.state().clone());

    manager.request_initial_resources();
    manager.on_resource_allocated(resource("r0", "h1"));
    manager.allocator().run_once().await.unwrap();

    assert!(broker.launched.load(Ordering::Relaxed));
    assert!(broker.saw_pending.load(Ordering::Relaxed));
}
