//! Integration tests for standby-aware failover.
//!
//! These tests drive broker events through the `ClusterManager`
//! callback surface and observe the coordinator's decisions via the
//! `MockBroker` record, the request state, and the shared counters.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rivulet_cluster_manager::broker::MockBroker;
use rivulet_cluster_manager::config::Config;
use rivulet_cluster_manager::job_model::StaticJobModel;
use rivulet_cluster_manager::manager::ClusterManager;
use rivulet_cluster_manager::resource::{ExitStatus, PreferredHost, Resource};
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

/// Standby failover enabled; restart requests delayed far enough that
/// tests can observe them in the delayed buffer.
fn standby_config() -> Config {
    Config {
        standby_replication_factor: 2,
        preferred_host_retry_delay: Duration::from_secs(60),
        ..Config::default()
    }
}

fn manager_with(model: StaticJobModel, config: Config) -> (Arc<MockBroker>, ClusterManager) {
    let broker = Arc::new(MockBroker::new());
    let manager = ClusterManager::new(config, Arc::new(model), broker.clone()).unwrap();
    (broker, manager)
}

#[tokio::test]
async fn failover_without_standbys_falls_back_to_any_host() {
    let model = StaticJobModel::with_replication(1, 2, COORDINATOR_URL);
    let (broker, manager) = manager_with(model, standby_config());
    let coordinator = manager.standby().unwrap();

    coordinator
        .initiate_standby_aware_allocation(&id("0"), &rid("r0"), manager.allocator())
        .await
        .unwrap();

    assert_eq!(
        manager
            .state()
            .failovers_to_any_host
            .load(Ordering::Relaxed),
        1
    );
    let pending = manager.request_state().pending_requests();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].processor_id, id("0"));
    assert_eq!(pending[0].preferred_host, PreferredHost::Any);
    // No standby was touched, so no metadata was created.
    assert!(coordinator.failover_metadata(&rid("r0")).is_none());
    assert!(broker.stops().is_empty());
}

#[tokio::test]
async fn preempted_active_steals_its_standbys_host() {
    let model = StaticJobModel::with_replication(1, 2, COORDINATOR_URL);
    let (broker, manager) = manager_with(model, standby_config());

    manager
        .state()
        .running_processors
        .write()
        .await
        .insert(id("0"), resource("r0", "h1"));
    manager
        .state()
        .running_processors
        .write()
        .await
        .insert(id("0-0"), resource("s0", "h2"));

    manager
        .on_container_stopped(id("0"), rid("r0"), host("h1"), ExitStatus::Preempted)
        .await
        .unwrap();

    // The standby on h2 was selected and stopped.
    let stopped: Vec<ResourceId> = broker.stops().into_iter().map(|r| r.resource_id).collect();
    assert_eq!(stopped, vec![rid("s0")]);
    let coordinator = manager.standby().unwrap();
    let metadata = coordinator.failover_metadata(&rid("r0")).unwrap();
    assert_eq!(metadata.standby_host(&rid("s0")), Some(host("h2")));
    assert_eq!(
        manager
            .state()
            .failovers_to_standby
            .load(Ordering::Relaxed),
        1
    );

    // The broker reports the standby stop; the swap requests follow.
    manager
        .on_container_stopped(id("0-0"), rid("s0"), host("h2"), ExitStatus::Unknown(143))
        .await
        .unwrap();

    let pending = manager.request_state().pending_requests();
    assert_eq!(pending.len(), 2);
    let for_active = pending
        .iter()
        .find(|r| r.processor_id == id("0"))
        .unwrap();
    assert_eq!(for_active.preferred_host, PreferredHost::Host(host("h2")));
    assert!(!for_active.is_ready(Instant::now()));
    let for_standby = pending
        .iter()
        .find(|r| r.processor_id == id("0-0"))
        .unwrap();
    assert_eq!(for_standby.preferred_host, PreferredHost::Any);
    assert!(metadata.contains_request(for_active));
    assert!(metadata.contains_request(for_standby));
}

#[tokio::test]
async fn second_failover_attempt_avoids_the_used_standby_host() {
    let model = StaticJobModel::with_replication(1, 2, COORDINATOR_URL)
        .with_last_known_host(id("0-0"), host("h2"));
    let config = Config {
        standby_replication_factor: 2,
        preferred_host_retry_delay: Duration::ZERO,
        ..Config::default()
    };
    let (_broker, manager) = manager_with(model, config);

    manager
        .state()
        .running_processors
        .write()
        .await
        .insert(id("0"), resource("r0", "h1"));
    manager
        .state()
        .running_processors
        .write()
        .await
        .insert(id("0-0"), resource("s0", "h2"));

    manager
        .on_container_stopped(id("0"), rid("r0"), host("h1"), ExitStatus::Aborted)
        .await
        .unwrap();
    manager
        .on_container_stopped(id("0-0"), rid("s0"), host("h2"), ExitStatus::Unknown(143))
        .await
        .unwrap();

    // The preferred-host request for the active expires unfulfilled.
    let request_for_active = manager
        .request_state()
        .pending_requests()
        .into_iter()
        .find(|r| r.processor_id == id("0"))
        .unwrap();
    let coordinator = manager.standby().unwrap();
    coordinator
        .handle_expired_request(&request_for_active, None, manager.allocator())
        .await
        .unwrap();

    // h2 was already used in this failover, the standby is gone, and
    // its last-known host is h2 too: the active falls back to any-host.
    assert_eq!(
        manager
            .state()
            .failovers_to_any_host
            .load(Ordering::Relaxed),
        1
    );
    let pending = manager.request_state().pending_requests();
    let actives: Vec<_> = pending
        .iter()
        .filter(|r| r.processor_id == id("0"))
        .collect();
    assert_eq!(actives.len(), 1);
    assert_eq!(actives[0].preferred_host, PreferredHost::Any);
}

#[tokio::test]
async fn constraint_violation_releases_and_fails_over() {
    let model = StaticJobModel::with_replication(1, 2, COORDINATOR_URL);
    let (broker, manager) = manager_with(model, standby_config());

    // The standby is already scheduled on the host being offered.
    manager
        .state()
        .pending_processors
        .write()
        .await
        .insert(id("0-0"), resource("s0", "h1"));

    let allocator = manager.allocator();
    let request = allocator.new_request(id("0"), PreferredHost::Host(host("h1")), Duration::ZERO);
    allocator.issue_request(request.clone());
    let offered = resource("r1", "h1");
    manager.request_state().add_resource(offered.clone());

    manager
        .standby()
        .unwrap()
        .check_constraints_and_run(
            &request,
            &PreferredHost::Host(host("h1")),
            &offered,
            allocator,
        )
        .await
        .unwrap();

    let released: Vec<ResourceId> = broker
        .releases()
        .into_iter()
        .map(|r| r.resource_id)
        .collect();
    assert_eq!(released, vec![rid("r1")]);
    assert_eq!(
        manager
            .state()
            .failed_standby_allocations
            .load(Ordering::Relaxed),
        1
    );
    // The violating request was cancelled; the failover (indexed by the
    // synthesized unknown resource ID) re-requested the active anywhere.
    let pending = manager.request_state().pending_requests();
    assert_eq!(pending.len(), 1);
    assert_ne!(pending[0], request);
    assert_eq!(pending[0].processor_id, id("0"));
    assert_eq!(pending[0].preferred_host, PreferredHost::Any);
    assert_eq!(
        manager
            .state()
            .failovers_to_any_host
            .load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn unknown_exit_restarts_active_on_its_host_and_records_the_request() {
    let model = StaticJobModel::with_replication(1, 2, COORDINATOR_URL);
    let (broker, manager) = manager_with(model, standby_config());

    manager
        .state()
        .running_processors
        .write()
        .await
        .insert(id("0"), resource("r0", "h1"));

    manager
        .on_container_stopped(id("0"), rid("r0"), host("h1"), ExitStatus::Unknown(1))
        .await
        .unwrap();

    // No standby was touched; the active was re-requested on its own
    // host after the retry delay.
    assert!(broker.stops().is_empty());
    let metadata = manager
        .standby()
        .unwrap()
        .failover_metadata(&rid("r0"))
        .unwrap();
    assert!(metadata.selected_standbys().is_empty());

    let pending = manager.request_state().pending_requests();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].preferred_host, PreferredHost::Host(host("h1")));
    assert!(metadata.contains_request(&pending[0]));
    // Delayed: not ready until the retry delay elapses.
    assert!(manager.request_state().peek_ready_request().is_none());
}

#[tokio::test]
async fn multiple_family_members_on_one_host_is_fatal() {
    let model = StaticJobModel::with_replication(1, 3, COORDINATOR_URL);
    let (broker, manager) = manager_with(
        model,
        Config {
            standby_replication_factor: 3,
            ..standby_config()
        },
    );

    // Invalid state set up deliberately: two standbys of one family on
    // the same host.
    manager
        .state()
        .running_processors
        .write()
        .await
        .insert(id("0-0"), resource("s0", "h2"));
    manager
        .state()
        .running_processors
        .write()
        .await
        .insert(id("0-1"), resource("s1", "h2"));

    let err = manager
        .standby()
        .unwrap()
        .initiate_standby_aware_allocation(&id("0"), &rid("r0"), manager.allocator())
        .await
        .unwrap_err();

    assert!(err.is_fatal());
    // Both standbys were still stopped before the abort surfaced.
    assert_eq!(broker.stops().len(), 2);
}

#[tokio::test]
async fn repeated_failure_registration_reuses_metadata() {
    let model = StaticJobModel::with_replication(1, 2, COORDINATOR_URL);
    let (_broker, manager) = manager_with(model, standby_config());

    manager
        .on_container_stopped(id("0"), rid("r0"), host("h1"), ExitStatus::Unknown(1))
        .await
        .unwrap();
    let coordinator = manager.standby().unwrap();
    let first = coordinator.failover_metadata(&rid("r0")).unwrap();

    manager
        .on_container_stopped(id("0"), rid("r0"), host("h1"), ExitStatus::Unknown(1))
        .await
        .unwrap();
    let second = coordinator.failover_metadata(&rid("r0")).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.requests().len(), 2);
}

#[tokio::test]
async fn confirmed_active_evicts_its_failover_entries() {
    let model = StaticJobModel::with_replication(1, 2, COORDINATOR_URL);
    let (_broker, manager) = manager_with(model, standby_config());

    manager
        .on_container_stopped(id("0"), rid("r0"), host("h1"), ExitStatus::Unknown(1))
        .await
        .unwrap();
    let coordinator = manager.standby().unwrap();
    assert_eq!(coordinator.failover_count(), 1);

    // The active comes back on a fresh resource.
    manager
        .state()
        .pending_processors
        .write()
        .await
        .insert(id("0"), resource("r2", "h3"));
    manager.on_launch_succeeded(&id("0")).await;

    assert_eq!(coordinator.failover_count(), 0);
    assert!(manager
        .state()
        .running_snapshot()
        .await
        .contains_key(&id("0")));
}

#[tokio::test]
async fn failed_standby_launch_is_rerequested_anywhere() {
    let model = StaticJobModel::with_replication(1, 2, COORDINATOR_URL);
    let (_broker, manager) = manager_with(model, standby_config());

    manager
        .state()
        .pending_processors
        .write()
        .await
        .insert(id("0-0"), resource("s0", "h2"));

    manager
        .on_launch_failed(id("0-0"), rid("s0"))
        .await
        .unwrap();

    let pending = manager.request_state().pending_requests();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].processor_id, id("0-0"));
    assert_eq!(pending[0].preferred_host, PreferredHost::Any);
}

#[tokio::test]
async fn expired_standby_request_uses_an_alternative_resource() {
    let model = StaticJobModel::with_replication(1, 2, COORDINATOR_URL);
    let (broker, manager) = manager_with(model, standby_config());
    let allocator = manager.allocator();

    let request = allocator.new_request(id("0-0"), PreferredHost::Host(host("h2")), Duration::ZERO);
    allocator.issue_request(request.clone());
    let alternative = resource("r1", "h3");
    manager.request_state().add_resource(alternative.clone());

    manager
        .standby()
        .unwrap()
        .handle_expired_request(&request, Some(alternative), allocator)
        .await
        .unwrap();

    // Constraints hold on h3, so the standby launches there directly.
    let launches = broker.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].1.processor_id, id("0-0"));
    assert_eq!(launches[0].0.host, host("h3"));
}
