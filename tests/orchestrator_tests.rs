
use std::sync::Arc;

use benchfleet::config::LeaseConfig;
use benchfleet::error::BenchError;
use benchfleet::lease::{AcquireRequest, MachineLeaseManager};
use benchfleet::orchestrator::Orchestrator;
use test_harness::{registry_with, FakeAgent, FakeProbe};

const HOST: &str = "10.0.0.5";

async fn orchestrator() -> (Orchestrator, Arc<FakeAgent>, Arc<FakeProbe>) {
    let (registry, probe) = registry_with(&[HOST]).await;
    let leases = Arc::new(MachineLeaseManager::new(LeaseConfig::in_memory(60_000)));
    let agent = FakeAgent::new();
    (Orchestrator::new(registry, leases, agent.clone()), agent, probe)
}

fn request(holder: &str, name: &str) -> AcquireRequest {
    AcquireRequest::new(HOST, holder, name)
        .test_case("basic_test.py")
        .port("COM1")
}

#[tokio::test]
async fn test_start_requires_lease() {
    let (orch, agent, _probe) = orchestrator().await;

    let err = orch
        .start_run(HOST, "u1", "basic_test.py", "COM1")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "LEASE_NOT_FOUND");

    orch.leases().acquire(request("u1", "Alice")).await.unwrap();
    let err = orch
        .start_run(HOST, "u2", "basic_test.py", "COM1")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NO_PERMISSION");
    assert_eq!(agent.start_count(), 0);

    let run = orch
        .start_run(HOST, "u1", "basic_test.py", "COM1")
        .await
        .unwrap();
    assert_eq!(agent.start_count(), 1);

    // The run is attached to the lease.
    let lease = orch.leases().status(HOST).await.lease.unwrap();
    assert_eq!(lease.run_id.as_deref(), Some(run.run_id.as_str()));
}

#[tokio::test]
async fn test_unknown_and_offline_machines() {
    let (orch, agent, probe) = orchestrator().await;

    let err = orch
        .acquire_and_start(AcquireRequest::new("10.0.0.99", "u1", "Alice"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "HOST_NOT_FOUND");

    probe.update(HOST, |h| h.reachable = false);
    orch.registry().run_health_check().await;

    let err = orch
        .acquire_and_start(request("u1", "Alice"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "HOST_OFFLINE");
    assert_eq!(agent.start_count(), 0);
    assert!(orch.leases().status(HOST).await.available);

    let err = orch.run_status("10.0.0.99", "test_1_0").await.unwrap_err();
    assert_eq!(err.code(), "HOST_NOT_FOUND");
}

#[tokio::test]
async fn test_acquire_and_start() {
    let (orch, agent, _probe) = orchestrator().await;

    let started = orch.acquire_and_start(request("u1", "Alice")).await.unwrap();
    assert_eq!(started.lease.holder_id, "u1");
    assert_eq!(started.lease.run_id.as_deref(), Some(started.run.run_id.as_str()));
    assert_eq!(
        agent.starts.lock().unwrap()[0],
        (HOST.to_string(), "basic_test.py".to_string(), "COM1".to_string())
    );

    let err = orch
        .acquire_and_start(request("u2", "Bob"))
        .await
        .unwrap_err();
    assert!(matches!(err, BenchError::HostBusy { ref holder_name } if holder_name == "Alice"));
    assert_eq!(agent.start_count(), 1);
}

#[tokio::test]
async fn test_failed_remote_start_rolls_back_new_lease() {
    let (orch, agent, _probe) = orchestrator().await;

    agent.fail_next_start(BenchError::CaseNotFound("basic_test.py".to_string()));
    let err = orch
        .acquire_and_start(request("u1", "Alice"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CASE_NOT_FOUND");
    assert!(orch.leases().status(HOST).await.available);
}

#[tokio::test]
async fn test_failed_remote_start_keeps_existing_lease() {
    let (orch, agent, _probe) = orchestrator().await;
    orch.leases().acquire(request("u1", "Alice")).await.unwrap();

    agent.fail_next_start(BenchError::Spawn("no python".to_string()));
    let err = orch
        .acquire_and_start(request("u1", "Alice"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SPAWN_FAILED");

    let status = orch.leases().status(HOST).await;
    assert_eq!(status.lease.unwrap().holder_id, "u1");
}

#[tokio::test]
async fn test_stop_only_by_holder() {
    let (orch, agent, _probe) = orchestrator().await;
    let started = orch.acquire_and_start(request("u1", "Alice")).await.unwrap();

    let err = orch
        .stop_run(HOST, "u2", &started.run.run_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NO_PERMISSION");
    assert!(agent.stops.lock().unwrap().is_empty());

    let ack = orch.stop_run(HOST, "u1", &started.run.run_id).await.unwrap();
    assert_eq!(ack.run_id, started.run.run_id);
    assert_eq!(agent.stops.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_stop_allowed_once_machine_is_free() {
    let (orch, agent, _probe) = orchestrator().await;
    let started = orch.acquire_and_start(request("u1", "Alice")).await.unwrap();
    orch.leases().release(HOST, "u1").await.unwrap();

    orch.stop_run(HOST, "u2", &started.run.run_id).await.unwrap();
    assert_eq!(agent.stops.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_status_and_logs_are_proxied() {
    let (orch, _agent, _probe) = orchestrator().await;

    let run = orch.run_status(HOST, "test_9_9").await.unwrap();
    assert_eq!(run.run_id, "test_9_9");

    let chunk = orch.run_logs(HOST, "test_9_9", 17).await.unwrap();
    assert_eq!(chunk.next_cursor, 17);
    assert!(chunk.lines.is_empty());
}
