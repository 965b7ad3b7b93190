
use std::sync::Arc;
use std::time::{Duration, Instant};

use benchfleet::config::LeaseConfig;
use benchfleet::fleet::{FleetRegistry, MachineOrigin};
use benchfleet::lease::{AcquireRequest, MachineLeaseManager, Occupancy};
use test_harness::{discovery_config, FakeHost, FakeProbe};

fn registry(probe: &Arc<FakeProbe>) -> FleetRegistry {
    FleetRegistry::new(discovery_config(None), probe.clone())
}

#[tokio::test]
async fn test_discovery_finds_reachable_agents() {
    let probe = FakeProbe::new();
    probe.set("10.9.8.2", FakeHost::online("bench-a"));
    probe.set("10.9.8.4", FakeHost::online("bench-b"));
    probe.set("10.9.8.5", FakeHost {
        reachable: false,
        ..FakeHost::online("bench-c")
    });
    let registry = registry(&probe);

    let found = registry.run_discovery().await;
    assert_eq!(found, 2);

    let machines = registry.list_known_machines().await;
    let addresses: Vec<&str> = machines.iter().map(|m| m.address.as_str()).collect();
    assert_eq!(addresses, vec!["10.9.8.2", "10.9.8.4"]);

    let a = &machines[0];
    assert!(a.reachable);
    assert_eq!(a.origin, MachineOrigin::Discovered);
    assert_eq!(a.display_name, "bench-a");
    assert_eq!(a.location, "lab-1");
    assert!(a.capabilities.has_test_case("basic_test.py"));
    assert!(a.capabilities.has_port("/dev/ttyUSB0"));
    assert!(a.last_seen_at.is_some());
}

#[tokio::test]
async fn test_discovery_skips_known_machines() {
    let probe = FakeProbe::new();
    probe.set("10.9.8.1", FakeHost::online("bench-a"));
    let registry = registry(&probe);

    assert_eq!(registry.run_discovery().await, 1);
    let fetches = probe.fetch_count();

    assert_eq!(registry.run_discovery().await, 0);
    assert_eq!(probe.fetch_count(), fetches);
}

#[tokio::test]
async fn test_discovery_ceiling_keeps_partial_results() {
    let probe = FakeProbe::new();
    probe.set("10.9.8.1", FakeHost::online("bench-a"));
    probe.set("10.9.8.2", FakeHost::online("bench-b"));
    probe.set("10.9.8.3", FakeHost::hanging(Duration::from_secs(30)));

    let config = benchfleet::config::DiscoveryConfig {
        discovery_timeout_ms: 500,
        ..discovery_config(None)
    };
    let registry = FleetRegistry::new(config, probe.clone());

    let started = Instant::now();
    let found = registry.run_discovery().await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(found, 2);
    assert!(registry.get_machine("10.9.8.3").await.is_none());
}

#[tokio::test]
async fn test_health_check_tracks_transitions() {
    let probe = FakeProbe::new();
    probe.set("10.9.8.1", FakeHost::online("bench-a"));
    let registry = registry(&probe);
    registry.run_discovery().await;

    probe.update("10.9.8.1", |h| h.reachable = false);
    registry.run_health_check().await;

    let machine = registry.get_machine("10.9.8.1").await.unwrap();
    assert!(!machine.reachable);
    // Kept for display but not trusted while offline.
    assert!(machine.capabilities.has_test_case("basic_test.py"));
    assert!(machine.trusted_capabilities().is_none());
    assert!(machine.last_checked_at.is_some());

    let fetches = probe.fetch_count();
    probe.update("10.9.8.1", |h| {
        h.reachable = true;
        h.test_cases = vec!["new_case.py".to_string()];
    });
    registry.run_health_check().await;

    let machine = registry.get_machine("10.9.8.1").await.unwrap();
    assert!(machine.reachable);
    assert_eq!(probe.fetch_count(), fetches + 1);
    assert!(machine.trusted_capabilities().unwrap().has_test_case("new_case.py"));

    // Staying reachable does not refetch.
    registry.run_health_check().await;
    assert_eq!(probe.fetch_count(), fetches + 1);
}

#[tokio::test]
async fn test_slow_address_does_not_delay_others() {
    let probe = FakeProbe::new();
    probe.set("10.9.8.1", FakeHost::online("bench-a"));
    probe.set("10.9.8.2", FakeHost::online("bench-slow"));
    let registry = Arc::new(registry(&probe));
    assert_eq!(registry.run_discovery().await, 2);

    probe.update("10.9.8.1", |h| h.reachable = false);
    probe.update("10.9.8.2", |h| h.delay = Duration::from_secs(2));

    let sweep = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.run_health_check().await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!sweep.is_finished());
    assert!(!registry.get_machine("10.9.8.1").await.unwrap().reachable);

    sweep.await.unwrap();
    assert!(registry.get_machine("10.9.8.2").await.unwrap().reachable);
}

#[tokio::test]
async fn test_failed_fetch_keeps_previous_capabilities() {
    let probe = FakeProbe::new();
    probe.set("10.9.8.1", FakeHost::online("bench-a"));
    let registry = registry(&probe);
    registry.run_discovery().await;

    probe.update("10.9.8.1", |h| h.reachable = false);
    registry.run_health_check().await;
    probe.update("10.9.8.1", |h| {
        h.reachable = true;
        h.fail_fetch = true;
    });
    registry.run_health_check().await;

    let machine = registry.get_machine("10.9.8.1").await.unwrap();
    assert!(machine.reachable);
    assert_eq!(machine.display_name, "bench-a");
    assert!(machine.capabilities.has_test_case("basic_test.py"));
}

#[tokio::test]
async fn test_refresh_now() {
    let probe = FakeProbe::new();
    probe.set("10.9.8.1", FakeHost::online("bench-a"));
    let registry = registry(&probe);

    let err = registry.refresh_now("10.9.8.1").await.unwrap_err();
    assert_eq!(err.code(), "HOST_NOT_FOUND");

    registry.run_discovery().await;
    let fetches = probe.fetch_count();
    probe.update("10.9.8.1", |h| h.hostname = "renamed".to_string());

    let machine = registry.refresh_now("10.9.8.1").await.unwrap();
    assert_eq!(probe.fetch_count(), fetches + 1);
    assert_eq!(machine.display_name, "renamed");
}

#[tokio::test]
async fn test_manual_machine_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("manual_hosts.json");
    let probe = FakeProbe::new();
    probe.set("10.1.1.7", FakeHost::online("bench-manual"));
    let registry = FleetRegistry::new(discovery_config(Some(file.clone())), probe.clone());

    let err = registry.add_manual("not-an-ip", "x", "").await.unwrap_err();
    assert_eq!(err.code(), "INVALID_ADDRESS");

    let machine = registry
        .add_manual("10.1.1.7", "Rack 7", "Shanghai")
        .await
        .unwrap();
    assert_eq!(machine.origin, MachineOrigin::Manual);
    assert_eq!(machine.display_name, "Rack 7");
    assert_eq!(machine.location, "Shanghai");
    assert!(machine.reachable);
    assert!(machine.capabilities.has_test_case("basic_test.py"));

    let err = registry.add_manual("10.1.1.7", "again", "").await.unwrap_err();
    assert_eq!(err.code(), "HOST_EXISTS");

    let text = std::fs::read_to_string(&file).unwrap();
    assert!(text.contains("Rack 7"));

    let machine = registry
        .update_manual("10.1.1.7", "Rack 8", "Beijing")
        .await
        .unwrap();
    assert_eq!(machine.display_name, "Rack 8");
    assert_eq!(machine.location, "Beijing");

    let err = registry.update_manual("10.1.1.99", "x", "").await.unwrap_err();
    assert_eq!(err.code(), "HOST_NOT_FOUND");

    // Still reachable: demoted to discovered instead of dropped.
    registry.remove_machine("10.1.1.7").await.unwrap();
    let machine = registry.get_machine("10.1.1.7").await.unwrap();
    assert_eq!(machine.origin, MachineOrigin::Discovered);
    assert!(registry.manual_machines().await.is_empty());

    // A second removal evicts the now-discovered record.
    registry.remove_machine("10.1.1.7").await.unwrap();
    assert!(registry.get_machine("10.1.1.7").await.is_none());

    let err = registry.remove_machine("10.1.1.7").await.unwrap_err();
    assert_eq!(err.code(), "HOST_NOT_FOUND");
}

#[tokio::test]
async fn test_discovered_machine_can_be_removed() {
    let probe = FakeProbe::new();
    probe.set("10.9.8.2", FakeHost::online("bench-b"));
    let registry = registry(&probe);

    assert_eq!(registry.run_discovery().await, 1);
    assert!(registry.get_machine("10.9.8.2").await.is_some());

    registry.remove_machine("10.9.8.2").await.unwrap();
    assert!(registry.get_machine("10.9.8.2").await.is_none());
    assert!(registry.list_known_machines().await.is_empty());

    let err = registry.remove_machine("10.9.8.2").await.unwrap_err();
    assert_eq!(err.code(), "HOST_NOT_FOUND");

    // Still reachable, so the next sweep finds it again.
    assert_eq!(registry.run_discovery().await, 1);
    assert!(registry.get_machine("10.9.8.2").await.is_some());
}

#[tokio::test]
async fn test_unreachable_manual_machine_dropped_on_removal() {
    let probe = FakeProbe::new();
    let registry = registry(&probe);

    let machine = registry.add_manual("10.1.1.8", "", "").await.unwrap();
    assert!(!machine.reachable);
    assert_eq!(machine.display_name, "10.1.1.8");

    registry.remove_machine("10.1.1.8").await.unwrap();
    assert!(registry.get_machine("10.1.1.8").await.is_none());
}

#[tokio::test]
async fn test_manual_list_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("manual_hosts.json");
    let probe = FakeProbe::new();

    {
        let registry = FleetRegistry::new(discovery_config(Some(file.clone())), probe.clone());
        registry.add_manual("10.1.1.9", "Bench 9", "").await.unwrap();
    }

    let registry = FleetRegistry::new(discovery_config(Some(file)), probe.clone());
    assert_eq!(registry.load_manual().await, 1);
    let machine = registry.get_machine("10.1.1.9").await.unwrap();
    assert_eq!(machine.display_name, "Bench 9");
    assert!(machine.is_manual());
}

#[tokio::test]
async fn test_malformed_manual_list_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("manual_hosts.json");
    std::fs::write(&file, "[{ broken").unwrap();

    let registry = FleetRegistry::new(discovery_config(Some(file)), FakeProbe::new());
    assert_eq!(registry.load_manual().await, 0);
    assert!(registry.list_known_machines().await.is_empty());
}

#[tokio::test]
async fn test_statuses_merged_with_fleet() {
    let probe = FakeProbe::new();
    probe.set("10.9.8.1", FakeHost::online("bench-a"));
    probe.set("10.9.8.2", FakeHost::online("bench-b"));
    let registry = registry(&probe);
    registry.run_discovery().await;

    let leases = MachineLeaseManager::new(LeaseConfig::in_memory(60_000));
    leases
        .acquire(AcquireRequest::new("10.9.8.1", "u1", "Alice").test_case("caseA"))
        .await
        .unwrap();
    leases
        .acquire(AcquireRequest::new("10.7.7.7", "u2", "Bob").manual())
        .await
        .unwrap();

    let merged = leases.all_statuses_with_fleet(&registry).await;
    let addresses: Vec<&str> = merged.iter().map(|m| m.address.as_str()).collect();
    assert_eq!(addresses, vec!["10.7.7.7", "10.9.8.1", "10.9.8.2"]);

    assert!(merged[0].machine.is_none());
    assert_eq!(merged[0].lease.state, Occupancy::Busy);
    assert_eq!(merged[1].lease.message, "正在被 Alice 使用");
    assert_eq!(merged[2].lease.state, Occupancy::Idle);
    assert!(merged[2].machine.as_ref().unwrap().reachable);
}

#[tokio::test]
async fn test_background_loops_stop_on_shutdown() {
    let probe = FakeProbe::new();
    probe.set("10.9.8.3", FakeHost::online("bench-a"));
    let config = benchfleet::config::DiscoveryConfig {
        discovery_interval_ms: 50,
        health_check_interval_ms: 50,
        ..discovery_config(None)
    };
    let registry = Arc::new(FleetRegistry::new(config, probe.clone()));

    let token = tokio_util::sync::CancellationToken::new();
    let discovery = registry.spawn_discovery_loop(token.clone());
    let health = registry.spawn_health_check_loop(token.clone());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(registry.get_machine("10.9.8.3").await.is_some());

    token.cancel();
    tokio::time::timeout(Duration::from_secs(2), discovery)
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), health)
        .await
        .unwrap()
        .unwrap();
}
