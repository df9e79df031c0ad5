//! Orchestrator integration tests against the in-memory runtime.
//!
//! Covers rotation sizing and ordering, gap-filling reconciliation, cleanup,
//! cycle exclusion and runtime timeouts.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;
use vpnpool_manager::{
    directory::StaticDirectory,
    orchestrator::{
        CleanupReport, MonitorOutcome, OrchestratorConfig, PoolOrchestrator, RotationOrder,
        RotationOutcome,
    },
    runtime::{ContainerRuntime, MockRuntime, RuntimeCommand},
};
use vpnpool_reconcile::{ContainerState, PoolLayout};

struct Harness {
    runtime: Arc<MockRuntime>,
    directory: Arc<StaticDirectory>,
    orchestrator: Arc<PoolOrchestrator>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vpnpool_manager=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

fn harness(capacity: usize, candidates: &[&str], order: RotationOrder) -> Harness {
    harness_with_timeout(capacity, candidates, order, Duration::from_secs(60))
}

fn harness_with_timeout(
    capacity: usize,
    candidates: &[&str],
    order: RotationOrder,
    runtime_timeout: Duration,
) -> Harness {
    init_tracing();

    let layout = PoolLayout::new(capacity, 8881, "nord-vpn-").unwrap();
    let runtime = Arc::new(MockRuntime::new(layout.clone()));
    let directory = Arc::new(StaticDirectory::new(candidates.iter().copied()));
    let orchestrator = Arc::new(PoolOrchestrator::new(
        runtime.clone(),
        directory.clone(),
        OrchestratorConfig {
            layout,
            rotation_order: order,
            runtime_timeout,
        },
    ));

    Harness {
        runtime,
        directory,
        orchestrator,
    }
}

fn endpoints(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[rstest]
#[case::more_candidates_than_slots(3, &["de1", "de2", "de3", "de4", "de5"], 3)]
#[case::fewer_candidates_than_slots(5, &["de1", "de2"], 2)]
#[case::exact_fit(2, &["de1", "de2"], 2)]
#[tokio::test]
async fn test_rotation_creates_min_of_candidates_and_capacity(
    #[case] capacity: usize,
    #[case] candidates: &[&str],
    #[case] expected: usize,
) {
    let h = harness(capacity, candidates, RotationOrder::FetchFirst);

    let RotationOutcome::Completed { slots, failed } = h.orchestrator.rotate().await else {
        panic!("rotation should complete");
    };

    assert_eq!(failed, 0);
    assert_eq!(slots.len(), expected);
    assert_eq!(h.runtime.count_managed().await.unwrap(), expected);

    let ports: HashSet<u16> = slots.iter().map(|s| s.port).collect();
    assert_eq!(ports.len(), expected, "host ports must be distinct");
    for (i, slot) in slots.iter().enumerate() {
        assert_eq!(slot.index, i);
        assert_eq!(slot.name, format!("nord-vpn-{i}"));
        assert_eq!(slot.port, 8881 + i as u16);
        assert!(slot.is_realized());
        assert!(candidates.contains(&slot.endpoint.as_str()));
    }

    let assigned: HashSet<&str> = slots.iter().map(|s| s.endpoint.as_str()).collect();
    assert_eq!(assigned.len(), expected, "each endpoint is used once");
}

#[tokio::test]
async fn test_rotation_replaces_previous_generation() {
    let h = harness(3, &["de1", "de2", "de3", "de4"], RotationOrder::FetchFirst);

    h.orchestrator.rotate().await;
    let first: Vec<String> = (0..3).filter_map(|i| h.runtime.id_for_index(i)).collect();
    assert_eq!(first.len(), 3);

    h.orchestrator.rotate().await;
    let second: Vec<String> = (0..3).filter_map(|i| h.runtime.id_for_index(i)).collect();

    assert_eq!(h.runtime.container_count(), 3);
    assert!(first.iter().all(|id| !second.contains(id)));
    assert_eq!(h.orchestrator.active_ports(), vec![8881, 8882, 8883]);
}

#[tokio::test]
async fn test_rotation_removes_stale_out_of_range_containers() {
    let h = harness(2, &["de1", "de2"], RotationOrder::FetchFirst);
    h.runtime
        .insert_named("nord-vpn-7", 8888, "old", ContainerState::Running);
    h.runtime.insert_named("postgres", 5432, "", ContainerState::Running);

    h.orchestrator.rotate().await;

    // Unmanaged container survives; stale slot 7 is gone.
    assert_eq!(h.runtime.container_count(), 3);
    let managed = h.runtime.list_managed().await.unwrap();
    assert!(managed.iter().all(|c| c.name != "nord-vpn-7"));
}

#[tokio::test]
async fn test_fetch_first_keeps_pool_without_candidates() {
    let h = harness(2, &["de1", "de2"], RotationOrder::FetchFirst);
    h.orchestrator.rotate().await;
    let before = h.orchestrator.active_slots();

    h.directory.set_candidates(Vec::<String>::new());
    h.runtime.clear_commands();

    let outcome = h.orchestrator.rotate().await;

    assert_eq!(outcome, RotationOutcome::Aborted { cleaned_up: false });
    assert!(h.runtime.mutations().is_empty());
    assert_eq!(h.runtime.container_count(), 2);
    assert_eq!(h.orchestrator.active_slots(), before);
}

#[tokio::test]
async fn test_cleanup_first_empties_pool_without_candidates() {
    let h = harness(2, &["de1", "de2"], RotationOrder::CleanupFirst);
    h.orchestrator.rotate().await;

    h.directory.set_candidates(Vec::<String>::new());
    let outcome = h.orchestrator.rotate().await;

    assert_eq!(outcome, RotationOutcome::Aborted { cleaned_up: true });
    assert_eq!(h.runtime.container_count(), 0);
    assert!(h.orchestrator.active_slots().is_empty());
}

#[tokio::test]
async fn test_directory_failure_behaves_like_empty_result() {
    let h = harness(2, &[], RotationOrder::FetchFirst);
    let failing = Arc::new(StaticDirectory::failing());
    let orchestrator = PoolOrchestrator::new(
        h.runtime.clone(),
        failing.clone(),
        OrchestratorConfig {
            layout: h.orchestrator.layout().clone(),
            ..OrchestratorConfig::default()
        },
    );

    let outcome = orchestrator.rotate().await;

    assert_eq!(outcome, RotationOutcome::Aborted { cleaned_up: false });
    assert_eq!(failing.calls(), 1);
}

#[tokio::test]
async fn test_rotation_scenario_then_reconcile_fills_single_gap() {
    let h = harness(3, &["de1", "de2", "de3", "de4"], RotationOrder::FetchFirst);

    let RotationOutcome::Completed { slots, .. } = h.orchestrator.rotate().await else {
        panic!("rotation should complete");
    };
    let ports: Vec<u16> = slots.iter().map(|s| s.port).collect();
    assert_eq!(ports, vec![8881, 8882, 8883]);

    // Slot 1 disappears out from under the pool.
    let id = h.runtime.id_for_index(1).unwrap();
    h.runtime.remove(&id, true).await.unwrap();
    h.runtime.clear_commands();

    let created = h
        .orchestrator
        .reconcile(&endpoints(&["x", "fr9", "y"]))
        .await
        .unwrap();

    assert_eq!(created.len(), 1);
    assert_eq!(created[0].name, "nord-vpn-1");
    assert_eq!(created[0].port, 8882);
    assert_eq!(created[0].endpoint, "fr9");
    assert_eq!(
        h.runtime.mutations(),
        vec![RuntimeCommand::Create {
            index: 1,
            endpoint: "fr9".to_string()
        }]
    );
    assert_eq!(h.runtime.endpoint_for_index(1).as_deref(), Some("fr9"));
}

#[tokio::test]
async fn test_reconcile_at_capacity_issues_no_mutations() {
    let h = harness(3, &["de1", "de2", "de3"], RotationOrder::FetchFirst);
    h.orchestrator.rotate().await;
    h.runtime.clear_commands();

    let created = h
        .orchestrator
        .reconcile(&endpoints(&["a", "b", "c"]))
        .await
        .unwrap();

    assert!(created.is_empty());
    assert!(h.runtime.mutations().is_empty());
}

#[tokio::test]
async fn test_reconcile_never_stops_or_removes() {
    let h = harness(3, &[], RotationOrder::FetchFirst);
    h.runtime.insert_container(0, "de1", ContainerState::Running);
    h.runtime.insert_container(1, "de2", ContainerState::Exited);
    h.runtime
        .insert_named("nord-vpn-9", 8899, "old", ContainerState::Running);
    h.runtime
        .insert_named("nord-vpn-backup", 9000, "", ContainerState::Exited);

    h.orchestrator
        .reconcile(&endpoints(&["a", "b", "c"]))
        .await
        .unwrap();

    let mutations = h.runtime.mutations();
    assert!(mutations
        .iter()
        .all(|c| !matches!(c, RuntimeCommand::Stop(_) | RuntimeCommand::Remove { .. })));
    assert_eq!(h.runtime.container_count(), 5);
}

#[tokio::test]
async fn test_reconcile_without_candidates_only_restarts() {
    let h = harness(2, &[], RotationOrder::FetchFirst);
    let stopped = h.runtime.insert_container(0, "de1", ContainerState::Exited);

    let created = h.orchestrator.reconcile(&[]).await.unwrap();

    assert!(created.is_empty());
    assert_eq!(h.runtime.mutations(), vec![RuntimeCommand::Start(stopped)]);
}

#[tokio::test]
async fn test_monitor_restarts_restarting_slot_without_creating() {
    let h = harness(5, &["de1", "de2", "de3", "de4", "de5"], RotationOrder::FetchFirst);
    let mut restarting = String::new();
    for i in 0..5 {
        let state = if i == 2 {
            ContainerState::Restarting
        } else {
            ContainerState::Running
        };
        let id = h.runtime.insert_container(i, &format!("de{}", i + 1), state);
        if i == 2 {
            restarting = id;
        }
    }

    let outcome = h.orchestrator.monitor_tick().await;

    assert_eq!(
        outcome,
        MonitorOutcome::Repaired {
            running: 4,
            created: 0
        }
    );
    assert_eq!(h.runtime.mutations(), vec![RuntimeCommand::Start(restarting)]);
    assert_eq!(h.runtime.count_managed().await.unwrap(), 5);
}

#[tokio::test]
async fn test_monitor_ignores_stale_out_of_range_container() {
    let h = harness(2, &["de1", "de2"], RotationOrder::FetchFirst);
    h.runtime.insert_container(0, "de1", ContainerState::Running);
    // Left over from a larger pool; it must not stand in for slot 1.
    h.runtime
        .insert_named("nord-vpn-7", 8888, "old", ContainerState::Running);

    let outcome = h.orchestrator.monitor_tick().await;

    assert_eq!(
        outcome,
        MonitorOutcome::Repaired {
            running: 1,
            created: 1
        }
    );
    assert!(h.runtime.id_for_index(1).is_some());
    assert_eq!(h.runtime.container_count(), 3);
}

#[tokio::test]
async fn test_monitor_healthy_at_capacity() {
    let h = harness(2, &["de1", "de2"], RotationOrder::FetchFirst);
    h.orchestrator.rotate().await;
    h.runtime.clear_commands();

    let outcome = h.orchestrator.monitor_tick().await;

    assert_eq!(outcome, MonitorOutcome::Healthy { running: 2 });
    assert!(h.runtime.mutations().is_empty());
    assert_eq!(h.directory.calls(), 1, "healthy ticks do not query the directory");
}

#[tokio::test]
async fn test_monitor_defers_while_cycle_in_progress() {
    let h = harness(2, &["de1", "de2"], RotationOrder::FetchFirst);

    let _guard = h.orchestrator.try_begin_cycle().unwrap();
    let outcome = h.orchestrator.monitor_tick().await;

    assert_eq!(outcome, MonitorOutcome::Deferred);
    assert!(h.runtime.commands().is_empty());
}

#[tokio::test]
async fn test_partial_pool_when_create_fails() {
    let h = harness(3, &["de1", "de2", "de3"], RotationOrder::FetchFirst);
    h.runtime.fail_create_for(1);

    let RotationOutcome::Completed { slots, failed } = h.orchestrator.rotate().await else {
        panic!("rotation should complete");
    };

    assert_eq!(failed, 1);
    assert_eq!(slots.len(), 2);
    assert_eq!(h.orchestrator.active_ports(), vec![8881, 8883]);
    assert_eq!(h.runtime.count_managed().await.unwrap(), 2);
}

#[tokio::test]
async fn test_cleanup_continues_past_failures() {
    let h = harness(3, &[], RotationOrder::FetchFirst);
    let broken = h.runtime.insert_container(0, "de1", ContainerState::Running);
    h.runtime.insert_container(1, "de2", ContainerState::Running);
    h.runtime.insert_container(2, "de3", ContainerState::Exited);
    h.runtime.fail_commands_for(&broken);

    let report = h.orchestrator.cleanup().await;

    assert_eq!(
        report,
        CleanupReport {
            stopped: 1,
            removed: 2,
            failed: 2
        }
    );
    assert_eq!(h.runtime.container_count(), 1);
    assert_eq!(h.runtime.id_for_index(0), Some(broken));
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let h = harness(2, &["de1", "de2"], RotationOrder::FetchFirst);
    h.orchestrator.rotate().await;

    let first = h.orchestrator.cleanup().await;
    assert_eq!(first.removed, 2);
    h.runtime.clear_commands();

    let second = h.orchestrator.cleanup().await;

    assert_eq!(second, CleanupReport::default());
    assert!(h.runtime.mutations().is_empty());
    assert_eq!(h.runtime.container_count(), 0);
}

#[tokio::test]
async fn test_shutdown_removes_everything() {
    let h = harness(3, &["de1", "de2", "de3"], RotationOrder::FetchFirst);
    h.orchestrator.rotate().await;

    let report = h.orchestrator.shutdown().await;

    assert_eq!(report.removed, 3);
    assert_eq!(report.stopped, 3);
    assert_eq!(h.runtime.container_count(), 0);
    assert!(h.orchestrator.active_slots().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_rotation_is_dropped() {
    let h = harness(2, &["de1", "de2"], RotationOrder::FetchFirst);
    h.runtime.set_delay(Duration::from_millis(100));

    let first = tokio::spawn({
        let orchestrator = Arc::clone(&h.orchestrator);
        async move { orchestrator.rotate().await }
    });

    while !h.orchestrator.is_cycle_in_progress() {
        tokio::task::yield_now().await;
    }

    let calls_before = h.directory.calls();
    let commands_before = h.runtime.commands().len();

    let second = h.orchestrator.rotate().await;

    assert_eq!(second, RotationOutcome::Skipped);
    assert_eq!(h.directory.calls(), calls_before);
    assert_eq!(h.runtime.commands().len(), commands_before);

    let first = first.await.unwrap();
    assert!(matches!(first, RotationOutcome::Completed { ref slots, .. } if slots.len() == 2));
    assert!(!h.orchestrator.is_cycle_in_progress());
}

#[tokio::test(start_paused = true)]
async fn test_runtime_timeouts_fold_into_failures() {
    let h = harness_with_timeout(
        2,
        &["de1", "de2"],
        RotationOrder::FetchFirst,
        Duration::from_secs(1),
    );
    h.runtime.set_delay(Duration::from_secs(5));

    let RotationOutcome::Completed { slots, failed } = h.orchestrator.rotate().await else {
        panic!("rotation should complete");
    };
    assert!(slots.is_empty());
    assert_eq!(failed, 2);
    assert_eq!(h.runtime.container_count(), 0);

    assert_eq!(h.orchestrator.monitor_tick().await, MonitorOutcome::Unavailable);
    assert_eq!(h.orchestrator.cleanup().await, CleanupReport::default());
}
