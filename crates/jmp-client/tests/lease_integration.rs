//! Integration tests for lease acquisition and monitoring.
//!
//! `LeaseManager` runs against the `InMemoryController` fake.  Monitor tests
//! use a paused tokio clock together with `PausedClock`, so lease end times
//! computed from wall-clock timestamps advance in step with tokio timers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jmp_client::application::lease::{Clock, LeaseConfig, LeaseError, LeaseManager};
use jmp_client::infrastructure::mock::{InMemoryController, PausedClock};
use jmp_core::domain::lease::{condition_type, Condition, ConditionStatus};
use jmp_core::{Exporter, Lease};
use tokio::runtime::Handle;

const EXPORTER: &str = "namespaces/lab/exporters/rpi-01";

fn config() -> LeaseConfig {
    LeaseConfig {
        namespace: "lab".to_string(),
        ..LeaseConfig::default()
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn minutes(m: i64) -> chrono::Duration {
    chrono::Duration::minutes(m)
}

/// A ready lease that began at `begin` for `duration`, with no end time yet.
fn running_lease(name: &str, begin: DateTime<Utc>, duration: Duration) -> Lease {
    Lease {
        namespace: "lab".to_string(),
        name: name.to_string(),
        selector: "board=rpi4".to_string(),
        duration,
        begin_time: None,
        effective_begin_time: Some(begin),
        effective_end_time: None,
        effective_duration: None,
        client: "alice".to_string(),
        exporter: Some(EXPORTER.to_string()),
        conditions: vec![Condition::new(
            condition_type::READY,
            ConditionStatus::True,
            "Scheduled",
            "",
        )],
    }
}

type Recorded = Arc<Mutex<Vec<Duration>>>;

fn record_endings(manager: &LeaseManager) -> Recorded {
    let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = recorded.clone();
    manager.on_ending(move |_, remaining| sink.lock().unwrap().push(remaining));
    recorded
}

// ── Acquisition and CRUD ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_request_list_and_release_round_trip() {
    // Arrange
    let controller = Arc::new(InMemoryController::new());
    controller.grant_on_create(EXPORTER);
    let manager = LeaseManager::new(controller.clone(), config());

    // Act
    let lease = manager
        .request("board=rpi4", Duration::from_secs(1800), None)
        .await
        .expect("lease granted");
    let listed = manager.list_all(None).await.expect("list");
    manager.release().await.expect("release");

    // Assert
    assert!(lease.is_ready());
    assert_eq!(lease.exporter.as_deref(), Some(EXPORTER));
    assert_eq!(listed.len(), 1);
    assert!(controller.leases.lock().unwrap().is_empty());
    assert_eq!(manager.name(), None);
}

#[tokio::test(start_paused = true)]
async fn test_request_waits_until_the_controller_grants() {
    // Arrange
    let controller = Arc::new(InMemoryController::new());
    let manager = LeaseManager::new(controller.clone(), config());
    let granter = {
        let controller = controller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            let id = controller
                .leases
                .lock()
                .unwrap()
                .keys()
                .next()
                .cloned()
                .expect("lease was created");
            controller.grant(&id, EXPORTER, Utc::now());
        })
    };
    let started = tokio::time::Instant::now();

    // Act
    let lease = manager
        .request("board=rpi4", Duration::from_secs(600), None)
        .await
        .expect("lease granted");

    // Assert
    granter.await.unwrap();
    assert!(lease.is_ready());
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(controller.get_calls() >= 3);
}

#[tokio::test]
async fn test_request_fails_when_lease_stops_pending_without_ready() {
    let controller = Arc::new(InMemoryController::new());
    let manager = LeaseManager::new(controller.clone(), config());
    let mut lease = running_lease("l1", t0(), Duration::from_secs(60));
    lease.conditions = vec![Condition::new(
        condition_type::PENDING,
        ConditionStatus::False,
        "Expired",
        "lease expired before it was scheduled",
    )];
    controller.insert(lease);
    manager.adopt("l1");

    let err = manager
        .request("board=rpi4", Duration::from_secs(60), None)
        .await
        .unwrap_err();

    assert!(matches!(err, LeaseError::NotPending { .. }), "{err}");
}

#[tokio::test]
async fn test_update_and_delete_go_through_the_controller() {
    let controller = Arc::new(InMemoryController::new());
    controller.insert(running_lease("l1", t0(), Duration::from_secs(1800)));
    let manager = LeaseManager::new(controller.clone(), config());

    let updated = manager
        .update("l1", Some(Duration::from_secs(3600)), None)
        .await
        .unwrap();
    manager.delete("l1").await.unwrap();
    let missing = manager.get("l1").await;

    assert_eq!(updated.duration, Duration::from_secs(3600));
    assert!(matches!(missing, Err(LeaseError::Rpc(_))));
}

#[tokio::test]
async fn test_list_exporters_applies_selector_across_pages() {
    let controller = Arc::new(InMemoryController::new());
    for (name, board) in [("a", "rpi4"), ("b", "qemu"), ("c", "rpi4")] {
        controller.exporters.lock().unwrap().push(Exporter {
            namespace: "lab".to_string(),
            name: name.to_string(),
            labels: BTreeMap::from([("board".to_string(), board.to_string())]),
        });
    }
    let manager = LeaseManager::new(controller.clone(), config());

    let exporters = manager.list_exporters(Some("board=rpi4")).await.unwrap();
    let one = manager.get_exporter("b").await.unwrap();

    let names: Vec<_> = exporters.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["a", "c"]);
    assert_eq!(one.labels["board"], "qemu");
}

// ── Monitoring ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_monitor_uses_cached_end_when_refresh_fails_after_expiry() {
    // Arrange: lease began at T for 30m, no effective end time; now is T+29m
    let controller = Arc::new(InMemoryController::new());
    controller.insert(running_lease("l1", t0(), Duration::from_secs(30 * 60)));
    let clock = Arc::new(PausedClock::starting_at(t0() + minutes(29)));
    let manager = Arc::new(LeaseManager::with_clock(
        controller.clone(),
        config(),
        clock.clone(),
    ));
    manager.adopt("l1");
    let endings = record_endings(&manager);

    // Act: the controller stops answering shortly after the first refreshes
    manager.monitor(&Handle::current()).expect("monitor starts");
    tokio::time::sleep(Duration::from_secs(10)).await;
    controller.set_stalled(true);
    tokio::time::sleep(Duration::from_secs(110)).await;

    // Assert: a warning with about a minute left, then zero by T+31m
    let endings = endings.lock().unwrap().clone();
    assert_eq!(endings.len(), 2, "{endings:?}");
    assert!(endings[0] <= Duration::from_secs(60) && endings[0] > Duration::from_secs(50));
    assert_eq!(endings[1], Duration::ZERO);
    assert!(clock.now() <= t0() + minutes(31));
    assert!(!manager.is_monitoring());
}

#[tokio::test(start_paused = true)]
async fn test_monitor_keeps_running_when_extended_in_the_last_interval() {
    // Arrange: two seconds left, and the controller takes a moment to answer
    let controller = Arc::new(InMemoryController::new());
    controller.insert(running_lease("l1", t0(), Duration::from_secs(30 * 60)));
    controller.set_latency(Duration::from_millis(10));
    let clock = Arc::new(PausedClock::starting_at(
        t0() + minutes(29) + chrono::Duration::seconds(58),
    ));
    let manager = Arc::new(LeaseManager::with_clock(controller.clone(), config(), clock));
    manager.adopt("l1");
    let endings = record_endings(&manager);

    // Act: extend to 40m before the refresh at the old end time
    manager.monitor(&Handle::current()).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    manager
        .update("l1", Some(Duration::from_secs(40 * 60)), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    // Assert: only the first warning, and the monitor saw the new end
    let endings = endings.lock().unwrap().clone();
    assert_eq!(endings.len(), 1, "{endings:?}");
    assert!(endings[0] > Duration::ZERO && endings[0] <= Duration::from_secs(2));
    assert!(manager.is_monitoring());
    assert!(controller.get_calls() >= 2);
    manager.stop_monitor().await;
}

#[tokio::test(start_paused = true)]
async fn test_monitor_rejects_negative_retry_multiplier() {
    let controller = Arc::new(InMemoryController::new());
    controller.set_unreachable(true);
    let manager = Arc::new(LeaseManager::new(
        controller.clone(),
        LeaseConfig {
            retry_multiplier: -1.0,
            ..config()
        },
    ));
    manager.adopt("l1");

    let result = manager.monitor(&Handle::current());
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(matches!(result, Err(LeaseError::Validation(_))));
    assert!(!manager.is_monitoring());
    assert_eq!(controller.get_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_warns_once_per_end_time() {
    // Arrange: 4 minutes left, under the 5 minute threshold
    let controller = Arc::new(InMemoryController::new());
    controller.insert(running_lease("l1", t0(), Duration::from_secs(30 * 60)));
    let clock = Arc::new(PausedClock::starting_at(t0() + minutes(26)));
    let manager = Arc::new(LeaseManager::with_clock(controller.clone(), config(), clock));
    manager.adopt("l1");
    let endings = record_endings(&manager);
    manager.monitor(&Handle::current()).unwrap();

    // Act: refreshes every 5s at the same end time, then an extension
    tokio::time::sleep(Duration::from_secs(62)).await;
    let warnings_before_extension = endings.lock().unwrap().len();
    manager
        .update("l1", Some(Duration::from_secs(31 * 60)), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    // Assert
    let endings = endings.lock().unwrap().clone();
    assert_eq!(warnings_before_extension, 1);
    assert_eq!(endings.len(), 2, "{endings:?}");
    assert_eq!(endings[0], Duration::from_secs(240));
    // First refresh after the update lands at 65s, 235s before the new end.
    assert_eq!(endings[1], Duration::from_secs(235));
    manager.stop_monitor().await;
}

#[tokio::test(start_paused = true)]
async fn test_monitor_retries_with_backoff_before_any_end_time_is_known() {
    // Arrange: the controller is down from the start
    let controller = Arc::new(InMemoryController::new());
    controller.set_unreachable(true);
    let manager = Arc::new(LeaseManager::new(controller.clone(), config()));
    manager.adopt("l1");
    let endings = record_endings(&manager);

    // Act
    manager.monitor(&Handle::current()).unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    // Assert: refreshes at 0, 1, 3, 7, 15 and 31 seconds
    assert_eq!(controller.get_calls(), 6);
    assert!(endings.lock().unwrap().is_empty());
    assert!(manager.is_monitoring());
    manager.stop_monitor().await;
    assert!(!manager.is_monitoring());
}

#[tokio::test(start_paused = true)]
async fn test_monitor_reports_zero_once_for_a_lease_that_already_ended() {
    let controller = Arc::new(InMemoryController::new());
    let mut lease = running_lease("l1", t0(), Duration::from_secs(600));
    lease.effective_end_time = Some(t0() + minutes(5));
    controller.insert(lease);
    let clock = Arc::new(PausedClock::starting_at(t0() + minutes(6)));
    let manager = Arc::new(LeaseManager::with_clock(controller.clone(), config(), clock));
    manager.adopt("l1");
    let endings = record_endings(&manager);

    manager.monitor(&Handle::current()).unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(*endings.lock().unwrap(), [Duration::ZERO]);
    assert_eq!(controller.get_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_release_stops_the_monitor_and_deletes_the_lease() {
    let controller = Arc::new(InMemoryController::new());
    controller.insert(running_lease("l1", t0(), Duration::from_secs(1800)));
    let clock = Arc::new(PausedClock::starting_at(t0()));
    let manager = Arc::new(LeaseManager::with_clock(controller.clone(), config(), clock));
    manager.adopt("l1");
    manager.monitor(&Handle::current()).unwrap();
    tokio::time::sleep(Duration::from_secs(12)).await;
    let calls = controller.get_calls();

    manager.release().await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(!manager.is_monitoring());
    assert_eq!(controller.get_calls(), calls);
    assert!(controller.leases.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_monitor_without_a_lease_is_rejected() {
    let manager = Arc::new(LeaseManager::new(
        Arc::new(InMemoryController::new()),
        config(),
    ));
    assert!(matches!(
        manager.monitor(&Handle::current()),
        Err(LeaseError::NoActiveLease)
    ));
}
