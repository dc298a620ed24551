//! Integration tests for exporter status polling.
//!
//! These tests drive a `StatusMonitor` against a `ScriptedExporter` on a
//! paused tokio clock, so poll intervals and RPC deadlines elapse instantly
//! and deterministically.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use jmp_client::application::status_monitor::{StatusMonitor, StatusMonitorConfig};
use jmp_client::infrastructure::config::ClientConfig;
use jmp_client::infrastructure::mock::{status, ScriptedExporter, StatusStep};
use jmp_client::infrastructure::portal::BlockingPortal;
use jmp_core::{ExporterStatus, RpcError, StatusResponse};
use tokio::runtime::Handle;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(60);

fn config() -> StatusMonitorConfig {
    ClientConfig::default().status_monitor_config()
}

fn started(exporter: &Arc<ScriptedExporter>) -> StatusMonitor {
    let monitor = StatusMonitor::new(exporter.clone(), config());
    monitor.start(&Handle::current());
    monitor
}

// ── Versions ──────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_status_version_never_decreases_while_connected() {
    // Arrange
    let exporter = Arc::new(ScriptedExporter::new("e"));
    for (s, v) in [
        (ExporterStatus::Available, 1),
        (ExporterStatus::BeforeLeaseHook, 3),
        (ExporterStatus::Available, 2),
        (ExporterStatus::BeforeLeaseHook, 4),
        (ExporterStatus::BeforeLeaseHook, 4),
        (ExporterStatus::LeaseReady, 7),
    ] {
        exporter.push_status(Ok(status(s, v)));
    }
    let monitor = StatusMonitor::new(exporter.clone(), config());
    let observed = Arc::new(Mutex::new(Vec::new()));
    let mut rx = monitor.subscribe();
    let collector = {
        let observed = observed.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let s = rx.borrow_and_update().clone();
                observed
                    .lock()
                    .unwrap()
                    .push((s.status_version, s.connection_lost));
            }
        })
    };

    // Act
    monitor.start(&Handle::current());
    assert!(monitor.wait_for_status(ExporterStatus::LeaseReady, WAIT).await);
    monitor.stop().await;
    drop(monitor);
    collector.await.unwrap();

    // Assert
    let versions: Vec<u64> = observed
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, lost)| !lost)
        .map(|(v, _)| *v)
        .collect();
    assert!(versions.windows(2).all(|w| w[0] <= w[1]), "{versions:?}");
    assert_eq!(versions.last(), Some(&7));
}

#[tokio::test(start_paused = true)]
async fn test_missed_transitions_counts_each_skipped_version() {
    // Arrange: 1 -> 3 skips one, 3 -> 2 is stale, 4 -> 7 skips two
    let exporter = Arc::new(ScriptedExporter::new("e"));
    for (s, v) in [
        (ExporterStatus::Available, 1),
        (ExporterStatus::BeforeLeaseHook, 3),
        (ExporterStatus::Available, 2),
        (ExporterStatus::BeforeLeaseHook, 4),
        (ExporterStatus::LeaseReady, 7),
    ] {
        exporter.push_status(Ok(status(s, v)));
    }

    // Act
    let monitor = started(&exporter);
    assert!(monitor.wait_for_status(ExporterStatus::LeaseReady, WAIT).await);

    // Assert
    assert_eq!(monitor.missed_transitions(), 3);
    assert_eq!(monitor.status_version(), 7);
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_large_version_jump_adds_exact_gap() {
    let exporter = Arc::new(ScriptedExporter::new("e"));
    exporter.push_status(Ok(status(ExporterStatus::Available, 2)));
    exporter.push_status(Ok(status(ExporterStatus::LeaseReady, 9)));

    let monitor = started(&exporter);
    assert!(monitor.wait_for_status(ExporterStatus::LeaseReady, WAIT).await);

    assert_eq!(monitor.missed_transitions(), 6);
    monitor.stop().await;
}

// ── Waiting ───────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_wait_for_current_status_makes_no_rpc() {
    // Arrange
    let exporter = Arc::new(ScriptedExporter::new("e"));
    exporter.set_status(Ok(status(ExporterStatus::LeaseReady, 1)));
    let monitor = started(&exporter);
    assert!(monitor.wait_for_status(ExporterStatus::LeaseReady, WAIT).await);
    let calls_before = exporter.status_calls();

    // Act
    let ready = monitor
        .wait_for_status(ExporterStatus::LeaseReady, Duration::from_secs(1))
        .await;

    // Assert
    assert!(ready);
    assert_eq!(exporter.status_calls(), calls_before);
    assert_eq!(monitor.active_waiters(), 0);
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_any_of_returns_the_matched_status() {
    let exporter = Arc::new(ScriptedExporter::new("e"));
    exporter.push_status(Ok(status(ExporterStatus::BeforeLeaseHook, 1)));
    exporter.push_status(Ok(status(ExporterStatus::BeforeLeaseHookFailed, 2)));
    let monitor = started(&exporter);

    let hit = monitor
        .wait_for_any_of(
            &[ExporterStatus::LeaseReady, ExporterStatus::BeforeLeaseHookFailed],
            WAIT,
        )
        .await;

    assert_eq!(hit, Some(ExporterStatus::BeforeLeaseHookFailed));
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_wait_never_exceeds_its_timeout_when_the_loop_is_wedged() {
    // Arrange: the RPC never answers and its own deadline is far away
    let exporter = Arc::new(ScriptedExporter::new("e"));
    exporter.push_step(StatusStep::Stall);
    let monitor = StatusMonitor::new(
        exporter.clone(),
        StatusMonitorConfig {
            rpc_timeout: Duration::from_secs(3600),
            ..config()
        },
    );
    monitor.start(&Handle::current());

    // Act
    let started_at = Instant::now();
    let ready = monitor
        .wait_for_status(ExporterStatus::LeaseReady, Duration::from_secs(2))
        .await;

    // Assert
    assert!(!ready);
    let waited = started_at.elapsed();
    assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3));
    monitor.stop().await;
}

// ── Timeouts and connection loss ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_timeouts_below_threshold_keep_the_connection() {
    // Arrange: N-1 timeouts then success
    let threshold = config().timeout_streak_threshold;
    let exporter = Arc::new(ScriptedExporter::new("e"));
    for _ in 0..threshold - 1 {
        exporter.push_status(Err(RpcError::deadline_exceeded("slow")));
    }
    exporter.push_status(Ok(status(ExporterStatus::LeaseReady, 1)));

    // Act
    let monitor = started(&exporter);
    let ready = monitor.wait_for_status(ExporterStatus::LeaseReady, WAIT).await;

    // Assert
    assert!(ready);
    assert!(!monitor.connection_lost());
    assert_eq!(exporter.status_calls(), threshold as usize);
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_at_threshold_lose_the_connection() {
    // Arrange: N timeouts; the success after them is never polled
    let threshold = config().timeout_streak_threshold;
    let exporter = Arc::new(ScriptedExporter::new("e"));
    for _ in 0..threshold {
        exporter.push_status(Err(RpcError::deadline_exceeded("slow")));
    }
    exporter.push_status(Ok(status(ExporterStatus::LeaseReady, 1)));

    // Act
    let monitor = started(&exporter);
    let ready = monitor.wait_for_status(ExporterStatus::LeaseReady, WAIT).await;

    // Assert
    assert!(!ready);
    assert!(monitor.connection_lost());
    assert_eq!(exporter.status_calls(), threshold as usize);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_streak_resets_after_success() {
    let threshold = config().timeout_streak_threshold;
    let exporter = Arc::new(ScriptedExporter::new("e"));
    for v in 1..=2 {
        for _ in 0..threshold - 1 {
            exporter.push_status(Err(RpcError::deadline_exceeded("slow")));
        }
        exporter.push_status(Ok(status(ExporterStatus::BeforeLeaseHook, v)));
    }
    exporter.push_status(Ok(status(ExporterStatus::LeaseReady, 3)));

    let monitor = started(&exporter);
    let ready = monitor.wait_for_status(ExporterStatus::LeaseReady, WAIT).await;

    assert!(ready);
    assert!(!monitor.connection_lost());
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_single_unavailable_loses_connection_immediately() {
    // Arrange: a short timeout streak, then one UNAVAILABLE
    let exporter = Arc::new(ScriptedExporter::new("e"));
    for _ in 0..3 {
        exporter.push_status(Err(RpcError::deadline_exceeded("slow")));
    }
    exporter.push_status(Err(RpcError::unavailable("connection reset")));
    exporter.push_status(Ok(status(ExporterStatus::LeaseReady, 1)));

    // Act
    let monitor = started(&exporter);
    let ready = monitor.wait_for_status(ExporterStatus::LeaseReady, WAIT).await;

    // Assert
    assert!(!ready);
    assert!(monitor.connection_lost());
    assert_eq!(exporter.status_calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_lost_connection_heals_on_next_wait_and_refreshes_message() {
    // Arrange
    let exporter = Arc::new(ScriptedExporter::new("e"));
    exporter.push_status(Ok(StatusResponse {
        status: ExporterStatus::BeforeLeaseHook,
        status_version: 1,
        message: "hook running".to_string(),
        previous_status: None,
    }));
    exporter.push_status(Err(RpcError::unavailable("gone")));
    let monitor = started(&exporter);
    assert!(!monitor.wait_for_status(ExporterStatus::LeaseReady, WAIT).await);
    assert!(monitor.connection_lost());
    assert_eq!(monitor.status_message(), "hook running");

    exporter.set_status(Ok(StatusResponse {
        status: ExporterStatus::LeaseReady,
        status_version: 2,
        message: "ready for use".to_string(),
        previous_status: Some(ExporterStatus::BeforeLeaseHook),
    }));

    // Act
    let ready = monitor.wait_for_status(ExporterStatus::LeaseReady, WAIT).await;

    // Assert
    assert!(ready);
    assert!(!monitor.connection_lost());
    assert_eq!(monitor.status_message(), "ready for use");
    assert!(monitor.snapshot().polling, "poll loop restarts after healing");

    let calls = exporter.status_calls();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(exporter.status_calls() > calls);
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_verification_poll_is_made_exactly_once_when_still_lost() {
    let exporter = Arc::new(ScriptedExporter::new("e"));
    exporter.push_status(Err(RpcError::unavailable("gone")));
    let monitor = started(&exporter);
    assert!(!monitor.wait_for_status(ExporterStatus::LeaseReady, WAIT).await);
    let calls = exporter.status_calls();

    let ready = monitor.wait_for_status(ExporterStatus::LeaseReady, WAIT).await;

    assert!(!ready);
    assert!(monitor.connection_lost());
    assert_eq!(exporter.status_calls(), calls + 1);
}

// ── Older exporters ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_unimplemented_status_falls_back_to_lease_ready() {
    // Arrange
    let exporter = Arc::new(ScriptedExporter::new("e"));
    exporter.set_status(Err(RpcError::unimplemented("GetStatus")));
    let monitor = started(&exporter);
    let started_at = Instant::now();

    // Act
    let ready = monitor.wait_for_status(ExporterStatus::LeaseReady, WAIT).await;
    let other = monitor.wait_for_status(ExporterStatus::Available, WAIT).await;

    // Assert: both answers come well before the caller's timeout
    assert!(ready);
    assert!(!other);
    assert!(started_at.elapsed() < Duration::from_secs(1));
    assert!(!monitor.connection_lost());
    assert!(monitor.snapshot().status_unsupported);

    tokio::time::sleep(WAIT).await;
    assert_eq!(exporter.status_calls(), 1, "no polling after the fallback");
}

// ── Synchronous callers ───────────────────────────────────────────────────────

#[test]
fn test_monitor_is_usable_from_synchronous_code_through_the_portal() {
    // Arrange
    let portal = BlockingPortal::start().expect("portal starts");
    let exporter = Arc::new(ScriptedExporter::new("e"));
    exporter.push_status(Ok(status(ExporterStatus::BeforeLeaseHook, 1)));
    exporter.push_status(Ok(status(ExporterStatus::LeaseReady, 2)));
    let monitor = Arc::new(StatusMonitor::new(exporter.clone(), config()));
    monitor.start(portal.handle());

    // Act
    let ready = {
        let monitor = monitor.clone();
        portal
            .call(async move {
                monitor
                    .wait_for_status(ExporterStatus::LeaseReady, Duration::from_secs(10))
                    .await
            })
            .expect("portal call completes")
    };

    // Assert
    assert!(ready);
    let stopper = monitor.clone();
    portal
        .call(async move { stopper.stop().await })
        .expect("stop completes");
    assert!(!monitor.snapshot().polling);
}
