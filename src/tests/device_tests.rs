use super::support::*;
use crate::config::NatConfig;
use crate::connectivity::upnp::{ADD_PORT_MAPPING, DELETE_PORT_MAPPING};
use crate::connectivity::*;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

fn expired_session(private_port: u16, public_port: u16) -> Mapping {
    Mapping::new_at(
        Protocol::TCP,
        Some(local_ip()),
        private_port,
        public_port,
        Mapping::SESSION_LIFETIME,
        "session",
        Utc::now() - ChronoDuration::hours(1),
    )
    .unwrap()
}

/// Fails deletes for one external port, accepts everything else
fn router_failing_delete_of(port: &'static str) -> Arc<FakeRouter> {
    FakeRouter::new(move |call| {
        if call.action == DELETE_PORT_MAPPING && call.arg("NewExternalPort") == Some(port) {
            fault(FaultCode::Unauthorized)
        } else {
            ok(&call.action, &[])
        }
    })
}

// ========================================================================
// MappingSet
// ========================================================================

#[tokio::test]
async fn test_mapping_set_register_replaces() {
    let set = MappingSet::new();
    set.register(tcp(1000, 2000, 60)).await;
    set.register(tcp(1000, 2000, 0)).await;
    set.register(tcp(1001, 2001, 0)).await;

    assert_eq!(set.len().await, 2);
    let stored = set.get((2000, 1000)).await.unwrap();
    assert_eq!(stored.kind(), MappingKind::Permanent);

    let removed = set.unregister(&tcp(1000, 2000, 0)).await;
    assert!(removed.is_some());
    assert_eq!(set.len().await, 1);
    assert!(set.unregister(&tcp(1000, 2000, 0)).await.is_none());
}

#[tokio::test]
async fn test_mapping_set_clones_share_state() {
    let set = MappingSet::new();
    let other = set.clone();
    set.register(tcp(1, 1, 0)).await;

    assert!(other.contains(&tcp(1, 1, 0)).await);
}

// ========================================================================
// Release
// ========================================================================

#[tokio::test]
async fn test_release_continues_after_failure() {
    let router = router_failing_delete_of("3003");
    let logger = CapturingLogger::new();
    let device = device_with(router.clone(), logger.clone(), &test_config());

    let mut created = Vec::new();
    for port in 3001..=3005 {
        created.push(device.create_port_map(tcp(port, port, 0)).await.unwrap());
    }

    let report = device.release_mappings(created).await;

    assert_eq!(report.released.len(), 4);
    assert_eq!(report.failed.len(), 1);
    assert!(!report.is_complete());
    assert_eq!(report.failed[0].0.public_port(), 3003);
    assert_eq!(report.failed[0].1.fault_code(), Some(606));
    assert_eq!(router.calls_for(DELETE_PORT_MAPPING).len(), 5);

    let owned = device.owned().snapshot().await;
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].public_port(), 3003);
    assert!(logger.has(Level::Warn, "Failed to release"));
}

#[tokio::test]
async fn test_release_session_mappings_only() {
    let router = FakeRouter::accepting();
    let device = device_with(router.clone(), CapturingLogger::new(), &test_config());

    device
        .create_port_map(tcp(4001, 4001, Mapping::SESSION_LIFETIME))
        .await
        .unwrap();
    device.create_port_map(tcp(4002, 4002, 0)).await.unwrap();
    device.create_port_map(tcp(4003, 4003, 3600)).await.unwrap();

    let report = device.release_session_mappings().await;

    assert!(report.is_complete());
    assert_eq!(report.released.len(), 1);
    assert_eq!(report.released[0].public_port(), 4001);

    let deletes = router.calls_for(DELETE_PORT_MAPPING);
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].arg("NewExternalPort"), Some("4001"));
    assert_eq!(device.owned().len().await, 2);
}

#[tokio::test]
async fn test_release_all() {
    let router = FakeRouter::accepting();
    let device = device_with(router.clone(), CapturingLogger::new(), &test_config());

    device
        .create_port_map(tcp(5001, 5001, Mapping::SESSION_LIFETIME))
        .await
        .unwrap();
    device.create_port_map(tcp(5002, 5002, 0)).await.unwrap();

    let report = device.release_all().await;

    assert_eq!(report.released.len(), 2);
    assert!(device.owned().is_empty().await);
    assert_eq!(router.calls_for(DELETE_PORT_MAPPING).len(), 2);
}

// ========================================================================
// Renewal
// ========================================================================

#[tokio::test]
async fn test_renew_expired_session() {
    let router = FakeRouter::accepting();
    let device = device_with(router.clone(), CapturingLogger::new(), &test_config());

    let stale = expired_session(6000, 6000);
    let before = stale.expiration();
    device.owned().register(stale.clone()).await;
    device.owned().register(tcp(6001, 6001, 0)).await;

    let renewed = device.renew_mappings().await;

    assert_eq!(renewed, 1);
    let adds = router.calls_for(ADD_PORT_MAPPING);
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0].arg("NewExternalPort"), Some("6000"));
    assert_eq!(adds[0].arg("NewLeaseDuration"), Some("600"));

    let stored = device.owned().get(stale.key()).await.unwrap();
    assert!(stored.expiration() > before);
    assert!(!stored.should_renew());
}

#[tokio::test]
async fn test_renew_skips_fresh_and_non_session_mappings() {
    let router = FakeRouter::accepting();
    let device = device_with(router.clone(), CapturingLogger::new(), &test_config());

    device
        .owned()
        .register(tcp(6100, 6100, Mapping::SESSION_LIFETIME))
        .await;
    device.owned().register(tcp(6101, 6101, 0)).await;
    let stale_manual = Mapping::new_at(
        Protocol::UDP,
        Some(local_ip()),
        6102,
        6102,
        60,
        "manual",
        Utc::now() - ChronoDuration::hours(1),
    )
    .unwrap();
    device.owned().register(stale_manual).await;

    assert_eq!(device.renew_mappings().await, 0);
    assert!(router.calls().is_empty());
}

#[tokio::test]
async fn test_renew_failure_drops_mapping() {
    let router = FakeRouter::new(|_| fault(FaultCode::ActionFailed));
    let logger = CapturingLogger::new();
    let device = device_with(router.clone(), logger.clone(), &test_config());

    let stale = expired_session(6200, 6200);
    device.owned().register(stale.clone()).await;

    assert_eq!(device.renew_mappings().await, 0);
    assert_eq!(router.calls().len(), 1);
    assert!(!device.owned().contains(&stale).await);
    assert!(logger.has(Level::Warn, "Renewal of"));

    // Nothing left to renew on the following ticks
    assert_eq!(device.renew_mappings().await, 0);
    assert_eq!(device.renew_mappings().await, 0);
    assert_eq!(router.calls().len(), 1);
}

#[tokio::test]
async fn test_renewal_moved_by_gateway_replaces_entry() {
    // Gateway insists on equal internal and external ports
    let router = FakeRouter::new(|call| {
        if call.action == ADD_PORT_MAPPING
            && call.arg("NewExternalPort") != call.arg("NewInternalPort")
        {
            fault(FaultCode::SamePortValuesRequired)
        } else {
            ok(&call.action, &[])
        }
    });
    let device = device_with(router.clone(), CapturingLogger::new(), &test_config());

    let stale = expired_session(6000, 7000);
    device.owned().register(stale.clone()).await;

    assert_eq!(device.renew_mappings().await, 1);
    assert_eq!(device.renew_mappings().await, 0);
    assert_eq!(device.renew_mappings().await, 0);

    let owned = device.owned().snapshot().await;
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].key(), (6000, 6000));
    assert!(!owned[0].should_renew());
    assert!(!device.owned().contains(&stale).await);
    assert_eq!(router.calls_for(ADD_PORT_MAPPING).len(), 2);

    device.release_all().await;
    let deletes = router.calls_for(DELETE_PORT_MAPPING);
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].arg("NewExternalPort"), Some("6000"));
}

fn router_with_slow_adds(delay: Duration) -> Arc<FakeRouter> {
    FakeRouter::new(move |call| {
        if call.action == ADD_PORT_MAPPING {
            Scripted::Delayed(
                delay,
                HttpReply {
                    status: 200,
                    body: ok_body(&call.action, &[]),
                },
            )
        } else {
            ok(&call.action, &[])
        }
    })
}

#[tokio::test]
async fn test_delete_during_renewal_is_not_undone() {
    let router = router_with_slow_adds(Duration::from_millis(50));
    let device = Arc::new(device_with(
        router.clone(),
        CapturingLogger::new(),
        &test_config(),
    ));
    let first = expired_session(8001, 8001);
    let second = expired_session(8002, 8002);
    device.owned().register(first.clone()).await;
    device.owned().register(second.clone()).await;

    let renewing = tokio::spawn({
        let device = device.clone();
        async move { device.renew_mappings().await }
    });

    // One renewal is on the wire when the caller deletes both
    tokio::time::sleep(Duration::from_millis(10)).await;
    device.delete_port_map(&first).await.unwrap();
    device.delete_port_map(&second).await.unwrap();

    assert_eq!(renewing.await.unwrap(), 0);
    assert!(device.owned().is_empty().await);

    let adds = router.calls_for(ADD_PORT_MAPPING);
    assert_eq!(adds.len(), 1);
    let renewed_port = adds[0].arg("NewExternalPort").unwrap().to_string();

    // The late renewal is removed from the gateway again
    let deletes = router.calls_for(DELETE_PORT_MAPPING);
    assert_eq!(deletes.len(), 3);
    assert_eq!(
        deletes
            .iter()
            .filter(|d| d.arg("NewExternalPort") == Some(renewed_port.as_str()))
            .count(),
        2
    );
    assert_eq!(deletes.last().unwrap().nth, router.calls().len() - 1);
}

#[tokio::test]
async fn test_create_during_renewal_is_kept() {
    let router = router_with_slow_adds(Duration::from_millis(30));
    let device = Arc::new(device_with(
        router.clone(),
        CapturingLogger::new(),
        &test_config(),
    ));
    let stale = expired_session(8101, 8101);
    device.owned().register(stale.clone()).await;

    let renewing = tokio::spawn({
        let device = device.clone();
        async move { device.renew_mappings().await }
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    let created = device
        .create_port_map(tcp(8102, 8102, Mapping::SESSION_LIFETIME))
        .await
        .unwrap();

    assert_eq!(renewing.await.unwrap(), 1);

    let renewed = device.owned().get(stale.key()).await.unwrap();
    assert!(!renewed.should_renew());
    assert!(device.owned().contains(&created).await);
    assert_eq!(device.owned().len().await, 2);
    assert_eq!(router.calls_for(ADD_PORT_MAPPING).len(), 2);
    assert!(router.calls_for(DELETE_PORT_MAPPING).is_empty());
}

#[tokio::test]
async fn test_renewals_are_sequential() {
    let router = FakeRouter::new(|call| {
        Scripted::Delayed(
            Duration::from_millis(20),
            HttpReply {
                status: 200,
                body: ok_body(&call.action, &[]),
            },
        )
    });
    let device = device_with(router.clone(), CapturingLogger::new(), &test_config());

    for port in 6300..6303 {
        device.owned().register(expired_session(port, port)).await;
    }

    assert_eq!(device.renew_mappings().await, 3);
    assert_eq!(router.calls().len(), 3);
    assert_eq!(router.max_in_flight(), 1);
}

#[tokio::test]
async fn test_scheduler_renews_until_stopped() {
    let router = FakeRouter::accepting();
    let device = Arc::new(device_with(
        router.clone(),
        CapturingLogger::new(),
        &test_config(),
    ));
    device.owned().register(expired_session(6400, 6400)).await;

    let mut scheduler = RenewalScheduler::start(
        device.clone(),
        Duration::from_millis(20),
        Duration::from_millis(0),
    );
    assert!(scheduler.is_running());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(router.calls_for(ADD_PORT_MAPPING).len(), 1);

    scheduler.stop();
    assert!(!scheduler.is_running());

    // A new stale mapping is not picked up once stopped
    device.owned().register(expired_session(6401, 6401)).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(router.calls_for(ADD_PORT_MAPPING).len(), 1);
}

#[tokio::test]
async fn test_scheduler_waits_initial_delay() {
    let router = FakeRouter::accepting();
    let device = Arc::new(device_with(
        router.clone(),
        CapturingLogger::new(),
        &test_config(),
    ));
    device.owned().register(expired_session(6500, 6500)).await;

    let _scheduler = RenewalScheduler::start(
        device.clone(),
        Duration::from_millis(20),
        Duration::from_secs(60),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(router.calls().is_empty());
}

#[tokio::test]
async fn test_scheduler_stops_on_drop() {
    let router = FakeRouter::accepting();
    let device = Arc::new(device_with(
        router.clone(),
        CapturingLogger::new(),
        &test_config(),
    ));

    let scheduler = RenewalScheduler::start(
        device.clone(),
        Duration::from_millis(10),
        Duration::from_millis(0),
    );
    drop(scheduler);

    device.owned().register(expired_session(6600, 6600)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(router.calls().is_empty());
}

// ========================================================================
// Teardown
// ========================================================================

#[tokio::test]
async fn test_teardown_releases_session_mappings_once() {
    let router = FakeRouter::accepting();
    let device = Arc::new(device_with(
        router.clone(),
        CapturingLogger::new(),
        &test_config(),
    ));
    device
        .create_port_map(tcp(7001, 7001, Mapping::SESSION_LIFETIME))
        .await
        .unwrap();
    device.create_port_map(tcp(7002, 7002, 0)).await.unwrap();

    let scheduler = RenewalScheduler::start(
        device.clone(),
        Duration::from_secs(60),
        Duration::from_secs(60),
    );
    let guard = ProcessTeardownGuard::new(device.clone(), Some(scheduler));

    guard.teardown().await;
    guard.teardown().await;

    assert!(guard.is_done());
    let deletes = router.calls_for(DELETE_PORT_MAPPING);
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].arg("NewExternalPort"), Some("7001"));
    assert_eq!(device.owned().len().await, 1);
}

#[tokio::test]
async fn test_teardown_swallows_failures() {
    let router = router_failing_delete_of("7101");
    let logger = CapturingLogger::new();
    let device = Arc::new(device_with(router.clone(), logger.clone(), &test_config()));
    device
        .create_port_map(tcp(7101, 7101, Mapping::SESSION_LIFETIME))
        .await
        .unwrap();
    device
        .create_port_map(tcp(7102, 7102, Mapping::SESSION_LIFETIME))
        .await
        .unwrap();

    let guard = ProcessTeardownGuard::new(device.clone(), None);
    guard.teardown().await;

    assert!(guard.is_done());
    assert_eq!(router.calls_for(DELETE_PORT_MAPPING).len(), 2);
    assert!(logger.has(Level::Warn, "could not be released"));
}

#[tokio::test]
async fn test_teardown_on_drop() {
    let router = FakeRouter::accepting();
    let device = Arc::new(device_with(
        router.clone(),
        CapturingLogger::new(),
        &test_config(),
    ));
    device
        .create_port_map(tcp(7201, 7201, Mapping::SESSION_LIFETIME))
        .await
        .unwrap();

    drop(ProcessTeardownGuard::new(device.clone(), None));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(router.calls_for(DELETE_PORT_MAPPING).len(), 1);
    assert!(device.owned().is_empty().await);
}

#[tokio::test]
async fn test_teardown_with_unreachable_device() {
    let router = FakeRouter::new(|call| {
        if call.action == DELETE_PORT_MAPPING {
            Scripted::Hang
        } else {
            ok(&call.action, &[])
        }
    });
    let config = NatConfig {
        request_timeout_ms: 30,
        ..NatConfig::default()
    };
    let logger = CapturingLogger::new();
    let device = Arc::new(device_with(router, logger.clone(), &config));
    device
        .create_port_map(tcp(7301, 7301, Mapping::SESSION_LIFETIME))
        .await
        .unwrap();

    let guard = ProcessTeardownGuard::new(device.clone(), None);
    guard.teardown().await;

    assert!(guard.is_done());
    assert!(logger.has(Level::Warn, "unreachable"));
}
