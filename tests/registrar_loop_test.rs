mod common;

use common::*;
use polog_sync::db;
use polog_sync::gateway::GatewayError;
use polog_sync::registrar::{self, Registrar, REGISTER_LEASE};
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test]
async fn start_is_idempotent() {
    let pool = setup_pool().await;
    let gateway = RecordingGateway::default();
    let blobs = RecordingBlobs::default();
    let media = RecordingMedia::default();
    let registrar = Registrar::new(
        pool,
        services(&gateway, &blobs, &media),
        Duration::from_millis(20),
    );

    assert!(!registrar.is_running());
    registrar.start();
    registrar.start();
    sleep(Duration::from_millis(60)).await;
    assert!(registrar.is_running());
    assert_eq!(registrar.active_loops(), 1);

    registrar.shutdown().await;
    assert!(!registrar.is_running());
    assert_eq!(registrar.active_loops(), 0);
}

#[tokio::test]
async fn loop_publishes_and_then_clears_staging() {
    let pool = setup_pool().await;
    let content = polog("Background", &["a1"]);
    let id = content.id.clone();
    stage(&pool, content).await;

    let gateway = RecordingGateway::default();
    let blobs = RecordingBlobs::default();
    let media = RecordingMedia::default().with_photos(&["a1"]);
    let registrar = Registrar::new(
        pool.clone(),
        services(&gateway, &blobs, &media),
        Duration::from_millis(20),
    );

    registrar.start();
    sleep(Duration::from_millis(200)).await;
    registrar.shutdown().await;

    assert_eq!(gateway.create_calls().len(), 1);
    assert_eq!(blobs.uploads().len(), 1);
    assert!(staged(&pool, &id).await.is_none());
}

#[tokio::test]
async fn stop_lets_the_running_cycle_finish() {
    let pool = setup_pool().await;
    let content = polog("In flight", &["a1"]);
    let id = content.id.clone();
    stage(&pool, content).await;

    let gateway = RecordingGateway::default();
    gateway.set_fetch_delay(Duration::from_millis(100));
    let blobs = RecordingBlobs::default();
    let media = RecordingMedia::default().with_photos(&["a1"]);
    let registrar = Registrar::new(
        pool.clone(),
        services(&gateway, &blobs, &media),
        Duration::from_millis(10),
    );

    registrar.start();
    sleep(Duration::from_millis(40)).await;
    assert_eq!(gateway.fetch_calls().len(), 1);
    registrar.stop();
    assert!(!registrar.is_running());
    registrar.shutdown().await;

    let entry = staged(&pool, &id).await.unwrap();
    assert!(entry.is_finished());
    assert_eq!(gateway.fetch_calls().len(), 1);
}

#[tokio::test]
async fn restart_after_stop_keeps_a_single_loop() {
    let pool = setup_pool().await;
    let content = polog("Stuck", &["a1"]);
    let id = content.id.clone();
    stage(&pool, content).await;

    let gateway = RecordingGateway::default();
    gateway.set_fetch_delay(Duration::from_millis(80));
    gateway.fail_fetch(&id, || GatewayError::Generic("unavailable".into()));
    let blobs = RecordingBlobs::default();
    let media = RecordingMedia::default().with_photos(&["a1"]);
    let registrar = Registrar::new(
        pool,
        services(&gateway, &blobs, &media),
        Duration::from_millis(10),
    );

    registrar.start();
    sleep(Duration::from_millis(30)).await;
    registrar.stop();
    registrar.start();
    assert!(registrar.is_running());

    // The old loop winds down once its cycle completes.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(registrar.active_loops(), 1);
    assert_eq!(gateway.max_in_flight(), 1);
    assert!(gateway.fetch_calls().len() >= 2);

    registrar.shutdown().await;
    assert_eq!(registrar.active_loops(), 0);
}

#[tokio::test]
async fn cycles_never_overlap() {
    let pool = setup_pool().await;
    let content = polog("Contended", &["a1"]);
    let id = content.id.clone();
    stage(&pool, content).await;

    let gateway = RecordingGateway::default();
    gateway.set_fetch_delay(Duration::from_millis(30));
    gateway.fail_fetch(&id, || GatewayError::Generic("unavailable".into()));
    let blobs = RecordingBlobs::default();
    let media = RecordingMedia::default().with_photos(&["a1"]);
    let registrar = Registrar::new(
        pool,
        services(&gateway, &blobs, &media),
        Duration::from_millis(5),
    );

    registrar.start();
    let (a, b, c) = tokio::join!(
        registrar.run_once(),
        registrar.run_once(),
        registrar.run_once()
    );
    assert!(a.is_err() && b.is_err() && c.is_err());
    registrar.shutdown().await;

    assert!(gateway.fetch_calls().len() >= 3);
    assert_eq!(gateway.max_in_flight(), 1);
}

#[tokio::test]
async fn overlapping_passes_on_one_store_run_once() {
    let pool = setup_pool().await;
    let content = polog("Shared store", &["a1", "a2"]);
    let id = content.id.clone();
    stage(&pool, content).await;

    let gateway = RecordingGateway::default();
    gateway.set_fetch_delay(Duration::from_millis(100));
    let blobs = RecordingBlobs::default();
    let media = RecordingMedia::default().with_photos(&["a1", "a2"]);
    // Two independent callers, as the daemon and the drain binary would be.
    let daemon = services(&gateway, &blobs, &media);
    let drain = services(&gateway, &blobs, &media);

    let (a, b) = tokio::join!(
        registrar::register(&pool, &daemon),
        registrar::register(&pool, &drain)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.contended != b.contended);
    assert_eq!(a.published + b.published, 1);
    assert_eq!(blobs.uploads().len(), 2);
    assert_eq!(gateway.create_calls().len(), 1);
    assert_eq!(gateway.max_in_flight(), 1);

    // The lease is released once the pass ends.
    let report = registrar::register(&pool, &drain).await.unwrap();
    assert!(!report.contended);
    assert_eq!(report.deleted, 1);
    assert!(staged(&pool, &id).await.is_none());
}

#[tokio::test]
async fn lease_held_elsewhere_skips_the_pass_until_it_expires() {
    let pool = setup_pool().await;
    let content = polog("Foreign lease", &["a1"]);
    stage(&pool, content).await;

    let gateway = RecordingGateway::default();
    let blobs = RecordingBlobs::default();
    let media = RecordingMedia::default().with_photos(&["a1"]);
    let services = services(&gateway, &blobs, &media);

    assert!(
        db::try_acquire_lease(&pool, REGISTER_LEASE, "other-process", Duration::from_secs(60))
            .await
            .unwrap()
    );
    let report = registrar::register(&pool, &services).await.unwrap();
    assert!(report.contended);
    assert!(gateway.fetch_calls().is_empty());

    // A crashed holder's lease lapses.
    assert!(
        db::try_acquire_lease(&pool, REGISTER_LEASE, "other-process", Duration::ZERO)
            .await
            .unwrap()
    );
    sleep(Duration::from_millis(5)).await;
    let report = registrar::register(&pool, &services).await.unwrap();
    assert!(!report.contended);
    assert_eq!(report.published, 1);
}
