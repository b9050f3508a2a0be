//! Integration tests for session handles against the mock daemon

use haggle_client::{
    unregister_with, Attribute, ClientConfig, DataObject, ErrorKind, Event, EventKind, Handle,
    HaggleError, LoopState, Node,
};
use haggle_mock_daemon::{DaemonState, MockDaemon, MockDaemonConfig};
use haggle_protocol::{codes, methods};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Test fixture running a mock daemon on a temporary socket
struct TestDaemon {
    _temp_dir: TempDir,
    config: ClientConfig,
    state: Arc<DaemonState>,
    shutdown_handle: broadcast::Sender<()>,
    _server_handle: JoinHandle<anyhow::Result<()>>,
}

impl TestDaemon {
    async fn start() -> Self {
        Self::start_with(MockDaemonConfig::default()).await
    }

    async fn start_with(daemon_config: MockDaemonConfig) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = ClientConfig::default().with_runtime_dir(temp_dir.path());

        let daemon = MockDaemon::bind_with(&config.socket_path, daemon_config)
            .await
            .expect("Failed to bind mock daemon");
        let state = daemon.state();
        let shutdown_handle = daemon.shutdown_handle();
        let server_handle = tokio::spawn(daemon.run());

        Self {
            _temp_dir: temp_dir,
            config,
            state,
            shutdown_handle,
            _server_handle: server_handle,
        }
    }

    async fn open(&self, name: &str) -> Handle {
        Handle::open_with(name, &self.config)
            .await
            .expect("Failed to open handle")
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        let _ = self.shutdown_handle.send(());
    }
}

fn forward_to(
    tx: mpsc::UnboundedSender<Event>,
) -> impl Fn(Event) -> anyhow::Result<()> + Send + Sync + 'static {
    move |event| {
        tx.send(event)?;
        Ok(())
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timed out waiting for event")
        .expect("Event channel closed")
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_open_and_dispose() {
    let daemon = TestDaemon::start().await;

    let handle = daemon.open("A").await;
    assert_eq!(handle.name(), "A");
    assert!(handle.session_id().unwrap() > 0);
    assert!(daemon.state.is_registered("A"));
    handle.ping().await.unwrap();

    handle.dispose().await;
    assert!(handle.is_disposed());
    assert!(!daemon.state.is_registered("A"));
    assert_eq!(daemon.state.release_count(), 1);

    handle.dispose().await;
    handle.dispose().await;
    assert_eq!(daemon.state.release_count(), 1);
}

#[tokio::test]
async fn test_operations_after_dispose_fail_without_ipc() {
    let daemon = TestDaemon::start().await;
    let handle = daemon.open("A").await;
    handle.dispose().await;

    let requests = daemon.state.request_count();
    let object = DataObject::new().with_attribute(Attribute::new("topic", "x", 1));

    let errors = vec![
        handle.session_id().unwrap_err(),
        handle.ping().await.unwrap_err(),
        handle.shutdown().await.unwrap_err(),
        handle
            .register_interest(Attribute::new("topic", "x", 1))
            .await
            .unwrap_err(),
        handle.register_interest_named("topic", "x").await.unwrap_err(),
        handle
            .unregister_interests(&[Attribute::new("topic", "x", 1)])
            .await
            .unwrap_err(),
        handle.publish_data_object(&object).await.unwrap_err(),
        handle.delete_data_object(&object).await.unwrap_err(),
        handle.get_application_interests_async().await.unwrap_err(),
        handle.get_data_objects_async().await.unwrap_err(),
        handle
            .register_event_interest(EventKind::Shutdown, |_event: Event| Ok(()))
            .await
            .unwrap_err(),
        handle.remove_event_handler(EventKind::Shutdown).unwrap_err(),
        handle.run().await.unwrap_err(),
        handle.run_background().unwrap_err(),
        handle.stop().unwrap_err(),
    ];

    for err in errors {
        assert!(matches!(err, HaggleError::HandleDisposed), "got {:?}", err);
        assert_eq!(err.kind(), ErrorKind::HandleDisposed);
    }
    assert!(!handle.is_running());
    assert_eq!(daemon.state.request_count(), requests);
}

#[tokio::test]
async fn test_duplicate_name_rejected_until_disposed() {
    let daemon = TestDaemon::start().await;
    let first = daemon.open("A").await;

    let err = Handle::open_with("A", &daemon.config).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RegistrationFailed);
    assert_eq!(err.code(), codes::NAME_IN_USE);

    let other = daemon.open("B").await;
    assert_ne!(other.session_id().unwrap(), first.session_id().unwrap());

    first.dispose().await;
    let again = daemon.open("A").await;
    assert!(daemon.state.is_registered("A"));

    again.dispose().await;
    other.dispose().await;
}

#[tokio::test]
async fn test_open_without_daemon_fails_registration() {
    let tmp = TempDir::new().unwrap();
    let config = ClientConfig::default().with_runtime_dir(tmp.path());

    let err = Handle::open_with("A", &config).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RegistrationFailed);
    assert_eq!(err.code(), codes::NOT_CONNECTED);
    assert!(err.is_recoverable());
}

#[tokio::test]
async fn test_unregister_by_name_recovers_leaked_handle() {
    let daemon = TestDaemon::start().await;
    let leaked = daemon.open("crashy").await;
    std::mem::forget(leaked);

    assert!(Handle::open_with("crashy", &daemon.config).await.is_err());

    unregister_with("crashy", &daemon.config).await.unwrap();
    assert!(!daemon.state.is_registered("crashy"));

    let handle = daemon.open("crashy").await;
    handle.dispose().await;

    let err = unregister_with("never-registered", &daemon.config)
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::BAD_HANDLE);
}

#[tokio::test]
async fn test_drop_without_dispose_releases_in_background() {
    let daemon = TestDaemon::start().await;
    let handle = daemon.open("forgetful").await;
    drop(handle);

    assert!(wait_until(|| daemon.state.release_count() == 1).await);
    assert!(!daemon.state.is_registered("forgetful"));
}

#[tokio::test]
async fn test_publish_reaches_peer_and_delete_retracts() {
    let daemon = TestDaemon::start().await;
    let a = daemon.open("A").await;
    let b = daemon.open("B").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    b.register_interest(Attribute::new("topic", "x", 1))
        .await
        .unwrap();
    b.register_event_interest(EventKind::NewDataObject, forward_to(tx))
        .await
        .unwrap();
    assert!(b.run_background().unwrap());

    a.register_interest(Attribute::new("topic", "x", 1))
        .await
        .unwrap();
    let d1 = DataObject::new()
        .with_attribute(Attribute::new("topic", "x", 1))
        .with_bytes(b"hello".to_vec());
    let id = a.publish_data_object(&d1).await.unwrap();
    assert_eq!(id, d1.id());

    match next_event(&mut rx).await {
        Event::NewDataObject(received) => {
            assert_eq!(received.id(), id);
            assert_eq!(received.attributes(), d1.attributes());
            assert_eq!(received.payload(), d1.payload());
        }
        other => panic!("unexpected event {:?}", other),
    }

    a.delete_data_object(&d1).await.unwrap();
    assert!(daemon.state.object_ids().is_empty());

    b.get_data_objects_async().await.unwrap();
    let quiet = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(quiet.is_err(), "unexpected event after delete: {:?}", quiet);

    a.dispose().await;
    b.dispose().await;
    assert!(!b.is_running());
}

#[tokio::test]
async fn test_snapshot_requests_arrive_as_events() {
    let daemon = TestDaemon::start().await;
    let handle = daemon.open("A").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    handle
        .register_event_interest(EventKind::InterestList, forward_to(tx.clone()))
        .await
        .unwrap();
    handle
        .register_event_interest(EventKind::NewDataObject, forward_to(tx))
        .await
        .unwrap();
    handle
        .register_interests(&[
            Attribute::new("topic", "x", 3),
            Attribute::new("topic", "y", 1),
        ])
        .await
        .unwrap();
    handle.register_interest_named("lang", "en").await.unwrap();
    handle
        .unregister_interest(Attribute::new("topic", "y", 1))
        .await
        .unwrap();
    assert!(handle.run_background().unwrap());

    handle.get_application_interests_async().await.unwrap();
    match next_event(&mut rx).await {
        Event::InterestListUpdate(interests) => {
            assert_eq!(
                interests,
                vec![Attribute::new("topic", "x", 3), Attribute::new("lang", "en", 1)]
            );
            assert_eq!(interests[0].weight(), 3);
            assert_eq!(interests[1].weight(), 1);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let object = DataObject::new().with_attribute(Attribute::new("lang", "en", 1));
    let id = handle.publish_data_object(&object).await.unwrap();
    handle.get_data_objects_async().await.unwrap();
    match next_event(&mut rx).await {
        Event::NewDataObject(received) => assert_eq!(received.id(), id),
        other => panic!("unexpected event {:?}", other),
    }

    handle.dispose().await;
}

#[tokio::test]
async fn test_events_in_order_and_stop_from_handler() {
    let daemon = TestDaemon::start().await;
    let handle = daemon.open("orderly").await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let control = handle.loop_control();
    handle
        .register_event_interest(EventKind::NeighborUpdate, move |event: Event| {
            let Event::NeighborUpdate(nodes) = event else {
                anyhow::bail!("unexpected event");
            };
            let mut seen = record.lock().unwrap();
            seen.push(nodes[0].name.clone());
            if seen.len() == 5 {
                control.stop();
            }
            Ok(())
        })
        .await
        .unwrap();

    for i in 0..10 {
        assert_eq!(
            daemon
                .state
                .broadcast_neighbors(vec![Node::new(format!("peer-{}", i))]),
            1
        );
    }

    assert!(handle.run().await.unwrap());
    assert!(!handle.is_running());
    let expected: Vec<String> = (0..5).map(|i| format!("peer-{}", i)).collect();
    assert_eq!(*seen.lock().unwrap(), expected);

    handle.dispose().await;
}

#[tokio::test]
async fn test_second_handler_replaces_first() {
    let daemon = TestDaemon::start().await;
    let handle = daemon.open("A").await;

    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let counter = first.clone();
    handle
        .register_event_interest(EventKind::NeighborUpdate, move |_event: Event| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
    let counter = second.clone();
    handle
        .register_event_interest(EventKind::NeighborUpdate, move |_event: Event| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

    assert!(handle.run_background().unwrap());
    for _ in 0..3 {
        daemon.state.broadcast_neighbors(vec![Node::new("peer")]);
    }

    assert!(wait_until(|| second.load(Ordering::SeqCst) == 3).await);
    assert_eq!(first.load(Ordering::SeqCst), 0);

    handle.dispose().await;
}

#[tokio::test]
async fn test_handler_faults_do_not_stop_loop() {
    let daemon = TestDaemon::start().await;
    let handle = daemon.open("A").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    handle
        .register_event_interest(EventKind::NeighborUpdate, move |event: Event| {
            let name = match &event {
                Event::NeighborUpdate(nodes) => nodes[0].name.clone(),
                _ => return Ok(()),
            };
            match name.as_str() {
                "bad-err" => anyhow::bail!("handler rejected {}", name),
                "bad-panic" => panic!("handler crashed"),
                _ => {
                    tx.send(event)?;
                    Ok(())
                }
            }
        })
        .await
        .unwrap();
    assert!(handle.run_background().unwrap());

    for name in ["bad-err", "bad-panic", "good"] {
        daemon.state.broadcast_neighbors(vec![Node::new(name)]);
    }

    match next_event(&mut rx).await {
        Event::NeighborUpdate(nodes) => assert_eq!(nodes[0].name, "good"),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(handle.is_running());

    handle.dispose().await;
    assert!(!handle.is_running());
}

#[tokio::test]
async fn test_removed_handler_drops_events() {
    let daemon = TestDaemon::start().await;
    let handle = daemon.open("A").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    handle
        .register_event_interest(EventKind::NeighborUpdate, forward_to(tx.clone()))
        .await
        .unwrap();
    handle
        .register_event_interest(EventKind::Shutdown, forward_to(tx))
        .await
        .unwrap();
    assert!(handle.remove_event_handler(EventKind::NeighborUpdate).unwrap());
    assert!(!handle.remove_event_handler(EventKind::NeighborUpdate).unwrap());
    assert!(handle.run_background().unwrap());

    daemon.state.broadcast_neighbors(vec![Node::new("ignored")]);
    assert!(daemon.state.push_event("A", &Event::Shutdown(7)));

    // The neighbor update was dropped, so the shutdown event arrives first
    assert_eq!(next_event(&mut rx).await, Event::Shutdown(7));
    assert!(handle.is_running());

    handle.dispose().await;
}

#[tokio::test]
async fn test_background_loop_is_single_flight() {
    let daemon = TestDaemon::start().await;
    let handle = daemon.open("A").await;

    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    handle
        .register_event_interest(EventKind::NeighborUpdate, move |_event: Event| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let (started, stopped) = (log.clone(), log.clone());
    handle
        .set_loop_callbacks(
            move || started.lock().unwrap().push("start"),
            move || stopped.lock().unwrap().push("stop"),
        )
        .unwrap();

    assert!(handle.run_background().unwrap());
    assert!(!handle.run_background().unwrap());
    assert!(!handle.run().await.unwrap());
    assert!(handle.is_running());

    for i in 0..20 {
        daemon
            .state
            .broadcast_neighbors(vec![Node::new(format!("peer-{}", i))]);
    }
    assert!(wait_until(|| count.load(Ordering::SeqCst) == 20).await);

    assert!(handle.stop().unwrap());
    assert!(wait_until(|| !handle.is_running()).await);
    assert_eq!(count.load(Ordering::SeqCst), 20);
    assert_eq!(*log.lock().unwrap(), vec!["start", "stop"]);

    handle.dispose().await;
}

#[tokio::test]
async fn test_cancelled_run_leaves_handle_usable() {
    let daemon = TestDaemon::start().await;
    let handle = daemon.open("A").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    handle
        .register_event_interest(EventKind::NeighborUpdate, forward_to(tx))
        .await
        .unwrap();

    let run = tokio::time::timeout(Duration::from_millis(50), handle.run()).await;
    assert!(run.is_err());
    assert!(!handle.is_running());
    assert_eq!(handle.loop_state(), LoopState::Stopped);
    assert!(!handle.stop().unwrap());

    assert!(handle.run_background().unwrap());
    daemon.state.broadcast_neighbors(vec![Node::new("late")]);
    assert_eq!(
        next_event(&mut rx).await,
        Event::NeighborUpdate(vec![Node::new("late")])
    );

    handle.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispose_waits_for_foreground_handler() {
    let daemon = TestDaemon::start().await;
    let handle = Arc::new(daemon.open("A").await);

    // 1 while the handler runs, 2 once it returned
    let phase = Arc::new(AtomicUsize::new(0));
    let marker = phase.clone();
    handle
        .register_event_interest(EventKind::InterestList, move |_event: Event| {
            marker.store(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(500));
            marker.store(2, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

    let runner = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.run().await })
    };
    handle.get_application_interests_async().await.unwrap();
    assert!(wait_until(|| phase.load(Ordering::SeqCst) == 1).await);

    handle.dispose().await;
    assert_eq!(phase.load(Ordering::SeqCst), 2);
    assert_eq!(daemon.state.release_count(), 1);
    assert!(!handle.is_running());
    assert!(runner.await.unwrap().unwrap());
}

#[tokio::test]
async fn test_refused_event_registration_leaves_no_handler() {
    let daemon = TestDaemon::start_with(MockDaemonConfig {
        refused_methods: vec![methods::EVENT_REGISTER.to_string()],
        ..MockDaemonConfig::default()
    })
    .await;
    let handle = daemon.open("A").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (first, second) = tokio::join!(
        handle.register_event_interest(EventKind::Shutdown, forward_to(tx.clone())),
        handle.register_event_interest(EventKind::Shutdown, forward_to(tx)),
    );
    for result in [first, second] {
        assert!(matches!(
            result,
            Err(HaggleError::Daemon {
                code: codes::INTERNAL_ERROR,
                ..
            })
        ));
    }
    assert!(!handle.remove_event_handler(EventKind::Shutdown).unwrap());

    assert!(handle.run_background().unwrap());
    assert!(daemon.state.push_event("A", &Event::Shutdown(3)));
    assert!(wait_until(|| handle.dispatch_stats().dropped == 1).await);
    assert!(rx.try_recv().is_err());

    handle.dispose().await;
}

#[tokio::test]
async fn test_concurrent_registration_keeps_last_handler() {
    let daemon = TestDaemon::start().await;
    let handle = daemon.open("A").await;

    let (first_tx, mut first_rx) = mpsc::unbounded_channel();
    let (second_tx, mut second_rx) = mpsc::unbounded_channel();
    let (first, second) = tokio::join!(
        handle.register_event_interest(EventKind::Shutdown, forward_to(first_tx)),
        handle.register_event_interest(EventKind::Shutdown, forward_to(second_tx)),
    );
    first.unwrap();
    second.unwrap();

    assert!(handle.run_background().unwrap());
    assert!(daemon.state.push_event("A", &Event::Shutdown(4)));
    assert_eq!(next_event(&mut second_rx).await, Event::Shutdown(4));
    assert!(first_rx.try_recv().is_err());

    handle.dispose().await;
}

#[tokio::test]
async fn test_partial_batch_is_reported() {
    let daemon = TestDaemon::start_with(MockDaemonConfig {
        batch_limit: Some(1),
        ..MockDaemonConfig::default()
    })
    .await;
    let handle = daemon.open("A").await;

    let err = handle
        .register_interests(&[
            Attribute::new("topic", "x", 1),
            Attribute::new("topic", "y", 1),
            Attribute::new("topic", "z", 1),
        ])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HaggleError::PartialBatch {
            accepted: 1,
            requested: 3
        }
    ));
    assert_eq!(err.kind(), ErrorKind::PartialBatch);

    handle.dispose().await;
}

#[tokio::test]
async fn test_rejected_payloads() {
    let daemon = TestDaemon::start_with(MockDaemonConfig {
        max_payload_bytes: 16,
        ..MockDaemonConfig::default()
    })
    .await;
    let handle = daemon.open("A").await;

    let err = handle
        .register_interests(&[Attribute::new("topic", "x", 1), Attribute::new("", "y", 1)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RejectedPayload);
    assert_eq!(err.code(), codes::REJECTED_PAYLOAD);
    assert!(daemon.state.interests_of("A").is_empty());

    let oversized = DataObject::new()
        .with_attribute(Attribute::new("topic", "x", 1))
        .with_bytes(vec![7u8; 64]);
    let err = handle.publish_data_object(&oversized).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RejectedPayload);
    assert!(daemon.state.object_ids().is_empty());

    // Rejections leave the handle usable
    handle.ping().await.unwrap();
    handle.dispose().await;
}

#[tokio::test]
async fn test_daemon_shutdown_notifies_sessions() {
    let daemon = TestDaemon::start().await;
    let watcher = daemon.open("watcher").await;
    let admin = daemon.open("admin").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    watcher
        .register_event_interest(EventKind::Shutdown, forward_to(tx))
        .await
        .unwrap();
    assert!(watcher.run_background().unwrap());

    assert_eq!(admin.shutdown().await.unwrap(), 0);
    assert_eq!(next_event(&mut rx).await, Event::Shutdown(0));

    // The daemon closes the connection, which ends the loop
    assert!(wait_until(|| !watcher.is_running()).await);
    let err = watcher.ping().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DaemonUnreachable);

    watcher.dispose().await;
    admin.dispose().await;
    assert!(watcher.is_disposed());
}
