//! Supervisor-level tests: the full local flow through the facade,
//! the advertising invariant, and idempotent shutdown.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::broadcast;

use drift_engine::Engine;
use drift_local::sender::SenderPhase;
use drift_types::{EngineConfig, EngineEvent, Mode};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drift=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn write_source(dir: &std::path::Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, patterned(len)).expect("write source file");
    path
}

async fn await_sender_phase(engine: &Engine, phase: SenderPhase) {
    tokio::time::timeout(Duration::from_secs(15), async {
        while engine.sender_phase().await != Some(phase) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("sender never reached {phase:?}"));
}

#[tokio::test]
async fn full_local_flow_through_the_facade() {
    init_tracing();
    let src_dir = tempfile::tempdir().expect("tempdir");
    let save_dir = tempfile::tempdir().expect("tempdir");
    let source = write_source(src_dir.path(), "report.pdf", 500_000);

    let engine = Engine::new(EngineConfig::default()).expect("engine");
    let mut events = engine.subscribe();

    let info = engine.start_sender().await.expect("start sender");
    assert!(info.port > 0);
    assert_eq!(info.code.len(), 7);
    assert!(engine.is_advertising(), "advertising while idle-listening");

    engine
        .connect_to_sender("127.0.0.1", info.port, &info.code, save_dir.path().to_path_buf())
        .await
        .expect("connect");

    await_sender_phase(&engine, SenderPhase::Authed).await;
    assert!(
        !engine.is_advertising(),
        "advertising must stop once a peer holds the session"
    );

    engine.send_files(&[source.clone()]).await.expect("send");

    let mut saw_complete = false;
    let mut saved_path = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while (!saw_complete || saved_path.is_none()) && tokio::time::Instant::now() < deadline {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(EngineEvent::TransferComplete {})) => saw_complete = true,
            Ok(Ok(EngineEvent::FileReceived { save_path, .. })) => {
                saved_path = Some(save_path);
            }
            Ok(Ok(_)) => {}
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
        }
    }
    assert!(saw_complete, "no transfer-complete event");
    let saved_path = saved_path.expect("no file-received event");
    assert_eq!(
        std::fs::read(&saved_path).expect("read saved"),
        patterned(500_000)
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn advertising_returns_after_idle_disconnect() {
    init_tracing();
    let save_dir = tempfile::tempdir().expect("tempdir");

    let engine = Engine::new(EngineConfig::default()).expect("engine");
    let info = engine.start_sender().await.expect("start sender");
    assert!(engine.is_advertising());

    engine
        .connect_to_sender("127.0.0.1", info.port, &info.code, save_dir.path().to_path_buf())
        .await
        .expect("connect");
    await_sender_phase(&engine, SenderPhase::Authed).await;
    assert!(!engine.is_advertising());

    // Peer leaves without ever transferring; the sender goes back to
    // listening and the advertisement returns.
    engine.disconnect_receiver().await;
    await_sender_phase(&engine, SenderPhase::Listening).await;

    tokio::time::timeout(Duration::from_secs(10), async {
        while !engine.is_advertising() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("advertising never resumed");

    engine.shutdown().await;
    assert!(!engine.is_advertising(), "shutdown withdraws advertising");
}

#[tokio::test]
async fn second_sender_session_is_refused() {
    init_tracing();
    let engine = Engine::new(EngineConfig::default()).expect("engine");
    engine.start_sender().await.expect("first session");
    let err = engine.start_sender().await.expect_err("second must fail");
    assert!(matches!(err, drift_types::EngineError::InvalidState(_)));
    engine.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_idempotent_and_concurrent_safe() {
    init_tracing();
    let engine = Engine::new(EngineConfig::default()).expect("engine");
    engine.start_sender().await.expect("start sender");

    let a = engine.clone();
    let b = engine.clone();
    let (ra, rb) = tokio::join!(a.shutdown(), b.shutdown());
    let _ = (ra, rb);
    engine.shutdown().await;

    let err = engine.start_sender().await.expect_err("engine is down");
    assert!(matches!(err, drift_types::EngineError::InvalidState(_)));
}

#[tokio::test]
async fn remote_session_reports_remote_connection_info() {
    init_tracing();
    let save_dir = tempfile::tempdir().expect("tempdir");
    let engine = Engine::new(EngineConfig::default()).expect("engine");

    let (channel, _far_side) = drift_remote::RemoteChannel::pair(16);
    let info = engine
        .start_remote(
            Mode::Sender,
            save_dir.path().to_path_buf(),
            channel,
            "peer-abc123",
        )
        .await
        .expect("start remote");

    assert_eq!(info.address, "REMOTE");
    assert_eq!(info.port, 0);
    assert_eq!(info.code, "peer-abc123");

    engine.shutdown().await;
}
