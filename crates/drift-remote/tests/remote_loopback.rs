//! End-to-end tests of the remote protocol over an in-process channel
//! pair: windowed flow control, duplicate filenames, zero-byte files,
//! and disconnect handling.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::broadcast;

use drift_remote::{RemoteChannel, RemoteSession};
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

struct Pair {
    sender: RemoteSession,
    receiver: RemoteSession,
    receiver_events: broadcast::Receiver<EngineEvent>,
}

fn spawn_pair(config: EngineConfig, save_dir: PathBuf) -> Pair {
    let (a, b) = RemoteChannel::pair(64);
    let (send_events, _) = broadcast::channel(4096);
    let (recv_events, receiver_events) = broadcast::channel(4096);

    let sender = RemoteSession::spawn(
        config.clone(),
        send_events,
        Mode::Sender,
        std::env::temp_dir(),
        a,
    );
    let receiver = RemoteSession::spawn(config, recv_events, Mode::Receiver, save_dir, b);
    Pair {
        sender,
        receiver,
        receiver_events,
    }
}

async fn await_event<F>(
    rx: &mut broadcast::Receiver<EngineEvent>,
    what: &str,
    mut pred: F,
) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(_) => panic!("event channel closed while waiting for {what}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

#[tokio::test]
async fn duplicate_filenames_land_as_distinct_files() {
    init_tracing();
    let src_dir = tempfile::tempdir().expect("tempdir");
    let save_dir = tempfile::tempdir().expect("tempdir");
    let source = write_source(src_dir.path(), "dup.bin", 5 * 1024 * 1024);

    let mut pair = spawn_pair(EngineConfig::default(), save_dir.path().to_path_buf());

    // The same file twice in one session.
    pair.sender
        .send_files(&[source.clone(), source.clone()])
        .await
        .expect("send");

    let mut saved = Vec::new();
    while saved.len() < 2 {
        let event = await_event(&mut pair.receiver_events, "file-received", |e| {
            matches!(e, EngineEvent::FileReceived { .. })
        })
        .await;
        let EngineEvent::FileReceived { file_name, save_path, .. } = event else {
            unreachable!();
        };
        assert_eq!(file_name, "dup.bin");
        saved.push(PathBuf::from(save_path));
    }

    assert_eq!(saved[0], save_dir.path().join("dup.bin"));
    assert_eq!(saved[1], save_dir.path().join("dup (1).bin"));

    let expected = patterned(5 * 1024 * 1024);
    for path in &saved {
        assert_eq!(
            std::fs::read(path).expect("read saved"),
            expected,
            "{} differs",
            path.display()
        );
    }

    pair.sender.disconnect("done").await;
    pair.receiver.closed().await;
}

#[tokio::test]
async fn small_window_still_delivers_every_chunk() {
    init_tracing();
    let src_dir = tempfile::tempdir().expect("tempdir");
    let save_dir = tempfile::tempdir().expect("tempdir");

    // 64 chunks through a 2-chunk window.
    let config = EngineConfig {
        remote_chunk_size: 1024,
        window_size: 2,
        ..EngineConfig::default()
    };
    let source = write_source(src_dir.path(), "windowed.bin", 64 * 1024);

    let mut pair = spawn_pair(config, save_dir.path().to_path_buf());
    pair.sender.send_files(&[source]).await.expect("send");

    await_event(&mut pair.receiver_events, "file-received", |e| {
        matches!(e, EngineEvent::FileReceived { .. })
    })
    .await;

    assert_eq!(
        std::fs::read(save_dir.path().join("windowed.bin")).expect("read saved"),
        patterned(64 * 1024)
    );

    pair.sender.disconnect("done").await;
    pair.receiver.closed().await;
}

#[tokio::test]
async fn zero_byte_file_completes_the_ack_machinery() {
    init_tracing();
    let src_dir = tempfile::tempdir().expect("tempdir");
    let save_dir = tempfile::tempdir().expect("tempdir");
    let source = write_source(src_dir.path(), "empty.bin", 0);

    let mut pair = spawn_pair(EngineConfig::default(), save_dir.path().to_path_buf());
    pair.sender.send_files(&[source]).await.expect("send");

    let event = await_event(&mut pair.receiver_events, "file-received", |e| {
        matches!(e, EngineEvent::FileReceived { .. })
    })
    .await;
    let EngineEvent::FileReceived { file_size, .. } = event else {
        unreachable!();
    };
    assert_eq!(file_size, 0);
    assert_eq!(
        std::fs::metadata(save_dir.path().join("empty.bin"))
            .expect("saved file")
            .len(),
        0
    );

    pair.sender.disconnect("done").await;
    pair.receiver.closed().await;
}

#[tokio::test]
async fn disconnect_request_closes_the_far_side() {
    init_tracing();
    let save_dir = tempfile::tempdir().expect("tempdir");
    let mut pair = spawn_pair(EngineConfig::default(), save_dir.path().to_path_buf());

    pair.sender.disconnect("user quit").await;

    let event = await_event(&mut pair.receiver_events, "connection-lost", |e| {
        matches!(e, EngineEvent::ConnectionLost { .. })
    })
    .await;
    let EngineEvent::ConnectionLost { mode, reason } = event else {
        unreachable!();
    };
    assert_eq!(mode, Mode::Receiver);
    assert!(reason.contains("user quit"), "got {reason:?}");

    pair.receiver.closed().await;
    assert!(pair.receiver.is_closed());
}
