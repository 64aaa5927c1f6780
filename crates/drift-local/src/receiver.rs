//! Local receiver engine: connect, authenticate, then consume framed
//! metadata/payload/end sequences, writing each file under a
//! collision-free name and acknowledging it once it is on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use drift_types::{
    EngineConfig, EngineError, EngineEvent, Mode, ProgressGate, TransferMetadata,
    collision_free_path, percent_done,
};
use drift_wire::{ControlFrame, FrameCodec, WireEvent};

use crate::handshake;
use crate::net;

/// Handle to an active receiver session.
#[derive(Clone, Debug)]
pub struct ReceiverEngine {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Destination for the payload bytes of the file in flight. Small
/// files accumulate in memory; large ones stream through a uniquely
/// named temp file that is renamed into place on completion.
enum Sink {
    Memory(Vec<u8>),
    Temp { file: tokio::fs::File, path: PathBuf },
}

struct InFlight {
    meta: TransferMetadata,
    sink: Sink,
    received: u64,
    started: Instant,
    gate: ProgressGate,
}

impl ReceiverEngine {
    /// Connect to a sender, authenticate with `code`, and start the
    /// receive loop saving into `save_dir`.
    pub async fn connect(
        config: EngineConfig,
        events: broadcast::Sender<EngineEvent>,
        address: &str,
        port: u16,
        code: &str,
        save_dir: PathBuf,
    ) -> Result<Self, EngineError> {
        let target = format!("{address}:{port}");
        let stream = tokio::time::timeout(config.auth_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| EngineError::ConnectTimeout)?
            .map_err(EngineError::from_connect_error)?;
        net::tune_stream(&stream);

        let mut stream = stream;
        let codec =
            handshake::authenticate_outbound(&mut stream, code, config.auth_timeout).await?;

        info!(%target, "authenticated with sender");
        let _ = events.send(EngineEvent::ConnectionStatus {
            connected: true,
            mode: Mode::Receiver,
        });

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        tokio::spawn(receive_loop(
            config,
            events,
            stream,
            codec,
            save_dir,
            cancel.clone(),
            done_tx,
        ));

        Ok(Self {
            shared: Arc::new(Shared {
                cancel,
                done: done_rx,
            }),
        })
    }

    /// Destroy the socket. Idempotent.
    pub fn disconnect(&self) {
        self.shared.cancel.cancel();
    }

    /// Resolves when the receive loop has exited.
    pub async fn finished(&self) {
        let mut done = self.shared.done.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn receive_loop(
    config: EngineConfig,
    events: broadcast::Sender<EngineEvent>,
    stream: TcpStream,
    codec: FrameCodec,
    save_dir: PathBuf,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
) {
    let mut current: Option<InFlight> = None;
    let result = receive_inner(
        &config,
        &events,
        stream,
        codec,
        &save_dir,
        &cancel,
        &mut current,
    )
    .await;

    // A broken session never leaves a stray temp file behind.
    if let Some(InFlight {
        sink: Sink::Temp { path, .. },
        ..
    }) = current.take()
    {
        let _ = tokio::fs::remove_file(&path).await;
    }

    match result {
        Ok(()) => {
            info!("sender closed the session");
            let _ = events.send(EngineEvent::ConnectionLost {
                mode: Mode::Receiver,
                reason: "connection closed by peer".to_string(),
            });
        }
        Err(EngineError::Cancelled) => debug!("receiver disconnected locally"),
        Err(e) => {
            error!("receive failed: {e}");
            let _ = events.send(EngineEvent::TransferError {
                message: e.to_string(),
            });
            let _ = events.send(EngineEvent::ConnectionLost {
                mode: Mode::Receiver,
                reason: e.to_string(),
            });
        }
    }
    let _ = done.send(true);
}

async fn receive_inner(
    config: &EngineConfig,
    events: &broadcast::Sender<EngineEvent>,
    mut stream: TcpStream,
    mut codec: FrameCodec,
    save_dir: &Path,
    cancel: &CancellationToken,
    current: &mut Option<InFlight>,
) -> Result<(), EngineError> {
    let mut buf = vec![0u8; config.chunk_size];

    loop {
        while let Some(event) = codec.next_event()? {
            match event {
                WireEvent::Control(ControlFrame::Metadata(meta)) => {
                    if current.is_some() {
                        return Err(EngineError::ProtocolViolation(
                            "metadata while a file is active".to_string(),
                        ));
                    }
                    debug!(
                        file = %meta.file_name,
                        size = meta.file_size,
                        current_file = meta.current_file,
                        total = meta.total_files,
                        "file incoming"
                    );
                    let sink = if meta.file_size <= config.memory_buffer_limit {
                        Sink::Memory(Vec::with_capacity(meta.file_size as usize))
                    } else {
                        let path =
                            save_dir.join(format!(".drift-{}.part", Uuid::new_v4().simple()));
                        let file = tokio::fs::File::create(&path).await?;
                        Sink::Temp { file, path }
                    };
                    codec.expect_payload(meta.file_size);

                    let mut gate = ProgressGate::new(config.progress_interval);
                    gate.admit(0);
                    emit_progress(events, &meta, 0, 0);
                    *current = Some(InFlight {
                        meta,
                        sink,
                        received: 0,
                        started: Instant::now(),
                        gate,
                    });
                }

                WireEvent::Payload(run) => {
                    let inflight = current.as_mut().ok_or_else(|| {
                        EngineError::ProtocolViolation("payload without metadata".to_string())
                    })?;
                    match &mut inflight.sink {
                        Sink::Memory(data) => data.extend_from_slice(&run),
                        Sink::Temp { file, .. } => file.write_all(&run).await?,
                    }
                    inflight.received += run.len() as u64;

                    let pct = percent_done(inflight.received, inflight.meta.file_size);
                    if pct < 100 && inflight.gate.admit(pct) {
                        emit_progress(events, &inflight.meta, pct, inflight.received);
                    }
                }

                WireEvent::Control(ControlFrame::FileEnd) => {
                    let inflight = current.take().ok_or_else(|| {
                        EngineError::ProtocolViolation("file-end without metadata".to_string())
                    })?;
                    let elapsed = inflight.started.elapsed();
                    let meta = inflight.meta.clone();
                    let target = materialise(inflight, save_dir).await?;
                    debug!(
                        file = %meta.file_name,
                        path = %target.display(),
                        ?elapsed,
                        "file saved"
                    );

                    emit_progress(events, &meta, 100, meta.file_size);
                    let _ = events.send(EngineEvent::FileReceived {
                        file_name: meta.file_name.clone(),
                        file_size: meta.file_size,
                        save_path: target.display().to_string(),
                        current_file: meta.current_file,
                        total_files: meta.total_files,
                    });

                    stream
                        .write_all(&FrameCodec::encode(&ControlFrame::FileSaved)?)
                        .await?;
                }

                WireEvent::Control(ControlFrame::Error { message }) => {
                    return Err(EngineError::Remote(message));
                }

                WireEvent::Control(frame) => {
                    return Err(EngineError::ProtocolViolation(format!(
                        "unexpected frame {frame:?}"
                    )));
                }
            }
        }

        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            read = stream.read(&mut buf) => read?,
        };
        if n == 0 {
            codec.finish()?;
            if current.is_some() {
                return Err(EngineError::PeerDisconnect);
            }
            return Ok(());
        }
        codec.ingest(&buf[..n]);
    }
}

/// Commit the finished file under its collision-free name. The name
/// is chosen now, at write time, so concurrent writers into the same
/// directory race only at the filesystem.
async fn materialise(inflight: InFlight, save_dir: &Path) -> Result<PathBuf, EngineError> {
    let target = collision_free_path(save_dir, &inflight.meta.file_name);
    match inflight.sink {
        Sink::Memory(data) => {
            let mut file = tokio::fs::File::create(&target).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        Sink::Temp { mut file, path } => {
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&path, &target).await?;
        }
    }
    Ok(target)
}

fn emit_progress(
    events: &broadcast::Sender<EngineEvent>,
    meta: &TransferMetadata,
    progress: u8,
    received: u64,
) {
    let _ = events.send(EngineEvent::TransferProgress {
        file_name: meta.file_name.clone(),
        progress,
        sent_bytes: None,
        received_bytes: Some(received),
        total_bytes: meta.file_size,
        current_file: meta.current_file,
        total_files: meta.total_files,
        speed: None,
    });
}
