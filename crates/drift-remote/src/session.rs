//! One remote session: the driver task that dispatches inbound
//! records, plus the windowed sender half.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use drift_types::{
    EngineConfig, EngineError, EngineEvent, Mode, ProgressGate, percent_done,
};
use drift_wire::RemoteFrame;

use crate::channel::{RemoteChannel, send_frame};
use crate::receiver::RemoteReceiver;

/// Interval between ack-map polls while the window is closed.
const ACK_POLL: Duration = Duration::from_millis(50);

/// An active session over a brokered channel. Either side can send
/// files; both run the same driver.
#[derive(Clone)]
pub struct RemoteSession {
    shared: Arc<Shared>,
}

struct Shared {
    config: EngineConfig,
    events: broadcast::Sender<EngineEvent>,
    mode: Mode,
    outbound: mpsc::Sender<Bytes>,
    /// Sender-side view of cumulative acks, per transfer id.
    acks: Mutex<HashMap<String, u64>>,
    cancel: CancellationToken,
    closed: watch::Receiver<bool>,
}

impl RemoteSession {
    /// Take ownership of the channel and start the driver.
    pub fn spawn(
        config: EngineConfig,
        events: broadcast::Sender<EngineEvent>,
        mode: Mode,
        save_dir: PathBuf,
        channel: RemoteChannel,
    ) -> Self {
        let (outbound, inbound) = channel.into_parts();
        let (closed_tx, closed_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            config: config.clone(),
            events: events.clone(),
            mode,
            outbound: outbound.clone(),
            acks: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            closed: closed_rx,
        });

        let receiver = RemoteReceiver::new(config, events.clone(), save_dir, outbound);
        tokio::spawn(drive(shared.clone(), inbound, receiver, closed_tx));

        let _ = events.send(EngineEvent::ConnectionStatus {
            connected: true,
            mode,
        });
        Self { shared }
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Resolves once the driver has exited and per-transfer state is
    /// freed.
    pub async fn closed(&self) {
        let mut closed = self.shared.closed.clone();
        while !*closed.borrow() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }

    /// Ask the peer to end the session, give in-flight messages a
    /// moment to flush, then close our side.
    pub async fn disconnect(&self, reason: &str) {
        if self.is_closed() {
            return;
        }
        let request = RemoteFrame::DisconnectRequest {
            reason: reason.to_string(),
            mode: self.shared.mode,
        };
        if let Err(e) = send_frame(&self.shared.outbound, &request).await {
            debug!("disconnect-request not sent: {e}");
        }
        tokio::time::sleep(self.shared.config.disconnect_grace).await;
        self.shared.cancel.cancel();
    }

    /// Send `paths` in order through the windowed chunk protocol.
    pub async fn send_files(&self, paths: &[PathBuf]) -> Result<(), EngineError> {
        let total = paths.len();
        info!(files = total, "starting remote transfer");
        for (index, path) in paths.iter().enumerate() {
            let result = self.send_one(path, index + 1, total).await;
            if let Err(e) = &result {
                if !matches!(e, EngineError::Cancelled) {
                    error!("remote transfer failed: {e}");
                    let _ = self.shared.events.send(EngineEvent::TransferError {
                        message: e.to_string(),
                    });
                }
                return result;
            }
        }
        info!("remote transfer complete");
        let _ = self.shared.events.send(EngineEvent::TransferComplete {});
        Ok(())
    }

    async fn send_one(
        &self,
        path: &Path,
        current: usize,
        total: usize,
    ) -> Result<(), EngineError> {
        let shared = &self.shared;
        let meta = tokio::fs::metadata(path).await?;
        let file_size = meta.len();
        let chunk_size = shared.config.remote_chunk_size as u64;
        // Zero-byte files still make one (empty) chunk so the ack
        // machinery runs.
        let total_chunks = if file_size == 0 {
            1
        } else {
            file_size.div_ceil(chunk_size)
        };
        let transfer_id = Uuid::new_v4().to_string();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());

        send_frame(
            &shared.outbound,
            &RemoteFrame::FileMeta {
                file_name: file_name.clone(),
                transfer_id: transfer_id.clone(),
                file_size,
                total_chunks,
            },
        )
        .await?;
        debug!(%file_name, %transfer_id, file_size, total_chunks, "file-meta sent");

        let mut file = tokio::fs::File::open(path).await?;
        let mut block = vec![0u8; chunk_size as usize];
        let mut sent: u64 = 0;
        let started = Instant::now();
        let mut gate = ProgressGate::new(shared.config.progress_interval);

        for index in 0..total_chunks {
            if shared.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            // Keep at most a window of chunks in flight.
            if index >= shared.config.window_size {
                let needed = index - shared.config.window_size;
                self.await_ack(&transfer_id, needed, shared.config.chunk_ack_timeout)
                    .await?;
            }

            let want = ((file_size - sent).min(chunk_size)) as usize;
            file.read_exact(&mut block[..want]).await?;

            send_frame(
                &shared.outbound,
                &RemoteFrame::FileChunk {
                    transfer_id: transfer_id.clone(),
                    chunk_index: index,
                    chunk: RemoteFrame::encode_chunk(&block[..want]),
                },
            )
            .await?;
            sent += want as u64;

            let pct = percent_done(sent, file_size);
            if pct < 100 && gate.admit(pct) {
                self.emit_progress(&file_name, pct, sent, file_size, current, total, started);
            }
        }

        self.await_ack(&transfer_id, total_chunks, shared.config.final_ack_timeout)
            .await?;
        send_frame(
            &shared.outbound,
            &RemoteFrame::FileComplete {
                transfer_id: transfer_id.clone(),
                file_size,
            },
        )
        .await?;
        self.emit_progress(&file_name, 100, sent, file_size, current, total, started);
        shared.acks.lock().expect("acks lock").remove(&transfer_id);
        debug!(%file_name, %transfer_id, "file-complete sent");
        Ok(())
    }

    /// Poll until the peer's cumulative ack reaches `needed`. The
    /// deadline is soft: the transfer logs and carries on.
    async fn await_ack(
        &self,
        transfer_id: &str,
        needed: u64,
        deadline: Duration,
    ) -> Result<(), EngineError> {
        let until = Instant::now() + deadline;
        loop {
            if self.is_closed() {
                return Err(EngineError::ChannelClosed);
            }
            let acked = self
                .shared
                .acks
                .lock()
                .expect("acks lock")
                .get(transfer_id)
                .copied()
                .unwrap_or(0);
            if acked >= needed {
                return Ok(());
            }
            if Instant::now() >= until {
                warn!(%transfer_id, needed, acked, "ack wait timed out, continuing");
                return Ok(());
            }
            tokio::select! {
                _ = self.shared.cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(ACK_POLL) => {}
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_progress(
        &self,
        file_name: &str,
        progress: u8,
        sent: u64,
        total_bytes: u64,
        current_file: usize,
        total_files: usize,
        started: Instant,
    ) {
        let elapsed = started.elapsed().as_secs_f64();
        let speed = (elapsed > 0.0).then(|| (sent as f64 / elapsed) as u64);
        let _ = self.shared.events.send(EngineEvent::TransferProgress {
            file_name: file_name.to_string(),
            progress,
            sent_bytes: Some(sent),
            received_bytes: None,
            total_bytes,
            current_file,
            total_files,
            speed,
        });
    }
}

/// Dispatch inbound records until the channel dies, the peer asks to
/// disconnect, or we are cancelled.
async fn drive(
    shared: Arc<Shared>,
    mut inbound: mpsc::Receiver<Bytes>,
    mut receiver: RemoteReceiver,
    closed: watch::Sender<bool>,
) {
    let reason = loop {
        let message = tokio::select! {
            _ = shared.cancel.cancelled() => break None,
            message = inbound.recv() => message,
        };
        let Some(raw) = message else {
            break Some("channel closed".to_string());
        };

        match RemoteFrame::decode(&raw) {
            Ok(RemoteFrame::ChunkAck {
                transfer_id,
                received_chunks,
            }) => {
                let mut acks = shared.acks.lock().expect("acks lock");
                let entry = acks.entry(transfer_id).or_insert(0);
                *entry = (*entry).max(received_chunks);
            }
            Ok(RemoteFrame::FileMeta {
                file_name,
                transfer_id,
                file_size,
                total_chunks,
            }) => {
                receiver
                    .begin(file_name, transfer_id, file_size, total_chunks)
                    .await;
            }
            Ok(RemoteFrame::FileChunk {
                transfer_id,
                chunk_index,
                chunk,
            }) => {
                receiver.chunk(&transfer_id, chunk_index, &chunk).await;
            }
            Ok(RemoteFrame::FileComplete { transfer_id, .. }) => {
                receiver.complete(&transfer_id).await;
            }
            Ok(RemoteFrame::DisconnectRequest { reason, mode }) => {
                info!(%reason, ?mode, "peer requested disconnect");
                tokio::time::sleep(shared.config.disconnect_grace).await;
                break Some(format!("peer disconnected: {reason}"));
            }
            Err(e) => warn!("undecodable channel record: {e}"),
        }
    };

    receiver.abort_all();
    if let Some(reason) = reason {
        let _ = shared.events.send(EngineEvent::ConnectionLost {
            mode: shared.mode,
            reason,
        });
    }
    let _ = closed.send(true);
    debug!("remote session driver exited");
}
