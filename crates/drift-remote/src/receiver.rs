//! Receive half of the remote protocol: per-transfer streaming state
//! keyed by transfer id, a bounded write queue per file, and windowed
//! acknowledgements back to the sender.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use drift_types::{
    EngineConfig, EngineError, EngineEvent, ProgressGate, collision_free_path, percent_done,
};
use drift_wire::RemoteFrame;

use crate::channel::send_frame;

pub(crate) struct RemoteReceiver {
    config: EngineConfig,
    events: broadcast::Sender<EngineEvent>,
    save_dir: PathBuf,
    outbound: mpsc::Sender<Bytes>,
    transfers: HashMap<String, Transfer>,
    /// Running count of files seen this session, for event indexing.
    files_seen: usize,
}

struct Transfer {
    /// Name the sender used; display only.
    file_name: String,
    /// On-disk truth after collision renaming.
    save_path: PathBuf,
    file_size: u64,
    total_chunks: u64,
    received_chunks: u64,
    received_bytes: u64,
    /// Bytes waiting to be flushed into the write queue.
    pending: Vec<u8>,
    /// Bounded queue feeding the writer task; dropping it closes the
    /// file.
    queue: Option<mpsc::Sender<Vec<u8>>>,
    writer: JoinHandle<Result<(), EngineError>>,
    file_index: usize,
    started: Instant,
    gate: ProgressGate,
}

impl RemoteReceiver {
    pub(crate) fn new(
        config: EngineConfig,
        events: broadcast::Sender<EngineEvent>,
        save_dir: PathBuf,
        outbound: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            config,
            events,
            save_dir,
            outbound,
            transfers: HashMap::new(),
            files_seen: 0,
        }
    }

    /// `file-meta`: allocate per-transfer state. The target file is
    /// created immediately under its collision-free name, so a second
    /// transfer of the same filename lands on the next `name (k)`.
    pub(crate) async fn begin(
        &mut self,
        file_name: String,
        transfer_id: String,
        file_size: u64,
        total_chunks: u64,
    ) {
        if self.transfers.contains_key(&transfer_id) {
            warn!(%transfer_id, "duplicate file-meta, ignoring");
            return;
        }

        let save_path = collision_free_path(&self.save_dir, &file_name);
        let file = match tokio::fs::File::create(&save_path).await {
            Ok(file) => file,
            Err(e) => {
                error!(%file_name, "cannot create target file: {e}");
                let _ = self.events.send(EngineEvent::TransferError {
                    message: format!("cannot create {file_name}: {e}"),
                });
                return;
            }
        };

        self.files_seen += 1;
        let (queue_tx, queue_rx) = mpsc::channel(self.config.write_queue_depth);
        let writer = tokio::spawn(writer_task(file, queue_rx));

        info!(
            %file_name,
            %transfer_id,
            file_size,
            total_chunks,
            path = %save_path.display(),
            "remote file incoming"
        );
        self.transfers.insert(
            transfer_id,
            Transfer {
                file_name,
                save_path,
                file_size,
                total_chunks,
                received_chunks: 0,
                received_bytes: 0,
                pending: Vec::new(),
                queue: Some(queue_tx),
                writer,
                file_index: self.files_seen,
                started: Instant::now(),
                gate: ProgressGate::new(self.config.progress_interval),
            },
        );
    }

    /// `file-chunk`: buffer, flush at the threshold (or on the final
    /// chunk), and ack every window.
    pub(crate) async fn chunk(&mut self, transfer_id: &str, chunk_index: u64, encoded: &str) {
        let Some(transfer) = self.transfers.get_mut(transfer_id) else {
            debug!(%transfer_id, chunk_index, "chunk for unknown transfer");
            return;
        };

        let data = match RemoteFrame::decode_chunk(encoded) {
            Ok(data) => data,
            Err(e) => {
                error!(%transfer_id, chunk_index, "dropping transfer: {e}");
                let _ = self.events.send(EngineEvent::TransferError {
                    message: e.to_string(),
                });
                self.transfers.remove(transfer_id);
                return;
            }
        };

        transfer.received_chunks += 1;
        transfer.received_bytes += data.len() as u64;
        transfer.pending.extend_from_slice(&data);

        let last = transfer.received_chunks >= transfer.total_chunks;
        if transfer.pending.len() >= self.config.remote_flush_threshold || last {
            let flush = std::mem::take(&mut transfer.pending);
            if let Some(queue) = &transfer.queue {
                // A full queue parks us here until the writer drains;
                // that is the backpressure bound on in-flight buffers.
                if queue.send(flush).await.is_err() {
                    error!(%transfer_id, "writer task gone, dropping transfer");
                    let _ = self.events.send(EngineEvent::TransferError {
                        message: "disk writer failed".to_string(),
                    });
                    self.transfers.remove(transfer_id);
                    return;
                }
            }
        }

        if transfer.received_chunks % self.config.window_size == 0 || last {
            let ack = RemoteFrame::ChunkAck {
                transfer_id: transfer_id.to_string(),
                received_chunks: transfer.received_chunks,
            };
            if let Err(e) = send_frame(&self.outbound, &ack).await {
                warn!(%transfer_id, "could not ack: {e}");
            }
        }

        let pct = percent_done(transfer.received_bytes, transfer.file_size);
        if pct < 100 && transfer.gate.admit(pct) {
            let _ = self.events.send(EngineEvent::TransferProgress {
                file_name: transfer.file_name.clone(),
                progress: pct,
                sent_bytes: None,
                received_bytes: Some(transfer.received_bytes),
                total_bytes: transfer.file_size,
                current_file: transfer.file_index,
                total_files: self.files_seen,
                speed: None,
            });
        }
    }

    /// `file-complete`: drain the write queue (bounded), close the
    /// file, report it, free the state.
    pub(crate) async fn complete(&mut self, transfer_id: &str) {
        let Some(mut transfer) = self.transfers.remove(transfer_id) else {
            debug!(%transfer_id, "file-complete for unknown transfer");
            return;
        };

        if !transfer.pending.is_empty() {
            let flush = std::mem::take(&mut transfer.pending);
            if let Some(queue) = &transfer.queue {
                let _ = queue.send(flush).await;
            }
        }
        transfer.queue.take();

        match tokio::time::timeout(self.config.drain_timeout, &mut transfer.writer).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                error!(file = %transfer.file_name, "write failed: {e}");
                let _ = self.events.send(EngineEvent::TransferError {
                    message: e.to_string(),
                });
                return;
            }
            Ok(Err(e)) => {
                error!(file = %transfer.file_name, "writer task died: {e}");
                return;
            }
            Err(_) => {
                warn!(file = %transfer.file_name, "write queue drain timed out");
                transfer.writer.abort();
            }
        }

        let elapsed = transfer.started.elapsed();
        info!(
            file = %transfer.file_name,
            path = %transfer.save_path.display(),
            bytes = transfer.received_bytes,
            ?elapsed,
            "remote file saved"
        );
        let _ = self.events.send(EngineEvent::TransferProgress {
            file_name: transfer.file_name.clone(),
            progress: 100,
            sent_bytes: None,
            received_bytes: Some(transfer.received_bytes),
            total_bytes: transfer.file_size,
            current_file: transfer.file_index,
            total_files: self.files_seen,
            speed: None,
        });
        let _ = self.events.send(EngineEvent::FileReceived {
            file_name: transfer.file_name,
            file_size: transfer.file_size,
            save_path: transfer.save_path.display().to_string(),
            current_file: transfer.file_index,
            total_files: self.files_seen,
        });
    }

    /// Tear down every in-flight transfer. Partial files stay on disk
    /// under their renamed targets.
    pub(crate) fn abort_all(&mut self) {
        for (transfer_id, transfer) in self.transfers.drain() {
            debug!(%transfer_id, file = %transfer.file_name, "aborting in-flight transfer");
            // Dropping the queue lets the writer flush what it has.
        }
    }
}

/// Serialises disk writes for one file. Exits when the queue closes,
/// syncing the file on the way out.
async fn writer_task(
    mut file: tokio::fs::File,
    mut queue: mpsc::Receiver<Vec<u8>>,
) -> Result<(), EngineError> {
    while let Some(buf) = queue.recv().await {
        file.write_all(&buf).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}
