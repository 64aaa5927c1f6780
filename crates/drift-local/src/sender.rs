//! Local sender engine: one listener, one authenticated receiver at
//! a time, files streamed in order with per-file acknowledgement.
//!
//! Advertising is live exactly while the sender is idle and listening.
//! It is withdrawn the moment a peer authenticates and comes back only
//! when the session returns to idle — never while stopping, and never
//! while a broken transfer is still unwinding.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use drift_discovery::{Discovery, host_name};
use drift_types::{
    ConnectionInfo, EngineConfig, EngineError, EngineEvent, Mode, ProgressGate, SessionCode,
    TransferMetadata, percent_done,
};
use drift_wire::{ControlFrame, FrameCodec, WireEvent};

use crate::handshake::{self, AuthedPeer};
use crate::net;

/// Pause between the last payload byte and `file-end`, letting the
/// receiver's progress observers catch up before finalisation.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Where the sender session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderPhase {
    /// Listening and advertising, no authenticated peer.
    Listening,
    /// A receiver holds the session.
    Authed,
    /// A batch of files is in flight.
    Sending,
    /// Stopped; the engine cannot be reused.
    Terminated,
}

/// Handle to an active sender session.
#[derive(Clone)]
pub struct SenderEngine {
    shared: Arc<Shared>,
}

struct Shared {
    config: EngineConfig,
    discovery: Discovery,
    events: broadcast::Sender<EngineEvent>,
    info: ConnectionInfo,
    code: SessionCode,
    hostname: String,
    phase: Mutex<SenderPhase>,
    stopping: AtomicBool,
    cancel: CancellationToken,
    transfer_cancel: Mutex<Option<CancellationToken>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Single-shot rendezvous for the `file-saved` the current file
    /// is waiting on.
    ack_slot: Mutex<Option<oneshot::Sender<()>>>,
}

impl SenderEngine {
    /// Bind the listener, generate the session code, begin
    /// advertising, and start accepting.
    pub async fn start(
        config: EngineConfig,
        discovery: Discovery,
        events: broadcast::Sender<EngineEvent>,
    ) -> Result<Self, EngineError> {
        let listener = net::bind_listener(config.port)?;
        let port = listener
            .local_addr()
            .map_err(EngineError::BindFailed)?
            .port();
        let code = SessionCode::generate()?;
        let hostname = host_name();
        let info = ConnectionInfo {
            address: net::local_ipv4().to_string(),
            port,
            code: code.to_string(),
            hostname: hostname.clone(),
        };

        let shared = Arc::new(Shared {
            config,
            discovery,
            events,
            info: info.clone(),
            code,
            hostname,
            phase: Mutex::new(SenderPhase::Listening),
            stopping: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            transfer_cancel: Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            ack_slot: Mutex::new(None),
        });

        maybe_advertise(&shared);
        tokio::spawn(accept_loop(shared.clone(), listener));

        info!(
            address = %info.address,
            port = info.port,
            code = %info.code,
            "sender listening"
        );
        Ok(Self { shared })
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.shared.info.clone()
    }

    pub fn phase(&self) -> SenderPhase {
        *self.shared.phase.lock().expect("phase lock")
    }

    pub fn is_advertising(&self) -> bool {
        self.shared.discovery.is_published()
    }

    /// Tear the session down: advertisement, active socket, listener.
    /// Idempotent; concurrent calls deduplicate on the stopping flag.
    pub async fn stop(&self) {
        if self.shared.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping sender");
        *self.shared.phase.lock().expect("phase lock") = SenderPhase::Terminated;
        self.shared.cancel.cancel();
        self.shared.discovery.unpublish();
        self.shared.writer.lock().await.take();
        self.shared.ack_slot.lock().expect("ack lock").take();
    }

    /// Abort the batch currently in flight, if any. The session drops
    /// back to authenticated-idle; the receiver keeps whatever prefix
    /// it already wrote.
    pub fn cancel_transfer(&self) {
        if let Some(token) = self.shared.transfer_cancel.lock().expect("cancel lock").as_ref() {
            token.cancel();
        }
    }

    /// Stream `paths` to the authenticated receiver, in order, each
    /// file held open until the receiver's `file-saved` (or its soft
    /// timeout).
    pub async fn send_files(&self, paths: &[PathBuf]) -> Result<(), EngineError> {
        let cancel = {
            let mut phase = self.shared.phase.lock().expect("phase lock");
            if *phase != SenderPhase::Authed {
                return Err(EngineError::InvalidState("no authenticated receiver"));
            }
            *phase = SenderPhase::Sending;
            let token = self.shared.cancel.child_token();
            *self.shared.transfer_cancel.lock().expect("cancel lock") = Some(token.clone());
            token
        };

        info!(files = paths.len(), "starting transfer");
        let result = self.transfer_all(paths, &cancel).await;
        self.shared.transfer_cancel.lock().expect("cancel lock").take();

        let readvertise = {
            let mut phase = self.shared.phase.lock().expect("phase lock");
            match *phase {
                SenderPhase::Sending => {
                    *phase = SenderPhase::Authed;
                    false
                }
                // The peer dropped mid-batch; with the partial state
                // now unwound the idle transition can re-advertise.
                SenderPhase::Listening => true,
                _ => false,
            }
        };
        if readvertise {
            maybe_advertise(&self.shared);
        }

        match &result {
            Ok(()) => {
                info!("transfer complete");
                let _ = self.shared.events.send(EngineEvent::TransferComplete {});
            }
            Err(EngineError::Cancelled) => info!("transfer cancelled"),
            Err(e) => {
                error!("transfer failed: {e}");
                let _ = self.shared.events.send(EngineEvent::TransferError {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn transfer_all(
        &self,
        paths: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let total = paths.len();
        for (index, path) in paths.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            self.send_one(path, index + 1, total, cancel).await?;
        }
        Ok(())
    }

    async fn send_one(
        &self,
        path: &Path,
        current: usize,
        total: usize,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let shared = &self.shared;
        let meta = tokio::fs::metadata(path).await?;
        let file_size = meta.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());

        // Park the rendezvous before any wire traffic so a fast ack
        // cannot slip past it.
        let (ack_tx, ack_rx) = oneshot::channel();
        *shared.ack_slot.lock().expect("ack lock") = Some(ack_tx);

        self.write_frame(&ControlFrame::Metadata(TransferMetadata {
            file_name: file_name.clone(),
            file_size,
            current_file: current,
            total_files: total,
        }))
        .await?;
        debug!(%file_name, file_size, current, total, "metadata sent");

        let mut file = tokio::fs::File::open(path).await?;
        let mut block = vec![0u8; shared.config.chunk_size];
        let mut sent: u64 = 0;
        let started = Instant::now();
        let mut gate = ProgressGate::new(shared.config.progress_interval);

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                read = file.read(&mut block) => read?,
            };
            if n == 0 {
                break;
            }
            // write_all parks here whenever the kernel send buffer is
            // full, which is what suspends the disk read.
            self.write_payload(&block[..n]).await?;
            sent += n as u64;

            let pct = percent_done(sent, file_size);
            if pct < 100 && gate.admit(pct) {
                self.emit_progress(&file_name, pct, sent, file_size, current, total, started);
            }
        }

        // Terminating tick, then let the wire settle before file-end.
        self.emit_progress(&file_name, 100, sent, file_size, current, total, started);
        tokio::time::sleep(SETTLE_DELAY).await;
        self.write_frame(&ControlFrame::FileEnd).await?;

        match tokio::time::timeout(shared.config.ack_timeout, ack_rx).await {
            Ok(Ok(())) => debug!(%file_name, "file acknowledged"),
            Ok(Err(_)) => return Err(EngineError::PeerDisconnect),
            Err(_) => warn!(%file_name, "acknowledgement timed out, continuing"),
        }
        Ok(())
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

    async fn write_frame(&self, frame: &ControlFrame) -> Result<(), EngineError> {
        let bytes = FrameCodec::encode(frame)?;
        let mut guard = self.shared.writer.lock().await;
        let writer = guard.as_mut().ok_or(EngineError::PeerDisconnect)?;
        writer
            .write_all(&bytes)
            .await
            .map_err(|_| EngineError::PeerDisconnect)
    }

    async fn write_payload(&self, data: &[u8]) -> Result<(), EngineError> {
        let mut guard = self.shared.writer.lock().await;
        let writer = guard.as_mut().ok_or(EngineError::PeerDisconnect)?;
        writer
            .write_all(data)
            .await
            .map_err(|_| EngineError::PeerDisconnect)
    }
}

/// Accept connections for the life of the session. While a peer is
/// authenticated (or the engine is stopping) extra connections are
/// dropped on the floor; a failed handshake leaves the session
/// listening.
async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        if shared.stopping.load(Ordering::SeqCst) {
            continue;
        }
        if *shared.phase.lock().expect("phase lock") != SenderPhase::Listening {
            debug!(%addr, "session busy, dropping extra connection");
            continue;
        }

        net::tune_stream(&stream);
        debug!(%addr, "inbound connection, awaiting auth");
        match handshake::authenticate_inbound(stream, &shared.code, shared.config.auth_timeout)
            .await
        {
            Ok(peer) => promote(&shared, peer).await,
            Err(EngineError::InvalidCode) => warn!(%addr, "rejected connection: invalid code"),
            Err(EngineError::AuthTimeout) => warn!(%addr, "authentication timed out"),
            Err(e) => warn!(%addr, "handshake failed: {e}"),
        }
    }
    debug!("listener closed");
}

async fn promote(shared: &Arc<Shared>, peer: AuthedPeer) {
    let AuthedPeer { stream, codec } = peer;
    let (read_half, write_half) = stream.into_split();
    *shared.writer.lock().await = Some(write_half);
    *shared.phase.lock().expect("phase lock") = SenderPhase::Authed;
    shared.discovery.unpublish();

    info!("receiver authenticated");
    let _ = shared.events.send(EngineEvent::ConnectionStatus {
        connected: true,
        mode: Mode::Sender,
    });

    tokio::spawn(session_read_loop(shared.clone(), read_half, codec));
}

/// Drain the authenticated peer's side of the wire: `file-saved`
/// acknowledgements, and ultimately the disconnect.
async fn session_read_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf, mut codec: FrameCodec) {
    let mut buf = vec![0u8; 8 * 1024];
    let reason = 'read: loop {
        let n = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            read = reader.read(&mut buf) => match read {
                Ok(n) => n,
                Err(e) => break 'read e.to_string(),
            },
        };
        if n == 0 {
            break 'read "connection closed by peer".to_string();
        }
        codec.ingest(&buf[..n]);

        loop {
            match codec.next_event() {
                Ok(Some(WireEvent::Control(ControlFrame::FileSaved))) => {
                    match shared.ack_slot.lock().expect("ack lock").take() {
                        Some(tx) => {
                            let _ = tx.send(());
                        }
                        None => debug!("unsolicited file-saved"),
                    }
                }
                Ok(Some(WireEvent::Control(frame))) => {
                    debug!("unexpected frame from receiver: {frame:?}");
                }
                Ok(Some(WireEvent::Payload(_))) => {
                    // The sender never declares a payload length.
                }
                Ok(None) => break,
                Err(e) => break 'read format!("receiver stream error: {e}"),
            }
        }
    };
    handle_disconnect(&shared, reason).await;
}

async fn handle_disconnect(shared: &Arc<Shared>, reason: String) {
    shared.writer.lock().await.take();
    // Dropping the parked rendezvous wakes any in-flight ack wait
    // with a disconnect.
    shared.ack_slot.lock().expect("ack lock").take();

    let was_sending = {
        let mut phase = shared.phase.lock().expect("phase lock");
        if *phase == SenderPhase::Terminated {
            return;
        }
        let was = *phase == SenderPhase::Sending;
        *phase = SenderPhase::Listening;
        was
    };

    warn!(%reason, "peer disconnected");
    let _ = shared.events.send(EngineEvent::ConnectionLost {
        mode: Mode::Sender,
        reason,
    });

    if !was_sending {
        maybe_advertise(shared);
    }
}

/// Publish the advertisement iff the session is idle and listening.
/// Publish failures are recoverable; the next idle transition retries.
fn maybe_advertise(shared: &Arc<Shared>) {
    if shared.stopping.load(Ordering::SeqCst) {
        return;
    }
    if *shared.phase.lock().expect("phase lock") != SenderPhase::Listening {
        return;
    }
    if let Err(e) =
        shared
            .discovery
            .publish(&shared.hostname, shared.info.port, &shared.hostname)
    {
        warn!("failed to publish advertisement: {e}");
    }
}
