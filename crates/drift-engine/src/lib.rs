//! Lifecycle supervisor: the process-wide owner of the discovery
//! daemon, at most one local sender session, at most one local
//! receiver session, and at most one remote session. All operations
//! are idempotent and shutdown deduplicates concurrent calls.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, broadcast};
use tracing::info;

use drift_discovery::{DiscoveredService, Discovery, host_name};
use drift_local::sender::SenderPhase;
use drift_local::{ReceiverEngine, SenderEngine};
use drift_remote::{RemoteChannel, RemoteSession};
use drift_types::{ConnectionInfo, EngineConfig, EngineError, EngineEvent, Mode};

/// Fan-out capacity for engine events; slow observers lose oldest
/// events rather than blocking the engine.
const EVENT_CAPACITY: usize = 1024;

/// The transfer engine as the host application sees it.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    discovery: Discovery,
    events: broadcast::Sender<EngineEvent>,
    sender: Mutex<Option<SenderEngine>>,
    receiver: Mutex<Option<ReceiverEngine>>,
    remote: Mutex<Option<RemoteSession>>,
    shutdown: AtomicBool,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let discovery = Discovery::new()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                discovery,
                events,
                sender: Mutex::new(None),
                receiver: Mutex::new(None),
                remote: Mutex::new(None),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// Observe engine events. Each subscriber gets an independent
    /// cursor.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Bind a listener, generate a session code, start advertising.
    /// Only one sender session may exist at a time.
    pub async fn start_sender(&self) -> Result<ConnectionInfo, EngineError> {
        self.ensure_live()?;
        let mut slot = self.inner.sender.lock().await;
        if slot.is_some() {
            return Err(EngineError::InvalidState("sender already active"));
        }
        let sender = SenderEngine::start(
            self.inner.config.clone(),
            self.inner.discovery.clone(),
            self.inner.events.clone(),
        )
        .await?;
        let connection_info = sender.connection_info();
        *slot = Some(sender);
        Ok(connection_info)
    }

    /// Tear down the sender session. Idempotent.
    pub async fn stop_sender(&self) {
        if let Some(sender) = self.inner.sender.lock().await.take() {
            sender.stop().await;
        }
    }

    /// Stream files to the authenticated receiver.
    pub async fn send_files(&self, paths: &[PathBuf]) -> Result<(), EngineError> {
        let sender = self
            .inner
            .sender
            .lock()
            .await
            .clone()
            .ok_or(EngineError::InvalidState("no active sender"))?;
        sender.send_files(paths).await
    }

    /// Abort the local batch currently in flight, if any.
    pub async fn cancel_transfer(&self) {
        if let Some(sender) = self.inner.sender.lock().await.as_ref() {
            sender.cancel_transfer();
        }
    }

    pub async fn sender_phase(&self) -> Option<SenderPhase> {
        self.inner.sender.lock().await.as_ref().map(|s| s.phase())
    }

    pub fn is_advertising(&self) -> bool {
        self.inner.discovery.is_published()
    }

    /// Browse the local link for senders over the configured window.
    pub async fn browse(&self) -> Vec<DiscoveredService> {
        self.inner
            .discovery
            .browse(self.inner.config.discovery_window)
            .await
    }

    /// Connect to a discovered sender and start receiving into
    /// `save_dir`.
    pub async fn connect_to_sender(
        &self,
        address: &str,
        port: u16,
        code: &str,
        save_dir: PathBuf,
    ) -> Result<(), EngineError> {
        self.ensure_live()?;
        let mut slot = self.inner.receiver.lock().await;
        if slot.is_some() {
            return Err(EngineError::InvalidState("receiver already active"));
        }
        let receiver = ReceiverEngine::connect(
            self.inner.config.clone(),
            self.inner.events.clone(),
            address,
            port,
            code,
            save_dir,
        )
        .await?;
        *slot = Some(receiver);
        Ok(())
    }

    /// Destroy the receiver's socket. Idempotent.
    pub async fn disconnect_receiver(&self) {
        if let Some(receiver) = self.inner.receiver.lock().await.take() {
            receiver.disconnect();
        }
    }

    /// Resolves when the current receiver session's loop has exited.
    pub async fn receiver_finished(&self) {
        let receiver = self.inner.receiver.lock().await.clone();
        if let Some(receiver) = receiver {
            receiver.finished().await;
        }
    }

    /// Adopt a brokered channel as the session transport. `peer_id`
    /// is the rendezvous identity of the remote peer.
    pub async fn start_remote(
        &self,
        mode: Mode,
        save_dir: PathBuf,
        channel: RemoteChannel,
        peer_id: &str,
    ) -> Result<ConnectionInfo, EngineError> {
        self.ensure_live()?;
        let mut slot = self.inner.remote.lock().await;
        if slot.is_some() {
            return Err(EngineError::InvalidState("remote session already active"));
        }
        *slot = Some(RemoteSession::spawn(
            self.inner.config.clone(),
            self.inner.events.clone(),
            mode,
            save_dir,
            channel,
        ));
        Ok(ConnectionInfo {
            address: "REMOTE".to_string(),
            port: 0,
            code: peer_id.to_string(),
            hostname: host_name(),
        })
    }

    /// Send files over the active remote session.
    pub async fn send_files_remote(&self, paths: &[PathBuf]) -> Result<(), EngineError> {
        let session = self
            .inner
            .remote
            .lock()
            .await
            .clone()
            .ok_or(EngineError::InvalidState("no active remote session"))?;
        session.send_files(paths).await
    }

    /// End the remote session with a reason the peer gets to see.
    pub async fn disconnect_remote(&self, reason: &str) {
        if let Some(session) = self.inner.remote.lock().await.take() {
            session.disconnect(reason).await;
        }
    }

    /// Release everything: advertising, listener, sockets, channel,
    /// per-transfer state. Concurrent calls deduplicate; repeat calls
    /// are no-ops.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("engine shutting down");
        self.stop_sender().await;
        self.disconnect_receiver().await;
        self.disconnect_remote("shutting down").await;
        self.inner.discovery.shutdown();
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(EngineError::InvalidState("engine is shut down"));
        }
        Ok(())
    }
}
