use bytes::Bytes;
use tokio::sync::mpsc;

use drift_types::EngineError;
use drift_wire::RemoteFrame;

/// The engine's view of the brokered channel: reliable, ordered,
/// message-framed, bidirectional. The rendezvous collaborator bridges
/// these endpoints to its transport; the engine never sees how.
pub struct RemoteChannel {
    outbound: mpsc::Sender<Bytes>,
    inbound: mpsc::Receiver<Bytes>,
}

impl RemoteChannel {
    /// Wrap the endpoints a broker integration hands over.
    pub fn new(outbound: mpsc::Sender<Bytes>, inbound: mpsc::Receiver<Bytes>) -> Self {
        Self { outbound, inbound }
    }

    /// An in-process loopback pair: what one side sends, the other
    /// receives. Used by tests and local demos.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            Self { outbound: a_tx, inbound: b_rx },
            Self { outbound: b_tx, inbound: a_rx },
        )
    }

    /// Split into the write endpoint and the read endpoint.
    pub(crate) fn into_parts(self) -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        (self.outbound, self.inbound)
    }
}

/// Encode and send one record. A closed channel is the session-fatal
/// `ChannelClosed`.
pub(crate) async fn send_frame(
    outbound: &mpsc::Sender<Bytes>,
    frame: &RemoteFrame,
) -> Result<(), EngineError> {
    let raw = frame.encode()?;
    outbound
        .send(raw)
        .await
        .map_err(|_| EngineError::ChannelClosed)
}
