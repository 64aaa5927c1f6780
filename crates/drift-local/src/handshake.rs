//! Code-based authentication on a fresh TCP connection.
//!
//! The sender arms a hard deadline and reads control frames until an
//! `auth` arrives; anything else before it is ignored. The receiver
//! volunteers its code immediately and waits for the verdict.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use drift_types::{EngineError, SessionCode};
use drift_wire::frame::INVALID_CODE_MESSAGE;
use drift_wire::{ControlFrame, FrameCodec, WireEvent};

/// An authenticated peer: the promoted socket plus the codec that
/// carries any bytes the peer sent right behind its handshake frame.
pub(crate) struct AuthedPeer {
    pub stream: TcpStream,
    pub codec: FrameCodec,
}

/// Sender side: read until the peer authenticates or the deadline
/// passes. On a code mismatch the peer gets an `error` frame and the
/// socket is dropped without promotion.
pub(crate) async fn authenticate_inbound(
    stream: TcpStream,
    code: &SessionCode,
    deadline: Duration,
) -> Result<AuthedPeer, EngineError> {
    // A timeout drops the in-flight future and the socket with it.
    match tokio::time::timeout(deadline, read_auth(stream, code)).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::AuthTimeout),
    }
}

async fn read_auth(mut stream: TcpStream, code: &SessionCode) -> Result<AuthedPeer, EngineError> {
    let mut codec = FrameCodec::new();
    let mut buf = vec![0u8; 4096];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(EngineError::PeerDisconnect);
        }
        codec.ingest(&buf[..n]);

        while let Some(event) = codec.next_event()? {
            let WireEvent::Control(frame) = event else {
                continue;
            };
            match frame {
                ControlFrame::Auth { code: candidate } => {
                    if code.matches(&candidate) {
                        stream
                            .write_all(&FrameCodec::encode(&ControlFrame::AuthSuccess)?)
                            .await?;
                        return Ok(AuthedPeer { stream, codec });
                    }
                    warn!("peer presented a wrong code, rejecting");
                    let error = ControlFrame::Error {
                        message: INVALID_CODE_MESSAGE.to_string(),
                    };
                    stream.write_all(&FrameCodec::encode(&error)?).await?;
                    let _ = stream.flush().await;
                    return Err(EngineError::InvalidCode);
                }
                other => {
                    debug!("ignoring pre-auth frame: {other:?}");
                }
            }
        }
    }
}

/// Receiver side: present the code, await the verdict.
pub(crate) async fn authenticate_outbound(
    stream: &mut TcpStream,
    code: &str,
    deadline: Duration,
) -> Result<FrameCodec, EngineError> {
    match tokio::time::timeout(deadline, present_code(stream, code)).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::ConnectTimeout),
    }
}

async fn present_code(stream: &mut TcpStream, code: &str) -> Result<FrameCodec, EngineError> {
    let auth = ControlFrame::Auth {
        code: code.trim().to_ascii_uppercase(),
    };
    stream.write_all(&FrameCodec::encode(&auth)?).await?;

    let mut codec = FrameCodec::new();
    let mut buf = vec![0u8; 4096];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(EngineError::PeerDisconnect);
        }
        codec.ingest(&buf[..n]);

        while let Some(event) = codec.next_event()? {
            let WireEvent::Control(frame) = event else {
                continue;
            };
            match frame {
                ControlFrame::AuthSuccess => return Ok(codec),
                ControlFrame::Error { message } => {
                    return if message == INVALID_CODE_MESSAGE {
                        Err(EngineError::InvalidCode)
                    } else {
                        Err(EngineError::Remote(message))
                    };
                }
                other => {
                    debug!("ignoring pre-verdict frame: {other:?}");
                }
            }
        }
    }
}
