//! Local-mode transfer engines: direct TCP on the LAN with
//! code-based authentication, framed control/data multiplexing and
//! per-file acknowledgement.

mod handshake;
mod net;
pub mod receiver;
pub mod sender;

pub use receiver::ReceiverEngine;
pub use sender::SenderEngine;
