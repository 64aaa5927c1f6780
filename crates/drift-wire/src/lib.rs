//! Wire formats for both transports: the delimiter-framed control
//! protocol used on local TCP sessions, and the JSON records carried
//! over the remote message channel.

pub mod codec;
pub mod frame;
pub mod remote;

pub use codec::{FrameCodec, WireEvent, DELIMITER};
pub use frame::ControlFrame;
pub use remote::RemoteFrame;
