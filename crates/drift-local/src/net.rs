use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};

use drift_types::EngineError;

/// Bind the sender's listener. Port 0 takes an ephemeral port.
pub(crate) fn bind_listener(port: u16) -> Result<TcpListener, EngineError> {
    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(EngineError::BindFailed)?;
    socket.set_reuse_address(true).map_err(EngineError::BindFailed)?;
    socket.bind(&addr.into()).map_err(EngineError::BindFailed)?;
    socket.listen(64).map_err(EngineError::BindFailed)?;
    socket.set_nonblocking(true).map_err(EngineError::BindFailed)?;
    TcpListener::from_std(socket.into()).map_err(EngineError::BindFailed)
}

/// Per-stream socket options for throughput.
pub(crate) fn tune_stream(stream: &TcpStream) {
    let sock_ref = socket2::SockRef::from(stream);
    let _ = sock_ref.set_nodelay(true);
}

/// Best-guess LAN IPv4 for this host, via a connected UDP probe (no
/// packet leaves the machine). Falls back to loopback when offline.
pub(crate) fn local_ipv4() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    };
    probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
