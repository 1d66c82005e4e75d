//! TCP sockets for the accept and server sides

use super::HostAddress;
use crate::{Error, Result, LISTEN_BACKLOG};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use tracing::debug;

/// Listen at `port` on all local IPv4 interfaces
pub fn listen_at(port: u16, reuse_address: bool) -> Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(Error::transport("creating socket"))?;
    socket
        .set_reuse_address(reuse_address)
        .map_err(Error::transport("setting socket option"))?;

    let endpoint = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket
        .bind(&SockAddr::from(endpoint))
        .map_err(Error::transport("binding to port"))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(Error::transport("listening to port"))?;

    Ok(socket.into())
}

/// Resolve `remote` and open a TCP connection to its first IPv4 address
pub fn connect(remote: &HostAddress) -> Result<TcpStream> {
    let addr = remote.resolve()?;
    debug!("Connecting to {} ({})", remote, addr);

    let stream = TcpStream::connect(addr).map_err(Error::transport("connecting to host"))?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}
