//! Socket setup helpers.
//!
//! Everything here runs once per socket: create, set options, bind/listen or
//! start a non-blocking connect. The steady-state read/write path lives in
//! `connection`.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream, ToSocketAddrs};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use shardline_core::error::ConnectError;

/// Bind a non-blocking listener on `0.0.0.0:port`.
///
/// SO_REUSEADDR is set so a restarted server can rebind while old
/// connections sit in TIME_WAIT. Port 0 picks a free port; read it back
/// with `local_addr()`.
pub fn listen(port: u16, backlog: i32) -> io::Result<TcpListener> {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Resolve `host:port` to the first address it names.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, ConnectError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|_| ConnectError::Resolve)?
        .next()
        .ok_or(ConnectError::Resolve)
}

/// Start a non-blocking connect to `addr`.
///
/// The returned stream is usually still connecting. Completion is signalled
/// by the socket becoming writable; `SO_ERROR` then says whether it worked.
pub fn start_connect(addr: SocketAddr, nodelay: bool) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if nodelay {
        socket.set_nodelay(true)?;
    }
    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(socket.into())
}

/// Options for a stream handed to an I/O thread.
pub fn prepare_stream(stream: &TcpStream, nodelay: bool) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    if nodelay {
        stream.set_nodelay(true)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn test_listen_on_free_port() {
        let l = listen(0, 16).unwrap();
        let addr = l.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        // Non-blocking: nothing pending.
        match l.accept() {
            Err(e) => assert_eq!(e.kind(), ErrorKind::WouldBlock),
            Ok(_) => panic!("unexpected connection"),
        }
    }

    #[test]
    fn test_resolve() {
        let a = resolve("127.0.0.1", 9000).unwrap();
        assert_eq!(a.port(), 9000);
        assert!(a.ip().is_loopback());
        assert_eq!(resolve("no such host.invalid", 1), Err(ConnectError::Resolve));
    }

    #[test]
    fn test_start_connect_loopback() {
        let l = listen(0, 16).unwrap();
        let port = l.local_addr().unwrap().port();
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        let s = start_connect(addr, true).unwrap();
        assert!(s.nodelay().unwrap());
    }
}
