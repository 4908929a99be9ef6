use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

/// Creates a non-blocking TCP socket with Nagle disabled.
///
/// `TCP_NODELAY` keeps small frames (control frames, short messages) from
/// sitting in the kernel waiting for coalescing; non-blocking mode is
/// required for the mio event loop.
pub fn create_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    Ok(socket)
}

/// Starts a non-blocking connect and hands the stream to mio.
///
/// Completion is signalled by the first writable event on the returned
/// stream, not by this call.
pub fn initiate(addr: SocketAddr) -> io::Result<mio::net::TcpStream> {
    let socket = create_socket(&addr)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
        #[cfg(unix)]
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }
    Ok(mio::net::TcpStream::from_std(socket.into()))
}
