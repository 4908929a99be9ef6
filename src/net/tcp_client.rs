use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::connection::Transport;
use crate::net::tcp_opt;

/// Plain transport for `ws://` targets.
pub struct TcpClient {
    socket: TcpStream,
}

impl TcpClient {
    /// Starts a non-blocking connect; the stream becomes usable once the
    /// poll loop reports it writable.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            socket: tcp_opt::initiate(addr)?,
        })
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(
            &mut self.socket,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )
    }
}

impl Transport for TcpClient {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.socket.read(buf) {
            // A zero-length read on a TCP stream is the peer closing.
            Ok(0) if !buf.is_empty() => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )),
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.socket.flush()
    }

    fn shutdown(&mut self) {
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
    }
}
