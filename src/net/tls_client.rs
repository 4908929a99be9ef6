use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};

use crate::connection::Transport;
use crate::net::tcp_opt;

/// rustls-backed transport for `wss://` targets. No internal locks; state
/// is owned by the struct and driven from the host's poll loop.
///
/// The TLS session handshake rides on the same `read`/`write`/`flush`
/// calls the websocket layer already makes, so callers never sequence it
/// explicitly.
#[derive(Debug)]
pub struct TlsClient {
    socket: TcpStream,
    session: ClientConnection,
    peer_closed: bool,
}

impl TlsClient {
    /// Starts a non-blocking connect and prepares a TLS session for
    /// `server_name`. The certificate trust anchors come from the
    /// caller-supplied config, never from a build-time switch.
    pub fn connect(
        addr: SocketAddr,
        server_name: &str,
        config: Arc<ClientConfig>,
    ) -> io::Result<Self> {
        let server_name = ServerName::try_from(server_name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid dns name"))?
            .to_owned();
        let session = ClientConnection::new(config, server_name)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let socket = tcp_opt::initiate(addr)?;
        Ok(Self {
            socket,
            session,
            peer_closed: false,
        })
    }

    /// Client config trusting the bundled webpki roots, for hosts without
    /// their own certificate policy.
    pub fn default_config() -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(
            &mut self.socket,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    /// True while the session has ciphertext waiting for the socket; hosts
    /// can use it to keep writable interest registered.
    pub fn wants_write(&self) -> bool {
        self.session.wants_write()
    }
}

impl Transport for TlsClient {
    /// Pulls ciphertext from the socket into the session, then hands out
    /// decrypted plaintext.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.session.read_tls(&mut self.socket) {
            Ok(0) => self.peer_closed = true,
            Ok(_) => {
                self.session
                    .process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        match self.session.reader().read(buf) {
            // Clean close: the peer sent close_notify.
            Ok(0) if !buf.is_empty() => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "tls session closed by peer",
            )),
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if self.peer_closed {
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    ))
                } else {
                    Ok(0)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Buffers plaintext into the session; `flush` moves the resulting
    /// ciphertext to the socket.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.session.writer().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.socket) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.session.send_close_notify();
        let _ = self.session.write_tls(&mut self.socket);
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_server_name() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let err = TlsClient::connect(addr, "not a hostname", TlsClient::default_config())
            .expect_err("bad dns name");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn connect_prepares_session() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let client =
            TlsClient::connect(addr, "localhost", TlsClient::default_config()).expect("connect");
        // A fresh client session wants to send its hello.
        assert!(client.wants_write() || client.session.is_handshaking());
    }
}
