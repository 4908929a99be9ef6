//! Default mio-based transports: plain TCP for `ws://`, rustls for `wss://`.

mod tcp_client;
mod tcp_opt;
mod tls_client;

pub use tcp_client::TcpClient;
pub use tcp_opt::{create_socket, initiate};
pub use tls_client::TlsClient;
