//! Client-side WebSocket engine for non-blocking, mio-driven hosts.
//!
//! The crate covers the protocol core of RFC 6455: the HTTP upgrade
//! handshake (key/challenge computation, request formatting, response
//! validation) and the frame layer (incremental decoder state machine,
//! masked encoder). The byte stream underneath sits behind the
//! [`Transport`] trait, with ready-made mio adapters for plain TCP and
//! rustls TLS in [`net`]; events reach the host through the [`Handler`]
//! trait.
//!
//! A single connection is driven from the host's poll loop:
//!
//! ```no_run
//! use std::net::ToSocketAddrs;
//! use std::time::Duration;
//!
//! use mio::{Events, Interest, Poll, Token};
//! use ws_engine::net::TlsClient;
//! use ws_engine::{Connection, Handler, Options, Target};
//!
//! struct Printer;
//!
//! impl Handler for Printer {
//!     fn on_open(&mut self) {
//!         println!("connected");
//!     }
//!     fn on_text_message(&mut self, text: &str) {
//!         println!("{text}");
//!     }
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     let target = Target::new("wss", "stream.example.com", None, "/feed")
//!         .expect("valid scheme");
//!     let addr = ("stream.example.com", target.port())
//!         .to_socket_addrs()?
//!         .next()
//!         .expect("resolved address");
//!
//!     let transport = TlsClient::connect(addr, target.host(), TlsClient::default_config())?;
//!     let mut conn = Connection::new(transport, target, Options::default(), Printer);
//!
//!     let mut poll = Poll::new()?;
//!     let mut events = Events::with_capacity(128);
//!     const WS: Token = Token(0);
//!     conn.transport_mut().register(poll.registry(), WS)?;
//!     conn.open();
//!
//!     loop {
//!         poll.poll(&mut events, Some(Duration::from_millis(100)))?;
//!         for event in &events {
//!             if event.token() == WS {
//!                 if event.is_writable() {
//!                     conn.on_writable();
//!                 }
//!                 if event.is_readable() {
//!                     conn.on_readable();
//!                 }
//!             }
//!         }
//!         conn.on_tick();
//!     }
//! }
//! ```

mod base64;
mod connection;
mod error;
mod framing;
mod handshake;
pub mod net;

pub use connection::{Connection, Handler, Options, State, Transport};
pub use error::{Error, HandshakeError, ProtocolError};
pub use framing::{close_payload, encode_frame, FrameDecoder, Incoming, OpCode, MAX_CONTROL_PAYLOAD};
pub use handshake::{accept_for_key, Scheme, Target};
