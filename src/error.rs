use std::io;
use std::str::Utf8Error;

use thiserror::Error;

/// Every failure the connection can surface. Each is reported at most once
/// per connection attempt through `Handler::on_failure`; the crate never
/// retries on its own.
#[derive(Debug, Error)]
pub enum Error {
    /// The target URL scheme is not `ws` or `wss`. Raised at construction
    /// time, before any connection is attempted.
    #[error("unsupported url scheme")]
    UnsupportedScheme,

    /// Transport-level failure before the handshake completed, including
    /// expiry of the handshake deadline.
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] io::Error),

    /// The server's upgrade response was malformed or rejected the upgrade.
    #[error("handshake failed: {0}")]
    HandshakeFailed(#[from] HandshakeError),

    /// The peer violated the framing protocol.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// A text message payload was not valid UTF-8.
    #[error("text payload is not valid utf-8: {0}")]
    InvalidEncoding(#[source] Utf8Error),

    /// Transport failure after the handshake completed.
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    /// A send was attempted while the connection was not in the
    /// `Connected` state.
    #[error("not connected")]
    NotConnected,
}

/// The specific deviation that made an upgrade response unacceptable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed http response")]
    BadResponse,
    #[error("unexpected status code {0}")]
    BadStatus(u16),
    #[error("missing or invalid upgrade header")]
    BadUpgrade,
    #[error("missing or invalid connection header")]
    BadConnection,
    #[error("missing sec-websocket-accept header")]
    MissingAccept,
    #[error("sec-websocket-accept does not match the sent key")]
    BadChallenge,
    #[error("upgrade response exceeded the response size limit")]
    ResponseTooLarge,
}

/// Framing-level violations, fatal to the connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("received a masked frame from the server")]
    MaskedFrame,
    #[error("invalid opcode {0}")]
    InvalidOpcode(u8),
    #[error("reserved bits set in frame header")]
    ReservedBits,
    #[error("fragmented control frame")]
    FragmentedControl,
    #[error("control frame payload exceeds 125 bytes")]
    ControlTooLong,
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,
    #[error("new data frame while a fragmented message is in progress")]
    InterleavedDataFrame,
    #[error("message of {0} bytes exceeds the configured size limit")]
    Overflow(u64),
}
