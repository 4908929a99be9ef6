//! HTTP upgrade handshake: key/challenge computation, request formatting
//! and response validation per RFC 6455 section 4.

use std::io;

use ring::digest;
use ring::rand::SecureRandom;

use crate::base64;
use crate::error::{Error, HandshakeError};

/// Fixed GUID appended to the key before hashing, per RFC 6455.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Ws,
    Wss,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Ws => 80,
            Scheme::Wss => 443,
        }
    }
}

/// Where to connect. Scheme is validated at construction; everything else is
/// taken as-is (URL/DNS parsing belongs to the caller).
#[derive(Debug, Clone)]
pub struct Target {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
}

impl Target {
    /// Fails with `Error::UnsupportedScheme` for anything but exactly
    /// `ws` or `wss`; no connection is attempted in that case.
    pub fn new(scheme: &str, host: &str, port: Option<u16>, path: &str) -> Result<Self, Error> {
        let scheme = match scheme {
            "ws" => Scheme::Ws,
            "wss" => Scheme::Wss,
            _ => return Err(Error::UnsupportedScheme),
        };
        let path = if path.is_empty() { "/".to_owned() } else { path.to_owned() };
        Ok(Self {
            scheme,
            host: host.to_owned(),
            port: port.unwrap_or_else(|| scheme.default_port()),
            path,
        })
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Wss
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `Host` header value; the port suffix is omitted when it matches the
    /// scheme default (80 for ws, 443 for wss).
    fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// One handshake attempt's key and the accept value the server must echo.
/// Lives from `open()` until the response is validated, then is discarded.
#[derive(Debug)]
pub struct Challenge {
    key: String,
    expected: String,
}

impl Challenge {
    /// 16 fresh random bytes per connection attempt. The protocol only needs
    /// them unpredictable, not secret.
    pub fn generate(rng: &dyn SecureRandom) -> io::Result<Self> {
        let mut nonce = [0u8; 16];
        rng.fill(&mut nonce)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "random source failure"))?;
        Ok(Self::from_nonce(&nonce))
    }

    fn from_nonce(nonce: &[u8; 16]) -> Self {
        let key = base64::encode(nonce);
        let expected = accept_for_key(&key);
        Self { key, expected }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn expected(&self) -> &str {
        &self.expected
    }
}

/// `Base64(SHA1(key ++ GUID))`, the exact string the server must send back
/// in `Sec-WebSocket-Accept`. Deterministic for a given key.
pub fn accept_for_key(key: &str) -> String {
    let mut input = Vec::with_capacity(key.len() + WS_GUID.len());
    input.extend_from_slice(key.as_bytes());
    input.extend_from_slice(WS_GUID.as_bytes());
    let hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &input);
    base64::encode(hash.as_ref())
}

/// Formats the HTTP/1.1 upgrade request. Pure formatting, ASCII output.
pub fn build_request(target: &Target, origin: Option<&str>, key: &str) -> String {
    let mut request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n",
        target.path(),
        target.host_header(),
        key,
    );
    if let Some(origin) = origin {
        request.push_str("Origin: ");
        request.push_str(origin);
        request.push_str("\r\n");
    }
    request.push_str("Sec-WebSocket-Version: 13\r\n\r\n");
    request
}

/// Validates the upgrade response headers, `raw` being everything up to and
/// including the blank-line terminator.
///
/// Header names and the `Upgrade`/`Connection` values are matched
/// ASCII-case-insensitively (HTTP token rules); the accept value is compared
/// byte-exact against the challenge.
pub fn validate_response(raw: &[u8], expected: &str) -> Result<(), HandshakeError> {
    let text = std::str::from_utf8(raw).map_err(|_| HandshakeError::BadResponse)?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next().ok_or(HandshakeError::BadResponse)?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().ok_or(HandshakeError::BadResponse)?;
    if !version.starts_with("HTTP/1.") {
        return Err(HandshakeError::BadResponse);
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(HandshakeError::BadResponse)?;
    if status != 101 {
        return Err(HandshakeError::BadStatus(status));
    }

    let mut upgrade = None;
    let mut connection = None;
    let mut accept = None;
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or(HandshakeError::BadResponse)?;
        let value = value.trim();
        if name.eq_ignore_ascii_case("upgrade") {
            upgrade = Some(value);
        } else if name.eq_ignore_ascii_case("connection") {
            connection = Some(value);
        } else if name.eq_ignore_ascii_case("sec-websocket-accept") {
            accept = Some(value);
        }
    }

    match upgrade {
        Some(v) if v.eq_ignore_ascii_case("websocket") => {}
        _ => return Err(HandshakeError::BadUpgrade),
    }
    match connection {
        Some(v) if v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")) => {}
        _ => return Err(HandshakeError::BadConnection),
    }
    match accept {
        Some(v) if v == expected => Ok(()),
        Some(_) => Err(HandshakeError::BadChallenge),
        None => Err(HandshakeError::MissingAccept),
    }
}
