//! Connection controller: owns the connection state machine, sequences the
//! upgrade handshake then the frame loop, and routes decoded frames to the
//! handler.
//!
//! The controller is driven by the host's poll loop: call `on_readable` /
//! `on_writable` when the transport signals readiness and `on_tick`
//! periodically while connecting. Nothing here blocks; unflushed output
//! waits in the write queue until the transport accepts it.

use std::io;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Error, HandshakeError};
use crate::framing::{self, FrameDecoder, Incoming, OpCode};
use crate::handshake::{self, Challenge, Target};

/// Upper bound on the upgrade response head. A server that has not
/// terminated its headers by then is not speaking HTTP.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

const READ_CHUNK: usize = 4096;

/// Normal-closure status code sent when the client initiates the close.
const CLOSE_NORMAL: u16 = 1000;

/// Byte-stream the connection runs over. Implementations are non-blocking:
/// no call may park the thread.
///
/// `read` returns plaintext bytes, `Ok(0)` when nothing is available right
/// now, and an error with kind `UnexpectedEof` once the peer has closed.
/// `write` buffers or sends and may return `WouldBlock`; `flush` pushes any
/// transport-internal buffer (for TLS, pending ciphertext) toward the
/// socket. `shutdown` is best-effort teardown.
pub trait Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn flush(&mut self) -> io::Result<()>;
    fn shutdown(&mut self);
}

/// Connection events, delivered from inside the host's poll loop. All
/// methods default to no-ops so hosts implement only what they observe.
pub trait Handler {
    fn on_open(&mut self) {}
    fn on_close(&mut self) {}
    fn on_failure(&mut self, error: Error) {
        let _ = error;
    }
    fn on_text_message(&mut self, text: &str) {
        let _ = text;
    }
    fn on_binary_message(&mut self, data: &[u8]) {
        let _ = data;
    }
    fn on_message_sent(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct Options {
    /// Optional `Origin` header for the upgrade request.
    pub origin: Option<String>,
    /// Hard cap on a reassembled message; frames advertising more are
    /// rejected before any allocation.
    pub max_message_size: usize,
    /// Deadline for the whole upgrade exchange, enforced via `on_tick`.
    pub handshake_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            origin: None,
            max_message_size: 1024 * 1024,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Connection<T: Transport, H: Handler> {
    transport: T,
    handler: H,
    target: Target,
    options: Options,
    state: State,
    rng: SystemRandom,
    challenge: Option<Challenge>,
    response: Vec<u8>,
    deadline: Option<Instant>,
    decoder: FrameDecoder,
    write_queue: Vec<u8>,
    pending_sends: usize,
    close_sent: bool,
}

impl<T: Transport, H: Handler> Connection<T, H> {
    pub fn new(transport: T, target: Target, options: Options, handler: H) -> Self {
        let decoder = FrameDecoder::new(options.max_message_size);
        Self {
            transport,
            handler,
            target,
            options,
            state: State::Disconnected,
            rng: SystemRandom::new(),
            challenge: None,
            response: Vec::new(),
            deadline: None,
            decoder,
            write_queue: Vec::new(),
            pending_sends: 0,
            close_sent: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable transport access, mainly for mio registration.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Starts the upgrade handshake. A no-op unless currently Disconnected,
    /// so repeated calls cannot start duplicate attempts.
    pub fn open(&mut self) {
        if self.state != State::Disconnected {
            debug!("open() ignored, state is {:?}", self.state);
            return;
        }
        let challenge = match Challenge::generate(&self.rng) {
            Ok(challenge) => challenge,
            Err(e) => {
                self.handler.on_failure(Error::ConnectionFailed(e));
                return;
            }
        };
        debug!(
            "opening websocket to {}:{}{}",
            self.target.host(),
            self.target.port(),
            self.target.path()
        );
        let request =
            handshake::build_request(&self.target, self.options.origin.as_deref(), challenge.key());
        self.challenge = Some(challenge);
        self.close_sent = false;
        self.write_queue.extend_from_slice(request.as_bytes());
        self.deadline = Some(Instant::now() + self.options.handshake_timeout);
        self.state = State::Connecting;
        self.pump_writes();
    }

    /// Requests shutdown regardless of state. When Connected this queues a
    /// Close frame, flushes best-effort and notifies `on_close` exactly
    /// once; when Connecting it aborts silently; when Disconnected it is a
    /// no-op.
    pub fn close(&mut self) {
        match self.state {
            State::Disconnected => {}
            State::Connecting => {
                debug!("close() while connecting, aborting attempt");
                self.teardown();
            }
            State::Connected => {
                if !self.close_sent {
                    let payload = framing::close_payload(CLOSE_NORMAL, b"");
                    self.queue_control(OpCode::Close, &payload);
                    self.close_sent = true;
                }
                // The transport goes away regardless of whether the close
                // frame made it out.
                let _ = self.flush_write_queue();
                self.teardown();
                self.handler.on_close();
            }
        }
    }

    /// Sends a single-frame text message.
    pub fn send_text(&mut self, text: &str) -> Result<(), Error> {
        self.send_data(OpCode::Text, text.as_bytes())
    }

    /// Sends a single-frame binary message.
    pub fn send_binary(&mut self, data: &[u8]) -> Result<(), Error> {
        self.send_data(OpCode::Binary, data)
    }

    /// Sends a Ping; the payload must not exceed 125 bytes.
    pub fn send_ping(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.send_control(OpCode::Ping, payload)
    }

    /// Sends an unsolicited Pong (pongs answering a Ping are automatic).
    pub fn send_pong(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.send_control(OpCode::Pong, payload)
    }

    /// Transport readiness: flushes queued output. Transport failures here
    /// surface through `on_failure`.
    pub fn on_writable(&mut self) {
        self.pump_writes();
    }

    /// Transport readiness: pulls available bytes and advances the
    /// handshake or the frame loop.
    pub fn on_readable(&mut self) {
        if self.state == State::Disconnected {
            return;
        }
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.transport.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if !self.process_input(&buf[..n]) {
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.fail_io(e);
                    return;
                }
            }
        }
    }

    /// Deadline enforcement while Connecting; call periodically from the
    /// poll loop. Steady-state frame reads carry no timeout: an idle
    /// websocket is a healthy websocket.
    pub fn on_tick(&mut self) {
        if self.state != State::Connecting {
            return;
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                warn!("handshake deadline expired");
                self.fail(Error::ConnectionFailed(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "handshake deadline expired",
                )));
            }
        }
    }

    fn send_data(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), Error> {
        self.send_frame(opcode, payload, true)
    }

    fn send_control(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), Error> {
        self.send_frame(opcode, payload, false)
    }

    /// Data messages (`counted`) participate in `on_message_sent`
    /// accounting; control frames do not.
    fn send_frame(&mut self, opcode: OpCode, payload: &[u8], counted: bool) -> Result<(), Error> {
        if self.state != State::Connected {
            return Err(Error::NotConnected);
        }
        let mask = self.new_mask().map_err(Error::Transport)?;
        framing::encode_frame(&mut self.write_queue, true, opcode, mask, payload)?;
        if counted {
            self.pending_sends += 1;
        }
        self.pump_writes();
        Ok(())
    }

    /// Returns false once the connection has been torn down and the rest of
    /// the input must be dropped.
    fn process_input(&mut self, chunk: &[u8]) -> bool {
        if self.state != State::Connecting {
            return self.process_frames(chunk);
        }

        self.response.extend_from_slice(chunk);
        if self.response.len() > MAX_RESPONSE_HEAD {
            self.fail(Error::HandshakeFailed(HandshakeError::ResponseTooLarge));
            return false;
        }
        let Some(end) = find_terminator(&self.response) else {
            return true;
        };
        // Anything past the blank line already belongs to the frame stream.
        let leftover = self.response.split_off(end + 4);
        let head = std::mem::take(&mut self.response);
        let Some(challenge) = self.challenge.take() else {
            self.fail(Error::ConnectionFailed(io::Error::new(
                io::ErrorKind::Other,
                "missing handshake state",
            )));
            return false;
        };
        match handshake::validate_response(&head, challenge.expected()) {
            Ok(()) => {
                debug!("handshake complete with {}", self.target.host());
                self.deadline = None;
                self.state = State::Connected;
                self.handler.on_open();
                if leftover.is_empty() {
                    true
                } else {
                    self.process_frames(&leftover)
                }
            }
            Err(e) => {
                self.fail(Error::HandshakeFailed(e));
                false
            }
        }
    }

    fn process_frames(&mut self, mut input: &[u8]) -> bool {
        while !input.is_empty() {
            match self.decoder.decode(input) {
                Ok((consumed, incoming)) => {
                    input = &input[consumed..];
                    if let Some(incoming) = incoming {
                        if !self.dispatch(incoming) {
                            return false;
                        }
                    }
                }
                Err(e) => {
                    self.fail(e);
                    return false;
                }
            }
        }
        true
    }

    fn dispatch(&mut self, incoming: Incoming) -> bool {
        match incoming {
            Incoming::Text(text) => {
                trace!("text message, {} bytes", text.len());
                self.handler.on_text_message(&text);
                true
            }
            Incoming::Binary(data) => {
                trace!("binary message, {} bytes", data.len());
                self.handler.on_binary_message(&data);
                true
            }
            Incoming::Ping(payload) => {
                trace!("ping, {} bytes", payload.len());
                self.queue_control(OpCode::Pong, &payload);
                self.pump_writes();
                self.state != State::Disconnected
            }
            Incoming::Pong(payload) => {
                trace!("pong, {} bytes", payload.len());
                true
            }
            Incoming::Close(payload) => {
                self.peer_close(&payload);
                false
            }
        }
    }

    /// Orderly shutdown on a peer Close frame: echo the status code if we
    /// have not sent a Close yet, then tear down and notify.
    fn peer_close(&mut self, payload: &[u8]) {
        debug!("close frame from peer");
        if !self.close_sent {
            let echo = if payload.len() >= 2 {
                framing::close_payload(u16::from_be_bytes([payload[0], payload[1]]), b"")
            } else {
                Vec::new()
            };
            self.queue_control(OpCode::Close, &echo);
            self.close_sent = true;
        }
        let _ = self.flush_write_queue();
        self.teardown();
        self.handler.on_close();
    }

    /// Encodes a control frame straight into the write queue. Payload sizes
    /// are bounded upstream (decoder and send API), so encoding cannot fail
    /// here.
    fn queue_control(&mut self, opcode: OpCode, payload: &[u8]) {
        match self.new_mask() {
            Ok(mask) => {
                if let Err(e) = framing::encode_frame(&mut self.write_queue, true, opcode, mask, payload)
                {
                    warn!("dropping outbound {opcode:?} frame: {e}");
                }
            }
            Err(e) => warn!("dropping outbound {opcode:?} frame: {e}"),
        }
    }

    fn pump_writes(&mut self) {
        if self.state == State::Disconnected {
            return;
        }
        if let Err(e) = self.flush_write_queue() {
            self.fail_io(e);
        }
    }

    fn flush_write_queue(&mut self) -> io::Result<()> {
        while !self.write_queue.is_empty() {
            match self.transport.write(&self.write_queue) {
                Ok(0) => break,
                Ok(n) => {
                    self.write_queue.drain(..n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        match self.transport.flush() {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        if self.write_queue.is_empty() && self.pending_sends > 0 {
            for _ in 0..self.pending_sends {
                self.handler.on_message_sent();
            }
            self.pending_sends = 0;
        }
        Ok(())
    }

    fn new_mask(&self) -> io::Result<[u8; 4]> {
        let mut mask = [0u8; 4];
        self.rng
            .fill(&mut mask)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "random source failure"))?;
        Ok(mask)
    }

    fn fail_io(&mut self, e: io::Error) {
        let error = if self.state == State::Connecting {
            Error::ConnectionFailed(e)
        } else {
            Error::Transport(e)
        };
        self.fail(error);
    }

    /// Single surfacing point for every failure: teardown, then one
    /// `on_failure`, plus `on_close` when the state had reached Connected.
    fn fail(&mut self, error: Error) {
        let was_connected = self.state == State::Connected;
        warn!("connection failure: {error}");
        self.teardown();
        self.handler.on_failure(error);
        if was_connected {
            self.handler.on_close();
        }
    }

    fn teardown(&mut self) {
        self.transport.shutdown();
        self.state = State::Disconnected;
        self.challenge = None;
        self.deadline = None;
        self.response.clear();
        self.decoder.reset();
        self.write_queue.clear();
        self.pending_sends = 0;
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
