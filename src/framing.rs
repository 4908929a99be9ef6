//! RFC 6455 frame layer: the incremental decoder state machine for
//! server-to-client frames and the masked encoder for client-to-server
//! frames.

use arrayvec::ArrayVec;

use crate::error::{Error, ProtocolError};

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_BITS: u8 = 0x0F;
const LEN_BITS: u8 = 0x7F;

/// Control frames carry at most 125 payload bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Base header (2) + 8-byte extended length + 4-byte mask key.
const MAX_HEADER: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        match bits {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(ProtocolError::InvalidOpcode(other)),
        }
    }

    fn as_bits(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// A completed inbound message or control signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Vec<u8>),
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Header,
    ExtendedLen { fin: bool, opcode: OpCode, need: usize },
    Payload { fin: bool, opcode: OpCode, remaining: usize },
}

/// Incremental frame decoder.
///
/// Consumes input byte-exact: header (2 bytes), optional extended length
/// (2 or 8 bytes), then payload. Data fragments accumulate in the
/// in-progress message buffer until a FIN=1 frame completes it; control
/// frames use a separate buffer so they can interleave with fragments.
/// Partial input always leaves the machine awaiting the exact remainder.
pub struct FrameDecoder {
    state: DecodeState,
    scratch: ArrayVec<u8, 8>,
    message_opcode: Option<OpCode>,
    message: Vec<u8>,
    control: Vec<u8>,
    max_message_size: usize,
}

impl FrameDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            state: DecodeState::Header,
            scratch: ArrayVec::new(),
            message_opcode: None,
            message: Vec::new(),
            control: Vec::new(),
            max_message_size,
        }
    }

    /// Consumes bytes from `input` and returns `(consumed, completed)`.
    ///
    /// Stops at the first completed message so the caller can dispatch it
    /// before feeding the rest; `completed == None` means all of `input`
    /// was consumed and more bytes are awaited.
    ///
    /// Any error aborts the in-progress message and resets the machine.
    pub fn decode(&mut self, input: &[u8]) -> Result<(usize, Option<Incoming>), Error> {
        let mut consumed = 0;
        loop {
            match self.state {
                DecodeState::Header => {
                    if !self.fill_scratch(input, &mut consumed, 2) {
                        return Ok((consumed, None));
                    }
                    let b0 = self.scratch[0];
                    let b1 = self.scratch[1];
                    self.scratch.clear();

                    if b1 & MASK_BIT != 0 {
                        return Err(self.abort(ProtocolError::MaskedFrame));
                    }
                    if b0 & RSV_BITS != 0 {
                        return Err(self.abort(ProtocolError::ReservedBits));
                    }
                    let opcode = match OpCode::from_bits(b0 & OPCODE_BITS) {
                        Ok(opcode) => opcode,
                        Err(e) => return Err(self.abort(e)),
                    };
                    let fin = b0 & FIN_BIT != 0;
                    let code = (b1 & LEN_BITS) as u64;
                    if opcode.is_control() {
                        if !fin {
                            return Err(self.abort(ProtocolError::FragmentedControl));
                        }
                        if code > MAX_CONTROL_PAYLOAD as u64 {
                            return Err(self.abort(ProtocolError::ControlTooLong));
                        }
                    }
                    match code {
                        126 => self.state = DecodeState::ExtendedLen { fin, opcode, need: 2 },
                        127 => self.state = DecodeState::ExtendedLen { fin, opcode, need: 8 },
                        n => self.begin_payload(fin, opcode, n)?,
                    }
                }
                DecodeState::ExtendedLen { fin, opcode, need } => {
                    if !self.fill_scratch(input, &mut consumed, need) {
                        return Ok((consumed, None));
                    }
                    let len = if need == 2 {
                        u16::from_be_bytes([self.scratch[0], self.scratch[1]]) as u64
                    } else {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(&self.scratch);
                        u64::from_be_bytes(raw)
                    };
                    self.scratch.clear();
                    self.begin_payload(fin, opcode, len)?;
                }
                DecodeState::Payload { fin, opcode, remaining } => {
                    if remaining > 0 {
                        let available = input.len() - consumed;
                        if available == 0 {
                            return Ok((consumed, None));
                        }
                        let take = available.min(remaining);
                        let chunk = &input[consumed..consumed + take];
                        if opcode.is_control() {
                            self.control.extend_from_slice(chunk);
                        } else {
                            self.message.extend_from_slice(chunk);
                        }
                        consumed += take;
                        if take < remaining {
                            self.state = DecodeState::Payload {
                                fin,
                                opcode,
                                remaining: remaining - take,
                            };
                            return Ok((consumed, None));
                        }
                    }
                    self.state = DecodeState::Header;
                    if let Some(incoming) = self.finish_frame(fin, opcode)? {
                        return Ok((consumed, Some(incoming)));
                    }
                }
            }
        }
    }

    /// True when nothing is buffered: no partial frame and no in-progress
    /// message.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::Header)
            && self.scratch.is_empty()
            && self.message_opcode.is_none()
            && self.message.is_empty()
            && self.control.is_empty()
    }

    /// Drops all partial-frame and in-progress message state.
    pub fn reset(&mut self) {
        self.state = DecodeState::Header;
        self.scratch.clear();
        self.message_opcode = None;
        self.message.clear();
        self.control.clear();
    }

    fn fill_scratch(&mut self, input: &[u8], consumed: &mut usize, need: usize) -> bool {
        while self.scratch.len() < need && *consumed < input.len() {
            self.scratch.push(input[*consumed]);
            *consumed += 1;
        }
        self.scratch.len() == need
    }

    /// Validates the frame against the fragmentation state and the message
    /// size limit, then arms the payload state. The limit is enforced before
    /// any buffer growth, on the whole in-progress message rather than the
    /// single frame.
    fn begin_payload(&mut self, fin: bool, opcode: OpCode, len: u64) -> Result<(), Error> {
        if !opcode.is_control() {
            match opcode {
                OpCode::Continuation => {
                    if self.message_opcode.is_none() {
                        return Err(self.abort(ProtocolError::UnexpectedContinuation));
                    }
                }
                _ => {
                    if self.message_opcode.is_some() {
                        return Err(self.abort(ProtocolError::InterleavedDataFrame));
                    }
                    self.message_opcode = Some(opcode);
                }
            }
            let total = match (self.message.len() as u64).checked_add(len) {
                Some(total) => total,
                None => return Err(self.abort(ProtocolError::Overflow(len))),
            };
            if total > self.max_message_size as u64 {
                return Err(self.abort(ProtocolError::Overflow(total)));
            }
            self.message.reserve(len as usize);
        }
        self.state = DecodeState::Payload {
            fin,
            opcode,
            remaining: len as usize,
        };
        Ok(())
    }

    fn finish_frame(&mut self, fin: bool, opcode: OpCode) -> Result<Option<Incoming>, Error> {
        if opcode.is_control() {
            let payload = std::mem::take(&mut self.control);
            return Ok(Some(match opcode {
                OpCode::Close => Incoming::Close(payload),
                OpCode::Ping => Incoming::Ping(payload),
                _ => Incoming::Pong(payload),
            }));
        }
        if !fin {
            // Fragment stored; the message completes on a later FIN=1 frame.
            return Ok(None);
        }
        let first = self.message_opcode.take();
        let payload = std::mem::take(&mut self.message);
        match first {
            Some(OpCode::Binary) => Ok(Some(Incoming::Binary(payload))),
            Some(OpCode::Text) => match String::from_utf8(payload) {
                Ok(text) => Ok(Some(Incoming::Text(text))),
                Err(e) => Err(Error::InvalidEncoding(e.utf8_error())),
            },
            // begin_payload only ever records Text or Binary as the first
            // fragment's opcode.
            _ => Err(Error::Protocol(ProtocolError::UnexpectedContinuation)),
        }
    }

    fn abort(&mut self, error: ProtocolError) -> Error {
        self.reset();
        Error::Protocol(error)
    }
}

/// Serializes one client frame into `dst`.
///
/// Every client frame carries the MASK bit; callers supply a fresh random
/// 4-byte key per frame. Fragmented data messages are written as a FIN=0
/// first frame, FIN=0 continuations and a FIN=1 last continuation.
pub fn encode_frame(
    dst: &mut Vec<u8>,
    fin: bool,
    opcode: OpCode,
    mask: [u8; 4],
    payload: &[u8],
) -> Result<(), ProtocolError> {
    if opcode.is_control() {
        if !fin {
            return Err(ProtocolError::FragmentedControl);
        }
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::ControlTooLong);
        }
    }

    let mut head = ArrayVec::<u8, MAX_HEADER>::new();
    head.push(if fin { FIN_BIT } else { 0 } | opcode.as_bits());
    if payload.len() <= MAX_CONTROL_PAYLOAD {
        head.push(MASK_BIT | payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        head.push(MASK_BIT | 126);
        head.try_extend_from_slice(&(payload.len() as u16).to_be_bytes())
            .expect("header fits");
    } else {
        head.push(MASK_BIT | 127);
        head.try_extend_from_slice(&(payload.len() as u64).to_be_bytes())
            .expect("header fits");
    }
    head.try_extend_from_slice(&mask).expect("header fits");

    dst.reserve(head.len() + payload.len());
    dst.extend_from_slice(&head);
    let start = dst.len();
    dst.extend_from_slice(payload);
    apply_mask(&mut dst[start..], mask);
    Ok(())
}

/// XORs `buf` with the repeating 4-byte key, in place. Involutive: applying
/// it twice restores the input.
pub(crate) fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Close frame payload: big-endian status code followed by an optional
/// reason.
pub fn close_payload(code: u16, reason: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024 * 1024;

    fn decode_all(decoder: &mut FrameDecoder, mut input: &[u8]) -> Vec<Incoming> {
        let mut out = Vec::new();
        while !input.is_empty() {
            let (consumed, incoming) = decoder.decode(input).expect("decode");
            input = &input[consumed..];
            match incoming {
                Some(incoming) => out.push(incoming),
                None => break,
            }
        }
        out
    }

    /// Converts a masked client frame into the unmasked server form so the
    /// decoder can read back what the encoder wrote.
    fn unmask_frame(frame: &[u8]) -> Vec<u8> {
        let code = frame[1] & LEN_BITS;
        let ext = match code {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let mask_at = 2 + ext;
        let mask: [u8; 4] = frame[mask_at..mask_at + 4].try_into().expect("mask key");
        let mut out = Vec::with_capacity(frame.len() - 4);
        out.push(frame[0]);
        out.push(frame[1] & !MASK_BIT);
        out.extend_from_slice(&frame[2..mask_at]);
        let start = out.len();
        out.extend_from_slice(&frame[mask_at + 4..]);
        apply_mask(&mut out[start..], mask);
        out
    }

    #[test]
    fn single_text_frame() {
        let mut decoder = FrameDecoder::new(MAX);
        let mut frame = vec![0x81, 0x05];
        frame.extend_from_slice(b"hello");
        let (consumed, incoming) = decoder.decode(&frame).unwrap();
        assert_eq!(consumed, 7);
        assert_eq!(incoming, Some(Incoming::Text("hello".to_owned())));
        assert!(decoder.is_idle());
    }

    #[test]
    fn fragmented_text_reassembles() {
        let mut decoder = FrameDecoder::new(MAX);
        let (consumed, incoming) = decoder.decode(&[0x01, 0x02, b'h', b'e']).unwrap();
        assert_eq!((consumed, incoming), (4, None));
        assert!(!decoder.is_idle());

        let (consumed, incoming) = decoder.decode(&[0x80, 0x03, b'l', b'l', b'o']).unwrap();
        assert_eq!(consumed, 5);
        assert_eq!(incoming, Some(Incoming::Text("hello".to_owned())));
        assert!(decoder.is_idle());
    }

    #[test]
    fn control_frame_between_fragments() {
        let mut decoder = FrameDecoder::new(MAX);
        let mut input = vec![0x01, 0x02, b'h', b'e'];
        input.extend_from_slice(&[0x89, 0x01, b'!']);
        input.extend_from_slice(&[0x80, 0x03, b'l', b'l', b'o']);
        let messages = decode_all(&mut decoder, &input);
        assert_eq!(
            messages,
            vec![
                Incoming::Ping(b"!".to_vec()),
                Incoming::Text("hello".to_owned()),
            ]
        );
    }

    #[test]
    fn extended_16_bit_length_needs_every_byte() {
        let mut decoder = FrameDecoder::new(MAX);
        let payload: Vec<u8> = (0..300u16).map(|i| i as u8).collect();
        let mut frame = vec![0x82, 126, 0x01, 0x2C];
        frame.extend_from_slice(&payload);

        // One byte short: no dispatch yet.
        let (consumed, incoming) = decoder.decode(&frame[..frame.len() - 1]).unwrap();
        assert_eq!(consumed, frame.len() - 1);
        assert!(incoming.is_none());
        assert!(!decoder.is_idle());

        let (consumed, incoming) = decoder.decode(&frame[frame.len() - 1..]).unwrap();
        assert_eq!(consumed, 1);
        assert_eq!(incoming, Some(Incoming::Binary(payload)));
        assert!(decoder.is_idle());
    }

    #[test]
    fn byte_at_a_time_feed() {
        let mut decoder = FrameDecoder::new(MAX);
        let mut frame = vec![0x81, 0x05];
        frame.extend_from_slice(b"hello");
        let mut messages = Vec::new();
        for &byte in &frame {
            let (consumed, incoming) = decoder.decode(&[byte]).unwrap();
            assert_eq!(consumed, 1);
            if let Some(incoming) = incoming {
                messages.push(incoming);
            }
        }
        assert_eq!(messages, vec![Incoming::Text("hello".to_owned())]);
    }

    #[test]
    fn masked_server_frame_is_rejected() {
        let mut decoder = FrameDecoder::new(MAX);
        let err = decoder.decode(&[0x81, 0x85]).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::MaskedFrame)));
        assert!(decoder.is_idle());
    }

    #[test]
    fn header_violations() {
        // reserved bit
        let err = FrameDecoder::new(MAX).decode(&[0xC1, 0x00]).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::ReservedBits)));

        // unknown opcode
        let err = FrameDecoder::new(MAX).decode(&[0x83, 0x00]).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::InvalidOpcode(3))));

        // non-final ping
        let err = FrameDecoder::new(MAX).decode(&[0x09, 0x00]).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::FragmentedControl)));

        // close frame advertising a 16-bit length
        let err = FrameDecoder::new(MAX).decode(&[0x88, 126]).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::ControlTooLong)));
    }

    #[test]
    fn fragmentation_violations() {
        // continuation with no message in progress
        let err = FrameDecoder::new(MAX).decode(&[0x80, 0x00]).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnexpectedContinuation)
        ));

        // a second text frame while fragments are pending
        let mut decoder = FrameDecoder::new(MAX);
        decoder.decode(&[0x01, 0x01, b'a']).unwrap();
        let err = decoder.decode(&[0x01, 0x01, b'b']).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::InterleavedDataFrame)
        ));
        assert!(decoder.is_idle());
    }

    #[test]
    fn oversize_length_rejected_before_allocation() {
        let mut decoder = FrameDecoder::new(16);
        let err = decoder.decode(&[0x82, 126, 0x00, 0x20]).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::Overflow(32))));

        // 64-bit length far beyond any buffer
        let mut decoder = FrameDecoder::new(MAX);
        let mut frame = vec![0x82, 127];
        frame.extend_from_slice(&(1u64 << 40).to_be_bytes());
        let err = decoder.decode(&frame).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::Overflow(_))));
        assert!(decoder.is_idle());
    }

    #[test]
    fn limit_applies_to_whole_message_not_frame() {
        let mut decoder = FrameDecoder::new(4);
        let (_, incoming) = decoder.decode(&[0x01, 0x03, b'a', b'b', b'c']).unwrap();
        assert!(incoming.is_none());
        let err = decoder.decode(&[0x80, 0x03, b'd', b'e', b'f']).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::Overflow(6))));
    }

    #[test]
    fn invalid_utf8_text_is_dropped() {
        let mut decoder = FrameDecoder::new(MAX);
        let err = decoder.decode(&[0x81, 0x02, 0xC3, 0x28]).unwrap_err();
        assert!(matches!(err, Error::InvalidEncoding(_)));
        assert!(decoder.message.is_empty());
        assert!(decoder.message_opcode.is_none());
    }

    #[test]
    fn zero_length_and_close_frames() {
        let mut decoder = FrameDecoder::new(MAX);
        let (consumed, incoming) = decoder.decode(&[0x89, 0x00]).unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(incoming, Some(Incoming::Ping(Vec::new())));

        let (_, incoming) = decoder.decode(&[0x88, 0x02, 0x03, 0xE8]).unwrap();
        assert_eq!(incoming, Some(Incoming::Close(vec![0x03, 0xE8])));
    }

    #[test]
    fn encoder_masks_and_round_trips() {
        let mask = [0x11, 0x22, 0x33, 0x44];
        let mut frame = Vec::new();
        encode_frame(&mut frame, true, OpCode::Text, mask, b"hello").unwrap();

        assert_eq!(frame[0], 0x81);
        assert_eq!(frame[1], 0x80 | 5);
        assert_eq!(&frame[2..6], &mask);
        // payload is not on the wire in the clear
        assert_ne!(&frame[6..], b"hello");

        let mut decoder = FrameDecoder::new(MAX);
        let (_, incoming) = decoder.decode(&unmask_frame(&frame)).unwrap();
        assert_eq!(incoming, Some(Incoming::Text("hello".to_owned())));
    }

    #[test]
    fn encoder_length_encodings() {
        let mask = [9, 9, 9, 9];

        let mut frame = Vec::new();
        encode_frame(&mut frame, true, OpCode::Binary, mask, &[0u8; 300]).unwrap();
        assert_eq!(frame[1], 0x80 | 126);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 300);
        assert_eq!(frame.len(), 2 + 2 + 4 + 300);

        let mut frame = Vec::new();
        encode_frame(&mut frame, true, OpCode::Binary, mask, &[0u8; 70_000]).unwrap();
        assert_eq!(frame[1], 0x80 | 127);
        assert_eq!(
            u64::from_be_bytes(frame[2..10].try_into().unwrap()),
            70_000
        );
        assert_eq!(frame.len(), 2 + 8 + 4 + 70_000);
    }

    #[test]
    fn encoder_fragments_round_trip() {
        let mask = [7, 7, 7, 7];
        let mut wire = Vec::new();
        let mut frame = Vec::new();
        encode_frame(&mut frame, false, OpCode::Text, mask, b"he").unwrap();
        wire.extend(unmask_frame(&frame));
        frame.clear();
        encode_frame(&mut frame, false, OpCode::Continuation, mask, b"ll").unwrap();
        wire.extend(unmask_frame(&frame));
        frame.clear();
        encode_frame(&mut frame, true, OpCode::Continuation, mask, b"o").unwrap();
        wire.extend(unmask_frame(&frame));

        let mut decoder = FrameDecoder::new(MAX);
        let messages = decode_all(&mut decoder, &wire);
        assert_eq!(messages, vec![Incoming::Text("hello".to_owned())]);
    }

    #[test]
    fn encoder_rejects_bad_control_frames() {
        let mask = [0; 4];
        let mut dst = Vec::new();
        assert_eq!(
            encode_frame(&mut dst, true, OpCode::Ping, mask, &[0u8; 126]),
            Err(ProtocolError::ControlTooLong)
        );
        assert_eq!(
            encode_frame(&mut dst, false, OpCode::Close, mask, &[]),
            Err(ProtocolError::FragmentedControl)
        );
    }

    #[test]
    fn close_payload_layout() {
        assert_eq!(close_payload(1000, b"bye"), vec![0x03, 0xE8, b'b', b'y', b'e']);
        assert_eq!(close_payload(1002, b""), vec![0x03, 0xEA]);
    }
}
