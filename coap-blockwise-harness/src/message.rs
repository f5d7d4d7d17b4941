//! CoAP message wire format (RFC 7252 §3).
//!
//! Every datagram exchanged with the client under test is a [`Message`].
//! This module is responsible for:
//! - Defining the header fields, message types, codes, and options.
//! - Serialising a [`Message`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Message`], returning errors
//!   for malformed or truncated input.
//!
//! No I/O happens here.
//!
//! # Wire format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Options (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Options are delta-encoded against the previous option number; both the
//! delta and the length use a 4-bit nibble with 1- or 2-byte extensions.

use thiserror::Error;

use crate::block::{BlockError, BlockOption};

/// Protocol version carried in every header.
pub const VERSION: u8 = 1;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 4;

/// Longest token permitted by RFC 7252.
pub const MAX_TOKEN_LEN: usize = 8;

const PAYLOAD_MARKER: u8 = 0xFF;

// Nibble escapes for option delta / length.
const EXT_8BIT: u8 = 13;
const EXT_16BIT: u8 = 14;
const RESERVED_NIBBLE: u8 = 15;
const EXT_8BIT_BASE: usize = 13;
const EXT_16BIT_BASE: usize = 269;
const MAX_EXTENDED: usize = EXT_16BIT_BASE + u16::MAX as usize;

/// Registered option numbers used by the harness.
pub mod option_number {
    pub const URI_HOST: u16 = 3;
    pub const URI_PATH: u16 = 11;
    pub const BLOCK2: u16 = 23;
}

/// The `T` header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::Confirmable => 0,
            Self::NonConfirmable => 1,
            Self::Acknowledgement => 2,
            Self::Reset => 3,
        }
    }
}

/// Method or response code, stored as the raw `c.dd` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(u8);

impl Code {
    pub const EMPTY: Code = Code::new(0, 0);
    pub const GET: Code = Code::new(0, 1);
    pub const POST: Code = Code::new(0, 2);
    pub const CONTENT: Code = Code::new(2, 5);
    pub const NOT_FOUND: Code = Code::new(4, 4);
    pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 5);

    pub const fn new(class: u8, detail: u8) -> Self {
        Code((class & 0b111) << 5 | (detail & 0b1_1111))
    }

    pub fn from_byte(raw: u8) -> Self {
        Code(raw)
    }

    pub fn byte(self) -> u8 {
        self.0
    }

    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(self) -> u8 {
        self.0 & 0b1_1111
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_request(self) -> bool {
        self.class() == 0 && self.detail() != 0
    }

    pub fn is_response(self) -> bool {
        (2..=5).contains(&self.class())
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// One option instance: number plus opaque value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

/// A complete CoAP message: header, token, options, payload.
///
/// `options` is always kept sorted by option number (insertion order is
/// preserved among equal numbers, which matters for repeated Uri-Path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Vec<u8>,
    options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: MessageType, code: Code, message_id: u16) -> Self {
        Self {
            msg_type,
            code,
            message_id,
            token: Vec::new(),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Confirmable GET for `path`; message id and token are left for the
    /// sender to fill in.
    pub fn get(path: &str) -> Self {
        let mut msg = Self::new(MessageType::Confirmable, Code::GET, 0);
        msg.set_uri_path(path);
        msg
    }

    /// Response skeleton correlated with `request`: piggybacked ACK for a
    /// confirmable request, NON otherwise; same message id and token.
    pub fn response_to(request: &Message, code: Code) -> Self {
        let msg_type = match request.msg_type {
            MessageType::Confirmable => MessageType::Acknowledgement,
            _ => MessageType::NonConfirmable,
        };
        let mut msg = Self::new(msg_type, code, request.message_id);
        msg.token = request.token.clone();
        msg
    }

    pub fn with_token(mut self, token: impl Into<Vec<u8>>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_block2(mut self, block: BlockOption) -> Self {
        self.set_block2(block);
        self
    }

    pub fn options(&self) -> &[CoapOption] {
        &self.options
    }

    /// Insert an option, keeping the list sorted by number.
    pub fn add_option(&mut self, number: u16, value: impl Into<Vec<u8>>) {
        let at = self.options.partition_point(|o| o.number <= number);
        self.options.insert(
            at,
            CoapOption {
                number,
                value: value.into(),
            },
        );
    }

    pub fn remove_options(&mut self, number: u16) {
        self.options.retain(|o| o.number != number);
    }

    /// Values of every instance of option `number`, in order.
    pub fn option_values(&self, number: u16) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |o| o.number == number)
            .map(|o| o.value.as_slice())
    }

    pub fn has_option(&self, number: u16) -> bool {
        self.options.iter().any(|o| o.number == number)
    }

    /// Replace all Uri-Path options with the segments of `path`.
    pub fn set_uri_path(&mut self, path: &str) {
        self.remove_options(option_number::URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(option_number::URI_PATH, segment.as_bytes());
        }
    }

    /// Absolute path built from the Uri-Path options (`/` when there are none).
    pub fn uri_path(&self) -> String {
        let mut path = String::new();
        for segment in self.option_values(option_number::URI_PATH) {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(segment));
        }
        if path.is_empty() {
            path.push('/');
        }
        path
    }

    /// The first BLOCK2 option, if present.
    pub fn block2(&self) -> Result<Option<BlockOption>, BlockError> {
        self.option_values(option_number::BLOCK2)
            .next()
            .map(BlockOption::decode)
            .transpose()
    }

    pub fn set_block2(&mut self, block: BlockOption) {
        self.remove_options(option_number::BLOCK2);
        self.add_option(option_number::BLOCK2, block.encode());
    }

    pub fn is_request(&self) -> bool {
        self.code.is_request()
    }

    pub fn is_confirmable(&self) -> bool {
        self.msg_type == MessageType::Confirmable
    }

    /// Serialise this message into a newly allocated byte vector.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        if self.token.len() > MAX_TOKEN_LEN {
            return Err(MessageError::TokenTooLong(self.token.len()));
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + self.token.len() + self.payload.len() + 16);
        buf.push(VERSION << 6 | self.msg_type.bits() << 4 | self.token.len() as u8);
        buf.push(self.code.byte());
        buf.extend_from_slice(&self.message_id.to_be_bytes());
        buf.extend_from_slice(&self.token);

        let mut previous = 0u16;
        for opt in &self.options {
            let (delta_nibble, delta_ext) = split_nibble(usize::from(opt.number - previous))?;
            let (len_nibble, len_ext) = split_nibble(opt.value.len())?;
            buf.push(delta_nibble << 4 | len_nibble);
            buf.extend_from_slice(&delta_ext);
            buf.extend_from_slice(&len_ext);
            buf.extend_from_slice(&opt.value);
            previous = opt.number;
        }

        if !self.payload.is_empty() {
            buf.push(PAYLOAD_MARKER);
            buf.extend_from_slice(&self.payload);
        }
        Ok(buf)
    }

    /// Parse a [`Message`] from a raw datagram.
    pub fn decode(buf: &[u8]) -> Result<Self, MessageError> {
        if buf.len() < HEADER_LEN {
            return Err(MessageError::BufferTooShort);
        }

        let version = buf[0] >> 6;
        if version != VERSION {
            return Err(MessageError::UnsupportedVersion(version));
        }
        let msg_type = MessageType::from_bits(buf[0] >> 4);
        let tkl = buf[0] & 0x0F;
        if usize::from(tkl) > MAX_TOKEN_LEN {
            return Err(MessageError::InvalidTokenLength(tkl));
        }
        let code = Code::from_byte(buf[1]);
        let message_id = u16::from_be_bytes([buf[2], buf[3]]);

        let mut pos = HEADER_LEN;
        let token = buf
            .get(pos..pos + usize::from(tkl))
            .ok_or(MessageError::BufferTooShort)?
            .to_vec();
        pos += usize::from(tkl);

        let mut options = Vec::new();
        let mut number = 0usize;
        let mut payload = Vec::new();

        while pos < buf.len() {
            let head = buf[pos];
            pos += 1;
            if head == PAYLOAD_MARKER {
                if pos == buf.len() {
                    return Err(MessageError::EmptyPayload);
                }
                payload = buf[pos..].to_vec();
                break;
            }

            let delta = read_extended(buf, &mut pos, head >> 4)?;
            let len = read_extended(buf, &mut pos, head & 0x0F)?;
            number += delta;
            if number > usize::from(u16::MAX) {
                return Err(MessageError::OptionNumberOverflow);
            }
            let value = buf
                .get(pos..pos + len)
                .ok_or(MessageError::TruncatedOption)?
                .to_vec();
            pos += len;
            options.push(CoapOption {
                number: number as u16,
                value,
            });
        }

        Ok(Self {
            msg_type,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {} mid={} path={}",
            self.msg_type,
            self.code,
            self.message_id,
            self.uri_path()
        )?;
        if let Ok(Some(block)) = self.block2() {
            write!(f, " block2={block}")?;
        }
        if !self.payload.is_empty() {
            write!(f, " len={}", self.payload.len())?;
        }
        Ok(())
    }
}

/// Errors that can arise when encoding or parsing a datagram.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("buffer too short to contain a header and token")]
    BufferTooShort,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("token length {0} exceeds 8")]
    InvalidTokenLength(u8),
    #[error("token of {0} bytes cannot be encoded")]
    TokenTooLong(usize),
    #[error("option runs past the end of the datagram")]
    TruncatedOption,
    #[error("reserved option nibble 15")]
    ReservedNibble,
    #[error("option number exceeds 65535")]
    OptionNumberOverflow,
    #[error("option value of {0} bytes cannot be encoded")]
    OptionTooLong(usize),
    #[error("payload marker followed by an empty payload")]
    EmptyPayload,
}

/// Split a delta or length into its 4-bit nibble and extension bytes.
fn split_nibble(value: usize) -> Result<(u8, Vec<u8>), MessageError> {
    if value < EXT_8BIT_BASE {
        Ok((value as u8, Vec::new()))
    } else if value < EXT_16BIT_BASE {
        Ok((EXT_8BIT, vec![(value - EXT_8BIT_BASE) as u8]))
    } else if value <= MAX_EXTENDED {
        let ext = (value - EXT_16BIT_BASE) as u16;
        Ok((EXT_16BIT, ext.to_be_bytes().to_vec()))
    } else {
        Err(MessageError::OptionTooLong(value))
    }
}

/// Resolve a delta/length nibble, consuming extension bytes from `buf`.
fn read_extended(buf: &[u8], pos: &mut usize, nibble: u8) -> Result<usize, MessageError> {
    match nibble {
        EXT_8BIT => {
            let b = *buf.get(*pos).ok_or(MessageError::TruncatedOption)?;
            *pos += 1;
            Ok(EXT_8BIT_BASE + usize::from(b))
        }
        EXT_16BIT => {
            let bytes = buf.get(*pos..*pos + 2).ok_or(MessageError::TruncatedOption)?;
            *pos += 2;
            Ok(EXT_16BIT_BASE + usize::from(u16::from_be_bytes([bytes[0], bytes[1]])))
        }
        RESERVED_NIBBLE => Err(MessageError::ReservedNibble),
        n => Ok(usize::from(n)),
    }
}
