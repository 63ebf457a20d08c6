//! Fixed-Size Wire Message
//!
//! Every request and response travels as one fixed-size record that is copied
//! by value into and out of a connection's registered buffer. The record never
//! carries pointers, so it means the same thing on both peers.
//!
//! ## Wire Layout
//!
//! ```text
//! offset  0        4        8                                  72
//!         ┌────────┬────────┬──────────────────────────────────┐
//!         │data_len│  kind  │         payload (64 bytes)       │
//!         │ u32 LE │ u32 LE │                                  │
//!         └────────┴────────┴──────────────────────────────────┘
//! ```
//!
//! The record is always [`WIRE_SIZE`] bytes long. Bytes of the payload region
//! past `data_len` are whatever the buffer last held; readers must rely on
//! `data_len` and never on the payload boundary.

use bytes::{Buf, BufMut};
use std::fmt;
use thiserror::Error;

/// Capacity of the payload region in bytes.
pub const MESSAGE_BUF_SIZE: usize = 64;

/// Size of the `data_len` + `kind` header.
pub const HEADER_SIZE: usize = 8;

/// Total size of one wire record.
pub const WIRE_SIZE: usize = HEADER_SIZE + MESSAGE_BUF_SIZE;

/// Errors produced while building or decoding a [`Message`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// The payload does not fit in the fixed payload region
    #[error("payload of {len} bytes exceeds the {max} byte message buffer")]
    PayloadTooLarge { len: usize, max: usize },

    /// Fewer bytes than one wire record were supplied
    #[error("truncated message: got {len} bytes, need {need}")]
    Truncated { len: usize, need: usize },

    /// The kind tag is not one of the four known kinds
    #[error("unknown message kind tag: {0}")]
    UnknownKind(u32),

    /// The header announces more payload than the record can hold
    #[error("declared length {0} exceeds the message buffer")]
    LengthOutOfRange(u32),
}

/// The four message kinds carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    /// Placeholder record; never produced by a live exchange
    Dummy = 0,
    /// A request
    Request = 1,
    /// A request whose payload is carried inline in the record
    ImmediateRequest = 2,
    /// A response to a request
    Response = 3,
}

impl MessageKind {
    /// Returns true for the two request kinds.
    pub fn is_request(self) -> bool {
        matches!(self, MessageKind::Request | MessageKind::ImmediateRequest)
    }

    /// The tag written on the wire.
    pub fn tag(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for MessageKind {
    type Error = MessageError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(MessageKind::Dummy),
            1 => Ok(MessageKind::Request),
            2 => Ok(MessageKind::ImmediateRequest),
            3 => Ok(MessageKind::Response),
            other => Err(MessageError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Dummy => "dummy",
            MessageKind::Request => "request",
            MessageKind::ImmediateRequest => "immediate-request",
            MessageKind::Response => "response",
        };
        f.write_str(name)
    }
}

/// One wire record: header plus a fixed-capacity payload.
///
/// `Message` owns its bytes. Encoding copies them into a registered buffer
/// and decoding copies them back out, so a message never aliases the region
/// it travelled through.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    data_len: u32,
    payload: [u8; MESSAGE_BUF_SIZE],
}

impl Message {
    /// Builds a message of `kind` carrying `data`.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::PayloadTooLarge`] when `data` is longer than
    /// [`MESSAGE_BUF_SIZE`].
    pub fn new(kind: MessageKind, data: &[u8]) -> Result<Self, MessageError> {
        if data.len() > MESSAGE_BUF_SIZE {
            return Err(MessageError::PayloadTooLarge {
                len: data.len(),
                max: MESSAGE_BUF_SIZE,
            });
        }

        let mut payload = [0u8; MESSAGE_BUF_SIZE];
        payload[..data.len()].copy_from_slice(data);

        Ok(Self {
            kind,
            data_len: data.len() as u32,
            payload,
        })
    }

    /// Builds a [`MessageKind::Request`].
    pub fn request(data: &[u8]) -> Result<Self, MessageError> {
        Self::new(MessageKind::Request, data)
    }

    /// Builds a [`MessageKind::ImmediateRequest`].
    pub fn immediate_request(data: &[u8]) -> Result<Self, MessageError> {
        Self::new(MessageKind::ImmediateRequest, data)
    }

    /// Builds a [`MessageKind::Response`].
    pub fn response(data: &[u8]) -> Result<Self, MessageError> {
        Self::new(MessageKind::Response, data)
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn data_len(&self) -> u32 {
        self.data_len
    }

    /// The meaningful part of the payload (the first `data_len` bytes).
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.data_len as usize]
    }

    /// Encodes the record into a fresh array.
    pub fn encode(&self) -> [u8; WIRE_SIZE] {
        let mut out = [0u8; WIRE_SIZE];
        let mut buf = &mut out[..];
        buf.put_u32_le(self.data_len);
        buf.put_u32_le(self.kind.tag());
        buf.put_slice(&self.payload);
        out
    }

    /// Decodes one record from the front of `input`.
    ///
    /// Bytes beyond [`WIRE_SIZE`] are ignored.
    pub fn decode(input: &[u8]) -> Result<Self, MessageError> {
        if input.len() < WIRE_SIZE {
            return Err(MessageError::Truncated {
                len: input.len(),
                need: WIRE_SIZE,
            });
        }

        let mut buf = &input[..WIRE_SIZE];
        let data_len = buf.get_u32_le();
        let kind = MessageKind::try_from(buf.get_u32_le())?;
        if data_len as usize > MESSAGE_BUF_SIZE {
            return Err(MessageError::LengthOutOfRange(data_len));
        }

        let mut payload = [0u8; MESSAGE_BUF_SIZE];
        buf.copy_to_slice(&mut payload);

        Ok(Self {
            kind,
            data_len,
            payload,
        })
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("data_len", &self.data_len)
            .field("payload", &String::from_utf8_lossy(self.payload()))
            .finish()
    }
}
