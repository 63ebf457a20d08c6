//! Link framing for the software provider.
//!
//! Each connected queue pair rides on one TCP stream. Everything on the
//! stream is a frame:
//!
//! ```text
//! ┌─────┬──────────┬──────────────────┐
//! │ tag │ len (LE) │   body (len)     │
//! │ u8  │   u32    │                  │
//! └─────┴──────────┴──────────────────┘
//! ```
//!
//! The connect request body carries the connection parameters followed by
//! the private data; accept and reject bodies are the private data alone.

use super::cm::ConnParam;
use super::{lock, TransportError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const TAG_CONNECT_REQUEST: u8 = 1;
const TAG_ACCEPT: u8 = 2;
const TAG_REJECT: u8 = 3;
const TAG_DATA: u8 = 4;
const TAG_DISCONNECT: u8 = 5;

const FRAME_HEADER: usize = 5;

/// Largest body a peer may announce.
pub(crate) const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    ConnectRequest(ConnParam),
    Accept(Bytes),
    Reject(Bytes),
    Data(Bytes),
    Disconnect,
}

impl Frame {
    pub(crate) fn encode(&self) -> Bytes {
        let (tag, body): (u8, Bytes) = match self {
            Frame::ConnectRequest(param) => {
                let mut body = BytesMut::with_capacity(3 + param.private_data.len());
                body.put_u8(param.responder_resources);
                body.put_u8(param.initiator_depth);
                body.put_u8(param.rnr_retry_count);
                body.put_slice(&param.private_data);
                (TAG_CONNECT_REQUEST, body.freeze())
            }
            Frame::Accept(data) => (TAG_ACCEPT, data.clone()),
            Frame::Reject(data) => (TAG_REJECT, data.clone()),
            Frame::Data(data) => (TAG_DATA, data.clone()),
            Frame::Disconnect => (TAG_DISCONNECT, Bytes::new()),
        };

        let mut out = BytesMut::with_capacity(FRAME_HEADER + body.len());
        out.put_u8(tag);
        out.put_u32_le(body.len() as u32);
        out.put_slice(&body);
        out.freeze()
    }

    /// Reads one frame. Returns `Ok(None)` on a clean end of stream.
    pub(crate) fn read_from<R: Read>(reader: &mut R) -> io::Result<Option<Frame>> {
        let mut header = [0u8; FRAME_HEADER];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let mut head = &header[..];
        let tag = head.get_u8();
        let len = head.get_u32_le() as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds limit"),
            ));
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;
        let mut body = Bytes::from(body);

        let frame = match tag {
            TAG_CONNECT_REQUEST => {
                if body.len() < 3 {
                    return Err(io::Error::new(
                        ErrorKind::InvalidData,
                        "short connect request",
                    ));
                }
                let responder_resources = body.get_u8();
                let initiator_depth = body.get_u8();
                let rnr_retry_count = body.get_u8();
                Frame::ConnectRequest(ConnParam {
                    private_data: body,
                    responder_resources,
                    initiator_depth,
                    rnr_retry_count,
                })
            }
            TAG_ACCEPT => Frame::Accept(body),
            TAG_REJECT => Frame::Reject(body),
            TAG_DATA => Frame::Data(body),
            TAG_DISCONNECT => Frame::Disconnect,
            other => {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    format!("unknown frame tag {other}"),
                ))
            }
        };
        Ok(Some(frame))
    }
}

/// The sending half of a connected stream, shared by the queue pair and the
/// connection-manager endpoint.
#[derive(Debug)]
pub(crate) struct Link {
    writer: Mutex<TcpStream>,
    closed: AtomicBool,
    disconnected: AtomicBool,
}

impl Link {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            writer: Mutex::new(stream),
            closed: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        }
    }

    pub(crate) fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        let mut writer = lock(&self.writer);
        writer.write_all(&frame.encode())?;
        writer.flush()?;
        Ok(())
    }

    /// Shuts the stream down in both directions, waking the reader.
    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = lock(&self.writer).shutdown(Shutdown::Both);
        }
    }

    /// Claims the single disconnect notification for this link.
    ///
    /// Returns true exactly once, for whichever side noticed first.
    pub(crate) fn mark_disconnected(&self) -> bool {
        !self.disconnected.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_one(bytes: &[u8]) -> io::Result<Option<Frame>> {
        Frame::read_from(&mut Cursor::new(bytes.to_vec()))
    }

    #[test]
    fn test_connect_request_carries_params() {
        let param = ConnParam::with_private_data(Bytes::from_static(&[1, 2, 3, 4]));
        let encoded = Frame::ConnectRequest(param.clone()).encode();
        assert_eq!(encoded[0], TAG_CONNECT_REQUEST);
        assert_eq!(&encoded[1..5], &7u32.to_le_bytes());
        assert_eq!(read_one(&encoded).unwrap(), Some(Frame::ConnectRequest(param)));
    }

    #[test]
    fn test_sequence_of_frames() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&Frame::Data(Bytes::from_static(b"abc")).encode());
        stream.extend_from_slice(&Frame::Disconnect.encode());

        let mut cursor = Cursor::new(stream);
        assert_eq!(
            Frame::read_from(&mut cursor).unwrap(),
            Some(Frame::Data(Bytes::from_static(b"abc")))
        );
        assert_eq!(Frame::read_from(&mut cursor).unwrap(), Some(Frame::Disconnect));
        assert_eq!(Frame::read_from(&mut cursor).unwrap(), None);
    }

    #[test]
    fn test_unknown_tag() {
        let err = read_one(&[9, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_oversized_frame() {
        let mut header = vec![TAG_DATA];
        header.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_le_bytes());
        assert!(read_one(&header).is_err());
    }

    #[test]
    fn test_truncated_body() {
        let encoded = Frame::Data(Bytes::from_static(b"abcdef")).encode();
        let err = read_one(&encoded[..8]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }
}
