//! Wire Protocol for the session stream
//!
//! Each binary WebSocket message carries one or more frames:
//! ```text
//! +--------+--------+--------+--------+--------+-- ... --+
//! | Type   | Length (4 bytes, big-endian)      | Payload |
//! +--------+--------+--------+--------+--------+-- ... --+
//! ```
//!
//! Message Types:
//! - 0x00: Data      - Terminal I/O data
//! - 0x01: Resize    - Window size change (cols: u16, rows: u16)
//! - 0x02: Heartbeat - Keep-alive ping/pong (seq: u32)
//! - 0x03: Error     - Error notification (utf-8)
//! - 0x04: Exit      - Remote shell exited (code: i32)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, ErrorKind};

/// Header size: 1 byte type + 4 bytes length
pub const HEADER_SIZE: usize = 5;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Message types for the wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Data = 0x00,
    Resize = 0x01,
    Heartbeat = 0x02,
    Error = 0x03,
    Exit = 0x04,
}

impl MessageType {
    /// Parse message type from byte
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Data),
            0x01 => Some(Self::Resize),
            0x02 => Some(Self::Heartbeat),
            0x03 => Some(Self::Error),
            0x04 => Some(Self::Exit),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> u8 {
        *self as u8
    }
}

/// A parsed protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Terminal I/O data
    Data(Bytes),
    /// Window resize (cols, rows)
    Resize { cols: u16, rows: u16 },
    /// Heartbeat ping/pong with sequence number
    Heartbeat(u32),
    /// Error message
    Error(String),
    /// Remote shell exit status
    Exit(i32),
}

impl Frame {
    /// Encode frame into bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Frame::Data(data) => {
                buf.put_u8(MessageType::Data.as_byte());
                buf.put_u32(data.len() as u32);
                buf.extend_from_slice(data);
            }
            Frame::Resize { cols, rows } => {
                buf.put_u8(MessageType::Resize.as_byte());
                buf.put_u32(4);
                buf.put_u16(*cols);
                buf.put_u16(*rows);
            }
            Frame::Heartbeat(seq) => {
                buf.put_u8(MessageType::Heartbeat.as_byte());
                buf.put_u32(4);
                buf.put_u32(*seq);
            }
            Frame::Error(msg) => {
                let msg_bytes = msg.as_bytes();
                buf.put_u8(MessageType::Error.as_byte());
                buf.put_u32(msg_bytes.len() as u32);
                buf.extend_from_slice(msg_bytes);
            }
            Frame::Exit(code) => {
                buf.put_u8(MessageType::Exit.as_byte());
                buf.put_u32(4);
                buf.put_i32(*code);
            }
        }

        buf.freeze()
    }

    /// Try to decode a frame from bytes.
    /// Returns None if not enough data, Err if invalid.
    pub fn decode(buf: &mut BytesMut) -> io::Result<Option<Self>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Peek at header without consuming
        let msg_type = buf[0];
        let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;

        if length > MAX_PAYLOAD_SIZE {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("Payload too large: {} bytes", length),
            ));
        }

        if buf.len() < HEADER_SIZE + length {
            return Ok(None);
        }

        let msg_type = MessageType::from_byte(msg_type).ok_or_else(|| {
            io::Error::new(
                ErrorKind::InvalidData,
                format!("Unknown message type: {}", msg_type),
            )
        })?;

        // Fixed-size payloads are validated before the header is consumed
        let fixed = matches!(
            msg_type,
            MessageType::Resize | MessageType::Heartbeat | MessageType::Exit
        );
        if fixed && length != 4 {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("{:?} frame must have 4 bytes payload", msg_type),
            ));
        }

        buf.advance(HEADER_SIZE);

        let frame = match msg_type {
            MessageType::Data => Frame::Data(buf.split_to(length).freeze()),
            MessageType::Resize => {
                let cols = buf.get_u16();
                let rows = buf.get_u16();
                Frame::Resize { cols, rows }
            }
            MessageType::Heartbeat => Frame::Heartbeat(buf.get_u32()),
            MessageType::Error => {
                let data = buf.split_to(length);
                Frame::Error(String::from_utf8_lossy(&data).to_string())
            }
            MessageType::Exit => Frame::Exit(buf.get_i32()),
        };

        Ok(Some(frame))
    }
}

/// Frame decoder for streaming input
pub struct FrameCodec {
    buffer: BytesMut,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Feed raw bytes into the codec
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame
    pub fn decode_next(&mut self) -> io::Result<Option<Frame>> {
        Frame::decode(&mut self.buffer)
    }

    /// Check if buffer is too large (possible malformed data)
    pub fn is_overflow(&self) -> bool {
        self.buffer.len() > HEADER_SIZE + MAX_PAYLOAD_SIZE
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
