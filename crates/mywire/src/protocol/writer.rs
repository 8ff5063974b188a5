//! MySQL packet writing utilities.
//!
//! `PacketWriter` builds a payload out of protocol primitives, and
//! `frame_payload` wraps a finished payload into one or more wire chunks.

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::{Command, MAX_PACKET_SIZE, PacketHeader};

/// A writer for MySQL protocol data.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    /// Create a new writer with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Create a new writer with specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Get the current buffer length.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Get the buffer as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return the payload.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u24_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes()[..3]);
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a length-encoded integer.
    ///
    /// - below 251: the value itself in 1 byte
    /// - below 2^16: 0xFC + 2 bytes
    /// - below 2^24: 0xFD + 3 bytes
    /// - otherwise: 0xFE + 8 bytes
    pub fn write_lenenc_int(&mut self, value: u64) {
        if value < 251 {
            self.write_u8(value as u8);
        } else if value < 0x1_0000 {
            self.write_u8(0xFC);
            self.write_u16_le(value as u16);
        } else if value < 0x0100_0000 {
            self.write_u8(0xFD);
            self.write_u24_le(value as u32);
        } else {
            self.write_u8(0xFE);
            self.write_u64_le(value);
        }
    }

    /// Write a length-encoded string.
    pub fn write_lenenc_string(&mut self, s: &str) {
        self.write_lenenc_bytes(s.as_bytes());
    }

    /// Write a length-encoded byte slice.
    pub fn write_lenenc_bytes(&mut self, data: &[u8]) {
        self.write_lenenc_int(data.len() as u64);
        self.buffer.extend_from_slice(data);
    }

    /// Write a null-terminated string.
    pub fn write_null_string(&mut self, s: &str) {
        self.buffer.extend_from_slice(s.as_bytes());
        self.buffer.push(0);
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Write zeros (padding).
    pub fn write_zeros(&mut self, count: usize) {
        self.buffer.resize(self.buffer.len() + count, 0);
    }
}

/// Frame a payload into wire chunks starting at `sequence_id`.
///
/// Returns the framed bytes and the sequence id for the next packet.
/// Payloads of `MAX_PACKET_SIZE` or more are split into full chunks
/// followed by a final chunk shorter than the maximum, which is empty
/// when the length is an exact multiple.
pub fn frame_payload(payload: &[u8], mut sequence_id: u8) -> (Vec<u8>, u8) {
    let chunks = payload.len() / MAX_PACKET_SIZE + 1;
    let mut out = Vec::with_capacity(payload.len() + chunks * PacketHeader::SIZE);

    let mut rest = payload;
    loop {
        let chunk_len = rest.len().min(MAX_PACKET_SIZE);
        let header = PacketHeader {
            payload_length: chunk_len as u32,
            sequence_id,
        };
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&rest[..chunk_len]);
        rest = &rest[chunk_len..];
        sequence_id = sequence_id.wrapping_add(1);

        if chunk_len < MAX_PACKET_SIZE {
            break;
        }
    }

    (out, sequence_id)
}

/// Frame a `COM_xxx` command with its argument, starting at sequence 0.
pub fn build_command_packet(command: Command, argument: &[u8]) -> (Vec<u8>, u8) {
    let mut writer = PacketWriter::with_capacity(1 + argument.len());
    writer.write_u8(command as u8);
    writer.write_bytes(argument);
    frame_payload(writer.as_bytes(), 0)
}
