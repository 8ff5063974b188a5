//! MySQL packet reading utilities.
//!
//! This module provides utilities for reading MySQL protocol data types
//! including length-encoded integers and strings, and for parsing the
//! generic OK / ERR / EOF response packets.

#![allow(clippy::cast_possible_truncation)]

use mywire_core::Error;

use crate::error::protocol_error;
use crate::protocol::{
    EofPacket, ErrPacket, OkPacket, SessionStateChange, capabilities, packet_marker,
    server_status, session_track,
};

/// A reader for MySQL protocol data.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Create a new reader from a byte slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Get remaining bytes in the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Check if we've reached the end of the data.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Current read offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Move the cursor to an absolute offset.
    ///
    /// Returns `false` (leaving the cursor unchanged) if `pos` is past the end.
    pub fn seek(&mut self, pos: usize) -> bool {
        if pos <= self.data.len() {
            self.pos = pos;
            true
        } else {
            false
        }
    }

    /// Peek at the next byte without advancing.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos)?;
        self.pos += 1;
        Some(*byte)
    }

    /// Read a u16 (little-endian).
    pub fn read_u16_le(&mut self) -> Option<u16> {
        let bytes = self.read_bytes(2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Read a u24 (little-endian, 3 bytes).
    pub fn read_u24_le(&mut self) -> Option<u32> {
        let bytes = self.read_bytes(3)?;
        Some(u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16))
    }

    /// Read a u32 (little-endian).
    pub fn read_u32_le(&mut self) -> Option<u32> {
        let bytes = self.read_bytes(4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a u64 (little-endian).
    pub fn read_u64_le(&mut self) -> Option<u64> {
        let bytes = self.read_bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Some(u64::from_le_bytes(buf))
    }

    /// Read a length-encoded integer.
    ///
    /// MySQL uses a variable-length integer encoding:
    /// - 0x00-0xFA: 1-byte value
    /// - 0xFC: 2-byte value follows
    /// - 0xFD: 3-byte value follows
    /// - 0xFE: 8-byte value follows
    /// - 0xFB: NULL (only meaningful inside a row; check with `peek` first)
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        let first = self.read_u8()?;
        match first {
            0x00..=0xFA => Some(u64::from(first)),
            0xFC => self.read_u16_le().map(u64::from),
            0xFD => self.read_u24_le().map(u64::from),
            0xFE => self.read_u64_le(),
            0xFB | 0xFF => None,
        }
    }

    /// Read a length-encoded string.
    pub fn read_lenenc_string(&mut self) -> Option<String> {
        let len = usize::try_from(self.read_lenenc_int()?).ok()?;
        self.read_string(len)
    }

    /// Read a length-encoded byte slice.
    pub fn read_lenenc_bytes(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.read_lenenc_int()?).ok()?;
        self.read_bytes(len)
    }

    /// Read a null-terminated string.
    ///
    /// A missing terminator reads to the end of the data.
    pub fn read_null_string(&mut self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let start = self.pos;
        while self.pos < self.data.len() && self.data[self.pos] != 0 {
            self.pos += 1;
        }
        let s = String::from_utf8_lossy(&self.data[start..self.pos]).into_owned();
        // Skip the null terminator
        if self.pos < self.data.len() {
            self.pos += 1;
        }
        Some(s)
    }

    /// Read a fixed-length string.
    pub fn read_string(&mut self, len: usize) -> Option<String> {
        let bytes = self.read_bytes(len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read remaining data as a string.
    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    /// Read a fixed number of bytes.
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(bytes)
    }

    /// Read up to `len` bytes, fewer if the data ends first.
    pub fn read_bytes_lossy(&mut self, len: usize) -> &'a [u8] {
        let len = len.min(self.remaining());
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        bytes
    }

    /// Read remaining bytes.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    /// Skip a number of bytes.
    pub fn skip(&mut self, n: usize) -> bool {
        if self.remaining() >= n {
            self.pos += n;
            true
        } else {
            false
        }
    }

    /// Parse an OK packet from the current position.
    ///
    /// OK packet format (protocol 4.1+):
    /// - 0x00 header
    /// - affected_rows: lenenc int
    /// - last_insert_id: lenenc int
    /// - status_flags: 2 bytes
    /// - warnings: 2 bytes
    /// - with CLIENT_SESSION_TRACK: lenenc info, then a lenenc session
    ///   state block when SERVER_SESSION_STATE_CHANGED is set
    /// - otherwise: info is the rest of the packet
    pub fn parse_ok_packet(&mut self, capability_flags: u32) -> Result<OkPacket, Error> {
        if self.peek() == Some(packet_marker::OK) {
            self.skip(1);
        }

        let affected_rows = self
            .read_lenenc_int()
            .ok_or_else(|| protocol_error("OK packet: missing affected rows"))?;
        let last_insert_id = self
            .read_lenenc_int()
            .ok_or_else(|| protocol_error("OK packet: missing last insert id"))?;
        let status_flags = self
            .read_u16_le()
            .ok_or_else(|| protocol_error("OK packet: missing status flags"))?;
        let warnings = self
            .read_u16_le()
            .ok_or_else(|| protocol_error("OK packet: missing warning count"))?;

        let mut info = String::new();
        let mut session_state = Vec::new();

        if capability_flags & capabilities::CLIENT_SESSION_TRACK != 0 {
            if !self.is_empty() {
                info = self
                    .read_lenenc_string()
                    .ok_or_else(|| protocol_error("OK packet: truncated status info"))?;

                if status_flags & server_status::SERVER_SESSION_STATE_CHANGED != 0 {
                    let block = self
                        .read_lenenc_bytes()
                        .ok_or_else(|| protocol_error("OK packet: truncated session state"))?;
                    session_state = parse_session_state(block)?;
                }
            }
        } else {
            info = self.read_rest_string();
        }

        Ok(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
            session_state,
        })
    }

    /// Parse an Error packet from the current position.
    ///
    /// ERR packet format:
    /// - 0xFF header
    /// - error_code: 2 bytes
    /// - with CLIENT_PROTOCOL_41: '#' marker + 5-byte sql_state
    /// - error_message: rest of packet
    pub fn parse_err_packet(&mut self, capability_flags: u32) -> Option<ErrPacket> {
        if self.peek() == Some(packet_marker::ERR) {
            self.skip(1);
        }

        let error_code = self.read_u16_le()?;

        let sql_state = if capability_flags & capabilities::CLIENT_PROTOCOL_41 != 0
            && self.peek() == Some(b'#')
        {
            self.skip(1);
            Some(self.read_string(5)?)
        } else {
            None
        };

        let error_message = self.read_rest_string();

        Some(ErrPacket {
            error_code,
            sql_state,
            error_message,
        })
    }

    /// Parse an EOF packet from the current position.
    ///
    /// EOF packet format:
    /// - 0xFE header
    /// - warnings: 2 bytes
    /// - status_flags: 2 bytes
    pub fn parse_eof_packet(&mut self) -> Option<EofPacket> {
        if self.peek() == Some(packet_marker::EOF) {
            self.skip(1);
        }

        let warnings = self.read_u16_le()?;
        let status_flags = self.read_u16_le()?;

        Some(EofPacket {
            warnings,
            status_flags,
        })
    }
}

/// Parse the session state block of an OK packet.
///
/// The block is a run of `type (1 byte) + lenenc data` entries filling the
/// whole block.
pub fn parse_session_state(block: &[u8]) -> Result<Vec<SessionStateChange>, Error> {
    let mut reader = PacketReader::new(block);
    let mut changes = Vec::new();

    while !reader.is_empty() {
        let kind = reader
            .read_u8()
            .ok_or_else(|| protocol_error("session state: missing entry type"))?;
        let data = reader
            .read_lenenc_bytes()
            .ok_or_else(|| protocol_error("session state: truncated entry"))?;
        let mut entry = PacketReader::new(data);

        let change = match kind {
            session_track::SYSTEM_VARIABLES => {
                let name = entry
                    .read_lenenc_string()
                    .ok_or_else(|| protocol_error("session state: missing variable name"))?;
                let value = entry
                    .read_lenenc_string()
                    .ok_or_else(|| protocol_error("session state: missing variable value"))?;
                SessionStateChange::SystemVariable { name, value }
            }
            session_track::SCHEMA => SessionStateChange::Schema {
                name: entry
                    .read_lenenc_string()
                    .ok_or_else(|| protocol_error("session state: missing schema name"))?,
            },
            session_track::STATE_CHANGE => SessionStateChange::StateChange {
                value: entry
                    .read_lenenc_string()
                    .ok_or_else(|| protocol_error("session state: missing state flag"))?,
            },
            other => {
                return Err(protocol_error(format!(
                    "{other} is not a valid session state type"
                )));
            }
        };
        changes.push(change);
    }

    Ok(changes)
}
