//! MySQL wire protocol implementation.
//!
//! MySQL packets have a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! Maximum chunk payload is 2^24 - 1 (16MB - 1). A chunk of exactly that
//! length means the logical packet continues in the next chunk.

pub mod framer;
pub mod reader;
pub mod writer;

pub use framer::{Packet, PacketFramer};
pub use reader::PacketReader;
pub use writer::PacketWriter;

/// Maximum payload size for a single MySQL packet chunk (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// MySQL capability flags (client and server).
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 12;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_RESERVED: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: u32 = 1 << 22;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities this client asks for on every connection.
    ///
    /// `CLIENT_CONNECT_WITH_DB` is added when a database is configured, and
    /// `CLIENT_PLUGIN_AUTH` only when the config opts in.
    pub const DEFAULT_CLIENT_FLAGS: u32 = CLIENT_SESSION_TRACK
        | CLIENT_TRANSACTIONS
        | CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;
}

/// MySQL command codes (COM_xxx) used by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Quit connection
    Quit = 0x01,
    /// Text protocol query
    Query = 0x03,
    /// Ping server
    Ping = 0x0e,
}

/// MySQL server status flags.
#[allow(dead_code)]
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_GOOD_INDEX_USED: u16 = 0x0010;
    pub const SERVER_STATUS_NO_INDEX_USED: u16 = 0x0020;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
    pub const SERVER_STATUS_DB_DROPPED: u16 = 0x0100;
    pub const SERVER_STATUS_NO_BACKSLASH_ESCAPES: u16 = 0x0200;
    pub const SERVER_STATUS_METADATA_CHANGED: u16 = 0x0400;
    pub const SERVER_QUERY_WAS_SLOW: u16 = 0x0800;
    pub const SERVER_PS_OUT_PARAMS: u16 = 0x1000;
    pub const SERVER_STATUS_IN_TRANS_READONLY: u16 = 0x2000;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// Session state change types carried in OK packets.
pub mod session_track {
    pub const SYSTEM_VARIABLES: u8 = 0x00;
    pub const SCHEMA: u8 = 0x01;
    pub const STATE_CHANGE: u8 = 0x02;
}

/// MySQL character set codes.
#[allow(dead_code)]
pub mod charset {
    pub const LATIN1_SWEDISH_CI: u8 = 8;
    pub const UTF8_GENERAL_CI: u8 = 33;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    pub const BINARY: u8 = 63;

    /// Default charset for new connections (utf8mb4_general_ci).
    pub const DEFAULT_CHARSET: u8 = UTF8MB4_GENERAL_CI;
}

/// Packet type sentinels (first payload byte).
pub mod packet_marker {
    pub const OK: u8 = 0x00;
    pub const EXTRA_AUTH: u8 = 0x01;
    pub const LOCAL_INFILE: u8 = 0xFB;
    pub const EOF: u8 = 0xFE;
    pub const ERR: u8 = 0xFF;
}

/// A MySQL packet header.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    /// Parse a packet header from 4 bytes.
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        let payload_length =
            u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
        let sequence_id = bytes[3];
        Self {
            payload_length,
            sequence_id,
        }
    }

    /// Encode the header to 4 bytes.
    pub fn to_bytes(&self) -> [u8; 4] {
        [
            (self.payload_length & 0xFF) as u8,
            ((self.payload_length >> 8) & 0xFF) as u8,
            ((self.payload_length >> 16) & 0xFF) as u8,
            self.sequence_id,
        ]
    }
}

/// Server response packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// OK packet (0x00)
    Ok,
    /// Error packet (0xFF)
    Error,
    /// EOF packet (0xFE with a short payload)
    Eof,
    /// Local infile request (0xFB)
    LocalInfile,
    /// Data packet (result set row, column definition, etc.)
    Data,
}

impl PacketType {
    /// Detect packet type from the first byte of payload.
    ///
    /// A text row may legitimately begin with 0xFE (a length-encoded value
    /// of 2^24 or more), so 0xFE only counts as EOF when the payload is
    /// shorter than 9 bytes.
    pub fn from_first_byte(byte: u8, payload_len: usize) -> Self {
        match byte {
            packet_marker::OK => PacketType::Ok,
            packet_marker::ERR => PacketType::Error,
            packet_marker::EOF if payload_len < 9 => PacketType::Eof,
            packet_marker::LOCAL_INFILE => PacketType::LocalInfile,
            _ => PacketType::Data,
        }
    }

    /// Detect the type of a whole payload.
    pub fn of(payload: &[u8]) -> Self {
        payload
            .first()
            .map_or(PacketType::Data, |&b| Self::from_first_byte(b, payload.len()))
    }
}

/// A single session state change reported in an OK packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStateChange {
    /// A tracked system variable changed
    SystemVariable { name: String, value: String },
    /// The default schema changed
    Schema { name: String },
    /// Session state changed flag ("1" when changed)
    StateChange { value: String },
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    /// Number of affected rows
    pub affected_rows: u64,
    /// Last insert ID
    pub last_insert_id: u64,
    /// Server status flags
    pub status_flags: u16,
    /// Number of warnings
    pub warnings: u16,
    /// Human readable status info (if any)
    pub info: String,
    /// Session state changes, in wire order
    pub session_state: Vec<SessionStateChange>,
}

/// Parsed Error packet.
#[derive(Debug, Clone)]
pub struct ErrPacket {
    /// Error code
    pub error_code: u16,
    /// SQL state (5 characters), absent without CLIENT_PROTOCOL_41
    pub sql_state: Option<String>,
    /// Error message
    pub error_message: String,
}

/// Parsed EOF packet.
#[derive(Debug, Clone, Copy)]
pub struct EofPacket {
    /// Number of warnings
    pub warnings: u16,
    /// Server status flags
    pub status_flags: u16,
}
