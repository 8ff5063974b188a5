//! Initial handshake: server greeting parsing and the client's reply.
//!
//! The greeting is protocol version 10. Everything after the lower half of
//! the capability flags is optional and gated on the flags the server sets.

use mywire_core::Error;

use crate::auth;
use crate::config::Config;
use crate::error::protocol_error;
use crate::protocol::capabilities::{
    CLIENT_CONNECT_WITH_DB, CLIENT_PLUGIN_AUTH, CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA,
    CLIENT_SECURE_CONNECTION,
};
use crate::protocol::{PacketReader, PacketWriter};

/// The only greeting format this client understands.
pub const PROTOCOL_VERSION: u8 = 10;

/// Length of the first scramble part.
const SCRAMBLE_PART1_LEN: usize = 8;

/// Minimum length of the second scramble part.
const SCRAMBLE_PART2_MIN_LEN: usize = 13;

/// Parsed server greeting (initial handshake packet).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Both scramble parts, as sent (the second part keeps its NUL)
    pub auth_data: Vec<u8>,
    /// Server capability flags
    pub capabilities: u32,
    /// Server default collation id
    pub charset: Option<u8>,
    pub status_flags: Option<u16>,
    /// Auth method named by the server (CLIENT_PLUGIN_AUTH only)
    pub auth_plugin: Option<String>,
}

/// Parse the server greeting.
pub fn parse_greeting(payload: &[u8]) -> Result<Greeting, Error> {
    let mut reader = PacketReader::new(payload);

    let protocol_version = reader
        .read_u8()
        .ok_or_else(|| protocol_error("Missing protocol version"))?;
    if protocol_version != PROTOCOL_VERSION {
        return Err(protocol_error(format!(
            "Unsupported protocol version {} (expected {})",
            protocol_version, PROTOCOL_VERSION
        )));
    }

    let server_version = reader
        .read_null_string()
        .ok_or_else(|| protocol_error("Missing server version"))?;
    let connection_id = reader
        .read_u32_le()
        .ok_or_else(|| protocol_error("Missing connection ID"))?;
    let mut auth_data = reader
        .read_bytes(SCRAMBLE_PART1_LEN)
        .ok_or_else(|| protocol_error("Missing auth data"))?
        .to_vec();

    // Filler
    reader.skip(1);

    let mut capabilities = u32::from(
        reader
            .read_u16_le()
            .ok_or_else(|| protocol_error("Missing capability flags"))?,
    );

    let mut greeting = Greeting {
        protocol_version,
        server_version,
        connection_id,
        auth_data: Vec::new(),
        capabilities,
        charset: None,
        status_flags: None,
        auth_plugin: None,
    };

    if reader.is_empty() {
        greeting.auth_data = auth_data;
        return Ok(greeting);
    }

    greeting.charset = reader.read_u8();
    greeting.status_flags = reader.read_u16_le();
    capabilities |= u32::from(reader.read_u16_le().unwrap_or(0)) << 16;

    // The length byte is always on the wire; it only carries meaning with
    // CLIENT_PLUGIN_AUTH.
    let len_byte = reader.read_u8().unwrap_or(0);
    let auth_data_len = if capabilities & CLIENT_PLUGIN_AUTH != 0 {
        usize::from(len_byte)
    } else {
        0
    };

    if capabilities & CLIENT_SECURE_CONNECTION != 0 {
        // Reserved
        reader.skip(10.min(reader.remaining()));

        let part2_len = SCRAMBLE_PART2_MIN_LEN.max(auth_data_len.saturating_sub(SCRAMBLE_PART1_LEN));
        auth_data.extend_from_slice(reader.read_bytes_lossy(part2_len));

        if capabilities & CLIENT_PLUGIN_AUTH != 0 {
            greeting.auth_plugin = reader.read_null_string();
        }
    }

    greeting.capabilities = capabilities;
    greeting.auth_data = auth_data;

    tracing::debug!(
        server_version = %greeting.server_version,
        connection_id = greeting.connection_id,
        capabilities = greeting.capabilities,
        auth_plugin = greeting.auth_plugin.as_deref().unwrap_or(""),
        "Parsed server greeting"
    );

    Ok(greeting)
}

/// Build the handshake response payload.
///
/// Returns the payload and the negotiated capability flags.
pub fn build_handshake_response(config: &Config, greeting: &Greeting) -> Result<(Vec<u8>, u32), Error> {
    let capabilities = config.capability_flags() & greeting.capabilities;

    let mut writer = PacketWriter::new();
    writer.write_u32_le(capabilities);
    writer.write_u32_le(config.max_packet_size);
    writer.write_u8(config.bin_charset);
    writer.write_zeros(23);
    writer.write_null_string(&config.user);

    let plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 {
        greeting.auth_plugin.as_deref().unwrap_or_default()
    } else {
        auth::plugins::MYSQL_NATIVE_PASSWORD
    };
    let auth_response =
        auth::auth_response(plugin, config.password.as_deref(), &greeting.auth_data)?;

    if capabilities & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        writer.write_lenenc_bytes(&auth_response);
    } else if capabilities & CLIENT_SECURE_CONNECTION != 0 {
        // Responses are at most 20 bytes
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u8(auth_response.len() as u8);
        writer.write_bytes(&auth_response);
    } else {
        writer.write_bytes(&auth_response);
        writer.write_u8(0);
    }

    if capabilities & CLIENT_CONNECT_WITH_DB != 0 {
        writer.write_null_string(config.database.as_deref().unwrap_or_default());
    }

    // The plugin name is not echoed back; an empty name is sent instead.
    if capabilities & CLIENT_PLUGIN_AUTH != 0 {
        writer.write_u8(0);
    }

    tracing::debug!(
        user = %config.user,
        capabilities,
        auth_len = auth_response.len(),
        "Built handshake response"
    );

    Ok((writer.into_bytes(), capabilities))
}
