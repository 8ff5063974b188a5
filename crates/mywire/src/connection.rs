//! MySQL connection state machine.
//!
//! A `Connection` is built eagerly and opens its transport lazily, on the
//! first command. The lifecycle is linear:
//!
//! ```text
//! Unconnected -> Established -> Ready -> Closing -> Closed
//! ```
//!
//! Any fatal error (protocol violation, auth failure, transport failure, or
//! anything going wrong during the handshake) moves the connection straight to
//! `Closed`. There is no reconnect: build a new `Connection` instead.

use std::collections::{BTreeMap, VecDeque};

use mywire_core::error::{ConnectionErrorKind, ValidationError, ValidationErrorKind};
use mywire_core::{Cx, Error, Outcome};

use crate::config::Config;
use crate::error::{
    auth_error, connection_error, io_connection_error, protocol_error, protocol_error_with_data,
    query_error,
};
use crate::handshake::{build_handshake_response, parse_greeting};
use crate::protocol::writer::{build_command_packet, frame_payload};
use crate::protocol::{
    Command, OkPacket, Packet, PacketFramer, PacketReader, PacketType, SessionStateChange,
    packet_marker,
};
use crate::result::ResultSet;
use crate::transport::{Connector, TcpConnector, Transport};
use crate::types::{decode_text_row, parse_column_definition};

/// Bytes requested per transport read while handshaking.
const HANDSHAKE_READ_SIZE: usize = 1024;

/// Bytes requested per transport read while running commands.
const COMMAND_READ_SIZE: usize = 4096;

/// Column counts are 2-byte fields everywhere else in the protocol.
const MAX_COLUMNS: u64 = u16::MAX as u64;

/// Upper bound on column definitions reserved before any arrive.
const PREALLOC_COLUMNS: usize = 256;

/// Connection state in the protocol state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Built, transport not opened yet
    #[default]
    Unconnected,
    /// Transport open, handshake in progress
    Established,
    /// Authenticated and ready for commands
    Ready,
    /// Shutting down
    Closing,
    /// Closed for good
    Closed,
}

/// Session state reported by the server through OK packets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// Tracked system variables, by name
    pub system_variables: BTreeMap<String, String>,
    /// Current default schema
    pub schema: Option<String>,
    /// Last reported state-change flag
    pub state_change: Option<String>,
}

impl SessionState {
    /// Record one change.
    pub fn apply(&mut self, change: SessionStateChange) {
        match change {
            SessionStateChange::SystemVariable { name, value } => {
                self.system_variables.insert(name, value);
            }
            SessionStateChange::Schema { name } => self.schema = Some(name),
            SessionStateChange::StateChange { value } => self.state_change = Some(value),
        }
    }
}

/// What the server has told us about this session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnInfo {
    pub server_version: String,
    pub connection_id: u32,
    /// Server default collation id from the greeting
    pub charset: Option<u8>,
    pub status_flags: u16,
    pub warnings: u16,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    /// Human readable info from the last OK packet
    pub status_info: String,
    pub session_state: SessionState,
}

/// A client connection to a MySQL server.
///
/// Every command takes `&mut self`, so a connection serves one command at a
/// time.
pub struct Connection<C: Connector = TcpConnector> {
    config: Config,
    connector: C,
    transport: Option<C::Transport>,
    state: ConnectionState,
    framer: PacketFramer,
    /// Packets reassembled but not consumed yet
    pending: VecDeque<Packet>,
    /// Sequence id for the next packet we send
    sequence_id: u8,
    /// Negotiated capability flags
    capabilities: u32,
    server_capabilities: u32,
    auth_plugin: Option<String>,
    auth_data: Vec<u8>,
    info: ConnInfo,
}

impl<C: Connector> std::fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("connection_id", &self.info.connection_id)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("server_version", &self.info.server_version)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a TCP connection. Nothing is sent until the first command.
    pub fn new(config: Config) -> Self {
        Self::with_connector(config, TcpConnector::default())
    }
}

impl<C: Connector> Connection<C> {
    /// Create a connection that opens its transport through `connector`.
    pub fn with_connector(config: Config, connector: C) -> Self {
        Self {
            config,
            connector,
            transport: None,
            state: ConnectionState::Unconnected,
            framer: PacketFramer::new(),
            pending: VecDeque::new(),
            sequence_id: 0,
            capabilities: 0,
            server_capabilities: 0,
            auth_plugin: None,
            auth_data: Vec::new(),
            info: ConnInfo::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn info(&self) -> &ConnInfo {
        &self.info
    }

    /// Last insert ID from the most recent OK packet.
    pub fn last_insert_id(&self) -> u64 {
        self.info.last_insert_id
    }

    /// Affected rows from the most recent OK packet.
    pub fn affected_rows(&self) -> u64 {
        self.info.affected_rows
    }

    pub fn connection_id(&self) -> u32 {
        self.info.connection_id
    }

    /// Negotiated capability flags (0 before the handshake).
    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    /// Capability flags advertised by the server.
    pub fn server_capabilities(&self) -> u32 {
        self.server_capabilities
    }

    /// Auth method the server named in its greeting.
    pub fn auth_plugin(&self) -> Option<&str> {
        self.auth_plugin.as_deref()
    }

    /// Scramble the server sent in its greeting.
    pub fn auth_data(&self) -> &[u8] {
        &self.auth_data
    }

    /// Open the transport and authenticate.
    ///
    /// Does nothing once the connection is past `Unconnected`; fails if it
    /// has been closed.
    pub async fn connect(&mut self, _cx: &Cx) -> Outcome<(), Error> {
        let result = self.ensure_connected().await;
        into_outcome(self.settle(result))
    }

    /// Run a SELECT and collect its rows.
    #[tracing::instrument(level = "debug", skip(self, _cx))]
    pub async fn query(&mut self, _cx: &Cx, sql: &str) -> Outcome<ResultSet, Error> {
        let result = self.run_query(sql).await;
        into_outcome(self.settle(result))
    }

    /// Run a statement that returns no rows.
    ///
    /// Affected rows and last insert id are available afterwards through
    /// `affected_rows()` and `last_insert_id()`.
    #[tracing::instrument(level = "debug", skip(self, _cx))]
    pub async fn exec(&mut self, _cx: &Cx, sql: &str) -> Outcome<(), Error> {
        let result = self.run_exec(sql).await;
        into_outcome(self.settle(result))
    }

    /// Check that the server is alive.
    pub async fn ping(&mut self, _cx: &Cx) -> Outcome<(), Error> {
        let result = self.run_ping().await;
        into_outcome(self.settle(result))
    }

    /// Close the connection, telling the server with COM_QUIT.
    ///
    /// The quit packet is best-effort. Closing a connection that never
    /// connected, or is already closed, does nothing.
    pub async fn close(&mut self, _cx: &Cx) -> Outcome<(), Error> {
        if self.state == ConnectionState::Ready {
            self.state = ConnectionState::Closing;
            if let Err(e) = self.send_command(Command::Quit, &[]).await {
                tracing::debug!(error = %e, "COM_QUIT failed during close");
            }
            self.shutdown();
        }
        Outcome::Ok(())
    }

    // === Commands ===

    async fn run_query(&mut self, sql: &str) -> Result<ResultSet, Error> {
        if !starts_with_keyword(sql, "select") {
            return Err(validation_error(ValidationErrorKind::NotSelect, sql));
        }
        self.ensure_connected().await?;

        self.send_command(Command::Query, sql.as_bytes()).await?;
        let first = self.read_packet(COMMAND_READ_SIZE).await?;

        match PacketType::of(&first.payload) {
            PacketType::Error => Err(self.server_error(&first.payload, Some(sql))),
            PacketType::Ok => {
                // Statement produced no result set
                let ok = self.parse_ok(&first.payload)?;
                self.apply_ok(ok);
                Ok(ResultSet::default())
            }
            PacketType::LocalInfile => Err(protocol_error(
                "LOCAL INFILE requests are not supported",
            )),
            PacketType::Eof | PacketType::Data => self.read_result_set(&first.payload, sql).await,
        }
    }

    async fn read_result_set(&mut self, first: &[u8], sql: &str) -> Result<ResultSet, Error> {
        let column_count = PacketReader::new(first)
            .read_lenenc_int()
            .filter(|&n| n > 0 && n <= MAX_COLUMNS)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| protocol_error_with_data("Invalid column count", first))?;

        let mut columns = Vec::with_capacity(column_count.min(PREALLOC_COLUMNS));
        for _ in 0..column_count {
            let packet = self.read_packet(COMMAND_READ_SIZE).await?;
            columns.push(parse_column_definition(&packet.payload)?);
        }

        let eof = self.read_packet(COMMAND_READ_SIZE).await?;
        if eof.payload.first() != Some(&packet_marker::EOF) {
            return Err(protocol_error_with_data(
                "Expected EOF after column definitions",
                &eof.payload,
            ));
        }

        let mut result = ResultSet::new(columns);
        loop {
            let packet = self.read_packet(COMMAND_READ_SIZE).await?;
            match PacketType::of(&packet.payload) {
                PacketType::Eof => {
                    if let Some(eof) = PacketReader::new(&packet.payload).parse_eof_packet() {
                        self.info.warnings = eof.warnings;
                        self.info.status_flags = eof.status_flags;
                    }
                    break;
                }
                PacketType::Error => return Err(self.server_error(&packet.payload, Some(sql))),
                _ => {
                    let row = decode_text_row(&packet.payload, result.columns())?;
                    result.push(row);
                }
            }
        }

        tracing::debug!(
            columns = result.columns().len(),
            rows = result.len(),
            "Result set read"
        );
        Ok(result)
    }

    async fn run_exec(&mut self, sql: &str) -> Result<(), Error> {
        if starts_with_keyword(sql, "select") {
            return Err(validation_error(ValidationErrorKind::UnexpectedSelect, sql));
        }
        self.ensure_connected().await?;

        self.send_command(Command::Query, sql.as_bytes()).await?;
        let packet = self.read_packet(COMMAND_READ_SIZE).await?;
        self.handle_common_packet(&packet.payload, Some(sql))?;
        Ok(())
    }

    async fn run_ping(&mut self) -> Result<(), Error> {
        self.ensure_connected().await?;

        self.send_command(Command::Ping, &[]).await?;
        let packet = self.read_packet(COMMAND_READ_SIZE).await?;
        self.handle_common_packet(&packet.payload, None)?;
        Ok(())
    }

    /// Handle a reply that must be OK or ERR.
    fn handle_common_packet(&mut self, payload: &[u8], sql: Option<&str>) -> Result<(), Error> {
        match payload.first() {
            Some(&packet_marker::OK) => {
                let ok = self.parse_ok(payload)?;
                self.apply_ok(ok);
                Ok(())
            }
            Some(&packet_marker::ERR) => Err(self.server_error(payload, sql)),
            Some(&other) => Err(protocol_error_with_data(
                format!("unsupported packet type {:#04x}", other),
                payload,
            )),
            None => Err(protocol_error("unsupported packet type (empty packet)")),
        }
    }

    fn parse_ok(&self, payload: &[u8]) -> Result<OkPacket, Error> {
        PacketReader::new(payload).parse_ok_packet(self.capabilities)
    }

    fn apply_ok(&mut self, ok: OkPacket) {
        self.info.affected_rows = ok.affected_rows;
        self.info.last_insert_id = ok.last_insert_id;
        self.info.status_flags = ok.status_flags;
        self.info.warnings = ok.warnings;
        self.info.status_info = ok.info;
        for change in ok.session_state {
            tracing::trace!(?change, "Session state change");
            self.info.session_state.apply(change);
        }
    }

    fn server_error(&self, payload: &[u8], sql: Option<&str>) -> Error {
        match PacketReader::new(payload).parse_err_packet(self.capabilities) {
            Some(err) => {
                tracing::debug!(
                    code = err.error_code,
                    sqlstate = err.sql_state.as_deref().unwrap_or(""),
                    message = %err.error_message,
                    "Server returned error"
                );
                query_error(err, sql)
            }
            None => protocol_error_with_data("Malformed ERR packet", payload),
        }
    }

    // === Handshake ===

    async fn ensure_connected(&mut self) -> Result<(), Error> {
        match self.state {
            ConnectionState::Unconnected => {
                let result = self.handshake().await;
                if result.is_err() {
                    // Any handshake failure is final, even a server ERR.
                    self.shutdown();
                }
                result
            }
            ConnectionState::Established | ConnectionState::Ready => Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => Err(connection_error(
                ConnectionErrorKind::Closed,
                "Connection is closed",
            )),
        }
    }

    async fn handshake(&mut self) -> Result<(), Error> {
        let addr = self.config.socket_addr();
        tracing::debug!(%addr, "Opening transport");

        let transport = self.connector.connect(&addr).await.map_err(|e| {
            let kind = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                ConnectionErrorKind::Refused
            } else {
                ConnectionErrorKind::Connect
            };
            io_connection_error(kind, format!("Failed to connect to {}", addr), e)
        })?;
        self.transport = Some(transport);
        self.state = ConnectionState::Established;

        let packet = self.read_packet(HANDSHAKE_READ_SIZE).await?;
        let greeting = parse_greeting(&packet.payload)?;

        self.server_capabilities = greeting.capabilities;
        self.info.server_version.clone_from(&greeting.server_version);
        self.info.connection_id = greeting.connection_id;
        self.info.charset = greeting.charset;
        self.info.status_flags = greeting.status_flags.unwrap_or(0);

        let (response, capabilities) = build_handshake_response(&self.config, &greeting)?;
        self.capabilities = capabilities;
        self.auth_plugin = greeting.auth_plugin;
        self.auth_data = greeting.auth_data;

        self.write_packet(&response).await?;

        let reply = self.read_packet(HANDSHAKE_READ_SIZE).await?;
        match reply.payload.first().copied() {
            Some(packet_marker::OK) => {
                let ok = self.parse_ok(&reply.payload)?;
                self.apply_ok(ok);
            }
            Some(packet_marker::ERR) => return Err(self.server_error(&reply.payload, None)),
            Some(packet_marker::EOF) => {
                let plugin = PacketReader::new(&reply.payload[1..]).read_null_string();
                return Err(auth_error(
                    format!(
                        "Server requested an authentication method switch to {}",
                        plugin.as_deref().unwrap_or("an unnamed method")
                    ),
                    plugin.as_deref(),
                ));
            }
            Some(packet_marker::EXTRA_AUTH) => {
                return Err(auth_error(
                    "Server requested extra authentication data",
                    self.auth_plugin.as_deref(),
                ));
            }
            _ => {
                return Err(protocol_error_with_data(
                    "Unexpected handshake reply",
                    &reply.payload,
                ));
            }
        }

        self.state = ConnectionState::Ready;
        tracing::debug!(
            connection_id = self.info.connection_id,
            server_version = %self.info.server_version,
            capabilities = self.capabilities,
            "Connection ready"
        );
        Ok(())
    }

    // === Packet I/O ===

    async fn send_command(&mut self, command: Command, argument: &[u8]) -> Result<(), Error> {
        if !self.pending.is_empty() || self.framer.in_progress() {
            tracing::warn!(
                pending = self.pending.len(),
                "Discarding unread packets before new command"
            );
            self.pending.clear();
            self.framer.reset();
        }

        let (bytes, next) = build_command_packet(command, argument);
        self.write_bytes(&bytes).await?;
        self.sequence_id = next;
        Ok(())
    }

    async fn write_packet(&mut self, payload: &[u8]) -> Result<(), Error> {
        let (bytes, next) = frame_payload(payload, self.sequence_id);
        self.write_bytes(&bytes).await?;
        self.sequence_id = next;
        Ok(())
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let transport = self.transport_mut()?;
        transport.write(bytes).await.map_err(|e| {
            io_connection_error(ConnectionErrorKind::Disconnected, "Failed to write packet", e)
        })?;
        tracing::trace!(len = bytes.len(), "Wrote packet");
        Ok(())
    }

    /// Read the next whole packet, pulling from the transport as needed.
    async fn read_packet(&mut self, read_size: usize) -> Result<Packet, Error> {
        loop {
            if let Some(packet) = self.pending.pop_front() {
                self.sequence_id = packet.sequence_id.wrapping_add(1);
                tracing::trace!(
                    len = packet.payload.len(),
                    sequence_id = packet.sequence_id,
                    "Read packet"
                );
                return Ok(packet);
            }

            let transport = self.transport_mut()?;
            let chunk = transport.read(read_size).await.map_err(|e| {
                io_connection_error(ConnectionErrorKind::Disconnected, "Failed to read packet", e)
            })?;
            if chunk.is_empty() {
                return Err(connection_error(
                    ConnectionErrorKind::Disconnected,
                    "Connection closed by server",
                ));
            }
            self.pending.extend(self.framer.feed(&chunk));
        }
    }

    fn transport_mut(&mut self) -> Result<&mut C::Transport, Error> {
        self.transport.as_mut().ok_or_else(|| {
            connection_error(ConnectionErrorKind::Closed, "Connection is closed")
        })
    }

    // === Failure handling ===

    /// Close the connection if `result` failed fatally.
    fn settle<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &result {
            if e.is_fatal() && self.state != ConnectionState::Closed {
                tracing::debug!(error = %e, "Fatal error, closing connection");
                self.state = ConnectionState::Closing;
                self.shutdown();
            }
        }
        result
    }

    fn shutdown(&mut self) {
        self.transport = None;
        self.pending.clear();
        self.framer.reset();
        self.state = ConnectionState::Closed;
    }
}

fn into_outcome<T>(result: Result<T, Error>) -> Outcome<T, Error> {
    match result {
        Ok(value) => Outcome::Ok(value),
        Err(e) => Outcome::Err(e),
    }
}

fn validation_error(kind: ValidationErrorKind, sql: &str) -> Error {
    Error::Validation(ValidationError {
        kind,
        sql: sql.to_string(),
    })
}

/// Does `sql` begin with `keyword`, ignoring ASCII case?
fn starts_with_keyword(sql: &str, keyword: &str) -> bool {
    sql.as_bytes()
        .get(..keyword.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(keyword.as_bytes()))
}
