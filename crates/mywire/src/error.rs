//! Constructors for the error values raised inside the protocol engine.

use mywire_core::error::{
    AuthError, ConnectionError, ConnectionErrorKind, ProtocolError, QueryError, QueryErrorKind,
};
use mywire_core::Error;

use crate::protocol::ErrPacket;

pub(crate) fn protocol_error(msg: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        raw_data: None,
    })
}

/// Protocol error carrying the payload that could not be understood.
pub(crate) fn protocol_error_with_data(msg: impl Into<String>, data: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        raw_data: Some(data.to_vec()),
    })
}

pub(crate) fn auth_error(msg: impl Into<String>, plugin: Option<&str>) -> Error {
    Error::Auth(AuthError {
        message: msg.into(),
        plugin: plugin.map(str::to_string),
    })
}

pub(crate) fn connection_error(kind: ConnectionErrorKind, msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind,
        message: msg.into(),
        source: None,
    })
}

pub(crate) fn io_connection_error(
    kind: ConnectionErrorKind,
    msg: impl Into<String>,
    err: std::io::Error,
) -> Error {
    Error::Connection(ConnectionError {
        kind,
        message: format!("{}: {}", msg.into(), err),
        source: Some(Box::new(err)),
    })
}

/// Turn a server ERR packet into a query error for `sql`.
pub(crate) fn query_error(err: ErrPacket, sql: Option<&str>) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::from_code(err.error_code),
        code: err.error_code,
        sqlstate: err.sql_state,
        message: err.error_message,
        sql: sql.map(str::to_string),
    })
}
