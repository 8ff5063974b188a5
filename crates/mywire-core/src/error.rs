//! Error types for mywire operations.

use std::fmt;

/// The primary error type for all mywire operations.
#[derive(Debug)]
pub enum Error {
    /// Transport errors (connect, read, write, closed connection); the
    /// underlying `io::Error`, if any, is the `source()`
    Connection(ConnectionError),
    /// Server-reported errors (ERR packets)
    Query(QueryError),
    /// Protocol errors (wire-level)
    Protocol(ProtocolError),
    /// Authentication method errors
    Auth(AuthError),
    /// Caller misuse detected before any I/O
    Validation(ValidationError),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection refused
    Refused,
    /// Connection lost during operation
    Disconnected,
    /// Connection was already closed
    Closed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// Server error code (e.g. 1064 for a syntax error)
    pub code: u16,
    /// Five character SQL-state, when the server sent one
    pub sqlstate: Option<String>,
    pub message: String,
    pub sql: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Deadlock detected
    Deadlock,
    /// Lock wait timeout
    Timeout,
    /// Other database error
    Database,
}

impl QueryErrorKind {
    /// Classify a MySQL server error code.
    pub fn from_code(code: u16) -> Self {
        match code {
            1064 | 1149 => QueryErrorKind::Syntax,
            1062 | 1451 | 1452 | 1048 => QueryErrorKind::Constraint,
            1046 | 1049 | 1051 | 1054 | 1146 => QueryErrorKind::NotFound,
            1044 | 1045 | 1142 | 1143 => QueryErrorKind::Permission,
            1213 => QueryErrorKind::Deadlock,
            1205 => QueryErrorKind::Timeout,
            _ => QueryErrorKind::Database,
        }
    }
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct AuthError {
    pub message: String,
    /// Plugin the server asked for, if any
    pub plugin: Option<String>,
}

/// Caller misuse of the command API.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    /// The rejected statement
    pub sql: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// `query` was given a statement that is not a SELECT
    NotSelect,
    /// `exec` was given a SELECT
    UnexpectedSelect,
}

impl Error {
    /// Does this error leave the connection unusable?
    ///
    /// Protocol, auth and transport failures close the connection;
    /// server-reported query errors and validation errors do not.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Protocol(_) | Error::Auth(_))
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Get SQLSTATE if available (e.g., "23000" for a duplicate key)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the server error code if available
    pub fn code(&self) -> Option<u16> {
        match self {
            Error::Query(q) => Some(q.code),
            _ => None,
        }
    }
}

impl QueryError {
    /// Is this a duplicate key violation?
    pub fn is_duplicate_key(&self) -> bool {
        // ER_DUP_ENTRY
        self.code == 1062
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.code == 1451 || self.code == 1452
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Auth(e) => write!(f, "Authentication error: {}", e.message),
            Error::Validation(e) => write!(f, "Validation error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sqlstate {
            Some(sqlstate) => write!(f, "{} ({}, SQLSTATE {})", self.message, self.code, sqlstate),
            None => write!(f, "{} ({})", self.message, self.code),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ValidationErrorKind::NotSelect => {
                write!(f, "query() only accepts SELECT statements: '{}'", self.sql)
            }
            ValidationErrorKind::UnexpectedSelect => {
                write!(f, "exec() does not accept SELECT statements: '{}'", self.sql)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<AuthError> for Error {
    fn from(err: AuthError) -> Self {
        Error::Auth(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

/// Result type alias for mywire operations.
pub type Result<T> = std::result::Result<T, Error>;
