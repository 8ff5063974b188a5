//! Async MySQL wire-protocol client.
//!
//! This crate implements the MySQL client/server protocol from scratch on
//! top of asupersync. It provides:
//!
//! - Incremental packet framing that does not care how reads are chunked
//! - The protocol 10 handshake with `mysql_native_password` authentication
//! - Text-protocol commands: query, exec, ping and quit
//! - Result-set decoding into typed rows
//! - OK packet session-state tracking
//!
//! # MySQL Protocol Overview
//!
//! MySQL uses a packet-based protocol with:
//! - 3-byte payload length + 1-byte sequence number header
//! - Packets of 16MB - 1 or more split across chunks
//! - Request/response pairing via sequence numbers
//!
//! # Example
//!
//! ```rust,ignore
//! use mywire::{Config, Connection};
//!
//! let config = Config::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .password("secret")
//!     .database("mydb");
//!
//! let mut conn = Connection::new(config);
//! let rows = conn.query(&cx, "SELECT id, title FROM books").await;
//! ```

pub mod auth;
pub mod config;
pub mod connection;
mod error;
pub mod handshake;
pub mod protocol;
pub mod result;
pub mod transport;
pub mod types;

pub use config::Config;
pub use connection::{ConnInfo, Connection, ConnectionState, SessionState};
pub use protocol::SessionStateChange;
pub use result::ResultSet;
pub use transport::{Connector, TcpConnector, TcpTransport, Transport};
pub use types::{ColumnDefinition, FieldType};

pub use mywire_core::{Cx, Error, Outcome, Row, Value};
