//! Core types for mywire.
//!
//! This crate provides the types shared by the protocol engine and its callers:
//!
//! - `Error` and the per-category error structs
//! - `Value`, the closed set of decoded column values
//! - `Row`, an ordered name-to-value mapping
//! - `Outcome` and `Cx` re-exported from asupersync

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    AuthError, ConnectionError, ConnectionErrorKind, Error, ProtocolError, QueryError,
    QueryErrorKind, Result, ValidationError, ValidationErrorKind,
};
pub use row::Row;
pub use value::Value;
