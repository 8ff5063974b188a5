//! Column metadata and text-protocol row decoding.
//!
//! Text result rows carry every value as a length-encoded string. The
//! column's type code decides whether it is turned into an integer, a float,
//! or kept as text.

use mywire_core::{Error, Row, Value};

use crate::error::{protocol_error, protocol_error_with_data};
use crate::protocol::PacketReader;

/// MySQL field type codes (`MYSQL_TYPE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Timestamp2 = 0x11,
    DateTime2 = 0x12,
    Time2 = 0x13,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a field type from its wire code.
    ///
    /// Codes this client does not know decode as `String`.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }

    /// Columns whose text values decode as `Value::Integer`.
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
        )
    }

    /// Columns whose text values decode as `Value::Float`.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, FieldType::Float | FieldType::Double)
    }
}

/// Column flag bits.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
}

/// Metadata for one result-set column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub catalog: String,
    pub schema: String,
    /// Table alias
    pub table: String,
    pub org_table: String,
    /// Column alias, used as the row key
    pub name: String,
    pub org_name: String,
    /// Collation id
    pub charset: u16,
    /// Maximum display length
    pub column_length: u32,
    pub column_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
    /// Only present for COM_FIELD_LIST style responses
    pub default_value: Option<String>,
}

impl ColumnDefinition {
    pub fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    pub fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    pub fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }
}

/// Parse a column definition packet (protocol 4.1 layout).
pub fn parse_column_definition(payload: &[u8]) -> Result<ColumnDefinition, Error> {
    let mut reader = PacketReader::new(payload);
    let mut string = |what: &str| {
        reader
            .read_lenenc_string()
            .ok_or_else(|| protocol_error_with_data(format!("column definition: missing {what}"), payload))
    };

    let catalog = string("catalog")?;
    let schema = string("schema")?;
    let table = string("table")?;
    let org_table = string("org_table")?;
    let name = string("name")?;
    let org_name = string("org_name")?;

    let fixed_len = reader
        .read_lenenc_int()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| protocol_error("column definition: missing fixed-length block"))?;
    let start = reader.position();

    let truncated = || protocol_error_with_data("column definition: truncated fixed block", payload);
    let charset = reader.read_u16_le().ok_or_else(truncated)?;
    let column_length = reader.read_u32_le().ok_or_else(truncated)?;
    let column_type = FieldType::from_u8(reader.read_u8().ok_or_else(truncated)?);
    let flags = reader.read_u16_le().ok_or_else(truncated)?;
    let decimals = reader.read_u8().ok_or_else(truncated)?;

    if !reader.seek(start + fixed_len) {
        return Err(truncated());
    }

    let default_value = if reader.is_empty() || reader.peek() == Some(0xFB) {
        None
    } else {
        Some(
            reader
                .read_lenenc_string()
                .ok_or_else(|| protocol_error("column definition: truncated default value"))?,
        )
    };

    Ok(ColumnDefinition {
        catalog,
        schema,
        table,
        org_table,
        name,
        org_name,
        charset,
        column_length,
        column_type,
        flags,
        decimals,
        default_value,
    })
}

/// Decode one text-protocol value for `column`.
///
/// A numeric column whose text does not parse (an unsigned BIGINT above
/// `i64::MAX`, for instance) keeps its text.
pub fn decode_text_value(column: &ColumnDefinition, text: String) -> Value {
    if column.column_type.is_integer() {
        match text.parse::<i64>() {
            Ok(v) => return Value::Integer(v),
            Err(e) => {
                tracing::warn!(column = %column.name, value = %text, error = %e, "Integer column kept as text");
            }
        }
    } else if column.column_type.is_float() {
        match text.parse::<f64>() {
            Ok(v) => return Value::Float(v),
            Err(e) => {
                tracing::warn!(column = %column.name, value = %text, error = %e, "Float column kept as text");
            }
        }
    }
    Value::Text(text)
}

/// Decode a text-protocol row packet.
pub fn decode_text_row(payload: &[u8], columns: &[ColumnDefinition]) -> Result<Row, Error> {
    let mut reader = PacketReader::new(payload);
    let mut row = Row::with_capacity(columns.len());

    for (i, column) in columns.iter().enumerate() {
        let value = if reader.peek() == Some(0xFB) {
            reader.skip(1);
            Value::Null
        } else {
            let text = reader.read_lenenc_string().ok_or_else(|| {
                protocol_error_with_data(
                    format!("row has {} of {} values", i, columns.len()),
                    payload,
                )
            })?;
            decode_text_value(column, text)
        };
        row.insert(column.name.clone(), value);
    }

    Ok(row)
}
