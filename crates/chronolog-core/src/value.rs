//! Property values and their text encoding
//!
//! Segment lines store each value as text next to its type tag. The encoding has to
//! survive a newline-delimited, pipe-separated file and stay readable by older
//! readers, which is why some types look the way they do:
//!
//! - scalars are plain locale independent text
//! - strings replace `\n` with [`NEWLINE_MANGLE`]
//! - vectors of primitives are comma joined
//! - vectors of strings are a base64 encoded JSON array tagged `VECTOR_STRING_BASE64`,
//!   so an empty vector and a vector holding one empty string stay distinct
//! - vectors of records are JSON with newlines mangled
//!
//! The legacy `VECTOR_STRING` tag (comma joined, empty means empty vector) is still decoded.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Replaces newline characters inside archived text.
pub const NEWLINE_MANGLE: &str = ".KRB_NEWLINE.";

/// Nested document stored inside a `VECTOR_HASH` value.
pub type Record = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ValueType {
    Bool,
    Char,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    String,
    VectorBool,
    VectorInt8,
    VectorUInt8,
    VectorInt16,
    VectorUInt16,
    VectorInt32,
    VectorUInt32,
    VectorInt64,
    VectorUInt64,
    VectorFloat,
    VectorDouble,
    /// Legacy comma joined string vectors, read only.
    VectorString,
    VectorStringBase64,
    VectorHash,
}

impl ValueType {
    const ALL: [ValueType; 27] = [
        ValueType::Bool,
        ValueType::Char,
        ValueType::Int8,
        ValueType::UInt8,
        ValueType::Int16,
        ValueType::UInt16,
        ValueType::Int32,
        ValueType::UInt32,
        ValueType::Int64,
        ValueType::UInt64,
        ValueType::Float,
        ValueType::Double,
        ValueType::String,
        ValueType::VectorBool,
        ValueType::VectorInt8,
        ValueType::VectorUInt8,
        ValueType::VectorInt16,
        ValueType::VectorUInt16,
        ValueType::VectorInt32,
        ValueType::VectorUInt32,
        ValueType::VectorInt64,
        ValueType::VectorUInt64,
        ValueType::VectorFloat,
        ValueType::VectorDouble,
        ValueType::VectorString,
        ValueType::VectorStringBase64,
        ValueType::VectorHash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Bool => "BOOL",
            ValueType::Char => "CHAR",
            ValueType::Int8 => "INT8",
            ValueType::UInt8 => "UINT8",
            ValueType::Int16 => "INT16",
            ValueType::UInt16 => "UINT16",
            ValueType::Int32 => "INT32",
            ValueType::UInt32 => "UINT32",
            ValueType::Int64 => "INT64",
            ValueType::UInt64 => "UINT64",
            ValueType::Float => "FLOAT",
            ValueType::Double => "DOUBLE",
            ValueType::String => "STRING",
            ValueType::VectorBool => "VECTOR_BOOL",
            ValueType::VectorInt8 => "VECTOR_INT8",
            ValueType::VectorUInt8 => "VECTOR_UINT8",
            ValueType::VectorInt16 => "VECTOR_INT16",
            ValueType::VectorUInt16 => "VECTOR_UINT16",
            ValueType::VectorInt32 => "VECTOR_INT32",
            ValueType::VectorUInt32 => "VECTOR_UINT32",
            ValueType::VectorInt64 => "VECTOR_INT64",
            ValueType::VectorUInt64 => "VECTOR_UINT64",
            ValueType::VectorFloat => "VECTOR_FLOAT",
            ValueType::VectorDouble => "VECTOR_DOUBLE",
            ValueType::VectorString => "VECTOR_STRING",
            ValueType::VectorStringBase64 => "VECTOR_STRING_BASE64",
            ValueType::VectorHash => "VECTOR_HASH",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|ty| ty.as_str() == s)
            .ok_or_else(|| Error::UnknownType(s.to_string()))
    }
}

impl TryFrom<String> for ValueType {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ValueType> for String {
    fn from(ty: ValueType) -> Self {
        ty.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Char(char),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    VectorBool(Vec<bool>),
    VectorInt8(Vec<i8>),
    VectorUInt8(Vec<u8>),
    VectorInt16(Vec<i16>),
    VectorUInt16(Vec<u16>),
    VectorInt32(Vec<i32>),
    VectorUInt32(Vec<u32>),
    VectorInt64(Vec<i64>),
    VectorUInt64(Vec<u64>),
    VectorFloat(Vec<f32>),
    VectorDouble(Vec<f64>),
    VectorString(Vec<String>),
    VectorRecord(Vec<Record>),
}

impl Value {
    /// Type tag written next to the encoded value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::Char(_) => ValueType::Char,
            Value::Int8(_) => ValueType::Int8,
            Value::UInt8(_) => ValueType::UInt8,
            Value::Int16(_) => ValueType::Int16,
            Value::UInt16(_) => ValueType::UInt16,
            Value::Int32(_) => ValueType::Int32,
            Value::UInt32(_) => ValueType::UInt32,
            Value::Int64(_) => ValueType::Int64,
            Value::UInt64(_) => ValueType::UInt64,
            Value::Float(_) => ValueType::Float,
            Value::Double(_) => ValueType::Double,
            Value::String(_) => ValueType::String,
            Value::VectorBool(_) => ValueType::VectorBool,
            Value::VectorInt8(_) => ValueType::VectorInt8,
            Value::VectorUInt8(_) => ValueType::VectorUInt8,
            Value::VectorInt16(_) => ValueType::VectorInt16,
            Value::VectorUInt16(_) => ValueType::VectorUInt16,
            Value::VectorInt32(_) => ValueType::VectorInt32,
            Value::VectorUInt32(_) => ValueType::VectorUInt32,
            Value::VectorInt64(_) => ValueType::VectorInt64,
            Value::VectorUInt64(_) => ValueType::VectorUInt64,
            Value::VectorFloat(_) => ValueType::VectorFloat,
            Value::VectorDouble(_) => ValueType::VectorDouble,
            Value::VectorString(_) => ValueType::VectorStringBase64,
            Value::VectorRecord(_) => ValueType::VectorHash,
        }
    }
}

fn mangle(text: &str) -> String {
    text.replace('\n', NEWLINE_MANGLE)
}

fn unmangle(text: &str) -> String {
    text.replace(NEWLINE_MANGLE, "\n")
}

fn join<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn invalid(ty: ValueType, text: &str) -> Error {
    Error::InvalidValue {
        type_tag: ty.as_str().to_string(),
        text: text.to_string(),
    }
}

fn parse_scalar<T: FromStr>(ty: ValueType, text: &str) -> Result<T> {
    text.parse().map_err(|_| invalid(ty, text))
}

fn parse_vector<T: FromStr>(ty: ValueType, text: &str) -> Result<Vec<T>> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(',').map(|item| parse_scalar(ty, item)).collect()
}

fn parse_bool(ty: ValueType, text: &str) -> Result<bool> {
    match text {
        "1" => Ok(true),
        "0" => Ok(false),
        other if other.eq_ignore_ascii_case("true") => Ok(true),
        other if other.eq_ignore_ascii_case("false") => Ok(false),
        _ => Err(invalid(ty, text)),
    }
}

fn bool_text(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

/// Encodes a value as the text stored in a segment line.
pub fn encode_value(value: &Value) -> Result<String> {
    let text = match value {
        Value::Bool(v) => bool_text(*v).to_string(),
        Value::Char(v) => mangle(&v.to_string()),
        Value::Int8(v) => v.to_string(),
        Value::UInt8(v) => v.to_string(),
        Value::Int16(v) => v.to_string(),
        Value::UInt16(v) => v.to_string(),
        Value::Int32(v) => v.to_string(),
        Value::UInt32(v) => v.to_string(),
        Value::Int64(v) => v.to_string(),
        Value::UInt64(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::String(v) => mangle(v),
        Value::VectorBool(v) => v.iter().map(|b| bool_text(*b)).collect::<Vec<_>>().join(","),
        Value::VectorInt8(v) => join(v),
        Value::VectorUInt8(v) => join(v),
        Value::VectorInt16(v) => join(v),
        Value::VectorUInt16(v) => join(v),
        Value::VectorInt32(v) => join(v),
        Value::VectorUInt32(v) => join(v),
        Value::VectorInt64(v) => join(v),
        Value::VectorUInt64(v) => join(v),
        Value::VectorFloat(v) => join(v),
        Value::VectorDouble(v) => join(v),
        Value::VectorString(v) => STANDARD.encode(serde_json::to_vec(v)?),
        Value::VectorRecord(v) => mangle(&serde_json::to_string(v)?),
    };
    Ok(text)
}

/// Decodes the text of a segment line back into a value of the tagged type.
pub fn decode_value(type_tag: &str, text: &str) -> Result<Value> {
    let ty: ValueType = type_tag.parse()?;
    let value = match ty {
        ValueType::Bool => Value::Bool(parse_bool(ty, text)?),
        ValueType::Char => {
            let unmangled = unmangle(text);
            let mut chars = unmangled.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Value::Char(c),
                _ => return Err(invalid(ty, text)),
            }
        }
        ValueType::Int8 => Value::Int8(parse_scalar(ty, text)?),
        ValueType::UInt8 => Value::UInt8(parse_scalar(ty, text)?),
        ValueType::Int16 => Value::Int16(parse_scalar(ty, text)?),
        ValueType::UInt16 => Value::UInt16(parse_scalar(ty, text)?),
        ValueType::Int32 => Value::Int32(parse_scalar(ty, text)?),
        ValueType::UInt32 => Value::UInt32(parse_scalar(ty, text)?),
        ValueType::Int64 => Value::Int64(parse_scalar(ty, text)?),
        ValueType::UInt64 => Value::UInt64(parse_scalar(ty, text)?),
        ValueType::Float => Value::Float(parse_scalar(ty, text)?),
        ValueType::Double => Value::Double(parse_scalar(ty, text)?),
        ValueType::String => Value::String(unmangle(text)),
        ValueType::VectorBool => {
            if text.is_empty() {
                Value::VectorBool(Vec::new())
            } else {
                Value::VectorBool(
                    text.split(',')
                        .map(|item| parse_bool(ty, item))
                        .collect::<Result<_>>()?,
                )
            }
        }
        ValueType::VectorInt8 => Value::VectorInt8(parse_vector(ty, text)?),
        ValueType::VectorUInt8 => Value::VectorUInt8(parse_vector(ty, text)?),
        ValueType::VectorInt16 => Value::VectorInt16(parse_vector(ty, text)?),
        ValueType::VectorUInt16 => Value::VectorUInt16(parse_vector(ty, text)?),
        ValueType::VectorInt32 => Value::VectorInt32(parse_vector(ty, text)?),
        ValueType::VectorUInt32 => Value::VectorUInt32(parse_vector(ty, text)?),
        ValueType::VectorInt64 => Value::VectorInt64(parse_vector(ty, text)?),
        ValueType::VectorUInt64 => Value::VectorUInt64(parse_vector(ty, text)?),
        ValueType::VectorFloat => Value::VectorFloat(parse_vector(ty, text)?),
        ValueType::VectorDouble => Value::VectorDouble(parse_vector(ty, text)?),
        ValueType::VectorString => {
            // Ambiguous legacy form: empty text is read as an empty vector.
            if text.is_empty() {
                Value::VectorString(Vec::new())
            } else {
                Value::VectorString(unmangle(text).split(',').map(str::to_string).collect())
            }
        }
        ValueType::VectorStringBase64 => {
            let decoded = STANDARD.decode(text.trim())?;
            Value::VectorString(serde_json::from_slice(&decoded)?)
        }
        ValueType::VectorHash => Value::VectorRecord(serde_json::from_str(&unmangle(text))?),
    };
    Ok(value)
}
