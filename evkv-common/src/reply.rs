//! # Reply Values
//!
//! Purpose: Represent a decoded server reply as a closed sum type that the
//! client hands to callers by value.
//!
//! ## Design Principles
//! 1. **Closed Variant Set**: Byte-string, integer, nil, array and error are
//!    the only shapes; arrays nest the same type recursively.
//! 2. **Cheap Copies**: Payloads are `Bytes`, so cloning a reply for delivery
//!    only bumps reference counts.
//! 3. **Exhaustive Mapping**: Wire values convert through a single `match`, so
//!    a new wire shape is a compile error rather than a runtime surprise.

use std::borrow::Cow;

use bytes::Bytes;

use crate::resp::RespValue;

/// Decoded server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Bulk string or status reply payload.
    Bytes(Bytes),
    /// Integer reply.
    Integer(i64),
    /// Null bulk string or null array.
    Nil,
    /// Multi-bulk reply.
    Array(Vec<Reply>),
    /// Error reply text, e.g. `ERR unknown command`.
    Error(Bytes),
}

impl Reply {
    /// Returns the payload of a byte-string reply.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Bytes(data) => Some(data.as_ref()),
            _ => None,
        }
    }

    /// Returns the value of an integer reply.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the elements of an array reply.
    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Returns the message of an error reply.
    pub fn as_error(&self) -> Option<&[u8]> {
        match self {
            Reply::Error(message) => Some(message.as_ref()),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Lossy UTF-8 view of a byte-string or error reply.
    pub fn to_string_lossy(&self) -> Option<Cow<'_, str>> {
        match self {
            Reply::Bytes(data) | Reply::Error(data) => Some(String::from_utf8_lossy(data)),
            _ => None,
        }
    }
}

impl From<RespValue> for Reply {
    fn from(value: RespValue) -> Self {
        match value {
            RespValue::Simple(text) => Reply::Bytes(text),
            RespValue::Error(message) => Reply::Error(message),
            RespValue::Integer(value) => Reply::Integer(value),
            RespValue::Bulk(Some(data)) => Reply::Bytes(data),
            RespValue::Bulk(None) | RespValue::Array(None) => Reply::Nil,
            RespValue::Array(Some(items)) => {
                Reply::Array(items.into_iter().map(Reply::from).collect())
            }
        }
    }
}
