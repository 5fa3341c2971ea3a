//! # Wire Values
//!
//! The raw values that travel in command arguments and reply value lists.
//!
//! ## Invariants
//! - Integers that fit in `i64` are always `Int`; `UInt` only holds values above `i64::MAX`.
//! - A handle id on the wire is a plain `Int`; the frame's `argIsHandle` list says which is which.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// An opaque byte buffer, serialized as `{"$bytes": [..]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Bytes {
    #[serde(rename = "$bytes")]
    pub bytes: Vec<u8>,
}

/// Variant order matters: untagged decoding picks the first variant that fits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Array(Vec<Value>),
    Bytes(Bytes),
    Dict(BTreeMap<String, Value>),
}

impl Value {
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(Bytes { bytes: bytes.into() })
    }

    pub fn dict<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self::Dict(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Int(v) => u64::try_from(*v).ok(),
            Self::UInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::UInt(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Negative integers are the only values known to be negative.
    pub fn is_negative(&self) -> bool {
        match self {
            Self::Int(v) => *v < 0,
            Self::Float(v) => *v < 0.0,
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Self::Int(v) }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self { Self::Int(v.into()) }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self { Self::Int(v.into()) }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(v) => Self::Int(v),
            Err(_) => Self::UInt(v),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self { Self::Float(v) }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Self::Str(v.into()) }
}

impl From<String> for Value {
    fn from(v: String) -> Self { Self::Str(v) }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self { Self::Array(v) }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Int(v) => write!(f, "{}", v),
            Self::UInt(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Str(s) => write!(f, "{:?}", s),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.bytes.len()),
            Self::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Self::Dict(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}
