//! Field-addressed message container carried over every transport.
//!
//! The hosted application's schema is opaque to this crate; the runtime only
//! reads a handful of reserved fields (discovery identity, keep-alive marker,
//! tree-command payloads). Equality is deep, which discovery relies on when it
//! decides whether a peer's advertisement actually changed.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Field {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Message(Box<Message>),
}

impl From<bool> for Field {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Field {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Field {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Field {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Field {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for Field {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<Message> for Field {
    fn from(v: Message) -> Self {
        Self::Message(Box::new(v))
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
            Self::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Self::Message(m) => write!(f, "{m}"),
        }
    }
}

/// A `what` code plus named fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub what: u32,
    pub fields: BTreeMap<String, Field>,
}

impl Message {
    #[must_use]
    pub const fn new(what: u32) -> Self {
        Self {
            what,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field insert.
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<Field>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Field>) {
        self.fields.insert(name.to_owned(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Field> {
        self.fields.remove(name)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(Field::Str(s)) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.fields.get(name) {
            Some(Field::Int(v)) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.fields.get(name) {
            Some(Field::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        match self.fields.get(name) {
            Some(Field::Bytes(v)) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_message(&self, name: &str) -> Option<&Message> {
        match self.fields.get(name) {
            Some(Field::Message(m)) => Some(m),
            _ => None,
        }
    }

    /// Reads a port number stored as an integer field.
    #[must_use]
    pub fn get_port(&self, name: &str) -> Option<u16> {
        self.get_int(name)
            .and_then(|v| u16::try_from(v).ok())
            .filter(|&p| p != 0)
    }

    /// Serializes into `buf` (cleared first, capacity reused).
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Encode`] if serialization fails.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        buf.clear();
        let bytes = postcard::to_stdvec(self)?;
        buf.extend_from_slice(&bytes);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`WireError::Decode`] on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        postcard::from_bytes(bytes).map_err(WireError::Decode)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message(0x{:08x}){{", self.what)?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        f.write_str("}")
    }
}

/// Serialization errors shared by every wire format in the crate.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("encode failed: {0}")]
    Encode(postcard::Error),
    #[error("decode failed: {0}")]
    Decode(postcard::Error),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),
    #[error("message 0x{0:08x} is not a tree-protocol message")]
    NotTreeMessage(u32),
}

impl From<postcard::Error> for WireError {
    fn from(err: postcard::Error) -> Self {
        Self::Encode(err)
    }
}
