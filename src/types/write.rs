//! # Writes and Revisions
//!
//! A [`Write`] is a single ADD or REMOVE of a (key, value) pair against a
//! record. The engine stamps each accepted write with a strictly monotonic
//! version, producing a [`Revision`] — the immutable unit that buffer
//! segments persist and database blocks index.
//!
//! ## Wire Encoding (stable)
//!
//! ```text
//! +-----------+----------------+----------------+----------------+
//! | operation | version        | record         | key length     |
//! | 1 byte    | 8 bytes BE     | 8 bytes BE     | 4 bytes BE     |
//! +-----------+----------------+----------------+----------------+
//! | key bytes (UTF-8)                                            |
//! +-----------+----------------+------------------------------- -+
//! | type tag  | value length   | value payload (type-specific)   |
//! | 1 byte    | 4 bytes BE     |                                 |
//! +-----------+----------------+---------------------------------+
//! ```
//!
//! ADD encodes as 1 and REMOVE as 0. All integers are big-endian. The
//! encoding is embedded in buffer segments and sealed blocks, so it can
//! never change for existing data.

use std::fmt;

use eyre::{bail, ensure, Result};

use super::{Value, ValueType};

/// The two mutations a store understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    Remove = 0,
    Add = 1,
}

impl Action {
    pub fn from_byte(byte: u8) -> Result<Self> {
        Ok(match byte {
            0 => Action::Remove,
            1 => Action::Add,
            other => bail!("unknown write operation byte {}", other),
        })
    }
}

/// An unversioned mutation intent. Stamped into a [`Revision`] when the
/// buffer accepts it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Write {
    pub action: Action,
    pub key: String,
    pub value: Value,
    pub record: i64,
}

impl Write {
    pub fn add<K: Into<String>>(key: K, value: Value, record: i64) -> Self {
        Self {
            action: Action::Add,
            key: key.into(),
            value,
            record,
        }
    }

    pub fn remove<K: Into<String>>(key: K, value: Value, record: i64) -> Self {
        Self {
            action: Action::Remove,
            key: key.into(),
            value,
            record,
        }
    }

}

/// A write stamped with its globally monotonic version. Immutable and
/// durable once persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    pub action: Action,
    pub key: String,
    pub value: Value,
    pub record: i64,
    pub version: i64,
}

impl Revision {
    pub fn stamp(write: Write, version: i64) -> Self {
        Self {
            action: write.action,
            key: write.key,
            value: write.value,
            record: write.record,
            version,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let key_bytes = self.key.as_bytes();
        let mut value_payload = Vec::with_capacity(9);
        self.value.encode_payload(&mut value_payload);

        let mut out = Vec::with_capacity(1 + 8 + 8 + 4 + key_bytes.len() + 1 + 4 + value_payload.len());
        out.push(self.action as u8);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.record.to_be_bytes());
        out.extend_from_slice(&(key_bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(key_bytes);
        out.push(self.value.value_type() as u8);
        out.extend_from_slice(&(value_payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&value_payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let action = Action::from_byte(cursor.take_u8("operation")?)?;
        let version = cursor.take_i64("version")?;
        let record = cursor.take_i64("record")?;
        let key_len = cursor.take_u32("key length")? as usize;
        let key_bytes = cursor.take_bytes(key_len, "key")?;
        let key = std::str::from_utf8(key_bytes)
            .map_err(|e| eyre::eyre!("revision key is not valid UTF-8: {}", e))?
            .to_string();
        let value_type = ValueType::from_tag(cursor.take_u8("value type")?)?;
        let value_len = cursor.take_u32("value length")? as usize;
        let value_payload = cursor.take_bytes(value_len, "value payload")?;
        let value = Value::decode_payload(value_type, value_payload)?;
        ensure!(
            cursor.is_empty(),
            "trailing garbage after encoded revision ({} bytes)",
            cursor.remaining()
        );
        Ok(Self {
            action,
            key,
            value,
            record,
            version,
        })
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.action {
            Action::Add => "ADD",
            Action::Remove => "REMOVE",
        };
        write!(
            f,
            "{} {} AS {} IN {} @{}",
            verb, self.key, self.value, self.record, self.version
        )
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take_bytes(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        ensure!(
            self.remaining() >= len,
            "truncated revision: {} needs {} bytes but only {} remain",
            what,
            len,
            self.remaining()
        );
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn take_u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take_bytes(1, what)?[0])
    }

    fn take_u32(&mut self, what: &str) -> Result<u32> {
        let bytes = self.take_bytes(4, what)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take_i64(&mut self, what: &str) -> Result<i64> {
        let bytes = self.take_bytes(8, what)?;
        let mut fixed = [0u8; 8];
        fixed.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(fixed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_round_trips() {
        let revision = Revision::stamp(
            Write::add("name", Value::String("jeff".to_string()), 17),
            1001,
        );
        let decoded = Revision::decode(&revision.encode()).unwrap();
        assert_eq!(revision, decoded);
    }

    #[test]
    fn operation_byte_leads_the_encoding() {
        let add = Revision::stamp(Write::add("k", Value::Integer(1), 1), 9);
        let remove = Revision::stamp(Write::remove("k", Value::Integer(1), 1), 10);
        assert_eq!(add.encode()[0], 1);
        assert_eq!(remove.encode()[0], 0);
    }

    #[test]
    fn version_and_record_are_big_endian() {
        let revision = Revision::stamp(Write::add("k", Value::Boolean(true), 2), 1);
        let bytes = revision.encode();
        assert_eq!(&bytes[1..9], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&bytes[9..17], &[0, 0, 0, 0, 0, 0, 0, 2]);
    }

    #[test]
    fn truncated_bytes_are_rejected() {
        let revision = Revision::stamp(Write::add("key", Value::Long(5), 3), 4);
        let bytes = revision.encode();
        assert!(Revision::decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(Revision::decode(&bytes[..10]).is_err());
    }
}
