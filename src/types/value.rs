//! # Typed Value Representation
//!
//! This module provides [`Value`], the typed primitive stored against a
//! (key, record) pair, together with its stable big-endian wire encoding.
//!
//! ## Value Variants
//!
//! | Variant | Rust Type | Wire tag | Payload encoding |
//! |---------|-----------|----------|------------------|
//! | Boolean | bool      | 1        | 1 byte, 0 or 1   |
//! | Integer | i32       | 2        | 4 bytes, big-endian |
//! | Long    | i64       | 3        | 8 bytes, big-endian |
//! | Float   | f32       | 4        | 4 bytes, IEEE 754 bits big-endian |
//! | Double  | f64       | 5        | 8 bytes, IEEE 754 bits big-endian |
//! | String  | String    | 6        | UTF-8 bytes |
//! | Tag     | String    | 7        | UTF-8 bytes (never search-indexed) |
//! | Link    | i64       | 8        | 8 bytes, big-endian record pointer |
//!
//! The wire encoding is part of the durable format: buffer segments and
//! sealed blocks both embed it, so the tags and byte orders above must
//! never change for existing data.
//!
//! ## Ordering
//!
//! The secondary index sorts revisions by value, so `Value` carries a total
//! order. Values order first by sort class (boolean < numeric < text <
//! link), then within a class:
//!
//! - numerics compare numerically across widths (`Integer(3)` sorts with
//!   `Double(3.5)`), with exact integer comparison when both sides are
//!   integral and a kind-rank tiebreak so distinct values never compare
//!   equal;
//! - text compares case-insensitively with a case-sensitive tiebreak,
//!   `String` before `Tag` on full ties;
//! - links compare by target record id.
//!
//! Equality and hashing are over the canonical encoding, which keeps them
//! consistent with the total order's `Equal`.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use eyre::{bail, ensure, Result};

/// A typed primitive value. Immutable once constructed.
#[derive(Debug, Clone)]
pub enum Value {
    Boolean(bool),
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Tag(String),
    Link(i64),
}

/// Wire type tags. Stable on-disk identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    Boolean = 1,
    Integer = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    String = 6,
    Tag = 7,
    Link = 8,
}

impl ValueType {
    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => ValueType::Boolean,
            2 => ValueType::Integer,
            3 => ValueType::Long,
            4 => ValueType::Float,
            5 => ValueType::Double,
            6 => ValueType::String,
            7 => ValueType::Tag,
            8 => ValueType::Link,
            other => bail!("unknown value type tag {}", other),
        })
    }
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Boolean(_) => ValueType::Boolean,
            Value::Integer(_) => ValueType::Integer,
            Value::Long(_) => ValueType::Long,
            Value::Float(_) => ValueType::Float,
            Value::Double(_) => ValueType::Double,
            Value::String(_) => ValueType::String,
            Value::Tag(_) => ValueType::Tag,
            Value::Link(_) => ValueType::Link,
        }
    }

    /// Appends the payload bytes (without the type tag) to `out`.
    pub fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Value::Boolean(b) => out.push(u8::from(*b)),
            Value::Integer(i) => out.extend_from_slice(&i.to_be_bytes()),
            Value::Long(l) => out.extend_from_slice(&l.to_be_bytes()),
            Value::Float(f) => out.extend_from_slice(&f.to_bits().to_be_bytes()),
            Value::Double(d) => out.extend_from_slice(&d.to_bits().to_be_bytes()),
            Value::String(s) | Value::Tag(s) => out.extend_from_slice(s.as_bytes()),
            Value::Link(l) => out.extend_from_slice(&l.to_be_bytes()),
        }
    }

    /// The canonical encoding: type tag byte followed by the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9);
        out.push(self.value_type() as u8);
        self.encode_payload(&mut out);
        out
    }

    /// Decodes a payload previously produced by [`Value::encode_payload`].
    pub fn decode_payload(value_type: ValueType, payload: &[u8]) -> Result<Self> {
        fn fixed<const N: usize>(payload: &[u8], what: &str) -> Result<[u8; N]> {
            ensure!(
                payload.len() == N,
                "{} payload must be {} bytes, got {}",
                what,
                N,
                payload.len()
            );
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(payload);
            Ok(bytes)
        }

        Ok(match value_type {
            ValueType::Boolean => {
                let byte = fixed::<1>(payload, "BOOLEAN")?[0];
                ensure!(byte <= 1, "BOOLEAN payload must be 0 or 1, got {}", byte);
                Value::Boolean(byte == 1)
            }
            ValueType::Integer => Value::Integer(i32::from_be_bytes(fixed(payload, "INTEGER")?)),
            ValueType::Long => Value::Long(i64::from_be_bytes(fixed(payload, "LONG")?)),
            ValueType::Float => {
                Value::Float(f32::from_bits(u32::from_be_bytes(fixed(payload, "FLOAT")?)))
            }
            ValueType::Double => {
                Value::Double(f64::from_bits(u64::from_be_bytes(fixed(payload, "DOUBLE")?)))
            }
            ValueType::String => Value::String(decode_utf8(payload, "STRING")?),
            ValueType::Tag => Value::Tag(decode_utf8(payload, "TAG")?),
            ValueType::Link => Value::Link(i64::from_be_bytes(fixed(payload, "LINK")?)),
        })
    }

    /// True when this value participates in the search index. Only STRING
    /// values do; TAG text is stored verbatim but never tokenized.
    pub fn is_search_indexable(&self) -> bool {
        matches!(self, Value::String(_))
    }

    /// The text of a string-like value, if any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Tag(s) => Some(s),
            _ => None,
        }
    }

    fn sort_class(&self) -> u8 {
        match self {
            Value::Boolean(_) => 0,
            Value::Integer(_) | Value::Long(_) | Value::Float(_) | Value::Double(_) => 1,
            Value::String(_) | Value::Tag(_) => 2,
            Value::Link(_) => 3,
        }
    }

    fn kind_rank(&self) -> u8 {
        self.value_type() as u8
    }

    fn as_f64(&self) -> f64 {
        match self {
            Value::Integer(i) => f64::from(*i),
            Value::Long(l) => *l as f64,
            Value::Float(f) => f64::from(*f),
            Value::Double(d) => *d,
            _ => unreachable!("as_f64 called on non-numeric value"),
        }
    }

    fn as_integral(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(i64::from(*i)),
            Value::Long(l) => Some(*l),
            _ => None,
        }
    }
}

fn decode_utf8(payload: &[u8], what: &str) -> Result<String> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| eyre::eyre!("{} payload is not valid UTF-8: {}", what, e))?;
    Ok(text.to_string())
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let class = self.sort_class().cmp(&other.sort_class());
        if class != Ordering::Equal {
            return class;
        }
        let primary = match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Link(a), Value::Link(b)) => a.cmp(b),
            (a, b) if a.sort_class() == 1 => match (a.as_integral(), b.as_integral()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => a.as_f64().total_cmp(&b.as_f64()),
            },
            (a, b) => {
                let (x, y) = (a.as_text().unwrap_or(""), b.as_text().unwrap_or(""));
                compare_text(x, y)
            }
        };
        primary
            .then_with(|| self.kind_rank().cmp(&other.kind_rank()))
            .then_with(|| exact_tiebreak(self, other))
    }
}

/// Case-insensitive primary comparison with a case-sensitive tiebreak, so
/// "Foo" and "foo" sort adjacently but remain distinct index entries.
fn compare_text(a: &str, b: &str) -> Ordering {
    let folded = a
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .cmp(b.chars().map(|c| c.to_ascii_lowercase()));
    folded.then_with(|| a.cmp(b))
}

/// Same-kind tiebreak for numerics whose numeric comparison tied but whose
/// bit patterns differ (e.g. -0.0 vs 0.0, NaN payloads).
fn exact_tiebreak(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Float(x), Value::Float(y)) => x.total_cmp(y),
        (Value::Double(x), Value::Double(y)) => x.total_cmp(y),
        _ => Ordering::Equal,
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        // cmp tiebreaks on kind rank, so Equal implies same variant too.
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.encode().hash(state);
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Long(l) => write!(f, "{}", l),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "{}", s),
            Value::Tag(t) => write!(f, "`{}`", t),
            Value::Link(l) => write!(f, "@{}", l),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value) {
        let encoded = value.encode();
        let value_type = ValueType::from_tag(encoded[0]).unwrap();
        let decoded = Value::decode_payload(value_type, &encoded[1..]).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn encoding_round_trips_every_variant() {
        round_trip(Value::Boolean(true));
        round_trip(Value::Integer(-40));
        round_trip(Value::Long(i64::MIN));
        round_trip(Value::Float(2.5));
        round_trip(Value::Double(-0.125));
        round_trip(Value::String("hello world".to_string()));
        round_trip(Value::Tag("tagged".to_string()));
        round_trip(Value::Link(42));
    }

    #[test]
    fn numeric_encodings_are_big_endian() {
        assert_eq!(Value::Integer(1).encode(), vec![2, 0, 0, 0, 1]);
        assert_eq!(
            Value::Long(1).encode(),
            vec![3, 0, 0, 0, 0, 0, 0, 0, 1]
        );
        assert_eq!(
            Value::Float(1.0).encode(),
            vec![4, 0x3f, 0x80, 0, 0]
        );
        assert_eq!(
            Value::Link(256).encode(),
            vec![8, 0, 0, 0, 0, 0, 0, 1, 0]
        );
    }

    #[test]
    fn numerics_sort_across_widths() {
        let mut values = vec![
            Value::Double(2.5),
            Value::Integer(3),
            Value::Long(1),
            Value::Float(0.5),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                Value::Float(0.5),
                Value::Long(1),
                Value::Double(2.5),
                Value::Integer(3),
            ]
        );
    }

    #[test]
    fn distinct_kinds_with_equal_magnitude_stay_distinct() {
        assert_ne!(Value::Integer(1), Value::Long(1));
        assert_ne!(
            Value::String("a".to_string()),
            Value::Tag("a".to_string())
        );
        assert!(Value::Integer(1) < Value::Long(1));
    }

    #[test]
    fn text_sorts_case_insensitively_first() {
        let mut values = vec![
            Value::String("banana".to_string()),
            Value::String("Apple".to_string()),
            Value::String("apple".to_string()),
        ];
        values.sort();
        assert_eq!(values[2], Value::String("banana".to_string()));
        assert!(values[0].as_text().unwrap().eq_ignore_ascii_case("apple"));
    }

    #[test]
    fn only_strings_are_search_indexable() {
        assert!(Value::String("x".to_string()).is_search_indexable());
        assert!(!Value::Tag("x".to_string()).is_search_indexable());
        assert!(!Value::Integer(1).is_search_indexable());
    }
}
