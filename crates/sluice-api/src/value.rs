use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use xxhash_rust::xxh3::Xxh3;

/// A single field value carried by a [`Tuple`](crate::Tuple).
///
/// The set of variants is closed on purpose: every variant has total
/// equality and a stable hash, which the engine relies on for partitioned
/// routing. Floats go through [`OrderedFloat`] so that `Value` can be a map
/// key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(OrderedFloat<f64>),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Feeds a stable byte encoding of this value into `hasher`.
    ///
    /// The encoding is tagged per variant so that e.g. `Int(1)` and
    /// `Bool(true)` never collide structurally.
    pub fn hash_into(&self, hasher: &mut Xxh3) {
        match self {
            Value::Bool(b) => {
                hasher.update(&[0u8, *b as u8]);
            }
            Value::Int(i) => {
                hasher.update(&[1u8]);
                hasher.update(&i.to_le_bytes());
            }
            Value::Float(f) => {
                hasher.update(&[2u8]);
                hasher.update(&f.into_inner().to_le_bytes());
            }
            Value::String(s) => {
                hasher.update(&[3u8]);
                hasher.update(s.as_bytes());
            }
            Value::Bytes(b) => {
                hasher.update(&[4u8]);
                hasher.update(b);
            }
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(f.into_inner()),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "{} bytes", b.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(OrderedFloat(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use xxhash_rust::xxh3::Xxh3;

    fn hash_of(value: &Value) -> u64 {
        let mut hasher = Xxh3::new();
        value.hash_into(&mut hasher);
        hasher.digest()
    }

    #[test]
    fn equal_values_hash_equal() {
        assert_eq!(hash_of(&Value::from(42i64)), hash_of(&Value::from(42i64)));
        assert_eq!(hash_of(&Value::from("abc")), hash_of(&Value::from("abc")));
    }

    #[test]
    fn variants_do_not_collide_structurally() {
        // `Int(1)` and `Bool(true)` share a payload byte pattern prefix;
        // the variant tag must keep them apart.
        assert_ne!(hash_of(&Value::from(true)), hash_of(&Value::from(1i64)));
        assert_ne!(
            hash_of(&Value::from("a")),
            hash_of(&Value::Bytes(vec![b'a']))
        );
    }
}
