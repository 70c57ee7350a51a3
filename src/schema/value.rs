//! Field-value coding: the byte layout each [`FieldType`] implies inside a
//! wire tuple field.

use crate::error::ClientError;
use crate::wire::WireField;

/// The declared type of one field of a space, per its `_vspace` format
/// entry (or the space's default type, for fields beyond the declared
/// prefix).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Str,
    Utf8Str,
    Num,
    Num64,
}

impl FieldType {
    pub(crate) fn from_wire_name(name: &str) -> FieldType {
        match name {
            "utf8str" | "string" | "str" => FieldType::Utf8Str,
            "num64" | "unsigned64" | "integer64" => FieldType::Num64,
            "num" | "unsigned" | "integer" => FieldType::Num,
            _ => FieldType::Str,
        }
    }
}

impl Default for FieldType {
    fn default() -> Self {
        FieldType::Str
    }
}

/// A decoded field value: the Rust-level counterpart of one wire tuple
/// field, once its bytes have been interpreted according to a
/// [`FieldType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bytes(Vec<u8>),
    Str(String),
    U32(u32),
    U64(u64),
}

impl Value {
    /// Encode this value to its wire representation. The byte layout is
    /// determined by which variant this is, not by the target field's
    /// declared type — callers are responsible for constructing the variant
    /// that matches the field they are writing to.
    pub fn pack(&self) -> WireField {
        match self {
            Value::Bytes(bytes) => bytes.clone(),
            Value::Str(s) => s.as_bytes().to_vec(),
            Value::U32(n) => n.to_le_bytes().to_vec(),
            Value::U64(n) => n.to_le_bytes().to_vec(),
        }
    }

    /// Decode a wire field according to `field_type`.
    pub fn unpack(field_type: FieldType, bytes: &[u8]) -> Result<Value, ClientError> {
        match field_type {
            FieldType::Str => Ok(Value::Bytes(bytes.to_vec())),
            FieldType::Utf8Str => String::from_utf8(bytes.to_vec())
                .map(Value::Str)
                .map_err(|e| ClientError::Schema(format!("field is not valid UTF-8: {}", e))),
            FieldType::Num => {
                let array: [u8; 4] = bytes.try_into().map_err(|_| {
                    ClientError::Schema(format!(
                        "NUM field must be 4 bytes, got {}",
                        bytes.len()
                    ))
                })?;
                Ok(Value::U32(u32::from_le_bytes(array)))
            }
            FieldType::Num64 => {
                let array: [u8; 8] = bytes.try_into().map_err(|_| {
                    ClientError::Schema(format!(
                        "NUM64 field must be 8 bytes, got {}",
                        bytes.len()
                    ))
                })?;
                Ok(Value::U64(u64::from_le_bytes(array)))
            }
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::U32(n)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::U64(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn num_round_trips() {
        let value = Value::U32(1234);
        let unpacked = Value::unpack(FieldType::Num, &value.pack()).unwrap();
        assert_eq!(unpacked, value);
    }

    #[test]
    fn num64_round_trips() {
        let value = Value::U64(123456789012);
        let unpacked = Value::unpack(FieldType::Num64, &value.pack()).unwrap();
        assert_eq!(unpacked, value);
    }

    #[test]
    fn utf8str_round_trips() {
        let value = Value::Str("hello".to_owned());
        let unpacked = Value::unpack(FieldType::Utf8Str, &value.pack()).unwrap();
        assert_eq!(unpacked, value);
    }

    #[test]
    fn str_is_opaque_bytes() {
        let value = Value::Bytes(vec![0xff, 0x00, 0x10]);
        let unpacked = Value::unpack(FieldType::Str, &value.pack()).unwrap();
        assert_eq!(unpacked, value);
    }

    #[test]
    fn num_rejects_wrong_width() {
        assert!(Value::unpack(FieldType::Num, &[1, 2, 3]).is_err());
    }
}
