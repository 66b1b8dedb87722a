//! Dynamic CBOR value tree used by the wire protocols.
//!
//! Both the AVSS control point and the transceiver RPC layer carry
//! CBOR-encoded payloads. Typed records are mapped onto this tree by the
//! [`crate::marshal`] module; the tree itself only knows about encoding and
//! decoding via minicbor.

use bytes::Bytes;
use minicbor::data::{Tag, Type};
use minicbor::decode::Decoder;
use minicbor::encode::{Encoder, Write};
use thiserror::Error;

/// IANA tag for an IPv4 address carried as a 4-byte string.
pub const TAG_IPV4: u64 = 52;
/// IANA tag for a binary UUID.
pub const TAG_UUID: u64 = 37;

#[derive(Error, Debug)]
pub enum CborError {
    #[error("CBOR decode error: {0}")]
    Decode(String),

    #[error("CBOR encode error: {0}")]
    Encode(String),

    #[error("unsupported CBOR item: {0}")]
    Unsupported(&'static str),
}

impl From<minicbor::decode::Error> for CborError {
    fn from(e: minicbor::decode::Error) -> Self {
        CborError::Decode(e.to_string())
    }
}

/// A decoded CBOR data item.
///
/// Maps are kept as ordered pair lists since protocol maps are keyed by
/// integers and must round-trip without imposing string keys. Unrecognized
/// tags are preserved as [`Value::Tag`] and interpreted (if at all) by the
/// unmarshalling layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Bytes),
    Text(String),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Tag(u64, Box<Value>),
}

impl Value {
    /// Name of the runtime type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::Text(_) => "text",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Tag(..) => "tag",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }
}

/// Look up an integer key in a decoded map.
pub fn map_get(entries: &[(Value, Value)], key: i64) -> Option<&Value> {
    entries
        .iter()
        .find(|(k, _)| matches!(k, Value::Int(i) if *i == key))
        .map(|(_, v)| v)
}

/// Encode a value into a fresh buffer.
pub fn to_vec(value: &Value) -> Result<Vec<u8>, CborError> {
    let mut buf = Vec::new();
    let mut encoder = Encoder::new(&mut buf);
    encode_value(&mut encoder, value).map_err(|e| CborError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decode a single value from a buffer.
pub fn from_slice(data: &[u8]) -> Result<Value, CborError> {
    let mut decoder = Decoder::new(data);
    decode_value(&mut decoder)
}

fn encode_value<W: Write>(
    e: &mut Encoder<W>,
    value: &Value,
) -> Result<(), minicbor::encode::Error<W::Error>>
where
    W::Error: std::fmt::Display,
{
    match value {
        Value::Null => {
            e.null()?;
        }
        Value::Bool(b) => {
            e.bool(*b)?;
        }
        Value::Int(i) => {
            e.i64(*i)?;
        }
        Value::Float(f) => {
            e.f64(*f)?;
        }
        Value::Bytes(b) => {
            e.bytes(b)?;
        }
        Value::Text(s) => {
            e.str(s)?;
        }
        Value::Array(items) => {
            e.array(items.len() as u64)?;
            for item in items {
                encode_value(e, item)?;
            }
        }
        Value::Map(entries) => {
            e.map(entries.len() as u64)?;
            for (k, v) in entries {
                encode_value(e, k)?;
                encode_value(e, v)?;
            }
        }
        Value::Tag(tag, inner) => {
            e.tag(Tag::new(*tag))?;
            encode_value(e, inner)?;
        }
    }
    Ok(())
}

fn decode_value(d: &mut Decoder<'_>) -> Result<Value, CborError> {
    let value = match d.datatype()? {
        Type::Bool => Value::Bool(d.bool()?),
        Type::Null => {
            d.null()?;
            Value::Null
        }
        Type::Undefined => {
            d.skip()?;
            Value::Null
        }
        Type::U8 | Type::U16 | Type::U32 | Type::U64 | Type::I8 | Type::I16 | Type::I32
        | Type::I64 | Type::Int => Value::Int(d.i64()?),
        Type::F16 | Type::F32 | Type::F64 => Value::Float(d.f64()?),
        Type::Bytes => Value::Bytes(Bytes::copy_from_slice(d.bytes()?)),
        Type::String => Value::Text(d.str()?.to_owned()),
        Type::Array => {
            let len = d.array()?.ok_or(CborError::Unsupported("indefinite array"))?;
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(decode_value(d)?);
            }
            Value::Array(items)
        }
        Type::Map => {
            let len = d.map()?.ok_or(CborError::Unsupported("indefinite map"))?;
            let mut entries = Vec::with_capacity(len as usize);
            for _ in 0..len {
                let k = decode_value(d)?;
                let v = decode_value(d)?;
                entries.push((k, v));
            }
            Value::Map(entries)
        }
        Type::Tag => {
            let tag = d.tag()?;
            Value::Tag(tag.as_u64(), Box::new(decode_value(d)?))
        }
        Type::BytesIndef | Type::StringIndef | Type::ArrayIndef | Type::MapIndef => {
            return Err(CborError::Unsupported("indefinite length item"));
        }
        _ => return Err(CborError::Unsupported("simple or reserved item")),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let encoded = to_vec(&value).unwrap();
        assert_eq!(from_slice(&encoded).unwrap(), value);
    }

    #[test]
    fn test_encode_rpc_request_frame() {
        // [0, 0, 10, null] as sent for a ping with a known method id
        let value = Value::Array(vec![
            Value::Int(0),
            Value::Int(0),
            Value::Int(10),
            Value::Null,
        ]);
        assert_eq!(to_vec(&value).unwrap(), hex::decode("8400000af6").unwrap());
    }

    #[test]
    fn test_decode_integer_keyed_map() {
        // {0: "v1.2.3", 1: "b"}
        let data = hex::decode("a2006676312e322e33016162").unwrap();
        let value = from_slice(&data).unwrap();
        let map = value.as_map().unwrap();
        assert_eq!(map_get(map, 0).unwrap().as_str(), Some("v1.2.3"));
        assert_eq!(map_get(map, 1).unwrap().as_str(), Some("b"));
    }

    #[test]
    fn test_roundtrip_nested() {
        roundtrip(Value::Map(vec![
            (Value::Int(0), Value::Int(-42)),
            (Value::Int(1), Value::Float(1.5)),
            (
                Value::Int(2),
                Value::Array(vec![Value::Bool(true), Value::Null]),
            ),
            (Value::Int(3), Value::Bytes(Bytes::from_static(b"\x01\x02"))),
            (Value::Int(4), Value::Text("anura".into())),
        ]));
    }

    #[test]
    fn test_tag_passthrough() {
        let data = hex::decode("d8344401020304").unwrap(); // 52(h'01020304')
        let value = from_slice(&data).unwrap();
        match value {
            Value::Tag(TAG_IPV4, inner) => {
                assert_eq!(inner.as_bytes().unwrap().as_ref(), &[1, 2, 3, 4]);
            }
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn test_indefinite_rejected() {
        // 0x9f = indefinite array start
        assert!(matches!(
            from_slice(&[0x9f, 0x01, 0xff]),
            Err(CborError::Unsupported(_))
        ));
    }
}
