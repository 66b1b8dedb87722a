//! Declarative mapping between typed records and CBOR values.
//!
//! Protocol records are maps keyed by small integer tags. The [`record!`]
//! macro declares a struct together with its per-field tags (and optional
//! defaults) and derives both directions of the conversion. Unknown keys in
//! the input are ignored, so firmware may add fields without breaking older
//! hosts, and records unmarshal identically regardless of field declaration
//! order.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::cbor::{self, CborError, Value};

#[derive(Error, Debug)]
pub enum MarshalError {
    #[error("missing required field {key} in {record}")]
    MissingField { record: &'static str, key: i64 },

    #[error("{found} not decodable as {expected}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),

    #[error(transparent)]
    Cbor(#[from] CborError),
}

impl MarshalError {
    /// Build a [`MarshalError::TypeMismatch`] from the offending value.
    pub fn mismatch(expected: &'static str, found: &Value) -> Self {
        MarshalError::TypeMismatch {
            expected,
            found: found.type_name(),
        }
    }
}

pub trait Marshal {
    fn marshal(&self) -> Value;
}

pub trait Unmarshal: Sized {
    fn unmarshal(value: &Value) -> Result<Self, MarshalError>;
}

/// Encode a marshallable record straight to CBOR bytes.
pub fn to_cbor<T: Marshal>(value: &T) -> Result<Vec<u8>, MarshalError> {
    Ok(cbor::to_vec(&value.marshal())?)
}

/// Decode CBOR bytes straight into a record.
pub fn from_cbor<T: Unmarshal>(data: &[u8]) -> Result<T, MarshalError> {
    T::unmarshal(&cbor::from_slice(data)?)
}

macro_rules! impl_marshal_int {
    ($($ty:ty),*) => {
        $(
            impl Marshal for $ty {
                fn marshal(&self) -> Value {
                    Value::Int(*self as i64)
                }
            }

            impl Unmarshal for $ty {
                fn unmarshal(value: &Value) -> Result<Self, MarshalError> {
                    match value {
                        Value::Int(i) => <$ty>::try_from(*i).map_err(|_| {
                            MarshalError::Invalid(stringify!($ty), format!("{i} out of range"))
                        }),
                        other => Err(MarshalError::mismatch(stringify!($ty), other)),
                    }
                }
            }
        )*
    };
}

impl_marshal_int!(i8, i16, i32, i64, u8, u16, u32);

impl Marshal for bool {
    fn marshal(&self) -> Value {
        Value::Bool(*self)
    }
}

impl Unmarshal for bool {
    fn unmarshal(value: &Value) -> Result<Self, MarshalError> {
        match value {
            Value::Bool(b) => Ok(*b),
            other => Err(MarshalError::mismatch("bool", other)),
        }
    }
}

impl Marshal for f64 {
    fn marshal(&self) -> Value {
        Value::Float(*self)
    }
}

impl Unmarshal for f64 {
    fn unmarshal(value: &Value) -> Result<Self, MarshalError> {
        match value {
            Value::Float(f) => Ok(*f),
            other => Err(MarshalError::mismatch("f64", other)),
        }
    }
}

impl Marshal for f32 {
    fn marshal(&self) -> Value {
        Value::Float(f64::from(*self))
    }
}

impl Unmarshal for f32 {
    fn unmarshal(value: &Value) -> Result<Self, MarshalError> {
        match value {
            Value::Float(f) => Ok(*f as f32),
            other => Err(MarshalError::mismatch("f32", other)),
        }
    }
}

impl Marshal for String {
    fn marshal(&self) -> Value {
        Value::Text(self.clone())
    }
}

impl Unmarshal for String {
    fn unmarshal(value: &Value) -> Result<Self, MarshalError> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            other => Err(MarshalError::mismatch("text", other)),
        }
    }
}

impl Marshal for Bytes {
    fn marshal(&self) -> Value {
        Value::Bytes(self.clone())
    }
}

impl Unmarshal for Bytes {
    fn unmarshal(value: &Value) -> Result<Self, MarshalError> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            other => Err(MarshalError::mismatch("bytes", other)),
        }
    }
}

impl Marshal for Value {
    fn marshal(&self) -> Value {
        self.clone()
    }
}

impl Unmarshal for Value {
    fn unmarshal(value: &Value) -> Result<Self, MarshalError> {
        Ok(value.clone())
    }
}

impl<T: Marshal> Marshal for Option<T> {
    fn marshal(&self) -> Value {
        match self {
            Some(inner) => inner.marshal(),
            None => Value::Null,
        }
    }
}

impl<T: Unmarshal> Unmarshal for Option<T> {
    fn unmarshal(value: &Value) -> Result<Self, MarshalError> {
        match value {
            Value::Null => Ok(None),
            other => Ok(Some(T::unmarshal(other)?)),
        }
    }
}

impl<T: Marshal> Marshal for Vec<T> {
    fn marshal(&self) -> Value {
        Value::Array(self.iter().map(Marshal::marshal).collect())
    }
}

impl<T: Unmarshal> Unmarshal for Vec<T> {
    fn unmarshal(value: &Value) -> Result<Self, MarshalError> {
        match value {
            Value::Array(items) => items.iter().map(T::unmarshal).collect(),
            other => Err(MarshalError::mismatch("array", other)),
        }
    }
}

impl<K: Marshal, V: Marshal> Marshal for BTreeMap<K, V> {
    fn marshal(&self) -> Value {
        Value::Map(self.iter().map(|(k, v)| (k.marshal(), v.marshal())).collect())
    }
}

impl<K: Unmarshal + Ord, V: Unmarshal> Unmarshal for BTreeMap<K, V> {
    fn unmarshal(value: &Value) -> Result<Self, MarshalError> {
        match value {
            Value::Map(entries) => entries
                .iter()
                .map(|(k, v)| Ok((K::unmarshal(k)?, V::unmarshal(v)?)))
                .collect(),
            other => Err(MarshalError::mismatch("map", other)),
        }
    }
}

impl Marshal for Ipv4Addr {
    fn marshal(&self) -> Value {
        Value::Tag(
            cbor::TAG_IPV4,
            Box::new(Value::Bytes(Bytes::copy_from_slice(&self.octets()))),
        )
    }
}

impl Unmarshal for Ipv4Addr {
    fn unmarshal(value: &Value) -> Result<Self, MarshalError> {
        match value {
            Value::Tag(cbor::TAG_IPV4, inner) => match inner.as_ref() {
                Value::Bytes(b) if b.len() == 4 => Ok(Ipv4Addr::new(b[0], b[1], b[2], b[3])),
                other => Err(MarshalError::mismatch("4-byte IPv4 string", other)),
            },
            other => Err(MarshalError::mismatch("tag 52 (IPv4)", other)),
        }
    }
}

impl Marshal for Uuid {
    fn marshal(&self) -> Value {
        Value::Tag(
            cbor::TAG_UUID,
            Box::new(Value::Bytes(Bytes::copy_from_slice(self.as_bytes()))),
        )
    }
}

impl Unmarshal for Uuid {
    fn unmarshal(value: &Value) -> Result<Self, MarshalError> {
        let bytes = match value {
            Value::Tag(cbor::TAG_UUID, inner) => inner.as_bytes(),
            Value::Bytes(b) => Some(b),
            _ => None,
        };
        match bytes {
            Some(b) => Uuid::from_slice(b)
                .map_err(|e| MarshalError::Invalid("uuid", e.to_string())),
            None => Err(MarshalError::mismatch("uuid", value)),
        }
    }
}

/// Declare a protocol record with integer-keyed fields.
///
/// ```
/// use anura_lib::record;
///
/// record! {
///     /// Example request payload.
///     pub struct ExampleArgs {
///         0 => count: i64,
///         1 => label: Option<String> = None,
///     }
/// }
/// ```
///
/// Fields without a default are required; a missing key fails with
/// [`MarshalError::MissingField`]. Unknown keys in the input map are ignored.
#[macro_export]
macro_rules! record {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                $key:literal => $field:ident : $ty:ty $(= $default:expr)?
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        $vis struct $name {
            $(
                $(#[$fmeta])*
                pub $field: $ty,
            )*
        }

        impl $crate::marshal::Marshal for $name {
            fn marshal(&self) -> $crate::cbor::Value {
                $crate::cbor::Value::Map(vec![
                    $(
                        (
                            $crate::cbor::Value::Int($key),
                            $crate::marshal::Marshal::marshal(&self.$field),
                        ),
                    )*
                ])
            }
        }

        impl $crate::marshal::Unmarshal for $name {
            fn unmarshal(
                value: &$crate::cbor::Value,
            ) -> Result<Self, $crate::marshal::MarshalError> {
                let entries = value
                    .as_map()
                    .ok_or_else(|| $crate::marshal::MarshalError::mismatch(stringify!($name), value))?;
                Ok(Self {
                    $(
                        $field: match $crate::cbor::map_get(entries, $key) {
                            Some(v) => $crate::marshal::Unmarshal::unmarshal(v)?,
                            None => $crate::record!(@absent $name, $key $(, $default)?),
                        },
                    )*
                })
            }
        }
    };

    (@absent $name:ident, $key:literal) => {
        return Err($crate::marshal::MarshalError::MissingField {
            record: stringify!($name),
            key: $key,
        })
    };

    (@absent $name:ident, $key:literal, $default:expr) => {
        $default
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    record! {
        struct WithAField {
            0 => field_with_key_0: i64,
        }
    }

    record! {
        struct FooBar {
            0 => foo: i64,
            1 => bar: bool,
        }
    }

    record! {
        struct BarFoo {
            1 => bar: bool,
            0 => foo: i64,
        }
    }

    record! {
        struct WithOptionalField {
            0 => optional: i64 = 100,
        }
    }

    record! {
        struct Empty {}
    }

    fn int_map(entries: &[(i64, Value)]) -> Value {
        Value::Map(
            entries
                .iter()
                .map(|(k, v)| (Value::Int(*k), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_unmarshal_unknown_key() {
        let value = int_map(&[(0, Value::Int(0)), (1, Value::Int(0))]);
        assert_eq!(
            WithAField::unmarshal(&value).unwrap(),
            WithAField { field_with_key_0: 0 }
        );
    }

    #[test]
    fn test_field_order_independence() {
        let value = int_map(&[(0, Value::Int(100)), (1, Value::Bool(true))]);
        let a = FooBar::unmarshal(&value).unwrap();
        let b = BarFoo::unmarshal(&value).unwrap();
        assert_eq!(a.foo, b.foo);
        assert_eq!(a.bar, b.bar);
    }

    #[test]
    fn test_record_requires_map() {
        assert!(Empty::unmarshal(&Value::Map(vec![])).is_ok());
        assert!(matches!(
            Empty::unmarshal(&Value::Array(vec![])),
            Err(MarshalError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_optional_field_default() {
        let absent = WithOptionalField::unmarshal(&Value::Map(vec![])).unwrap();
        assert_eq!(absent.optional, 100);

        let present = WithOptionalField::unmarshal(&int_map(&[(0, Value::Int(200))])).unwrap();
        assert_eq!(present.optional, 200);
    }

    #[test]
    fn test_required_field_missing() {
        assert!(WithAField::unmarshal(&int_map(&[(0, Value::Int(100))])).is_ok());
        assert!(matches!(
            WithAField::unmarshal(&Value::Map(vec![])),
            Err(MarshalError::MissingField { key: 0, .. })
        ));
    }

    #[test]
    fn test_marshal_roundtrip() {
        let original = FooBar { foo: -7, bar: true };
        let value = original.marshal();
        assert_eq!(FooBar::unmarshal(&value).unwrap(), original);
    }

    #[test]
    fn test_primitive_type_mismatch() {
        assert!(matches!(
            i64::unmarshal(&Value::Text("5".into())),
            Err(MarshalError::TypeMismatch { .. })
        ));
        assert!(matches!(
            f32::unmarshal(&Value::Int(5)),
            Err(MarshalError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_ipv4_tag_hook() {
        let tagged = Value::Tag(
            cbor::TAG_IPV4,
            Box::new(Value::Bytes(Bytes::from_static(&[192, 168, 0, 1]))),
        );
        assert_eq!(
            Ipv4Addr::unmarshal(&tagged).unwrap(),
            Ipv4Addr::new(192, 168, 0, 1)
        );
        assert_eq!(Ipv4Addr::new(192, 168, 0, 1).marshal(), tagged);
    }

    #[test]
    fn test_option_null_is_none() {
        assert_eq!(Option::<i64>::unmarshal(&Value::Null).unwrap(), None);
        assert_eq!(
            Option::<i64>::unmarshal(&Value::Int(3)).unwrap(),
            Some(3)
        );
    }
}
