//! Bluetooth LE addresses as used by nodes and transceivers.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::cbor::Value;
use crate::marshal::{Marshal, MarshalError, Unmarshal};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid Bluetooth address: {0:?}")]
pub struct InvalidAddressError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AddrType {
    Public = 0,
    Random = 1,
}

/// A Bluetooth LE address together with its address type.
///
/// The textual form is six hex octets joined by `:` or `-`, optionally
/// followed by `/public` or `/random` (default public):
///
/// ```
/// use anura_lib::BluetoothAddrLE;
///
/// let addr: BluetoothAddrLE = "a1:b2:c3:d4:e5:f6/random".parse().unwrap();
/// assert_eq!(addr.to_string(), "A1:B2:C3:D4:E5:F6/random");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BluetoothAddrLE {
    pub addr_type: AddrType,
    pub address: [u8; 6],
}

impl BluetoothAddrLE {
    pub fn new(addr_type: AddrType, address: [u8; 6]) -> Self {
        Self { addr_type, address }
    }

    /// The address octets without the type suffix, e.g. `A1:B2:C3:D4:E5:F6`.
    pub fn address_str(&self) -> String {
        self.address
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl fmt::Display for BluetoothAddrLE {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let type_str = match self.addr_type {
            AddrType::Public => "public",
            AddrType::Random => "random",
        };
        write!(f, "{}/{}", self.address_str(), type_str)
    }
}

impl FromStr for BluetoothAddrLE {
    type Err = InvalidAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidAddressError(s.to_string());

        let (addr_part, addr_type) = match s.split_once('/') {
            None => (s, AddrType::Public),
            Some((addr, suffix)) => {
                let addr_type = if suffix.eq_ignore_ascii_case("public") {
                    AddrType::Public
                } else if suffix.eq_ignore_ascii_case("random") {
                    AddrType::Random
                } else {
                    return Err(invalid());
                };
                (addr, addr_type)
            }
        };

        let hex: String = addr_part.chars().filter(|c| *c != ':' && *c != '-').collect();
        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }

        let mut address = [0u8; 6];
        for (i, octet) in address.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }

        Ok(BluetoothAddrLE { addr_type, address })
    }
}

// On the wire an address is the two-element array [type, octets], not an
// integer-keyed map like ordinary records.
impl Marshal for BluetoothAddrLE {
    fn marshal(&self) -> Value {
        Value::Array(vec![
            Value::Int(u8::from(self.addr_type) as i64),
            Value::Bytes(Bytes::copy_from_slice(&self.address)),
        ])
    }
}

impl Unmarshal for BluetoothAddrLE {
    fn unmarshal(value: &Value) -> Result<Self, MarshalError> {
        let mismatch = || MarshalError::mismatch("BluetoothAddrLE", value);
        let items = value.as_array().ok_or_else(mismatch)?;
        match items {
            [Value::Int(addr_type), Value::Bytes(octets)] if octets.len() == 6 => {
                let addr_type = u8::try_from(*addr_type)
                    .ok()
                    .and_then(|t| AddrType::try_from(t).ok())
                    .ok_or_else(mismatch)?;
                let mut address = [0u8; 6];
                address.copy_from_slice(octets);
                Ok(BluetoothAddrLE { addr_type, address })
            }
            _ => Err(mismatch()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_random() {
        let addr: BluetoothAddrLE = "A1:B2:C3:D4:E5:F6/random".parse().unwrap();
        assert_eq!(addr.addr_type, AddrType::Random);
        assert_eq!(addr.address, [0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6]);
        assert_eq!(addr.to_string(), "A1:B2:C3:D4:E5:F6/random");
    }

    #[test]
    fn test_parse_default_type_and_separators() {
        let colon: BluetoothAddrLE = "00:00:00:00:00:00".parse().unwrap();
        assert_eq!(colon.addr_type, AddrType::Public);

        let hyphen: BluetoothAddrLE = "ff-ff-ff-ff-ff-ff/PUBLIC".parse().unwrap();
        assert_eq!(hyphen.addr_type, AddrType::Public);
        assert_eq!(hyphen.address, [0xFF; 6]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<BluetoothAddrLE>().is_err());
        assert!("a1:b2:c3:d4:e5".parse::<BluetoothAddrLE>().is_err());
        assert!("a1:b2:c3:d4:e5:f6/unknown".parse::<BluetoothAddrLE>().is_err());
        assert!("zz:b2:c3:d4:e5:f6".parse::<BluetoothAddrLE>().is_err());
    }

    #[test]
    fn test_marshal_as_tuple() {
        let addr: BluetoothAddrLE = "a1:b2:c3:d4:e5:f6/random".parse().unwrap();
        let value = addr.marshal();
        let items = value.as_array().unwrap();
        assert_eq!(items[0].as_int(), Some(1));
        assert_eq!(
            items[1].as_bytes().unwrap().as_ref(),
            &[0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6]
        );
        assert_eq!(BluetoothAddrLE::unmarshal(&value).unwrap(), addr);
    }
}
