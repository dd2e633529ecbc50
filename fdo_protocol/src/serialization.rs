//! CBOR (de)serialization helpers, and wrappers that change how a type maps onto CBOR:
//! [`CborSeq`] serializes a struct as an array of its field values, and [`EmbeddedCbor`]
//! holds the serialized bytes of its contents, so that hashes and signatures computed
//! over those bytes survive a round trip unchanged.

use std::{fmt::Debug, marker::PhantomData};

use ciborium::value::Value;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(thiserror::Error, Debug)]
pub enum CborError {
    #[error("deserialization failed: {0}")]
    Deserialization(#[from] ciborium::de::Error<std::io::Error>),
    #[error("serialization failed: {0}")]
    Serialization(#[from] ciborium::ser::Error<std::io::Error>),
}

pub fn cbor_serialize<T: Serialize>(o: &T) -> Result<Vec<u8>, CborError> {
    let mut bts: Vec<u8> = Vec::new();
    ciborium::ser::into_writer(o, &mut bts)?;
    Ok(bts)
}

pub fn cbor_deserialize<T: DeserializeOwned>(reader: &[u8]) -> Result<T, CborError> {
    let deserialized = ciborium::de::from_reader(reader)?;
    Ok(deserialized)
}

/// Wrapper for structs that serializes as an array of the struct's field values,
/// in declaration order, instead of as a map.
///
/// Deserialization relies on serde's derived struct visitors accepting sequences:
/// the fields are read positionally, so field order is part of the wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CborSeq<T>(pub T);

impl<T> From<T> for CborSeq<T> {
    fn from(value: T) -> Self {
        CborSeq(value)
    }
}

impl<T: Serialize> Serialize for CborSeq<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = Value::serialized(&self.0).map_err(serde::ser::Error::custom)?;
        match value {
            Value::Map(entries) => entries
                .into_iter()
                .map(|(_, val)| val)
                .collect::<Vec<_>>()
                .serialize(serializer),
            _ => Err(serde::ser::Error::custom("CborSeq contents did not serialize to a map")),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for CborSeq<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Derived `Deserialize` impls visit sequences positionally, which is
        // exactly the inverse of the `Serialize` impl above.
        T::deserialize(deserializer).map(CborSeq)
    }
}

/// CBOR data embedded in a byte string: the contents are serialized once on
/// construction, and the original bytes are kept verbatim after parsing, so
/// outer signatures and hash links cover bytes rather than reparsed structure.
#[derive(Clone, PartialEq, Eq)]
pub struct EmbeddedCbor<T> {
    bts: ByteBuf,
    _marker: PhantomData<T>,
}

impl<T> Debug for EmbeddedCbor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EmbeddedCbor").field(&hex::encode(&self.bts)).finish()
    }
}

impl<T: Serialize> EmbeddedCbor<T> {
    pub fn new(value: &T) -> Result<Self, CborError> {
        Ok(EmbeddedCbor {
            bts: ByteBuf::from(cbor_serialize(value)?),
            _marker: PhantomData,
        })
    }
}

impl<T: DeserializeOwned> EmbeddedCbor<T> {
    pub fn parse(&self) -> Result<T, CborError> {
        cbor_deserialize(&self.bts)
    }
}

impl<T> EmbeddedCbor<T> {
    /// The exact serialized bytes, as signed or hashed by the embedding structure.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bts
    }

    pub fn from_bytes(bts: Vec<u8>) -> Self {
        EmbeddedCbor {
            bts: ByteBuf::from(bts),
            _marker: PhantomData,
        }
    }
}

impl<T> Serialize for EmbeddedCbor<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bts.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for EmbeddedCbor<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bts = ByteBuf::deserialize(deserializer)?;
        Ok(EmbeddedCbor {
            bts,
            _marker: PhantomData,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    struct ExampleKeyed {
        count: u32,
        label: String,
        payload: ByteBuf,
    }

    fn example() -> ExampleKeyed {
        ExampleKeyed {
            count: 42,
            label: "hello".to_string(),
            payload: ByteBuf::from(vec![1, 2, 3]),
        }
    }

    #[test]
    fn cbor_seq_serializes_as_array() {
        let serialized = cbor_serialize(&CborSeq(example())).unwrap();
        let value: Value = cbor_deserialize(&serialized).unwrap();
        let Value::Array(entries) = value else {
            panic!("expected array");
        };
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], Value::Integer(42.into()));
    }

    #[test]
    fn cbor_seq_roundtrip() {
        let serialized = cbor_serialize(&CborSeq(example())).unwrap();
        let deserialized: CborSeq<ExampleKeyed> = cbor_deserialize(&serialized).unwrap();
        assert_eq!(deserialized.0, example());
    }

    #[test]
    fn embedded_cbor_preserves_bytes() {
        let embedded = EmbeddedCbor::new(&example()).unwrap();
        let serialized = cbor_serialize(&embedded).unwrap();
        let deserialized: EmbeddedCbor<ExampleKeyed> = cbor_deserialize(&serialized).unwrap();

        assert_eq!(deserialized.as_bytes(), embedded.as_bytes());
        assert_eq!(deserialized.parse().unwrap(), example());
        // Reserializing must produce identical bytes; hash links depend on it.
        assert_eq!(cbor_serialize(&deserialized).unwrap(), serialized);
    }
}
