//! Elementary protocol types: device GUIDs, nonces, hashes and HMACs,
//! and the capability flags exchanged during session setup.

use std::fmt::{self, Debug, Display};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_repr::{Deserialize_repr, Serialize_repr};
use uuid::Uuid;

use fdo_common::{
    generator::Generator,
    utils::{random_bytes, sha256, sha384},
};

use crate::serialization::CborSeq;

/// Protocol version carried in credentials, vouchers and session setup.
pub const PROTOCOL_VERSION: u16 = 101;

#[derive(thiserror::Error, Debug)]
pub enum TypeError {
    #[error("wrong byte length {found}, expected {expected}")]
    WrongLength { expected: usize, found: usize },
    #[error("hash mismatch for algorithm {0:?}")]
    HashMismatch(HashAlgorithm),
    #[error("hash algorithm {0:?} not usable here")]
    UnusableAlgorithm(HashAlgorithm),
}

/// 128-bit device identifier, assigned at initialization and rotated on
/// every completed ownership transfer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Guid(ByteBuf);

impl Guid {
    pub fn new(uuids: &impl Generator<Uuid>) -> Self {
        Guid(ByteBuf::from(*uuids.generate().as_bytes()))
    }

    pub fn as_uuid(&self) -> Uuid {
        let mut bts = [0u8; 16];
        bts.copy_from_slice(&self.0);
        Uuid::from_bytes(bts)
    }
}

impl TryFrom<Vec<u8>> for Guid {
    type Error = TypeError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != 16 {
            return Err(TypeError::WrongLength {
                expected: 16,
                found: value.len(),
            });
        }
        Ok(Guid(ByteBuf::from(value)))
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_uuid())
    }
}

/// 128-bit random value; carried by every signed message that could otherwise
/// be replayed, contributed fresh by the relying party.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Nonce(ByteBuf);

impl Nonce {
    pub fn new() -> Self {
        Nonce(ByteBuf::from(random_bytes(16)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Default for Nonce {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Digest and HMAC algorithm identifiers, using the COSE registry values.
#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum HashAlgorithm {
    Sha256 = -16,
    Sha384 = -43,
    HmacSha256 = 5,
    HmacSha384 = 6,
}

impl HashAlgorithm {
    pub fn is_hmac(&self) -> bool {
        matches!(self, HashAlgorithm::HmacSha256 | HashAlgorithm::HmacSha384)
    }

    pub(crate) fn digest(&self, data: &[u8]) -> Result<Vec<u8>, TypeError> {
        match self {
            HashAlgorithm::Sha256 => Ok(sha256(data)),
            HashAlgorithm::Sha384 => Ok(sha384(data)),
            alg => Err(TypeError::UnusableAlgorithm(*alg)),
        }
    }
}

/// A digest value paired with the algorithm that produced it.
/// Serialized as `[algorithm, value]`.
pub type Hash = CborSeq<HashKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HashKeyed {
    pub algorithm: HashAlgorithm,
    pub value: ByteBuf,
}

impl Hash {
    pub fn compute(algorithm: HashAlgorithm, data: &[u8]) -> Result<Hash, TypeError> {
        Ok(HashKeyed {
            algorithm,
            value: ByteBuf::from(algorithm.digest(data)?),
        }
        .into())
    }

    /// Verifies that this hash matches `data`, using the embedded algorithm.
    pub fn matches_data(&self, data: &[u8]) -> Result<(), TypeError> {
        let expected = self.0.algorithm.digest(data)?;
        // Hashes are public values, no constant-time comparison needed.
        if expected != *self.0.value {
            return Err(TypeError::HashMismatch(self.0.algorithm));
        }
        Ok(())
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.0.algorithm
    }

    pub fn value(&self) -> &[u8] {
        &self.0.value
    }

    pub fn from_parts(algorithm: HashAlgorithm, value: Vec<u8>) -> Hash {
        HashKeyed {
            algorithm,
            value: ByteBuf::from(value),
        }
        .into()
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.0.algorithm, hex::encode(&self.0.value))
    }
}

/// An HMAC value, same shape as [`Hash`] but with an HMAC algorithm.
pub type HMac = Hash;

/// Optional features a party declares during session setup. Bit 0 signals
/// delegate support. Vendor-specific strings may be appended freely.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityFlags {
    pub bits: u64,
    pub vendor: Vec<String>,
}

impl CapabilityFlags {
    const DELEGATE: u64 = 1;

    pub fn with_delegate() -> Self {
        CapabilityFlags {
            bits: Self::DELEGATE,
            ..Default::default()
        }
    }

    pub fn supports_delegate(&self) -> bool {
        self.bits & Self::DELEGATE != 0
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use fdo_common::generator::UuidGenerator;

    use crate::serialization::{cbor_deserialize, cbor_serialize};

    use super::*;

    #[test]
    fn guid_roundtrip() {
        let guid = Guid::new(&UuidGenerator);
        let serialized = cbor_serialize(&guid).unwrap();
        let deserialized: Guid = cbor_deserialize(&serialized).unwrap();
        assert_eq!(guid, deserialized);
    }

    #[test]
    fn guid_requires_16_bytes() {
        assert_matches!(
            Guid::try_from(vec![0u8; 15]),
            Err(TypeError::WrongLength { expected: 16, found: 15 })
        );
    }

    #[test]
    fn fresh_nonces_differ() {
        assert_ne!(Nonce::new(), Nonce::new());
    }

    #[test]
    fn hash_matches_its_input() {
        let hash = Hash::compute(HashAlgorithm::Sha384, b"some data").unwrap();
        hash.matches_data(b"some data").unwrap();
        assert_matches!(
            hash.matches_data(b"other data"),
            Err(TypeError::HashMismatch(HashAlgorithm::Sha384))
        );
    }

    #[test]
    fn hmac_algorithms_do_not_digest() {
        assert_matches!(
            Hash::compute(HashAlgorithm::HmacSha256, b"x"),
            Err(TypeError::UnusableAlgorithm(HashAlgorithm::HmacSha256))
        );
    }

    #[test]
    fn capability_flags() {
        assert!(CapabilityFlags::with_delegate().supports_delegate());
        assert!(!CapabilityFlags::default().supports_delegate());
    }
}
