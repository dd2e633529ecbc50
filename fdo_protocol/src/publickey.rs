//! Public keys as they travel in vouchers and protocol messages: a tagged
//! union of raw SubjectPublicKeyInfo bytes, a COSE_Key, or an X.509
//! certificate chain whose leaf is the effective key.

use ciborium::value::Value;
use coset::{iana, CoseKeyBuilder, Label};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_repr::{Deserialize_repr, Serialize_repr};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::{
    cose::CoseKey,
    keys::{KeyError, KeyPair, KeyType, PublicVerifier},
    serialization::{cbor_serialize, CborError, CborSeq},
    types::{Hash, HashAlgorithm, TypeError},
};

#[derive(thiserror::Error, Debug)]
pub enum PublicKeyError {
    #[error("public key bytes are not a supported SubjectPublicKeyInfo")]
    UnsupportedSpki,
    #[error("COSE key is not a supported EC2 key")]
    UnsupportedCoseKey,
    #[error("COSE key coordinate missing or malformed")]
    CoseKeyCoordinate,
    #[error("certificate chain is empty")]
    EmptyChain,
    #[error("certificate parsing failed: {0}")]
    CertificateParsing(String),
    #[error("declared key type {declared:?} does not match key material {actual:?}")]
    KeyTypeMismatch { declared: KeyType, actual: KeyType },
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("CBOR error: {0}")]
    Cbor(#[from] CborError),
    #[error(transparent)]
    Hash(#[from] TypeError),
}

/// How the key material inside a [`PublicKey`] is encoded.
#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PublicKeyEncoding {
    X509 = 1,
    X5Chain = 2,
    CoseKey = 3,
}

/// An X.509 certificate chain, leaf first, each certificate DER-encoded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct X5Chain(pub Vec<ByteBuf>);

impl X5Chain {
    pub fn new(certs: Vec<Vec<u8>>) -> Self {
        X5Chain(certs.into_iter().map(ByteBuf::from).collect())
    }

    pub fn leaf_der(&self) -> Result<&[u8], PublicKeyError> {
        self.0.first().map(AsRef::as_ref).ok_or(PublicKeyError::EmptyChain)
    }

    /// The leaf certificate's public key; chain validation is the delegate
    /// engine's concern, not performed here.
    pub fn leaf_verifying_key(&self) -> Result<PublicVerifier, PublicKeyError> {
        let der = self.leaf_der()?;
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PublicKeyError::CertificateParsing(e.to_string()))?;
        verifier_from_spki(cert.public_key().raw)
    }

    pub fn serialized(&self) -> Result<Vec<u8>, CborError> {
        cbor_serialize(self)
    }
}

/// Parses a DER SubjectPublicKeyInfo into one of the supported key types.
pub fn verifier_from_spki(spki: &[u8]) -> Result<PublicVerifier, PublicKeyError> {
    if let Ok(key) = p256::ecdsa::VerifyingKey::from_public_key_der(spki) {
        return Ok(PublicVerifier::EcP256(key));
    }
    if let Ok(key) = p384::ecdsa::VerifyingKey::from_public_key_der(spki) {
        return Ok(PublicVerifier::EcP384(key));
    }
    if let Ok(key) = rsa::RsaPublicKey::from_public_key_der(spki) {
        return Ok(PublicVerifier::Rsa { key, use_pss: false });
    }
    Err(PublicKeyError::UnsupportedSpki)
}

fn spki_from_verifier(verifier: &PublicVerifier) -> Result<Vec<u8>, PublicKeyError> {
    let der = match verifier {
        PublicVerifier::EcP256(key) => key
            .to_public_key_der()
            .map_err(|e| KeyError::Decoding(Box::new(e)))?,
        PublicVerifier::EcP384(key) => key
            .to_public_key_der()
            .map_err(|e| KeyError::Decoding(Box::new(e)))?,
        PublicVerifier::Rsa { key, .. } => key
            .to_public_key_der()
            .map_err(|e| KeyError::Decoding(Box::new(e)))?,
    };
    Ok(der.as_ref().to_vec())
}

fn verifier_key_type(verifier: &PublicVerifier) -> KeyType {
    match verifier {
        PublicVerifier::EcP256(_) => KeyType::EcP256,
        PublicVerifier::EcP384(_) => KeyType::EcP384,
        PublicVerifier::Rsa { use_pss: false, .. } => KeyType::RsaPkcs,
        PublicVerifier::Rsa { use_pss: true, .. } => KeyType::RsaPss,
    }
}

/// The key material variants. The shapes are disjoint in CBOR (byte string,
/// array, map), so `untagged` deserialization is unambiguous; the
/// [`PublicKeyEncoding`] field in [`PublicKey`] is cross-checked on use.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum PublicKeyBody {
    X509(ByteBuf),
    X5Chain(X5Chain),
    CoseKey(CoseKey),
}

pub type PublicKey = CborSeq<PublicKeyKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PublicKeyKeyed {
    pub key_type: KeyType,
    pub encoding: PublicKeyEncoding,
    pub body: PublicKeyBody,
}

impl PublicKey {
    pub fn from_verifier(verifier: &PublicVerifier) -> Result<PublicKey, PublicKeyError> {
        Ok(PublicKeyKeyed {
            key_type: verifier_key_type(verifier),
            encoding: PublicKeyEncoding::X509,
            body: PublicKeyBody::X509(ByteBuf::from(spki_from_verifier(verifier)?)),
        }
        .into())
    }

    pub fn from_keypair(key: &KeyPair) -> Result<PublicKey, PublicKeyError> {
        Self::from_verifier(&key.verifying_key())
    }

    pub fn from_x5chain(key_type: KeyType, chain: X5Chain) -> PublicKey {
        PublicKeyKeyed {
            key_type,
            encoding: PublicKeyEncoding::X5Chain,
            body: PublicKeyBody::X5Chain(chain),
        }
        .into()
    }

    pub fn from_cose_key(key_type: KeyType, key: CoseKey) -> PublicKey {
        PublicKeyKeyed {
            key_type,
            encoding: PublicKeyEncoding::CoseKey,
            body: PublicKeyBody::CoseKey(key),
        }
        .into()
    }

    /// The effective verifier: the key itself, or the leaf key of an X5Chain.
    /// Rejects key material inconsistent with the declared key type.
    pub fn verifying_key(&self) -> Result<PublicVerifier, PublicKeyError> {
        let verifier = match &self.0.body {
            PublicKeyBody::X509(spki) => verifier_from_spki(spki)?,
            PublicKeyBody::X5Chain(chain) => chain.leaf_verifying_key()?,
            PublicKeyBody::CoseKey(key) => cose_key_to_verifier(key)?,
        };

        let actual = verifier_key_type(&verifier);
        let declared = self.0.key_type;
        // PSS vs PKCS1v15 is a signer-side selector; both declare RSA material.
        let matches = match (declared, actual) {
            (KeyType::RsaPkcs | KeyType::RsaPss, KeyType::RsaPkcs | KeyType::RsaPss) => true,
            _ => declared == actual,
        };
        if !matches {
            return Err(PublicKeyError::KeyTypeMismatch { declared, actual });
        }

        let verifier = match verifier {
            PublicVerifier::Rsa { key, .. } => PublicVerifier::Rsa {
                key,
                use_pss: declared == KeyType::RsaPss,
            },
            other => other,
        };
        Ok(verifier)
    }

    pub fn x5chain(&self) -> Option<&X5Chain> {
        match &self.0.body {
            PublicKeyBody::X5Chain(chain) => Some(chain),
            _ => None,
        }
    }

    /// Hash over the serialized key, as embedded in voucher entries.
    pub fn hash(&self, algorithm: HashAlgorithm) -> Result<Hash, PublicKeyError> {
        Ok(Hash::compute(algorithm, &cbor_serialize(self)?)?)
    }
}

impl TryFrom<&PublicVerifier> for CoseKey {
    type Error = PublicKeyError;

    fn try_from(verifier: &PublicVerifier) -> Result<Self, Self::Error> {
        let key = match verifier {
            PublicVerifier::EcP256(key) => {
                let point = key.to_encoded_point(false);
                let x = point.x().ok_or(PublicKeyError::CoseKeyCoordinate)?.to_vec();
                let y = point.y().ok_or(PublicKeyError::CoseKeyCoordinate)?.to_vec();
                CoseKeyBuilder::new_ec2_pub_key(iana::EllipticCurve::P_256, x, y).build()
            }
            PublicVerifier::EcP384(key) => {
                let point = key.to_encoded_point(false);
                let x = point.x().ok_or(PublicKeyError::CoseKeyCoordinate)?.to_vec();
                let y = point.y().ok_or(PublicKeyError::CoseKeyCoordinate)?.to_vec();
                CoseKeyBuilder::new_ec2_pub_key(iana::EllipticCurve::P_384, x, y).build()
            }
            PublicVerifier::Rsa { .. } => return Err(PublicKeyError::UnsupportedCoseKey),
        };
        Ok(CoseKey(key))
    }
}

fn cose_key_to_verifier(key: &CoseKey) -> Result<PublicVerifier, PublicKeyError> {
    if key.0.kty != coset::RegisteredLabel::Assigned(iana::KeyType::EC2) {
        return Err(PublicKeyError::UnsupportedCoseKey);
    }

    let param = |label: i64| {
        key.0
            .params
            .iter()
            .find(|(l, _)| *l == Label::Int(label))
            .map(|(_, v)| v)
    };

    let curve = param(iana::Ec2KeyParameter::Crv as i64).ok_or(PublicKeyError::UnsupportedCoseKey)?;
    let x = coordinate_bytes(param(iana::Ec2KeyParameter::X as i64))?;
    let y = coordinate_bytes(param(iana::Ec2KeyParameter::Y as i64))?;

    let sec1: Vec<u8> = [&[0x04u8][..], &x, &y].concat();
    match curve {
        Value::Integer(i) if *i == (iana::EllipticCurve::P_256 as i64).into() => {
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(&sec1)
                .map_err(|_| PublicKeyError::CoseKeyCoordinate)?;
            Ok(PublicVerifier::EcP256(key))
        }
        Value::Integer(i) if *i == (iana::EllipticCurve::P_384 as i64).into() => {
            let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(&sec1)
                .map_err(|_| PublicKeyError::CoseKeyCoordinate)?;
            Ok(PublicVerifier::EcP384(key))
        }
        _ => Err(PublicKeyError::UnsupportedCoseKey),
    }
}

fn coordinate_bytes(value: Option<&Value>) -> Result<Vec<u8>, PublicKeyError> {
    match value {
        Some(Value::Bytes(bts)) => Ok(bts.clone()),
        _ => Err(PublicKeyError::CoseKeyCoordinate),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::serialization::{cbor_deserialize, cbor_serialize};

    use super::*;

    #[test]
    fn x509_roundtrip() {
        let keypair = KeyPair::random_p256();
        let public_key = PublicKey::from_keypair(&keypair).unwrap();

        let serialized = cbor_serialize(&public_key).unwrap();
        let deserialized: PublicKey = cbor_deserialize(&serialized).unwrap();
        assert_eq!(deserialized, public_key);

        assert_eq!(deserialized.verifying_key().unwrap(), keypair.verifying_key());
    }

    #[test]
    fn cose_key_roundtrip() {
        let keypair = KeyPair::random_p384();
        let cose_key = CoseKey::try_from(&keypair.verifying_key()).unwrap();
        let public_key = PublicKey::from_cose_key(KeyType::EcP384, cose_key);

        let serialized = cbor_serialize(&public_key).unwrap();
        let deserialized: PublicKey = cbor_deserialize(&serialized).unwrap();

        assert_eq!(deserialized.verifying_key().unwrap(), keypair.verifying_key());
    }

    #[test]
    fn key_type_mismatch_is_rejected() {
        let keypair = KeyPair::random_p256();
        let cose_key = CoseKey::try_from(&keypair.verifying_key()).unwrap();
        let public_key = PublicKey::from_cose_key(KeyType::EcP384, cose_key);

        assert_matches!(
            public_key.verifying_key(),
            Err(PublicKeyError::KeyTypeMismatch {
                declared: KeyType::EcP384,
                actual: KeyType::EcP256
            })
        );
    }

    #[test]
    fn key_hash_is_stable() {
        let public_key = PublicKey::from_keypair(&KeyPair::random_p256()).unwrap();
        let hash = public_key.hash(HashAlgorithm::Sha256).unwrap();
        hash.matches_data(&cbor_serialize(&public_key).unwrap()).unwrap();
    }

    #[test]
    fn empty_chain_has_no_leaf() {
        let chain = X5Chain::new(vec![]);
        assert_matches!(chain.leaf_verifying_key(), Err(PublicKeyError::EmptyChain));
    }
}
