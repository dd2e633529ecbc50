//! Key and signature abstraction: the supported key types, the fixed
//! key-to-algorithm mapping, and signing/verification over raw bytes.
//! COSE envelope construction on top of these lives in [`crate::cose`].

use p256::ecdsa::signature::{RandomizedSigner, SignatureEncoding, Signer, Verifier};
use rand_core::OsRng;
use ring::hmac;
use rsa::{
    pkcs8::{DecodePrivateKey, EncodePrivateKey},
    traits::PublicKeyParts,
    RsaPrivateKey, RsaPublicKey,
};
use serde_repr::{Deserialize_repr, Serialize_repr};
use sha2::{Sha256, Sha384};

use crate::types::{HMac, Hash, HashAlgorithm};

#[derive(thiserror::Error, Debug)]
pub enum KeyError {
    #[error("signing failed: {0}")]
    Signing(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("signature verification failed")]
    Verification,
    #[error("algorithm {expected:?} expected for this key, got {found:?}")]
    AlgorithmMismatch {
        expected: SignatureAlgorithm,
        found: SignatureAlgorithm,
    },
    #[error("HMAC verification failed")]
    HmacVerification,
    #[error("HMAC requested with non-HMAC algorithm {0:?}")]
    NotAnHmacAlgorithm(HashAlgorithm),
    #[error("unsupported RSA key size of {0} bits")]
    UnsupportedRsaKeySize(usize),
    #[error("key decoding failed: {0}")]
    Decoding(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// The supported key types, with their registry identifiers.
#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyType {
    RsaPkcs = 5,
    RsaPss = 6,
    EcP256 = 10,
    EcP384 = 11,
}

/// COSE signature algorithm identifiers. Selection is a fixed function of the
/// key material plus the PSS selector; there is no runtime negotiation.
#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SignatureAlgorithm {
    ES256 = -7,
    ES384 = -35,
    PS256 = -37,
    PS384 = -38,
    RS256 = -257,
    RS384 = -258,
}

impl SignatureAlgorithm {
    /// Every signing algorithm has an HMAC counterpart with the same hash.
    pub fn hmac_algorithm(&self) -> HashAlgorithm {
        match self {
            SignatureAlgorithm::ES256 | SignatureAlgorithm::RS256 | SignatureAlgorithm::PS256 => {
                HashAlgorithm::HmacSha256
            }
            SignatureAlgorithm::ES384 | SignatureAlgorithm::RS384 | SignatureAlgorithm::PS384 => {
                HashAlgorithm::HmacSha384
            }
        }
    }

    /// The digest algorithm used for hash links produced alongside signatures
    /// of this algorithm.
    pub fn digest_algorithm(&self) -> HashAlgorithm {
        match self.hmac_algorithm() {
            HashAlgorithm::HmacSha256 => HashAlgorithm::Sha256,
            _ => HashAlgorithm::Sha384,
        }
    }
}

/// Private key material of one of the supported types.
#[derive(Clone)]
pub enum PrivateKey {
    EcP256(p256::ecdsa::SigningKey),
    EcP384(p384::ecdsa::SigningKey),
    Rsa(Box<RsaPrivateKey>),
}

/// A private key with its PSS selector, implementing the signer half of the
/// signature abstraction. The algorithm is deduced, never negotiated:
/// P-256 signs ES256, P-384 signs ES384, RSA-2048 signs RS256 (PS256 with
/// `use_pss`), RSA-3072 signs RS384 (PS384 with `use_pss`).
#[derive(Clone)]
pub struct KeyPair {
    key: PrivateKey,
    use_pss: bool,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_type", &self.key_type())
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    pub fn random_p256() -> Self {
        KeyPair {
            key: PrivateKey::EcP256(p256::ecdsa::SigningKey::random(&mut OsRng)),
            use_pss: false,
        }
    }

    pub fn random_p384() -> Self {
        KeyPair {
            key: PrivateKey::EcP384(p384::ecdsa::SigningKey::random(&mut OsRng)),
            use_pss: false,
        }
    }

    pub fn new_rsa(key: RsaPrivateKey, use_pss: bool) -> Result<Self, KeyError> {
        let bits = key.size() * 8;
        if bits != 2048 && bits != 3072 {
            return Err(KeyError::UnsupportedRsaKeySize(bits));
        }
        Ok(KeyPair {
            key: PrivateKey::Rsa(Box::new(key)),
            use_pss,
        })
    }

    pub fn key_type(&self) -> KeyType {
        match (&self.key, self.use_pss) {
            (PrivateKey::EcP256(_), _) => KeyType::EcP256,
            (PrivateKey::EcP384(_), _) => KeyType::EcP384,
            (PrivateKey::Rsa(_), false) => KeyType::RsaPkcs,
            (PrivateKey::Rsa(_), true) => KeyType::RsaPss,
        }
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        match &self.key {
            PrivateKey::EcP256(_) => SignatureAlgorithm::ES256,
            PrivateKey::EcP384(_) => SignatureAlgorithm::ES384,
            PrivateKey::Rsa(key) => match (key.size() * 8, self.use_pss) {
                (2048, false) => SignatureAlgorithm::RS256,
                (2048, true) => SignatureAlgorithm::PS256,
                (_, false) => SignatureAlgorithm::RS384,
                (_, true) => SignatureAlgorithm::PS384,
            },
        }
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        let signature = match &self.key {
            PrivateKey::EcP256(key) => {
                let signature: p256::ecdsa::Signature =
                    key.try_sign(data).map_err(|e| KeyError::Signing(Box::new(e)))?;
                signature.to_vec()
            }
            PrivateKey::EcP384(key) => {
                let signature: p384::ecdsa::Signature =
                    key.try_sign(data).map_err(|e| KeyError::Signing(Box::new(e)))?;
                signature.to_vec()
            }
            PrivateKey::Rsa(key) => match self.algorithm() {
                SignatureAlgorithm::RS256 => rsa::pkcs1v15::SigningKey::<Sha256>::new((**key).clone())
                    .try_sign(data)
                    .map_err(|e| KeyError::Signing(Box::new(e)))?
                    .to_vec(),
                SignatureAlgorithm::RS384 => rsa::pkcs1v15::SigningKey::<Sha384>::new((**key).clone())
                    .try_sign(data)
                    .map_err(|e| KeyError::Signing(Box::new(e)))?
                    .to_vec(),
                SignatureAlgorithm::PS256 => rsa::pss::BlindedSigningKey::<Sha256>::new((**key).clone())
                    .try_sign_with_rng(&mut OsRng, data)
                    .map_err(|e| KeyError::Signing(Box::new(e)))?
                    .to_vec(),
                _ => rsa::pss::BlindedSigningKey::<Sha384>::new((**key).clone())
                    .try_sign_with_rng(&mut OsRng, data)
                    .map_err(|e| KeyError::Signing(Box::new(e)))?
                    .to_vec(),
            },
        };
        Ok(signature)
    }

    pub fn verifying_key(&self) -> PublicVerifier {
        match &self.key {
            PrivateKey::EcP256(key) => PublicVerifier::EcP256(*key.verifying_key()),
            PrivateKey::EcP384(key) => PublicVerifier::EcP384(*key.verifying_key()),
            PrivateKey::Rsa(key) => PublicVerifier::Rsa {
                key: key.to_public_key(),
                use_pss: self.use_pss,
            },
        }
    }

    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, KeyError> {
        let der = match &self.key {
            PrivateKey::EcP256(key) => p256::SecretKey::from(key)
                .to_pkcs8_der()
                .map_err(|e| KeyError::Decoding(Box::new(e)))?,
            PrivateKey::EcP384(key) => p384::SecretKey::from(key)
                .to_pkcs8_der()
                .map_err(|e| KeyError::Decoding(Box::new(e)))?,
            PrivateKey::Rsa(key) => key.to_pkcs8_der().map_err(|e| KeyError::Decoding(Box::new(e)))?,
        };
        Ok(der.as_bytes().to_vec())
    }

    pub fn from_pkcs8_der(der: &[u8], use_pss: bool) -> Result<Self, KeyError> {
        if let Ok(key) = p256::SecretKey::from_pkcs8_der(der) {
            return Ok(KeyPair {
                key: PrivateKey::EcP256(key.into()),
                use_pss: false,
            });
        }
        if let Ok(key) = p384::SecretKey::from_pkcs8_der(der) {
            return Ok(KeyPair {
                key: PrivateKey::EcP384(key.into()),
                use_pss: false,
            });
        }
        let key = RsaPrivateKey::from_pkcs8_der(der).map_err(|e| KeyError::Decoding(Box::new(e)))?;
        KeyPair::new_rsa(key, use_pss)
    }
}

/// The verifier half of the signature abstraction.
#[derive(Debug, Clone, PartialEq)]
pub enum PublicVerifier {
    EcP256(p256::ecdsa::VerifyingKey),
    EcP384(p384::ecdsa::VerifyingKey),
    Rsa { key: RsaPublicKey, use_pss: bool },
}

impl PublicVerifier {
    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            PublicVerifier::EcP256(_) => SignatureAlgorithm::ES256,
            PublicVerifier::EcP384(_) => SignatureAlgorithm::ES384,
            PublicVerifier::Rsa { key, use_pss } => match (key.size() * 8, use_pss) {
                (2048, false) => SignatureAlgorithm::RS256,
                (2048, true) => SignatureAlgorithm::PS256,
                (_, false) => SignatureAlgorithm::RS384,
                (_, true) => SignatureAlgorithm::PS384,
            },
        }
    }

    /// Verifies `signature` over `data`. The algorithm the envelope declared
    /// must be the one this key implies; a mismatch is its own error, never a
    /// silent fallback.
    pub fn verify(&self, algorithm: SignatureAlgorithm, data: &[u8], signature: &[u8]) -> Result<(), KeyError> {
        let expected = self.algorithm();
        if algorithm != expected {
            return Err(KeyError::AlgorithmMismatch {
                expected,
                found: algorithm,
            });
        }

        match self {
            PublicVerifier::EcP256(key) => {
                let signature =
                    p256::ecdsa::Signature::from_slice(signature).map_err(|_| KeyError::Verification)?;
                key.verify(data, &signature).map_err(|_| KeyError::Verification)
            }
            PublicVerifier::EcP384(key) => {
                let signature =
                    p384::ecdsa::Signature::from_slice(signature).map_err(|_| KeyError::Verification)?;
                key.verify(data, &signature).map_err(|_| KeyError::Verification)
            }
            PublicVerifier::Rsa { key, .. } => match expected {
                SignatureAlgorithm::RS256 => {
                    let signature =
                        rsa::pkcs1v15::Signature::try_from(signature).map_err(|_| KeyError::Verification)?;
                    rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key.clone())
                        .verify(data, &signature)
                        .map_err(|_| KeyError::Verification)
                }
                SignatureAlgorithm::RS384 => {
                    let signature =
                        rsa::pkcs1v15::Signature::try_from(signature).map_err(|_| KeyError::Verification)?;
                    rsa::pkcs1v15::VerifyingKey::<Sha384>::new(key.clone())
                        .verify(data, &signature)
                        .map_err(|_| KeyError::Verification)
                }
                SignatureAlgorithm::PS256 => {
                    let signature = rsa::pss::Signature::try_from(signature).map_err(|_| KeyError::Verification)?;
                    rsa::pss::VerifyingKey::<Sha256>::new(key.clone())
                        .verify(data, &signature)
                        .map_err(|_| KeyError::Verification)
                }
                _ => {
                    let signature = rsa::pss::Signature::try_from(signature).map_err(|_| KeyError::Verification)?;
                    rsa::pss::VerifyingKey::<Sha384>::new(key.clone())
                        .verify(data, &signature)
                        .map_err(|_| KeyError::Verification)
                }
            },
        }
    }
}

fn ring_hmac_algorithm(algorithm: HashAlgorithm) -> Result<hmac::Algorithm, KeyError> {
    match algorithm {
        HashAlgorithm::HmacSha256 => Ok(hmac::HMAC_SHA256),
        HashAlgorithm::HmacSha384 => Ok(hmac::HMAC_SHA384),
        other => Err(KeyError::NotAnHmacAlgorithm(other)),
    }
}

pub fn hmac_sign(algorithm: HashAlgorithm, secret: &[u8], data: &[u8]) -> Result<HMac, KeyError> {
    let key = hmac::Key::new(ring_hmac_algorithm(algorithm)?, secret);
    let tag = hmac::sign(&key, data);
    Ok(HMac::from_parts(algorithm, tag.as_ref().to_vec()))
}

pub fn hmac_verify(mac: &HMac, secret: &[u8], data: &[u8]) -> Result<(), KeyError> {
    let key = hmac::Key::new(ring_hmac_algorithm(mac.algorithm())?, secret);
    hmac::verify(&key, data, mac.value()).map_err(|_| KeyError::HmacVerification)
}
