//! COSE envelopes: `Sign1` for everything signed, `Mac0` for the device HMAC
//! over the voucher header. Wraps [`coset`] structures with typed payloads and
//! serde support, so envelopes slot into the CBOR message structs directly.

use std::{borrow::Cow, marker::PhantomData};

use ciborium::value::Value;
use coset::{iana, AsCborValue, CoseMac0, CoseMac0Builder, CoseSign1, CoseSign1Builder, HeaderBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    keys::{hmac_sign, hmac_verify, KeyError, KeyPair, PublicVerifier, SignatureAlgorithm},
    serialization::{cbor_deserialize, cbor_serialize, CborError},
    types::HashAlgorithm,
};

#[derive(thiserror::Error, Debug)]
pub enum CoseError {
    #[error("envelope carries no payload")]
    MissingPayload,
    #[error("protected header carries no algorithm")]
    MissingAlgorithm,
    #[error("unsupported algorithm label {0}")]
    UnsupportedAlgorithm(i64),
    #[error("CBOR error in envelope: {0}")]
    Cbor(#[from] CborError),
    #[error("envelope structure error: {0}")]
    Structure(#[source] coset::CoseError),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// A typed COSE envelope: `C` is the COSE structure ([`CoseSign1`] or [`CoseMac0`]),
/// `T` the type of the CBOR payload inside it.
#[derive(Clone, Debug, PartialEq)]
pub struct TypedCose<C, T>(pub C, PhantomData<T>);

pub type TypedSign1<T> = TypedCose<CoseSign1, T>;
pub type TypedMac0<T> = TypedCose<CoseMac0, T>;

impl<C, T> From<C> for TypedCose<C, T> {
    fn from(cose: C) -> Self {
        TypedCose(cose, PhantomData)
    }
}

impl<C, T> Serialize for TypedCose<C, T>
where
    C: AsCborValue + Clone,
{
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0
            .clone()
            .to_cbor_value()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de, C, T> Deserialize<'de> for TypedCose<C, T>
where
    C: AsCborValue,
{
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let cose = C::from_cbor_value(value).map_err(serde::de::Error::custom)?;
        Ok(cose.into())
    }
}

fn algorithm_label(alg: SignatureAlgorithm) -> iana::Algorithm {
    match alg {
        SignatureAlgorithm::ES256 => iana::Algorithm::ES256,
        SignatureAlgorithm::ES384 => iana::Algorithm::ES384,
        SignatureAlgorithm::PS256 => iana::Algorithm::PS256,
        SignatureAlgorithm::PS384 => iana::Algorithm::PS384,
        SignatureAlgorithm::RS256 => iana::Algorithm::RS256,
        SignatureAlgorithm::RS384 => iana::Algorithm::RS384,
    }
}

fn header_algorithm(protected: &coset::ProtectedHeader) -> Result<i64, CoseError> {
    match &protected.header.alg {
        Some(coset::RegisteredLabelWithPrivate::Assigned(alg)) => Ok(*alg as i64),
        Some(coset::RegisteredLabelWithPrivate::PrivateUse(label)) => Ok(*label),
        _ => Err(CoseError::MissingAlgorithm),
    }
}

fn signature_algorithm(protected: &coset::ProtectedHeader) -> Result<SignatureAlgorithm, CoseError> {
    let label = header_algorithm(protected)?;
    let alg = match label {
        -7 => SignatureAlgorithm::ES256,
        -35 => SignatureAlgorithm::ES384,
        -37 => SignatureAlgorithm::PS256,
        -38 => SignatureAlgorithm::PS384,
        -257 => SignatureAlgorithm::RS256,
        -258 => SignatureAlgorithm::RS384,
        other => return Err(CoseError::UnsupportedAlgorithm(other)),
    };
    Ok(alg)
}

fn mac_algorithm(protected: &coset::ProtectedHeader) -> Result<HashAlgorithm, CoseError> {
    let label = header_algorithm(protected)?;
    match label {
        5 => Ok(HashAlgorithm::HmacSha256),
        6 => Ok(HashAlgorithm::HmacSha384),
        other => Err(CoseError::UnsupportedAlgorithm(other)),
    }
}

impl<T> TypedSign1<T>
where
    T: Serialize,
{
    /// Signs the CBOR serialization of `payload`. The algorithm in the protected
    /// header follows from the key; `aad` is the external AAD covered by the
    /// signature but not carried in the envelope.
    pub fn sign(payload: &T, key: &KeyPair, aad: &[u8]) -> Result<Self, CoseError> {
        Self::sign_raw(cbor_serialize(payload)?, key, aad)
    }

    fn sign_raw(payload: Vec<u8>, key: &KeyPair, aad: &[u8]) -> Result<Self, CoseError> {
        let protected = HeaderBuilder::new().algorithm(algorithm_label(key.algorithm())).build();
        let sign1 = CoseSign1Builder::new()
            .protected(protected)
            .payload(payload)
            .try_create_signature(aad, |data| key.sign(data))?
            .build();
        Ok(sign1.into())
    }
}

impl<T> TypedSign1<T>
where
    T: DeserializeOwned,
{
    /// Verifies the signature and parses the payload.
    pub fn verify(&self, verifier: &PublicVerifier, aad: &[u8]) -> Result<T, CoseError> {
        let algorithm = signature_algorithm(&self.0.protected)?;
        self.0
            .verify_signature(aad, |signature, data| verifier.verify(algorithm, data, signature))?;
        self.dangerous_parse_unverified()
    }

    /// Parses the payload without verifying the signature. Callers must either
    /// verify separately or treat the result as untrusted.
    pub fn dangerous_parse_unverified(&self) -> Result<T, CoseError> {
        let payload = self.0.payload.as_ref().ok_or(CoseError::MissingPayload)?;
        Ok(cbor_deserialize(payload)?)
    }
}

impl<T> TypedSign1<T> {
    /// This envelope's bytes as signed input for hash links.
    pub fn serialized(&self) -> Result<Vec<u8>, CoseError> {
        let value = self.0.clone().to_cbor_value().map_err(CoseError::Structure)?;
        Ok(cbor_serialize(&value)?)
    }
}

impl<T> TypedMac0<T>
where
    T: Serialize,
{
    pub fn mac(payload: &T, algorithm: HashAlgorithm, secret: &[u8]) -> Result<Self, CoseError> {
        Self::mac_raw(Cow::Owned(cbor_serialize(payload)?), algorithm, secret)
    }

    pub fn mac_raw(payload: Cow<'_, [u8]>, algorithm: HashAlgorithm, secret: &[u8]) -> Result<Self, CoseError> {
        let label = match algorithm {
            HashAlgorithm::HmacSha256 => iana::Algorithm::HMAC_256_256,
            _ => iana::Algorithm::HMAC_384_384,
        };
        let protected = HeaderBuilder::new().algorithm(label).build();
        let mac0 = CoseMac0Builder::new()
            .protected(protected)
            .payload(payload.into_owned())
            .try_create_tag(&[], |data| hmac_sign(algorithm, secret, data).map(|mac| mac.value().to_vec()))?
            .build();
        Ok(mac0.into())
    }
}

impl<T> TypedMac0<T> {
    pub fn verify_mac(&self, secret: &[u8]) -> Result<(), CoseError> {
        let algorithm = mac_algorithm(&self.0.protected)?;
        self.0.verify_tag(&[], |tag, data| {
            let mac = crate::types::HMac::from_parts(algorithm, tag.to_vec());
            hmac_verify(&mac, secret, data)
        })?;
        Ok(())
    }

    /// The exact payload bytes covered by the tag.
    pub fn payload_bytes(&self) -> Result<&[u8], CoseError> {
        self.0
            .payload
            .as_deref()
            .ok_or(CoseError::MissingPayload)
    }

    pub fn algorithm(&self) -> Result<HashAlgorithm, CoseError> {
        mac_algorithm(&self.0.protected)
    }

    pub fn tag(&self) -> &[u8] {
        &self.0.tag
    }
}

/// Wrapper for [`coset::CoseKey`] with serde support.
#[derive(Clone, Debug, PartialEq)]
pub struct CoseKey(pub coset::CoseKey);

impl From<coset::CoseKey> for CoseKey {
    fn from(key: coset::CoseKey) -> Self {
        CoseKey(key)
    }
}

impl Serialize for CoseKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0
            .clone()
            .to_cbor_value()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CoseKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let key = coset::CoseKey::from_cbor_value(value).map_err(serde::de::Error::custom)?;
        Ok(CoseKey(key))
    }
}
