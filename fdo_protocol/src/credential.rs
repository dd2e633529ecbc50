//! The device credential: the device's persistent state between protocol
//! runs. Written at initialization, replaced (or kept, on credential reuse)
//! at the end of each successful ownership transfer.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::{
    keys::{hmac_sign, hmac_verify, KeyError, KeyPair},
    publickey::{PublicKey, PublicKeyError},
    rendezvous::RendezvousInfo,
    serialization::{cbor_serialize, CborError},
    types::{Guid, HMac, Hash},
};

#[derive(thiserror::Error, Debug)]
pub enum CredentialError {
    #[error("stored private key unreadable: {0}")]
    PrivateKey(#[source] KeyError),
    #[error("manufacturer key does not match the hash in the credential")]
    ManufacturerKeyMismatch,
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    PublicKey(#[from] PublicKeyError),
    #[error("CBOR error: {0}")]
    Cbor(#[from] CborError),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeviceCredential {
    pub active: bool,
    pub version: u16,
    pub guid: Guid,
    pub device_info: String,
    pub rendezvous_info: RendezvousInfo,
    /// Hash of the manufacturer public key from the voucher header, checked
    /// against the header presented during ownership transfer.
    pub manufacturer_key_hash: Hash,
    /// PKCS#8 DER encoding of the device private key.
    pub private_key: ByteBuf,
    pub hmac_secret: ByteBuf,
}

impl DeviceCredential {
    pub fn new(
        guid: Guid,
        device_info: String,
        rendezvous_info: RendezvousInfo,
        manufacturer_key_hash: Hash,
        device_key: &KeyPair,
        hmac_secret: Vec<u8>,
    ) -> Result<Self, CredentialError> {
        Ok(DeviceCredential {
            active: true,
            version: crate::types::PROTOCOL_VERSION,
            guid,
            device_info,
            rendezvous_info,
            manufacturer_key_hash,
            private_key: ByteBuf::from(device_key.to_pkcs8_der()?),
            hmac_secret: ByteBuf::from(hmac_secret),
        })
    }

    pub fn device_key(&self) -> Result<KeyPair, CredentialError> {
        KeyPair::from_pkcs8_der(&self.private_key, false).map_err(CredentialError::PrivateKey)
    }

    /// The device's HMAC over `data` (the voucher header bytes), using the
    /// HMAC algorithm paired with the device key's signing algorithm.
    pub fn compute_hmac(&self, data: &[u8]) -> Result<HMac, CredentialError> {
        let algorithm = self.device_key()?.algorithm().hmac_algorithm();
        Ok(hmac_sign(algorithm, &self.hmac_secret, data)?)
    }

    pub fn verify_hmac(&self, mac: &HMac, data: &[u8]) -> Result<(), CredentialError> {
        Ok(hmac_verify(mac, &self.hmac_secret, data)?)
    }

    /// Checks that `key` is the manufacturer key this credential was
    /// initialized against.
    pub fn verify_manufacturer_key(&self, key: &PublicKey) -> Result<(), CredentialError> {
        self.manufacturer_key_hash
            .matches_data(&cbor_serialize(key)?)
            .map_err(|_| CredentialError::ManufacturerKeyMismatch)
    }

    /// Installs the replacement identity received at the end of an ownership
    /// transfer. The device key and HMAC secret are retained.
    pub fn replace(&mut self, guid: Guid, rendezvous_info: RendezvousInfo, manufacturer_key_hash: Hash) {
        self.guid = guid;
        self.rendezvous_info = rendezvous_info;
        self.manufacturer_key_hash = manufacturer_key_hash;
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use fdo_common::{generator::UuidGenerator, utils::random_bytes};

    use crate::{
        rendezvous::{single_directive, RendezvousProtocolValue},
        serialization::cbor_deserialize,
        types::HashAlgorithm,
    };

    use super::*;

    fn new_credential() -> (DeviceCredential, KeyPair, PublicKey) {
        let device_key = KeyPair::random_p256();
        let manufacturer_key = PublicKey::from_keypair(&KeyPair::random_p256()).unwrap();
        let credential = DeviceCredential::new(
            Guid::new(&UuidGenerator),
            "test-device".to_string(),
            single_directive(RendezvousProtocolValue::Http, "rv.example.com", 8080),
            manufacturer_key.hash(HashAlgorithm::Sha256).unwrap(),
            &device_key,
            random_bytes(32),
        )
        .unwrap();
        (credential, device_key, manufacturer_key)
    }

    #[test]
    fn credential_roundtrip() {
        let (credential, device_key, _) = new_credential();
        let serialized = cbor_serialize(&credential).unwrap();
        let deserialized: DeviceCredential = cbor_deserialize(&serialized).unwrap();
        assert_eq!(deserialized, credential);
        assert_eq!(
            deserialized.device_key().unwrap().verifying_key(),
            device_key.verifying_key()
        );
    }

    #[test]
    fn hmac_matches_key_algorithm() {
        let (credential, _, _) = new_credential();
        let mac = credential.compute_hmac(b"header bytes").unwrap();
        assert_eq!(mac.algorithm(), HashAlgorithm::HmacSha256);
        credential.verify_hmac(&mac, b"header bytes").unwrap();
    }

    #[test]
    fn manufacturer_key_check() {
        let (credential, _, manufacturer_key) = new_credential();
        credential.verify_manufacturer_key(&manufacturer_key).unwrap();

        let other = PublicKey::from_keypair(&KeyPair::random_p256()).unwrap();
        assert_matches!(
            credential.verify_manufacturer_key(&other),
            Err(CredentialError::ManufacturerKeyMismatch)
        );
    }

    #[test]
    fn replace_rotates_identity_but_keeps_keys() {
        let (mut credential, device_key, _) = new_credential();
        let old_guid = credential.guid.clone();
        let new_guid = Guid::new(&UuidGenerator);
        let new_hash = PublicKey::from_keypair(&KeyPair::random_p256())
            .unwrap()
            .hash(HashAlgorithm::Sha256)
            .unwrap();

        credential.replace(
            new_guid.clone(),
            single_directive(RendezvousProtocolValue::Https, "rv2.example.com", 443),
            new_hash.clone(),
        );

        assert_ne!(credential.guid, old_guid);
        assert_eq!(credential.guid, new_guid);
        assert_eq!(credential.manufacturer_key_hash, new_hash);
        assert_eq!(
            credential.device_key().unwrap().verifying_key(),
            device_key.verifying_key()
        );
    }
}
