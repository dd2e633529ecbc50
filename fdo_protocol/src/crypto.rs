//! Session cryptography for ownership transfer: ECDH key exchange, HKDF key
//! derivation, and AES-GCM encryption of every message after the exchange
//! completes. Nonces encode the sender role and a monotonic message counter,
//! so replayed or reordered ciphertexts fail authentication.

use aes_gcm::{aead::Aead, Aes128Gcm, Aes256Gcm, KeyInit, Nonce as AesNonce};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_repr::{Deserialize_repr, Serialize_repr};
use strum::{Display, EnumString};

use fdo_common::utils::hkdf;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("HKDF failed")]
    Hkdf,
    #[error("peer key exchange parameter is not a valid point for the negotiated suite")]
    PeerKey,
    #[error("AEAD encryption/decryption failed")]
    Aead,
    #[error("session message counter overflow")]
    CounterOverflow,
}

/// The negotiable key exchange suites.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum KexSuite {
    #[strum(serialize = "ECDH256")]
    #[serde(rename = "ECDH256")]
    EcdhP256,
    #[strum(serialize = "ECDH384")]
    #[serde(rename = "ECDH384")]
    EcdhP384,
}

/// The negotiable symmetric suites for post-exchange session encryption.
#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CipherSuite {
    Aes128Gcm = 1,
    Aes256Gcm = 3,
}

impl CipherSuite {
    fn key_len(&self) -> usize {
        match self {
            CipherSuite::Aes128Gcm => 16,
            CipherSuite::Aes256Gcm => 32,
        }
    }
}

/// Which side of the session a party is; determines the nonce domain each
/// side encrypts in, so the two directions never share a nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Device,
    Owner,
}

impl SessionRole {
    fn nonce_tag(&self) -> u8 {
        match self {
            SessionRole::Device => 0,
            SessionRole::Owner => 1,
        }
    }

    pub fn peer(&self) -> SessionRole {
        match self {
            SessionRole::Device => SessionRole::Owner,
            SessionRole::Owner => SessionRole::Device,
        }
    }
}

enum KexSecret {
    P256(p256::ecdh::EphemeralSecret),
    P384(p384::ecdh::EphemeralSecret),
}

/// One party's half of an ECDH key exchange.
pub struct KeyExchange {
    secret: KexSecret,
}

impl KeyExchange {
    pub fn new(suite: KexSuite) -> Self {
        let secret = match suite {
            KexSuite::EcdhP256 => KexSecret::P256(p256::ecdh::EphemeralSecret::random(&mut OsRng)),
            KexSuite::EcdhP384 => KexSecret::P384(p384::ecdh::EphemeralSecret::random(&mut OsRng)),
        };
        KeyExchange { secret }
    }

    pub fn suite(&self) -> KexSuite {
        match self.secret {
            KexSecret::P256(_) => KexSuite::EcdhP256,
            KexSecret::P384(_) => KexSuite::EcdhP384,
        }
    }

    /// This party's key exchange parameter: the uncompressed SEC1 point.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        match &self.secret {
            KexSecret::P256(secret) => secret.public_key().to_sec1_bytes().to_vec(),
            KexSecret::P384(secret) => secret.public_key().to_sec1_bytes().to_vec(),
        }
    }

    /// Derives the session key from the peer's parameter. `context` must be
    /// identical on both sides (the session nonces, in transcript order).
    pub fn derive(
        self,
        peer_public: &[u8],
        cipher: CipherSuite,
        context: &[u8],
        role: SessionRole,
    ) -> Result<SessionCrypter, CryptoError> {
        let shared = match self.secret {
            KexSecret::P256(secret) => {
                let peer = p256::PublicKey::from_sec1_bytes(peer_public).map_err(|_| CryptoError::PeerKey)?;
                secret.diffie_hellman(&peer).raw_secret_bytes().to_vec()
            }
            KexSecret::P384(secret) => {
                let peer = p384::PublicKey::from_sec1_bytes(peer_public).map_err(|_| CryptoError::PeerKey)?;
                secret.diffie_hellman(&peer).raw_secret_bytes().to_vec()
            }
        };

        let key = hkdf(&shared, context, "SessionEncryptionKey", cipher.key_len()).map_err(|_| CryptoError::Hkdf)?;
        Ok(SessionCrypter {
            cipher,
            key,
            role,
            send_counter: 0,
            recv_counter: 0,
        })
    }
}

/// An encrypted protocol message: the AES-GCM ciphertext of the serialized
/// inner message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage(pub ByteBuf);

/// Authenticated encryption of session traffic after key exchange.
/// Each direction counts its own messages; the counter is baked into the
/// nonce, so a replayed or dropped message makes decryption fail.
#[derive(Debug)]
pub struct SessionCrypter {
    cipher: CipherSuite,
    key: Vec<u8>,
    role: SessionRole,
    send_counter: u64,
    recv_counter: u64,
}

impl SessionCrypter {
    fn nonce(role: SessionRole, counter: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[3] = role.nonce_tag();
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    fn aead(&self, nonce: &[u8; 12], plaintext: Option<&[u8]>, ciphertext: Option<&[u8]>) -> Result<Vec<u8>, CryptoError> {
        let nonce = AesNonce::from_slice(nonce);
        match (self.cipher, plaintext, ciphertext) {
            (CipherSuite::Aes128Gcm, Some(pt), _) => Aes128Gcm::new_from_slice(&self.key)
                .map_err(|_| CryptoError::Aead)?
                .encrypt(nonce, pt)
                .map_err(|_| CryptoError::Aead),
            (CipherSuite::Aes128Gcm, _, Some(ct)) => Aes128Gcm::new_from_slice(&self.key)
                .map_err(|_| CryptoError::Aead)?
                .decrypt(nonce, ct)
                .map_err(|_| CryptoError::Aead),
            (CipherSuite::Aes256Gcm, Some(pt), _) => Aes256Gcm::new_from_slice(&self.key)
                .map_err(|_| CryptoError::Aead)?
                .encrypt(nonce, pt)
                .map_err(|_| CryptoError::Aead),
            (CipherSuite::Aes256Gcm, _, Some(ct)) => Aes256Gcm::new_from_slice(&self.key)
                .map_err(|_| CryptoError::Aead)?
                .decrypt(nonce, ct)
                .map_err(|_| CryptoError::Aead),
            _ => Err(CryptoError::Aead),
        }
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage, CryptoError> {
        let counter = self.send_counter;
        self.send_counter = self.send_counter.checked_add(1).ok_or(CryptoError::CounterOverflow)?;
        let nonce = Self::nonce(self.role, counter);
        let ciphertext = self.aead(&nonce, Some(plaintext), None)?;
        Ok(EncryptedMessage(ByteBuf::from(ciphertext)))
    }

    pub fn decrypt(&mut self, message: &EncryptedMessage) -> Result<Vec<u8>, CryptoError> {
        let counter = self.recv_counter;
        self.recv_counter = self.recv_counter.checked_add(1).ok_or(CryptoError::CounterOverflow)?;
        let nonce = Self::nonce(self.role.peer(), counter);
        self.aead(&nonce, None, Some(&message.0))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rstest::rstest;

    use super::*;

    fn session_pair(suite: KexSuite, cipher: CipherSuite) -> (SessionCrypter, SessionCrypter) {
        let device = KeyExchange::new(suite);
        let owner = KeyExchange::new(suite);
        let device_public = device.public_key_bytes();
        let owner_public = owner.public_key_bytes();

        let device_crypter = device
            .derive(&owner_public, cipher, b"context", SessionRole::Device)
            .unwrap();
        let owner_crypter = owner
            .derive(&device_public, cipher, b"context", SessionRole::Owner)
            .unwrap();
        (device_crypter, owner_crypter)
    }

    #[rstest]
    #[case(KexSuite::EcdhP256, CipherSuite::Aes128Gcm)]
    #[case(KexSuite::EcdhP256, CipherSuite::Aes256Gcm)]
    #[case(KexSuite::EcdhP384, CipherSuite::Aes256Gcm)]
    fn exchange_and_encrypt(#[case] suite: KexSuite, #[case] cipher: CipherSuite) {
        let (mut device, mut owner) = session_pair(suite, cipher);

        let encrypted = device.encrypt(b"from device").unwrap();
        assert_eq!(owner.decrypt(&encrypted).unwrap(), b"from device");

        let encrypted = owner.encrypt(b"from owner").unwrap();
        assert_eq!(device.decrypt(&encrypted).unwrap(), b"from owner");
    }

    #[test]
    fn replayed_message_fails() {
        let (mut device, mut owner) = session_pair(KexSuite::EcdhP256, CipherSuite::Aes256Gcm);

        let encrypted = device.encrypt(b"first").unwrap();
        owner.decrypt(&encrypted).unwrap();
        // The receive counter has advanced; the same ciphertext no longer authenticates.
        assert_matches!(owner.decrypt(&encrypted), Err(CryptoError::Aead));
    }

    #[test]
    fn context_mismatch_yields_different_keys() {
        let device = KeyExchange::new(KexSuite::EcdhP256);
        let owner = KeyExchange::new(KexSuite::EcdhP256);
        let device_public = device.public_key_bytes();
        let owner_public = owner.public_key_bytes();

        let mut device_crypter = device
            .derive(&owner_public, CipherSuite::Aes256Gcm, b"context A", SessionRole::Device)
            .unwrap();
        let mut owner_crypter = owner
            .derive(&device_public, CipherSuite::Aes256Gcm, b"context B", SessionRole::Owner)
            .unwrap();

        let encrypted = device_crypter.encrypt(b"payload").unwrap();
        assert_matches!(owner_crypter.decrypt(&encrypted), Err(CryptoError::Aead));
    }

    #[test]
    fn wrong_suite_peer_key_is_rejected() {
        let device = KeyExchange::new(KexSuite::EcdhP384);
        let owner = KeyExchange::new(KexSuite::EcdhP256);
        assert_matches!(
            device.derive(&owner.public_key_bytes(), CipherSuite::Aes256Gcm, b"", SessionRole::Device),
            Err(CryptoError::PeerKey)
        );
    }

    #[test]
    fn kex_suite_names() {
        assert_eq!(KexSuite::EcdhP256.to_string(), "ECDH256");
        assert_eq!("ECDH384".parse::<KexSuite>().unwrap(), KexSuite::EcdhP384);
    }
}
