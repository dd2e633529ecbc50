//! Narrow storage contracts for the long-lived protocol state, with
//! in-memory implementations for tests and single-process deployments.
//! Updates are transactional per record; voucher replacement is
//! replace-if-current so concurrent transfers cannot lose updates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::{
    keys::{KeyPair, KeyType},
    rendezvous::To1d,
    types::Guid,
    voucher::OwnershipVoucher,
};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("record already exists")]
    AlreadyExists,
    #[error("store failure: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Signing keys held by a party, indexed by key type.
pub trait KeyRing: Send + Sync {
    fn private_key(&self, key_type: KeyType) -> Option<&KeyPair>;
}

/// A keyring holding a single key, serving it for its own type.
pub struct SingleKeyRing(pub KeyPair);

impl KeyRing for SingleKeyRing {
    fn private_key(&self, key_type: KeyType) -> Option<&KeyPair> {
        (self.0.key_type() == key_type).then_some(&self.0)
    }
}

#[async_trait]
pub trait VoucherStore: Send + Sync {
    async fn insert(&self, voucher: OwnershipVoucher) -> Result<(), StoreError>;

    async fn get(&self, guid: &Guid) -> Result<Option<OwnershipVoucher>, StoreError>;

    /// Atomically replaces the voucher under `guid`, but only if the stored
    /// one still equals `current`. Returns whether the swap happened.
    async fn replace_if_current(
        &self,
        guid: &Guid,
        current: &OwnershipVoucher,
        replacement: OwnershipVoucher,
    ) -> Result<bool, StoreError>;
}

pub struct MemoryVoucherStore {
    vouchers: DashMap<Guid, OwnershipVoucher>,
}

impl MemoryVoucherStore {
    pub fn new() -> Self {
        MemoryVoucherStore {
            vouchers: DashMap::new(),
        }
    }
}

impl Default for MemoryVoucherStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VoucherStore for MemoryVoucherStore {
    async fn insert(&self, voucher: OwnershipVoucher) -> Result<(), StoreError> {
        let guid = voucher.header().map_err(|e| StoreError::Internal(Box::new(e)))?.0.guid;
        if self.vouchers.contains_key(&guid) {
            return Err(StoreError::AlreadyExists);
        }
        self.vouchers.insert(guid, voucher);
        Ok(())
    }

    async fn get(&self, guid: &Guid) -> Result<Option<OwnershipVoucher>, StoreError> {
        Ok(self.vouchers.get(guid).map(|voucher| voucher.clone()))
    }

    async fn replace_if_current(
        &self,
        guid: &Guid,
        current: &OwnershipVoucher,
        replacement: OwnershipVoucher,
    ) -> Result<bool, StoreError> {
        match self.vouchers.get_mut(guid) {
            Some(mut entry) if *entry == *current => {
                *entry = replacement;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// A delegate chain at rest: the full certificate chain plus the leaf's
/// private key, filed under an operator-assigned name.
#[derive(Clone)]
pub struct StoredDelegate {
    pub chain: crate::publickey::X5Chain,
    pub leaf_key: KeyPair,
}

#[async_trait]
pub trait DelegateStore: Send + Sync {
    async fn put(&self, name: String, delegate: StoredDelegate) -> Result<(), StoreError>;
    async fn get(&self, name: &str) -> Result<Option<StoredDelegate>, StoreError>;
}

pub struct MemoryDelegateStore {
    delegates: DashMap<String, StoredDelegate>,
}

impl MemoryDelegateStore {
    pub fn new() -> Self {
        MemoryDelegateStore {
            delegates: DashMap::new(),
        }
    }
}

impl Default for MemoryDelegateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DelegateStore for MemoryDelegateStore {
    async fn put(&self, name: String, delegate: StoredDelegate) -> Result<(), StoreError> {
        self.delegates.insert(name, delegate);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<StoredDelegate>, StoreError> {
        Ok(self.delegates.get(name).map(|delegate| delegate.clone()))
    }
}

/// One owner registration held by a rendezvous service.
#[derive(Debug, Clone)]
pub struct RendezvousBlob {
    pub to1d: To1d,
    /// Device verification key material from the registration voucher.
    pub device_cert_chain: Option<crate::publickey::X5Chain>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait RendezvousBlobStore: Send + Sync {
    /// Stores or replaces the registration for `guid`.
    async fn put(&self, guid: Guid, blob: RendezvousBlob) -> Result<(), StoreError>;

    /// Returns the registration for `guid` if present and not expired; an
    /// expired registration is never served.
    async fn get(&self, guid: &Guid, now: DateTime<Utc>) -> Result<Option<RendezvousBlob>, StoreError>;
}

pub struct MemoryRendezvousBlobStore {
    blobs: DashMap<Guid, RendezvousBlob>,
}

impl MemoryRendezvousBlobStore {
    pub fn new() -> Self {
        MemoryRendezvousBlobStore {
            blobs: DashMap::new(),
        }
    }
}

impl Default for MemoryRendezvousBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RendezvousBlobStore for MemoryRendezvousBlobStore {
    async fn put(&self, guid: Guid, blob: RendezvousBlob) -> Result<(), StoreError> {
        self.blobs.insert(guid, blob);
        Ok(())
    }

    async fn get(&self, guid: &Guid, now: DateTime<Utc>) -> Result<Option<RendezvousBlob>, StoreError> {
        let expired = match self.blobs.get(guid) {
            Some(blob) if blob.expires_at > now => return Ok(Some(blob.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.blobs.remove(guid);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::voucher::test_voucher::new_test_voucher;

    use super::*;

    #[tokio::test]
    async fn voucher_insert_and_get() {
        let store = MemoryVoucherStore::new();
        let test = new_test_voucher();
        let guid = test.voucher.header().unwrap().0.guid;

        store.insert(test.voucher.clone()).await.unwrap();
        assert_matches!(store.insert(test.voucher.clone()).await, Err(StoreError::AlreadyExists));

        let loaded = store.get(&guid).await.unwrap().unwrap();
        assert_eq!(loaded, test.voucher);
    }

    #[tokio::test]
    async fn replace_if_current_detects_lost_updates() {
        let store = MemoryVoucherStore::new();
        let test = new_test_voucher();
        let guid = test.voucher.header().unwrap().0.guid;
        store.insert(test.voucher.clone()).await.unwrap();

        let mut extended = test.voucher.clone();
        extended
            .extend(
                &test.manufacturer_key,
                &crate::publickey::PublicKey::from_keypair(&crate::keys::KeyPair::random_p256()).unwrap(),
            )
            .unwrap();

        assert!(store
            .replace_if_current(&guid, &test.voucher, extended.clone())
            .await
            .unwrap());
        // A second writer still holding the original loses the race.
        assert!(!store
            .replace_if_current(&guid, &test.voucher, extended.clone())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn expired_rendezvous_blob_is_not_served() {
        use crate::{
            cose::TypedSign1,
            keys::KeyPair,
            rendezvous::{To1dPayloadKeyed, To2AddressEntryKeyed, TransportProtocol},
            types::{Hash, HashAlgorithm},
        };

        let store = MemoryRendezvousBlobStore::new();
        let guid = Guid::new(&fdo_common::generator::UuidGenerator);

        let payload: crate::rendezvous::To1dPayload = To1dPayloadKeyed {
            addresses: vec![To2AddressEntryKeyed {
                ip: None,
                dns: Some("owner.example.com".to_string()),
                port: 8043,
                protocol: TransportProtocol::Http,
            }
            .into()],
            to0d_hash: Hash::compute(HashAlgorithm::Sha256, b"to0d").unwrap(),
        }
        .into();
        let to1d = TypedSign1::sign(&payload, &KeyPair::random_p256(), &[]).unwrap();

        let blob = RendezvousBlob {
            to1d,
            device_cert_chain: None,
            expires_at: Utc::now() - chrono::Duration::seconds(1),
        };
        store.put(guid.clone(), blob).await.unwrap();

        assert!(store.get(&guid, Utc::now()).await.unwrap().is_none());
    }
}
