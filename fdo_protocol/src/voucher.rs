//! The ownership voucher: an append-only, hash-chained record of custody
//! transfers from manufacturer to current owner. Extension appends one signed
//! entry; verification walks the chain and rechecks every link.

use tracing::debug;

use crate::{
    cose::{CoseError, TypedSign1},
    keys::{KeyError, KeyPair},
    publickey::{PublicKey, PublicKeyError, X5Chain},
    serialization::{cbor_serialize, CborError, CborSeq, EmbeddedCbor},
    types::{Guid, HMac, Hash, HashAlgorithm, TypeError},
};

use crate::rendezvous::RendezvousInfo;

#[derive(thiserror::Error, Debug)]
pub enum VoucherError {
    #[error("voucher has no entries")]
    Empty,
    #[error("signing key is not the current owner key")]
    NotCurrentOwner,
    #[error("hash link broken at entry {0}")]
    HashLink(usize),
    #[error("public key hash mismatch at entry {0}")]
    KeyHash(usize),
    #[error("device certificate chain does not match the hash in the header")]
    DeviceChainHash,
    #[error("COSE error in voucher entry: {0}")]
    Cose(#[from] CoseError),
    #[error("public key error in voucher: {0}")]
    PublicKey(#[from] PublicKeyError),
    #[error("CBOR error in voucher: {0}")]
    Cbor(#[from] CborError),
    #[error(transparent)]
    Hash(#[from] TypeError),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// The voucher header, fixed at device initialization. Its hash anchors the
/// entry chain, so none of these fields can ever change.
pub type VoucherHeader = CborSeq<VoucherHeaderKeyed>;

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct VoucherHeaderKeyed {
    pub version: u16,
    pub guid: Guid,
    pub rendezvous_info: RendezvousInfo,
    pub device_info: String,
    pub manufacturer_public_key: PublicKey,
    pub device_cert_chain_hash: Option<Hash>,
}

/// What a voucher entry's signature covers: the link to the previous entry
/// (or the header), and the key custody is transferred to.
pub type VoucherEntryPayload = CborSeq<VoucherEntryPayloadKeyed>;

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct VoucherEntryPayloadKeyed {
    pub previous_hash: Hash,
    pub public_key_hash: Hash,
    pub public_key: PublicKey,
}

pub type VoucherEntry = TypedSign1<VoucherEntryPayload>;

pub type OwnershipVoucher = CborSeq<OwnershipVoucherKeyed>;

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct OwnershipVoucherKeyed {
    pub header: EmbeddedCbor<VoucherHeader>,
    pub header_hmac: HMac,
    pub device_cert_chain: Option<X5Chain>,
    pub entries: Vec<VoucherEntry>,
}

impl OwnershipVoucher {
    /// Creates a voucher at device initialization: the manufacturer signs
    /// entry 0, transferring custody from itself to `initial_owner` (or back
    /// to itself when no initial owner is named).
    pub fn create(
        header: EmbeddedCbor<VoucherHeader>,
        header_hmac: HMac,
        device_cert_chain: Option<X5Chain>,
        manufacturer_key: &KeyPair,
        initial_owner: Option<PublicKey>,
    ) -> Result<OwnershipVoucher, VoucherError> {
        let mut voucher: OwnershipVoucher = OwnershipVoucherKeyed {
            header,
            header_hmac,
            device_cert_chain,
            entries: Vec::new(),
        }
        .into();

        let initial_owner = match initial_owner {
            Some(key) => key,
            None => PublicKey::from_keypair(manufacturer_key)?,
        };
        voucher.extend(manufacturer_key, &initial_owner)?;
        Ok(voucher)
    }

    pub fn header(&self) -> Result<VoucherHeader, VoucherError> {
        Ok(self.0.header.parse()?)
    }

    pub fn num_entries(&self) -> usize {
        self.0.entries.len()
    }

    /// The hash anchoring entry 0: computed over the header bytes followed by
    /// the serialized header HMAC.
    fn header_hash(&self, algorithm: HashAlgorithm) -> Result<Hash, VoucherError> {
        let mut data = self.0.header.as_bytes().to_vec();
        data.extend(cbor_serialize(&self.0.header_hmac)?);
        Ok(Hash::compute(algorithm, &data)?)
    }

    /// The hash of the tail entry, or of the header when the chain is empty.
    fn tail_hash(&self, algorithm: HashAlgorithm) -> Result<Hash, VoucherError> {
        match self.0.entries.last() {
            None => self.header_hash(algorithm),
            Some(entry) => Ok(Hash::compute(algorithm, &entry.serialized()?)?),
        }
    }

    /// The current owner: the key named by the tail entry's payload, without
    /// verifying the chain. Manufacturer key if the chain is empty.
    pub fn owner_public_key(&self) -> Result<PublicKey, VoucherError> {
        match self.0.entries.last() {
            None => Ok(self.header()?.0.manufacturer_public_key),
            Some(entry) => Ok(entry.dangerous_parse_unverified()?.0.public_key),
        }
    }

    /// Appends one entry transferring custody to `new_owner`. `signer` must
    /// hold the current owner key; this is the only permitted mutation.
    pub fn extend(&mut self, signer: &KeyPair, new_owner: &PublicKey) -> Result<(), VoucherError> {
        let current_owner = self.owner_public_key()?;
        if current_owner.verifying_key()? != signer.verifying_key() {
            return Err(VoucherError::NotCurrentOwner);
        }

        let digest = signer.algorithm().digest_algorithm();
        let payload: VoucherEntryPayload = VoucherEntryPayloadKeyed {
            previous_hash: self.tail_hash(digest)?,
            public_key_hash: new_owner.hash(digest)?,
            public_key: new_owner.clone(),
        }
        .into();

        let entry = TypedSign1::sign(&payload, signer, &[])?;
        self.0.entries.push(entry);
        Ok(())
    }

    /// Walks the chain entry by entry, verifying each signature against the
    /// previous custodian's key and each hash link against the previous
    /// entry's bytes. Returns the verified current owner key.
    pub fn verify(&self) -> Result<PublicKey, VoucherError> {
        if self.0.entries.is_empty() {
            return Err(VoucherError::Empty);
        }

        let header = self.header()?;
        if let (Some(expected), Some(chain)) = (&header.0.device_cert_chain_hash, &self.0.device_cert_chain) {
            expected
                .matches_data(&chain.serialized()?)
                .map_err(|_| VoucherError::DeviceChainHash)?;
        }

        let mut signer_key = header.0.manufacturer_public_key.clone();
        let mut previous_bytes: Option<Vec<u8>> = None;

        for (index, entry) in self.0.entries.iter().enumerate() {
            let payload = entry.verify(&signer_key.verifying_key()?, &[])?;
            debug!("voucher entry {index}: signature OK");

            let expected_previous = match &previous_bytes {
                None => {
                    let mut data = self.0.header.as_bytes().to_vec();
                    data.extend(cbor_serialize(&self.0.header_hmac)?);
                    data
                }
                Some(bts) => bts.clone(),
            };
            payload
                .0
                .previous_hash
                .matches_data(&expected_previous)
                .map_err(|_| VoucherError::HashLink(index))?;

            payload
                .0
                .public_key_hash
                .matches_data(&cbor_serialize(&payload.0.public_key)?)
                .map_err(|_| VoucherError::KeyHash(index))?;

            previous_bytes = Some(entry.serialized()?);
            signer_key = payload.0.public_key;
        }

        debug!("voucher chain OK, {} entries", self.0.entries.len());
        Ok(signer_key)
    }

    /// Parsed entry payloads, in chain order, without verification.
    pub fn iter_entries(&self) -> impl Iterator<Item = Result<VoucherEntryPayload, VoucherError>> + '_ {
        self.0
            .entries
            .iter()
            .map(|entry| Ok(entry.dangerous_parse_unverified()?))
    }
}


#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::{
        cose::CoseError,
        keys::KeyError,
        serialization::{cbor_deserialize, cbor_serialize},
        types::HashAlgorithm,
    };

    use super::{test_voucher::new_test_voucher, *};

    #[test]
    fn created_voucher_verifies() {
        let test = new_test_voucher();
        let owner = test.voucher.verify().unwrap();
        // Without an initial owner, custody stays with the manufacturer.
        assert_eq!(
            owner.verifying_key().unwrap(),
            test.manufacturer_key.verifying_key()
        );
    }

    #[test]
    fn extend_transfers_custody() {
        let mut test = new_test_voucher();
        let new_owner_key = KeyPair::random_p256();
        let new_owner = PublicKey::from_keypair(&new_owner_key).unwrap();

        test.voucher.extend(&test.manufacturer_key, &new_owner).unwrap();

        let owner = test.voucher.verify().unwrap();
        assert_eq!(owner.verifying_key().unwrap(), new_owner_key.verifying_key());
        assert_eq!(test.voucher.num_entries(), 2);

        // The tail entry binds the new key: its payload-key hash matches the
        // key, and its previous-hash matches the prior tail's bytes.
        let entries: Vec<_> = test.voucher.iter_entries().collect::<Result<_, _>>().unwrap();
        let tail = entries.last().unwrap();
        tail.0
            .public_key_hash
            .matches_data(&cbor_serialize(&new_owner).unwrap())
            .unwrap();
        tail.0
            .previous_hash
            .matches_data(&test.voucher.0.entries[0].serialized().unwrap())
            .unwrap();
    }

    #[test]
    fn extend_requires_current_owner_key() {
        let mut test = new_test_voucher();
        let interloper = KeyPair::random_p256();
        let new_owner = PublicKey::from_keypair(&KeyPair::random_p256()).unwrap();

        assert_matches!(
            test.voucher.extend(&interloper, &new_owner),
            Err(VoucherError::NotCurrentOwner)
        );
    }

    #[test]
    fn empty_voucher_is_rejected() {
        let mut test = new_test_voucher();
        test.voucher.0.entries.clear();
        assert_matches!(test.voucher.verify(), Err(VoucherError::Empty));
    }

    #[test]
    fn broken_hash_link_is_rejected() {
        let mut test = new_test_voucher();
        let owner2 = KeyPair::random_p256();
        let owner3 = KeyPair::random_p256();
        test.voucher
            .extend(&test.manufacturer_key, &PublicKey::from_keypair(&owner2).unwrap())
            .unwrap();
        test.voucher
            .extend(&owner2, &PublicKey::from_keypair(&owner3).unwrap())
            .unwrap();

        // Removing a middle entry breaks both the signature chain and the hash links.
        test.voucher.0.entries.remove(1);
        assert_matches!(test.voucher.verify(), Err(_));
    }

    #[test]
    fn reordered_entries_are_rejected() {
        let mut test = new_test_voucher();
        let owner2 = KeyPair::random_p256();
        test.voucher
            .extend(&test.manufacturer_key, &PublicKey::from_keypair(&owner2).unwrap())
            .unwrap();

        test.voucher.0.entries.swap(0, 1);
        assert_matches!(
            test.voucher.verify(),
            Err(VoucherError::Cose(CoseError::Key(KeyError::Verification)) | VoucherError::HashLink(_))
        );
    }

    #[test]
    fn voucher_roundtrip_preserves_signatures() {
        let mut test = new_test_voucher();
        let owner2 = KeyPair::random_p256();
        test.voucher
            .extend(&test.manufacturer_key, &PublicKey::from_keypair(&owner2).unwrap())
            .unwrap();

        let serialized = cbor_serialize(&test.voucher).unwrap();
        let deserialized: OwnershipVoucher = cbor_deserialize(&serialized).unwrap();
        deserialized.verify().unwrap();
        assert_eq!(cbor_serialize(&deserialized).unwrap(), serialized);
    }

    #[test]
    fn header_hmac_requires_device_secret() {
        let test = new_test_voucher();
        crate::keys::hmac_verify(
            &test.voucher.0.header_hmac,
            &test.hmac_secret,
            test.voucher.0.header.as_bytes(),
        )
        .unwrap();

        assert_matches!(
            crate::keys::hmac_verify(
                &test.voucher.0.header_hmac,
                b"wrong secret",
                test.voucher.0.header.as_bytes(),
            ),
            Err(KeyError::HmacVerification)
        );
    }

    #[test]
    fn mixed_key_sizes_chain() {
        let mut test = new_test_voucher();
        let owner2 = KeyPair::random_p384();
        test.voucher
            .extend(&test.manufacturer_key, &PublicKey::from_keypair(&owner2).unwrap())
            .unwrap();
        let owner3 = KeyPair::random_p256();
        test.voucher
            .extend(&owner2, &PublicKey::from_keypair(&owner3).unwrap())
            .unwrap();

        let owner = test.voucher.verify().unwrap();
        assert_eq!(owner.verifying_key().unwrap(), owner3.verifying_key());
        // The P-384 entry carries SHA-384 hashes per the algorithm table.
        let entries: Vec<_> = test.voucher.iter_entries().collect::<Result<_, _>>().unwrap();
        assert_eq!(entries[2].0.previous_hash.algorithm(), HashAlgorithm::Sha384);
    }
}
