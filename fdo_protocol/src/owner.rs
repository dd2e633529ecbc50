//! The owner side: registers its addresses with a rendezvous service
//! (Transfer Ownership 0) and runs the server half of the ownership transfer
//! (Transfer Ownership 2).
//!
//! TO2 session state holds live cryptographic material (ephemeral key
//! exchange secrets, AEAD counters) and module state, so it is kept
//! process-local and dies with the session rather than going through the
//! persistent session store.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use fdo_common::generator::Generator;

use crate::{
    cose::TypedSign1,
    crypto::{KeyExchange, SessionCrypter, SessionRole},
    errors::{ProtocolError, Result},
    keys::KeyPair,
    messages::{
        to0::{self, OwnerSignKeyed, To0d, To0dKeyed},
        to2::{
            DeviceServiceInfo, DeviceServiceInfoReady, Done, Done2, Done2Keyed, GetOvNextEntry, HelloDevice,
            OvNextEntry, OvNextEntryKeyed, OwnerServiceInfo, OwnerServiceInfoKeyed, OwnerServiceInfoReady,
            OwnerServiceInfoReadyKeyed, ProveDevice, ProveOvHdr, ProveOvHdrPayload, ProveOvHdrPayloadKeyed,
            SetupDevice, SetupDevicePayload, SetupDevicePayloadKeyed,
        },
        Message, MessageType,
    },
    publickey::{PublicKey, X5Chain},
    rendezvous::{RendezvousInfo, To1d, To1dPayload, To1dPayloadKeyed, To2AddressEntry},
    serialization::{cbor_deserialize, cbor_serialize, EmbeddedCbor},
    server_state::SessionToken,
    serviceinfo::{effective_mtu, OwnerModule, OwnerModuleScheduler, MTU_DEFAULT},
    store::VoucherStore,
    transport::{ClientSession, ProtocolServer, Transport, TransportResponse},
    types::{CapabilityFlags, Guid, HMac, Hash, Nonce},
    voucher::{OwnershipVoucher, VoucherHeader, VoucherHeaderKeyed},
};

/// A delegate chain the owner presents instead of signing with the owner key
/// directly. The chain must be rooted at the voucher's current owner key and
/// authorize the onboard function.
pub struct OwnerDelegate {
    pub chain: X5Chain,
    pub leaf_key: KeyPair,
}

type ModuleFactory = Box<dyn Fn() -> Vec<Box<dyn OwnerModule>> + Send + Sync>;

pub struct OwnerConfig {
    pub owner_key: KeyPair,
    pub delegate: Option<OwnerDelegate>,
    /// Rendezvous directives for the device's next incarnation.
    pub replacement_rendezvous_info: RendezvousInfo,
    /// Ask the device to keep its current credential instead of rotating.
    pub reuse_credential: bool,
    /// Largest ServiceInfo message this owner accepts.
    pub mtu: u16,
    pub capabilities: CapabilityFlags,
}

struct ReplacementState {
    header: EmbeddedCbor<VoucherHeader>,
    original_voucher: OwnershipVoucher,
    hmac: Option<HMac>,
}

enum To2State {
    ServingEntries {
        voucher: OwnershipVoucher,
        nonce_prove_ov: Nonce,
        nonce_prove_device: Nonce,
        kex: KeyExchange,
        cipher_suite: crate::crypto::CipherSuite,
    },
    Streaming {
        crypter: SessionCrypter,
        nonce_prove_device: Nonce,
        nonce_setup_device: Nonce,
        replacement: Option<ReplacementState>,
        scheduler: OwnerModuleScheduler,
        device_mtu: u16,
        device_ready: bool,
    },
    Done,
}

struct To2Session {
    state: To2State,
    last_active: chrono::DateTime<chrono::Utc>,
}

pub struct Owner<G> {
    config: OwnerConfig,
    vouchers: Arc<dyn VoucherStore>,
    modules: ModuleFactory,
    sessions: Arc<DashMap<SessionToken, Arc<Mutex<To2Session>>>>,
    cleanup_task: JoinHandle<()>,
    uuids: G,
}

impl<G> Drop for Owner<G> {
    fn drop(&mut self) {
        // Stop the task at the next .await
        self.cleanup_task.abort();
    }
}

impl<G> Owner<G>
where
    G: Generator<Uuid> + Send + Sync,
{
    pub fn new(config: OwnerConfig, vouchers: Arc<dyn VoucherStore>, modules: ModuleFactory, uuids: G) -> Self {
        let sessions: Arc<DashMap<SessionToken, Arc<Mutex<To2Session>>>> = Arc::new(DashMap::new());

        let cleanup_sessions = sessions.clone();
        let cleanup_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                crate::server_state::CLEANUP_INTERVAL_SECONDS,
            ));
            loop {
                interval.tick().await;
                let cutoff = chrono::Utc::now()
                    - chrono::Duration::seconds(crate::server_state::SESSION_EXPIRY_SECONDS as i64);
                cleanup_sessions.retain(|_, session| match session.try_lock() {
                    Ok(session) => session.last_active > cutoff,
                    Err(_) => true,
                });
            }
        });

        Owner {
            config,
            vouchers,
            modules,
            sessions,
            cleanup_task,
            uuids,
        }
    }

    /// The key and wire form the owner proves itself with: the delegate leaf
    /// when delegation is configured, the owner key otherwise.
    fn proof_key(&self) -> Result<(&KeyPair, PublicKey)> {
        match &self.config.delegate {
            Some(delegate) => Ok((
                &delegate.leaf_key,
                PublicKey::from_x5chain(delegate.leaf_key.key_type(), delegate.chain.clone()),
            )),
            None => Ok((&self.config.owner_key, PublicKey::from_keypair(&self.config.owner_key)?)),
        }
    }

    // TO0: register with a rendezvous service.

    /// Registers `(guid, addresses)` with the rendezvous service behind
    /// `transport` for `wait_seconds`. Returns the granted TTL.
    pub async fn register_with_rendezvous(
        &self,
        transport: &dyn Transport,
        guid: &Guid,
        addresses: Vec<To2AddressEntry>,
        wait_seconds: u32,
    ) -> Result<u32> {
        let voucher = self
            .vouchers
            .get(guid)
            .await?
            .ok_or_else(|| ProtocolError::UnknownGuid(guid.clone()))?;

        let mut session = ClientSession::new(transport, crate::transport::DEFAULT_TURN_TIMEOUT);
        let hello: to0::Hello = to0::HelloKeyed {
            capabilities: self.config.capabilities.clone(),
        }
        .into();
        let ack: to0::HelloAck = session.request::<_, to0::HelloAck>(&hello).await?;

        let to0d: To0d = To0dKeyed {
            voucher,
            wait_seconds,
            nonce: ack.0.nonce,
        }
        .into();
        let to0d = EmbeddedCbor::new(&to0d)?;

        let to1d_payload: To1dPayload = To1dPayloadKeyed {
            addresses,
            to0d_hash: Hash::compute(
                self.config.owner_key.algorithm().digest_algorithm(),
                to0d.as_bytes(),
            )?,
        }
        .into();
        let to1d: To1d = TypedSign1::sign(&to1d_payload, &self.config.owner_key, &[])?;

        let accept: to0::AcceptOwner = session
            .request::<_, to0::AcceptOwner>(&to0::OwnerSign::from(OwnerSignKeyed { to0d, to1d }))
            .await?;

        info!("registered {guid} with rendezvous, granted {}s", accept.0.wait_seconds);
        Ok(accept.0.wait_seconds)
    }

    /// Extends the stored voucher for `guid` to a new owner key, using
    /// replace-if-current so a concurrent transfer cannot be lost.
    pub async fn extend_voucher(&self, guid: &Guid, new_owner: &PublicKey) -> Result<()> {
        let current = self
            .vouchers
            .get(guid)
            .await?
            .ok_or_else(|| ProtocolError::UnknownGuid(guid.clone()))?;

        let mut extended = current.clone();
        extended.extend(&self.config.owner_key, new_owner)?;

        if !self.vouchers.replace_if_current(guid, &current, extended).await? {
            return Err(ProtocolError::TransferFailed.into());
        }
        Ok(())
    }

    // TO2 server side.

    async fn process_hello_device(&self, message: HelloDevice) -> Result<(ProveOvHdr, SessionToken)> {
        let guid = message.0.guid;
        let voucher = self
            .vouchers
            .get(&guid)
            .await?
            .ok_or_else(|| ProtocolError::UnknownGuid(guid.clone()))?;
        info!("TO2 started for {guid}");

        let kex = KeyExchange::new(message.0.kex_suite);
        let nonce_prove_device = Nonce::new();
        let (signing_key, public_key) = self.proof_key()?;

        let payload: ProveOvHdrPayload = ProveOvHdrPayloadKeyed {
            header: voucher.0.header.clone(),
            num_entries: voucher.num_entries() as u16,
            header_hmac: voucher.0.header_hmac.clone(),
            nonce_prove_ov: message.0.nonce_prove_ov.clone(),
            nonce_prove_device: nonce_prove_device.clone(),
            kex_a: serde_bytes::ByteBuf::from(kex.public_key_bytes()),
            kex_suite: message.0.kex_suite,
            cipher_suite: message.0.cipher_suite,
            public_key,
            capabilities: self.config.capabilities.clone(),
        }
        .into();
        let response: ProveOvHdr = TypedSign1::sign(&payload, signing_key, &[])?;

        let token = SessionToken::new_random();
        self.sessions.insert(
            token.clone(),
            Arc::new(Mutex::new(To2Session {
                state: To2State::ServingEntries {
                    voucher,
                    nonce_prove_ov: message.0.nonce_prove_ov,
                    nonce_prove_device,
                    kex,
                    cipher_suite: message.0.cipher_suite,
                },
                last_active: chrono::Utc::now(),
            })),
        );

        Ok((response, token))
    }

    fn process_get_entry(&self, session: &mut To2Session, message: GetOvNextEntry) -> Result<OvNextEntry> {
        let To2State::ServingEntries { voucher, .. } = &session.state else {
            return Err(ProtocolError::UnknownSession.into());
        };

        let entry_num = message.0.entry_num;
        let entry = voucher
            .0
            .entries
            .get(entry_num as usize)
            .ok_or(ProtocolError::EntryCount {
                announced: voucher.num_entries() as u16,
                served: entry_num,
            })?
            .clone();

        Ok(OvNextEntryKeyed { entry_num, entry }.into())
    }

    fn replacement_header(&self, voucher: &OwnershipVoucher, new_guid: Guid) -> Result<EmbeddedCbor<VoucherHeader>> {
        let original = voucher.header()?;
        let header: VoucherHeader = VoucherHeaderKeyed {
            version: original.0.version,
            guid: new_guid,
            rendezvous_info: self.config.replacement_rendezvous_info.clone(),
            device_info: original.0.device_info,
            manufacturer_public_key: PublicKey::from_keypair(&self.config.owner_key)?,
            device_cert_chain_hash: original.0.device_cert_chain_hash,
        }
        .into();
        Ok(EmbeddedCbor::new(&header)?)
    }

    fn process_prove_device(&self, session: &mut To2Session, message: ProveDevice) -> Result<Vec<u8>> {
        let To2State::ServingEntries {
            voucher,
            nonce_prove_ov,
            nonce_prove_device,
            kex,
            cipher_suite,
        } = std::mem::replace(&mut session.state, To2State::Done)
        else {
            return Err(ProtocolError::UnknownSession.into());
        };

        let device_key = voucher
            .0
            .device_cert_chain
            .as_ref()
            .ok_or(ProtocolError::DeviceKeyUnavailable)?
            .leaf_verifying_key()?;
        let payload = message.verify(&device_key, &[])?;

        if payload.0.nonce_prove_device != nonce_prove_device {
            return Err(ProtocolError::NonceMismatch.into());
        }
        debug!("device proved possession of its key");

        let context: Vec<u8> = [nonce_prove_ov.as_bytes(), nonce_prove_device.as_bytes()].concat();
        let mut crypter = kex.derive(&payload.0.kex_b, cipher_suite, &context, SessionRole::Owner)?;

        // Assemble the replacement identity the device will answer to next.
        let new_guid = Guid::new(&self.uuids);
        let replacement_header = self.replacement_header(&voucher, new_guid.clone())?;
        let setup: SetupDevicePayload = SetupDevicePayloadKeyed {
            rendezvous_info: self.config.replacement_rendezvous_info.clone(),
            guid: new_guid,
            nonce_setup_device: payload.0.nonce_setup_device.clone(),
            owner_public_key: PublicKey::from_keypair(&self.config.owner_key)?,
            reuse_credential: self.config.reuse_credential,
        }
        .into();
        let response: SetupDevice = TypedSign1::sign(&setup, &self.config.owner_key, &[])?;
        let encrypted = crypter.encrypt(&cbor_serialize(&response)?)?;

        session.state = To2State::Streaming {
            crypter,
            nonce_prove_device,
            nonce_setup_device: payload.0.nonce_setup_device,
            replacement: (!self.config.reuse_credential).then_some(ReplacementState {
                header: replacement_header,
                original_voucher: voucher,
                hmac: None,
            }),
            scheduler: OwnerModuleScheduler::new((self.modules)()),
            device_mtu: MTU_DEFAULT,
            device_ready: false,
        };

        Ok(cbor_serialize(&encrypted)?)
    }

    fn process_device_ready(&self, session: &mut To2Session, body: &[u8]) -> Result<Vec<u8>> {
        let To2State::Streaming {
            crypter,
            replacement,
            device_mtu,
            device_ready,
            ..
        } = &mut session.state
        else {
            return Err(ProtocolError::UnknownSession.into());
        };

        let message: DeviceServiceInfoReady = decrypt_message(crypter, body)?;
        *device_mtu = effective_mtu(message.0.mtu);
        *device_ready = true;

        if let Some(replacement) = replacement {
            replacement.hmac = message.0.replacement_hmac;
        }

        let response: OwnerServiceInfoReady = OwnerServiceInfoReadyKeyed {
            mtu: Some(self.config.mtu),
        }
        .into();
        encrypt_message(crypter, &response)
    }

    fn process_device_service_info(&self, session: &mut To2Session, body: &[u8]) -> Result<Vec<u8>> {
        let To2State::Streaming {
            crypter,
            scheduler,
            device_mtu,
            device_ready,
            ..
        } = &mut session.state
        else {
            return Err(ProtocolError::UnknownSession.into());
        };
        if !*device_ready {
            return Err(ProtocolError::UnknownSession.into());
        }

        let message: DeviceServiceInfo = decrypt_message(crypter, body)?;
        let (service_info, owner_done) = scheduler.next_message(&message.0.service_info, *device_mtu)?;

        let response: OwnerServiceInfo = OwnerServiceInfoKeyed {
            service_info,
            is_done: owner_done,
        }
        .into();
        encrypt_message(crypter, &response)
    }

    async fn process_done(&self, session: &mut To2Session, body: &[u8]) -> Result<Vec<u8>> {
        let To2State::Streaming {
            crypter,
            nonce_prove_device,
            nonce_setup_device,
            replacement,
            ..
        } = &mut session.state
        else {
            return Err(ProtocolError::UnknownSession.into());
        };

        let message: Done = decrypt_message(crypter, body)?;
        if message.0.nonce_prove_device != *nonce_prove_device {
            return Err(ProtocolError::NonceMismatch.into());
        }

        // Commit the replacement voucher now that the device has committed.
        if let Some(replacement) = replacement.take() {
            let hmac = replacement.hmac.ok_or(ProtocolError::MissingReplacementHmac)?;
            let voucher = OwnershipVoucher::create(
                replacement.header,
                hmac,
                replacement.original_voucher.0.device_cert_chain.clone(),
                &self.config.owner_key,
                None,
            )?;
            let new_guid = voucher.header()?.0.guid;
            self.vouchers.insert(voucher).await?;
            info!("replacement voucher stored for {new_guid}");
        }

        let response: Done2 = Done2Keyed {
            nonce_setup_device: nonce_setup_device.clone(),
        }
        .into();
        let body = encrypt_message(crypter, &response)?;
        session.state = To2State::Done;
        info!("TO2 complete");
        Ok(body)
    }
}

fn decrypt_message<M: Message>(crypter: &mut SessionCrypter, body: &[u8]) -> Result<M> {
    let encrypted: crate::crypto::EncryptedMessage = cbor_deserialize(body)?;
    let plaintext = crypter.decrypt(&encrypted)?;
    Ok(cbor_deserialize(&plaintext)?)
}

fn encrypt_message<M: Message>(crypter: &mut SessionCrypter, message: &M) -> Result<Vec<u8>> {
    let encrypted = crypter.encrypt(&cbor_serialize(message)?)?;
    Ok(cbor_serialize(&encrypted)?)
}

#[async_trait]
impl<G> ProtocolServer for Owner<G>
where
    G: Generator<Uuid> + Send + Sync,
{
    async fn process_message(
        &self,
        message_type: MessageType,
        body: Vec<u8>,
        token: Option<SessionToken>,
    ) -> Result<TransportResponse> {
        if message_type == MessageType::To2HelloDevice {
            let (response, token) = self.process_hello_device(cbor_deserialize(&body)?).await?;
            return Ok(TransportResponse {
                message_type: ProveOvHdr::MESSAGE_TYPE,
                body: cbor_serialize(&response)?,
                token: Some(token),
            });
        }

        let token = token.ok_or(ProtocolError::MissingSessionToken)?;
        let session = self
            .sessions
            .get(&token)
            .map(|session| session.clone())
            .ok_or(ProtocolError::UnknownSession)?;
        let mut session = session.lock().await;
        session.last_active = chrono::Utc::now();

        let (response_type, response_body) = match message_type {
            MessageType::To2GetOvNextEntry => {
                let response = self.process_get_entry(&mut session, cbor_deserialize(&body)?)?;
                (OvNextEntry::MESSAGE_TYPE, cbor_serialize(&response)?)
            }
            MessageType::To2ProveDevice => {
                let body = self.process_prove_device(&mut session, cbor_deserialize(&body)?)?;
                (SetupDevice::MESSAGE_TYPE, body)
            }
            MessageType::To2DeviceServiceInfoReady => {
                let body = self.process_device_ready(&mut session, &body)?;
                (OwnerServiceInfoReady::MESSAGE_TYPE, body)
            }
            MessageType::To2DeviceServiceInfo => {
                let body = self.process_device_service_info(&mut session, &body)?;
                (OwnerServiceInfo::MESSAGE_TYPE, body)
            }
            MessageType::To2Done => {
                let body = self.process_done(&mut session, &body).await?;
                (Done2::MESSAGE_TYPE, body)
            }
            other => {
                warn!("unexpected message type {other} in TO2");
                return Err(ProtocolError::UnexpectedMessageType {
                    expected: MessageType::To2GetOvNextEntry,
                    found: other,
                }
                .into());
            }
        };

        Ok(TransportResponse {
            message_type: response_type,
            body: response_body,
            token: Some(token.clone()),
        })
    }
}
