//! The device side: initialization against a manufacturer, owner lookup via
//! rendezvous, and the client half of the ownership transfer. Failure at any
//! step is fatal to that session; the onboarding driver then moves on to the
//! next address the directives or the rendezvous lookup offered.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::{
    cose::{TypedMac0, TypedSign1},
    crypto::{CipherSuite, KexSuite, KeyExchange, SessionCrypter, SessionRole},
    delegate::{self, DelegateFunction},
    errors::{Error, ProtocolError, Result},
    keys::{hmac_sign, KeyPair},
    messages::{
        di::{AppStart, AppStartKeyed, DeviceMfgInfo, DiDone, SetCredentials, SetHmac, SetHmacKeyed},
        to1::{HelloRv, HelloRvAck, HelloRvKeyed, ProveToRv, ProveToRvPayload, ProveToRvPayloadKeyed, RvRedirect},
        to2::{
            DeviceServiceInfo, DeviceServiceInfoKeyed, DeviceServiceInfoReady, DeviceServiceInfoReadyKeyed, Done,
            Done2, DoneKeyed, GetOvNextEntry, GetOvNextEntryKeyed, HelloDevice, HelloDeviceKeyed, OvNextEntry,
            OwnerServiceInfo, OwnerServiceInfoReady, ProveDevice, ProveDevicePayload, ProveDevicePayloadKeyed,
            ProveOvHdr, SetupDevice,
        },
        Message,
    },
    publickey::PublicKey,
    rendezvous::{contact_attempts, RendezvousInterpreterSide, To1d},
    serialization::{cbor_deserialize, cbor_serialize, EmbeddedCbor},
    serviceinfo::{effective_mtu, DeviceModule, DeviceModuleRegistry},
    types::{CapabilityFlags, Hash, Nonce},
    voucher::{OwnershipVoucher, OwnershipVoucherKeyed, VoucherHeader, VoucherHeaderKeyed},
};

use crate::credential::DeviceCredential;
use crate::transport::{ClientSession, Transport, TransportFactory, DEFAULT_TURN_TIMEOUT};

/// Settings for a device onboarding run.
pub struct DeviceConfig {
    pub kex_suite: KexSuite,
    pub cipher_suite: CipherSuite,
    /// Largest ServiceInfo message this device accepts.
    pub mtu: u16,
    pub capabilities: CapabilityFlags,
    /// Expected owner identity, checked against the delegate chain's root
    /// constraints when the owner presents one.
    pub expected_owner_identifier: Option<String>,
    pub turn_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            kex_suite: KexSuite::EcdhP256,
            cipher_suite: CipherSuite::Aes256Gcm,
            mtu: crate::serviceinfo::MTU_DEFAULT,
            capabilities: CapabilityFlags::with_delegate(),
            expected_owner_identifier: None,
            turn_timeout: DEFAULT_TURN_TIMEOUT,
        }
    }
}

/// Outcome of a completed ownership transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The credential was replaced with the new identity.
    Replaced,
    /// The owner requested credential reuse; nothing changed.
    Reused,
}

/// Runs Device Initialize against the manufacturer behind `transport`,
/// producing the device credential.
pub async fn initialize(
    transport: &dyn Transport,
    mfg_info: DeviceMfgInfo,
    device_key: &KeyPair,
    hmac_secret: Vec<u8>,
    turn_timeout: Duration,
) -> Result<DeviceCredential> {
    let mut session = ClientSession::new(transport, turn_timeout);

    let device_info = mfg_info.0.device_info.clone();
    let response: SetCredentials = session
        .request::<_, SetCredentials>(&AppStart::from(AppStartKeyed { mfg_info }))
        .await?;

    let header = response.0.header.parse()?;
    let manufacturer_key_hash = header.0.manufacturer_public_key.hash(
        header
            .0
            .manufacturer_public_key
            .verifying_key()?
            .algorithm()
            .digest_algorithm(),
    )?;

    let hmac_algorithm = device_key.algorithm().hmac_algorithm();
    let hmac = TypedMac0::mac_raw(
        std::borrow::Cow::Borrowed(response.0.header.as_bytes()),
        hmac_algorithm,
        &hmac_secret,
    )?;
    let _: DiDone = session
        .request::<_, DiDone>(&SetHmac::from(SetHmacKeyed { hmac }))
        .await?;

    info!("initialized as {}", header.0.guid);
    DeviceCredential::new(
        header.0.guid,
        device_info,
        header.0.rendezvous_info,
        manufacturer_key_hash,
        device_key,
        hmac_secret,
    )
    .map_err(Error::Credential)
}

/// Runs Transfer Ownership 1: proves possession of the device key to the
/// rendezvous service and returns the owner's address blob.
pub async fn run_to1(transport: &dyn Transport, credential: &DeviceCredential, config: &DeviceConfig) -> Result<To1d> {
    let mut session = ClientSession::new(transport, config.turn_timeout);

    let hello: HelloRv = HelloRvKeyed {
        guid: credential.guid.clone(),
        capabilities: config.capabilities.clone(),
    }
    .into();
    let ack: HelloRvAck = session.request::<_, HelloRvAck>(&hello).await?;

    let payload: ProveToRvPayload = ProveToRvPayloadKeyed {
        nonce: ack.0.nonce,
        guid: credential.guid.clone(),
    }
    .into();
    let proof: ProveToRv = TypedSign1::sign(&payload, &credential.device_key()?, &[])?;

    let redirect: RvRedirect = session.request::<_, RvRedirect>(&proof).await?;
    debug!("rendezvous returned owner addresses for {}", credential.guid);
    Ok(redirect.0.to1d)
}

async fn request_encrypted<Req: Message, Resp: Message>(
    session: &mut ClientSession<'_>,
    crypter: &mut SessionCrypter,
    request: &Req,
) -> Result<Resp> {
    let encrypted = crypter.encrypt(&cbor_serialize(request)?)?;
    let body = session
        .request_raw(Req::MESSAGE_TYPE, cbor_serialize(&encrypted)?, Resp::MESSAGE_TYPE)
        .await?;
    let encrypted: crate::crypto::EncryptedMessage = cbor_deserialize(&body)?;
    let plaintext = crypter.decrypt(&encrypted)?;
    Ok(cbor_deserialize(&plaintext)?)
}

/// Runs the full Transfer Ownership 2 against the owner behind `transport`.
/// On success the credential has been committed (replaced or deliberately
/// kept) and the outcome says which.
pub async fn run_to2(
    transport: &dyn Transport,
    credential: &mut DeviceCredential,
    modules: Vec<Box<dyn DeviceModule>>,
    config: &DeviceConfig,
    pinned_owner_key_hash: Option<&Hash>,
) -> Result<TransferOutcome> {
    let mut session = ClientSession::new(transport, config.turn_timeout);
    let device_key = credential.device_key()?;

    // Step 1: HelloDevice / ProveOVHdr.
    let nonce_prove_ov = Nonce::new();
    let hello: HelloDevice = HelloDeviceKeyed {
        guid: credential.guid.clone(),
        nonce_prove_ov: nonce_prove_ov.clone(),
        kex_suite: config.kex_suite,
        cipher_suite: config.cipher_suite,
        capabilities: config.capabilities.clone(),
    }
    .into();
    let prove_ov_hdr: ProveOvHdr = session.request::<_, ProveOvHdr>(&hello).await?;

    // The proof key is taken from the envelope itself; its authority is
    // established below, against the voucher chain.
    let unverified = prove_ov_hdr.dangerous_parse_unverified()?;
    let proof_key = unverified.0.public_key.verifying_key()?;
    let hdr = prove_ov_hdr.verify(&proof_key, &[])?;

    if hdr.0.nonce_prove_ov != nonce_prove_ov {
        return Err(ProtocolError::NonceMismatch.into());
    }

    let header = hdr.0.header.parse()?;
    if header.0.guid != credential.guid {
        return Err(ProtocolError::UnknownGuid(header.0.guid).into());
    }
    credential.verify_manufacturer_key(&header.0.manufacturer_public_key)?;
    credential.verify_hmac(&hdr.0.header_hmac, hdr.0.header.as_bytes())?;
    debug!("voucher header matches the device credential");

    // Step 2: fetch the entries and verify custody from manufacturer to the
    // current owner.
    let mut entries = Vec::with_capacity(hdr.0.num_entries as usize);
    for entry_num in 0..hdr.0.num_entries {
        let response: OvNextEntry = session
            .request::<_, OvNextEntry>(&GetOvNextEntry::from(GetOvNextEntryKeyed { entry_num }))
            .await?;
        if response.0.entry_num != entry_num {
            return Err(ProtocolError::EntryCount {
                announced: entry_num,
                served: response.0.entry_num,
            }
            .into());
        }
        entries.push(response.0.entry);
    }

    let voucher: OwnershipVoucher = OwnershipVoucherKeyed {
        header: hdr.0.header.clone(),
        header_hmac: hdr.0.header_hmac.clone(),
        device_cert_chain: None,
        entries,
    }
    .into();
    let owner_key = voucher.verify()?;
    debug!("voucher custody chain verified, {} entries", hdr.0.num_entries);

    if let Some(pinned) = pinned_owner_key_hash {
        pinned.matches_data(&cbor_serialize(&owner_key)?)?;
    }

    // The ProveOVHdr signer must be the verified owner, either directly or
    // through a delegate chain rooted at the owner key.
    match hdr.0.public_key.x5chain() {
        Some(chain) => {
            delegate::verify_chain(
                chain,
                DelegateFunction::Onboard,
                Some(&owner_key.verifying_key()?),
                config.expected_owner_identifier.as_deref(),
            )?;
            debug!("owner delegate chain authorized for onboarding");
        }
        None => {
            if proof_key != owner_key.verifying_key()? {
                return Err(Error::Voucher(crate::voucher::VoucherError::NotCurrentOwner));
            }
        }
    }

    // Step 3: ProveDevice / SetupDevice, key exchange included.
    let kex = KeyExchange::new(config.kex_suite);
    let kex_b = kex.public_key_bytes();
    let nonce_setup_device = Nonce::new();

    let payload: ProveDevicePayload = ProveDevicePayloadKeyed {
        nonce_prove_device: hdr.0.nonce_prove_device.clone(),
        nonce_setup_device: nonce_setup_device.clone(),
        kex_b: serde_bytes::ByteBuf::from(kex_b),
    }
    .into();
    let prove_device: ProveDevice = TypedSign1::sign(&payload, &device_key, &[])?;

    let context: Vec<u8> = [nonce_prove_ov.as_bytes(), hdr.0.nonce_prove_device.as_bytes()].concat();
    let mut crypter = kex.derive(&hdr.0.kex_a, config.cipher_suite, &context, SessionRole::Device)?;

    let body = session
        .request_raw(
            ProveDevice::MESSAGE_TYPE,
            cbor_serialize(&prove_device)?,
            SetupDevice::MESSAGE_TYPE,
        )
        .await?;
    let encrypted: crate::crypto::EncryptedMessage = cbor_deserialize(&body)?;
    let setup: SetupDevice = cbor_deserialize(&crypter.decrypt(&encrypted)?)?;

    let setup = setup.verify(&setup.dangerous_parse_unverified()?.0.owner_public_key.verifying_key()?, &[])?;
    if setup.0.nonce_setup_device != nonce_setup_device {
        return Err(ProtocolError::NonceMismatch.into());
    }
    info!("received replacement identity {}", setup.0.guid);

    // Step 5: ServiceInfo readiness, with the replacement HMAC unless the
    // owner asked for credential reuse.
    let replacement_hmac = if setup.0.reuse_credential {
        None
    } else {
        let replacement_header: VoucherHeader = VoucherHeaderKeyed {
            version: header.0.version,
            guid: setup.0.guid.clone(),
            rendezvous_info: setup.0.rendezvous_info.clone(),
            device_info: header.0.device_info.clone(),
            manufacturer_public_key: setup.0.owner_public_key.clone(),
            device_cert_chain_hash: header.0.device_cert_chain_hash.clone(),
        }
        .into();
        let replacement_header = EmbeddedCbor::new(&replacement_header)?;
        Some(hmac_sign(
            device_key.algorithm().hmac_algorithm(),
            &credential.hmac_secret,
            replacement_header.as_bytes(),
        )?)
    };

    let ready: DeviceServiceInfoReady = DeviceServiceInfoReadyKeyed {
        replacement_hmac,
        mtu: Some(config.mtu),
    }
    .into();
    let owner_ready: OwnerServiceInfoReady = request_encrypted(&mut session, &mut crypter, &ready).await?;
    let owner_mtu = effective_mtu(owner_ready.0.mtu);
    debug!("ServiceInfo streaming with owner MTU {owner_mtu}");

    // Step 6: the ServiceInfo stream.
    let mut registry = DeviceModuleRegistry::new(modules);
    let (mut outgoing, mut device_done) =
        registry.handle_turn(&crate::serviceinfo::ServiceInfo::default(), owner_mtu)?;
    loop {
        let message: DeviceServiceInfo = DeviceServiceInfoKeyed {
            service_info: std::mem::take(&mut outgoing),
            is_done: device_done,
        }
        .into();
        let response: OwnerServiceInfo = request_encrypted(&mut session, &mut crypter, &message).await?;

        let (next_outgoing, next_done) = registry.handle_turn(&response.0.service_info, owner_mtu)?;
        outgoing = next_outgoing;
        device_done = next_done;

        if response.0.is_done && device_done && outgoing.is_empty() {
            break;
        }
    }

    // Step 7: Done / Done2, then commit.
    let done: Done = DoneKeyed {
        nonce_prove_device: hdr.0.nonce_prove_device.clone(),
    }
    .into();
    let done2: Done2 = request_encrypted(&mut session, &mut crypter, &done).await?;
    if done2.0.nonce_setup_device != nonce_setup_device {
        return Err(ProtocolError::NonceMismatch.into());
    }

    if setup.0.reuse_credential {
        info!("owner requested credential reuse; keeping current identity");
        return Ok(TransferOutcome::Reused);
    }

    let new_key_hash = setup.0.owner_public_key.hash(
        setup
            .0
            .owner_public_key
            .verifying_key()?
            .algorithm()
            .digest_algorithm(),
    )?;
    credential.replace(setup.0.guid.clone(), setup.0.rendezvous_info, new_key_hash);
    info!("credential replaced, device now answers as {}", credential.guid);
    Ok(TransferOutcome::Replaced)
}

type DeviceModuleFactory<'a> = &'a (dyn Fn() -> Vec<Box<dyn DeviceModule>> + Send + Sync);

/// Full onboarding: walks the credential's rendezvous directives in order,
/// looks the owner up (or bypasses straight to it), and attempts the
/// transfer against each address until one succeeds.
pub async fn onboard(
    factory: &dyn TransportFactory,
    credential: &mut DeviceCredential,
    modules: DeviceModuleFactory<'_>,
    config: &DeviceConfig,
) -> Result<TransferOutcome> {
    let attempts = contact_attempts(&credential.rendezvous_info, RendezvousInterpreterSide::Device)?;

    for attempt in attempts {
        if attempt.delay_seconds > 0 {
            tokio::time::sleep(Duration::from_secs(attempt.delay_seconds as u64)).await;
        }

        if attempt.bypass_to1 {
            // The directive names the owner directly; no rendezvous lookup.
            match try_to2_at(factory, &attempt.url, credential, modules, config, attempt.owner_key_hash.as_ref()).await
            {
                Ok(outcome) => return Ok(outcome),
                Err(error) => {
                    warn!("transfer at {} failed: {error}", attempt.url);
                }
            }
            continue;
        }

        let to1d = {
            let transport = match factory.connect(&attempt.url) {
                Ok(transport) => transport,
                Err(error) => {
                    warn!("cannot reach rendezvous {}: {error}", attempt.url);
                    continue;
                }
            };
            match run_to1(transport.as_ref(), credential, config).await {
                Ok(to1d) => to1d,
                Err(error) => {
                    warn!("owner lookup at {} failed: {error}", attempt.url);
                    continue;
                }
            }
        };

        // The owner signature is not checked here; the addresses lead to the
        // owner, who then has to prove itself in the transfer.
        let addresses = to1d.dangerous_parse_unverified()?.0.addresses;
        for address in addresses {
            let url = match address.url() {
                Ok(url) => url,
                Err(error) => {
                    warn!("unusable owner address: {error}");
                    continue;
                }
            };
            match try_to2_at(factory, &url, credential, modules, config, attempt.owner_key_hash.as_ref()).await {
                Ok(outcome) => return Ok(outcome),
                Err(error) => {
                    warn!("transfer at {url} failed: {error}");
                    continue;
                }
            }
        }
    }

    Err(ProtocolError::TransferFailed.into())
}

async fn try_to2_at(
    factory: &dyn TransportFactory,
    url: &url::Url,
    credential: &mut DeviceCredential,
    modules: DeviceModuleFactory<'_>,
    config: &DeviceConfig,
    pinned_owner_key_hash: Option<&Hash>,
) -> Result<TransferOutcome> {
    let transport = factory.connect(url).map_err(Error::Transport)?;
    run_to2(transport.as_ref(), credential, modules(), config, pinned_owner_key_hash).await
}
