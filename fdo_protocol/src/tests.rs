//! End-to-end protocol runs: initialization, rendezvous registration and
//! lookup, and the full ownership transfer, wired through in-process
//! transports.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use assert_matches::assert_matches;
use url::Url;

use fdo_common::generator::UuidGenerator;

use crate::{
    credential::DeviceCredential,
    delegate::{
        generate::{generate_chain, ChainLink},
        DelegateFunction,
    },
    device::{self, DeviceConfig, TransferOutcome},
    errors::{Error, ProtocolError},
    keys::KeyPair,
    manufacturer::{ca, DiData, Manufacturer},
    messages::di::{DeviceMfgInfo, DeviceMfgInfoKeyed},
    owner::{Owner, OwnerConfig, OwnerDelegate},
    publickey::PublicKey,
    rendezvous::{
        single_directive, RendezvousProtocolValue, To2AddressEntry, To2AddressEntryKeyed, TransportProtocol,
    },
    rendezvous_server::{RendezvousServer, RvData},
    serialization::cbor_serialize,
    server_state::MemorySessionStore,
    serviceinfo::{
        DeviceModule, DeviceYield, ModuleDirective, OwnerModule, ServiceInfoError, ServiceInfoProducer,
    },
    store::{MemoryRendezvousBlobStore, MemoryVoucherStore, RendezvousBlobStore, SingleKeyRing, VoucherStore},
    transport::{ServerTransport, Transport, TransportError, TransportFactory},
    types::CapabilityFlags,
};

const RV_HOST: &str = "rv.example.com";
const OWNER_HOST: &str = "owner.example.com";
const PAYLOAD_LEN: usize = 4096;

fn payload() -> Vec<u8> {
    (0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect()
}

/// Owner module streaming a payload in acked chunks under `fdo.download`.
struct DownloadSender {
    data: Vec<u8>,
    chunk_size: usize,
    offset: usize,
    begun: bool,
}

impl OwnerModule for DownloadSender {
    fn name(&self) -> &str {
        "fdo.download"
    }

    fn handle_info(&mut self, command: &str, _value: &[u8]) -> Result<(), ServiceInfoError> {
        if command != "ack" {
            return Err(ServiceInfoError::Module {
                module: "fdo.download".to_string(),
                message: format!("unexpected command {command}"),
            });
        }
        Ok(())
    }

    fn produce_info(&mut self, producer: &mut ServiceInfoProducer) -> Result<ModuleDirective, ServiceInfoError> {
        if !self.begun {
            producer.add("begin", cbor_serialize(&(self.data.len() as u64)).unwrap())?;
            self.begun = true;
        }
        if self.offset < self.data.len() {
            let end = (self.offset + self.chunk_size).min(self.data.len());
            if producer.add("data", self.data[self.offset..end].to_vec())? {
                self.offset = end;
            }
            return Ok(ModuleDirective {
                block_peer: true,
                module_done: false,
            });
        }
        producer.add("end", Vec::new())?;
        Ok(ModuleDirective {
            block_peer: false,
            module_done: true,
        })
    }
}

/// Device module receiving the chunks, acking each.
struct DownloadReceiver {
    received: Arc<Mutex<Vec<u8>>>,
    pending_ack: bool,
    ended: bool,
}

impl DeviceModule for DownloadReceiver {
    fn name(&self) -> &str {
        "fdo.download"
    }

    fn transition(&mut self, _active: bool) -> Result<(), ServiceInfoError> {
        Ok(())
    }

    fn receive(
        &mut self,
        command: &str,
        value: &[u8],
        _responder: &mut ServiceInfoProducer,
    ) -> Result<(), ServiceInfoError> {
        match command {
            "begin" => {}
            "data" => {
                self.received.lock().unwrap().extend_from_slice(value);
                self.pending_ack = true;
            }
            "end" => self.ended = true,
            other => {
                return Err(ServiceInfoError::Module {
                    module: "fdo.download".to_string(),
                    message: format!("unexpected command {other}"),
                })
            }
        }
        Ok(())
    }

    fn yield_info(&mut self, responder: &mut ServiceInfoProducer) -> Result<DeviceYield, ServiceInfoError> {
        if self.pending_ack {
            responder.add("ack", Vec::new())?;
            self.pending_ack = false;
        }
        if self.ended {
            return Ok(DeviceYield::Done);
        }
        Ok(DeviceYield::NotNow)
    }
}

struct SharedTransport(Arc<dyn Transport>);

#[async_trait::async_trait]
impl Transport for SharedTransport {
    async fn send(
        &self,
        message_type: crate::messages::MessageType,
        body: Vec<u8>,
        token: Option<crate::server_state::SessionToken>,
    ) -> Result<crate::transport::TransportResponse, TransportError> {
        self.0.send(message_type, body, token).await
    }
}

struct TestTransportFactory {
    routes: HashMap<String, Arc<dyn Transport>>,
}

impl TransportFactory for TestTransportFactory {
    fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, TransportError> {
        let host = url.host_str().unwrap_or_default();
        let transport = self
            .routes
            .get(host)
            .ok_or_else(|| TransportError::Failure(format!("no route to {host}").into()))?;
        Ok(Box::new(SharedTransport(transport.clone())))
    }
}

struct TestSetup {
    credential: DeviceCredential,
    owner_vouchers: Arc<MemoryVoucherStore>,
    owner_key: KeyPair,
    rv_blobs: Arc<MemoryRendezvousBlobStore>,
}

/// Runs device initialization and hands the voucher over to the owner.
async fn initialize_device() -> TestSetup {
    let manufacturer_key = KeyPair::random_p256();
    let device_key = KeyPair::random_p256();
    let device_ca_key = KeyPair::random_p256();
    let owner_key = KeyPair::random_p256();

    let mfr_vouchers = Arc::new(MemoryVoucherStore::new());
    let manufacturer = Manufacturer::new(
        Arc::new(SingleKeyRing(manufacturer_key.clone())),
        single_directive(RendezvousProtocolValue::Http, RV_HOST, 8080),
        Some(Box::new(ca::RcgenDeviceCa::new(&device_ca_key, "device-ca").unwrap())),
        Arc::new(MemorySessionStore::<DiData>::new()),
        mfr_vouchers.clone(),
        UuidGenerator,
    );
    let transport = ServerTransport(manufacturer);

    let mfg_info: DeviceMfgInfo = DeviceMfgInfoKeyed {
        key_type: device_key.key_type(),
        serial_number: "SN-0001".to_string(),
        device_info: "test-device".to_string(),
        csr: serde_bytes::ByteBuf::from(ca::generate_csr(&device_key, "test-device").unwrap()),
    }
    .into();

    let credential = device::initialize(
        &transport,
        mfg_info,
        &device_key,
        fdo_common::utils::random_bytes(32),
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    // Ownership passes from the manufacturer to the owner.
    let voucher = mfr_vouchers.get(&credential.guid).await.unwrap().unwrap();
    let mut transferred = voucher.clone();
    transferred
        .extend(&manufacturer_key, &PublicKey::from_keypair(&owner_key).unwrap())
        .unwrap();
    transferred.verify().unwrap();

    let owner_vouchers = Arc::new(MemoryVoucherStore::new());
    owner_vouchers.insert(transferred).await.unwrap();

    TestSetup {
        credential,
        owner_vouchers,
        owner_key,
        rv_blobs: Arc::new(MemoryRendezvousBlobStore::new()),
    }
}

fn owner_addresses() -> Vec<To2AddressEntry> {
    vec![To2AddressEntryKeyed {
        ip: None,
        dns: Some(OWNER_HOST.to_string()),
        port: 8043,
        protocol: TransportProtocol::Http,
    }
    .into()]
}

fn new_owner(setup: &TestSetup, delegate: Option<OwnerDelegate>, reuse_credential: bool) -> Owner<UuidGenerator> {
    let config = OwnerConfig {
        owner_key: setup.owner_key.clone(),
        delegate,
        replacement_rendezvous_info: single_directive(RendezvousProtocolValue::Http, RV_HOST, 8080),
        reuse_credential,
        mtu: 1500,
        capabilities: CapabilityFlags::with_delegate(),
    };
    Owner::new(
        config,
        setup.owner_vouchers.clone(),
        Box::new(|| {
            vec![Box::new(DownloadSender {
                data: payload(),
                chunk_size: 1024,
                offset: 0,
                begun: false,
            }) as Box<dyn OwnerModule>]
        }),
        UuidGenerator,
    )
}

fn new_rendezvous(setup: &TestSetup) -> RendezvousServer<MemorySessionStore<RvData>, fdo_common::generator::TimeGenerator> {
    RendezvousServer::new(
        Arc::new(MemorySessionStore::new()),
        setup.rv_blobs.clone(),
        3600,
        CapabilityFlags::default(),
        fdo_common::generator::TimeGenerator,
    )
}

#[tokio::test]
async fn initialization_produces_matching_credential_and_voucher() {
    let setup = initialize_device().await;

    // The credential's manufacturer key hash matches the key that signed
    // voucher entry 0.
    let voucher = setup.owner_vouchers.get(&setup.credential.guid).await.unwrap().unwrap();
    let header = voucher.header().unwrap();
    setup
        .credential
        .verify_manufacturer_key(&header.0.manufacturer_public_key)
        .unwrap();

    // The device HMAC in the voucher verifies under the credential's secret.
    setup
        .credential
        .verify_hmac(&voucher.0.header_hmac, voucher.0.header.as_bytes())
        .unwrap();
}

#[tokio::test]
async fn full_onboarding_rotates_guid_and_delivers_serviceinfo() {
    let setup = initialize_device().await;
    let original_guid = setup.credential.guid.clone();
    let mut credential = setup.credential.clone();

    let owner = new_owner(&setup, None, false);
    let rendezvous = new_rendezvous(&setup);

    let rv_transport: Arc<dyn Transport> = Arc::new(ServerTransport(Arc::new(rendezvous)));
    // TO0: the owner registers its addresses.
    let granted = owner
        .register_with_rendezvous(&rv_transport, &original_guid, owner_addresses(), 600)
        .await
        .unwrap();
    assert_eq!(granted, 600);

    let owner = Arc::new(owner);
    let owner_transport: Arc<dyn Transport> = Arc::new(ServerTransport(owner.clone()));
    let factory = TestTransportFactory {
        routes: HashMap::from([
            (RV_HOST.to_string(), rv_transport.clone()),
            (OWNER_HOST.to_string(), owner_transport),
        ]),
    };

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_for_factory = received.clone();
    let modules = move || {
        vec![Box::new(DownloadReceiver {
            received: received_for_factory.clone(),
            pending_ack: false,
            ended: false,
        }) as Box<dyn DeviceModule>]
    };

    let outcome = device::onboard(&factory, &mut credential, &modules, &DeviceConfig::default())
        .await
        .unwrap();
    assert_eq!(outcome, TransferOutcome::Replaced);

    // The GUID rotated; the old registration remains valid until its TTL.
    assert_ne!(credential.guid, original_guid);
    assert!(setup
        .rv_blobs
        .get(&original_guid, chrono::Utc::now())
        .await
        .unwrap()
        .is_some());

    // The streamed payload arrived complete and in order.
    assert_eq!(*received.lock().unwrap(), payload());

    // The owner stored a replacement voucher under the new GUID, rooted at
    // the owner key, and the credential's key hash matches it.
    let replacement = setup.owner_vouchers.get(&credential.guid).await.unwrap().unwrap();
    let replacement_owner = replacement.verify().unwrap();
    assert_eq!(
        replacement_owner.verifying_key().unwrap(),
        setup.owner_key.verifying_key()
    );
    credential
        .verify_manufacturer_key(&replacement.header().unwrap().0.manufacturer_public_key)
        .unwrap();
    credential
        .verify_hmac(&replacement.0.header_hmac, replacement.0.header.as_bytes())
        .unwrap();
}

#[tokio::test]
async fn credential_reuse_keeps_identity() {
    let setup = initialize_device().await;
    let original_guid = setup.credential.guid.clone();
    let mut credential = setup.credential.clone();

    let owner = new_owner(&setup, None, true);
    let owner_transport = ServerTransport(Arc::new(owner));

    let received = Arc::new(Mutex::new(Vec::new()));
    let modules: Vec<Box<dyn DeviceModule>> = vec![Box::new(DownloadReceiver {
        received: received.clone(),
        pending_ack: false,
        ended: false,
    })];

    let outcome = device::run_to2(&owner_transport, &mut credential, modules, &DeviceConfig::default(), None)
        .await
        .unwrap();

    assert_eq!(outcome, TransferOutcome::Reused);
    assert_eq!(credential.guid, original_guid);
    assert_eq!(*received.lock().unwrap(), payload());
}

#[tokio::test]
async fn delegated_owner_passes_when_authorized() {
    use crate::store::{DelegateStore, MemoryDelegateStore, StoredDelegate};

    let setup = initialize_device().await;
    let mut credential = setup.credential.clone();

    let (chain, leaf_key) = generate_chain(
        &setup.owner_key,
        &[
            ChainLink {
                common_name: "root",
                identifier: Some("DNS:*.tenant1.example"),
            },
            ChainLink {
                common_name: "onboarding-server",
                identifier: Some("DNS:srv.tenant1.example"),
            },
        ],
        &[DelegateFunction::Onboard],
    )
    .unwrap();

    // Chains are filed by name and picked up from the store at startup.
    let delegates = MemoryDelegateStore::new();
    delegates
        .put("tenant1-onboarding".to_string(), StoredDelegate { chain, leaf_key })
        .await
        .unwrap();
    let delegate = delegates.get("tenant1-onboarding").await.unwrap().unwrap();

    let owner = new_owner(
        &setup,
        Some(OwnerDelegate {
            chain: delegate.chain,
            leaf_key: delegate.leaf_key,
        }),
        false,
    );
    let owner_transport = ServerTransport(Arc::new(owner));

    let config = DeviceConfig {
        expected_owner_identifier: Some("DNS:a.tenant1.example".to_string()),
        ..Default::default()
    };
    let outcome = device::run_to2(&owner_transport, &mut credential, Vec::new(), &config, None)
        .await
        .unwrap();
    assert_eq!(outcome, TransferOutcome::Replaced);
}

#[tokio::test]
async fn delegate_without_onboard_function_is_rejected() {
    let setup = initialize_device().await;
    let mut credential = setup.credential.clone();

    let (chain, leaf_key) = generate_chain(
        &setup.owner_key,
        &[
            ChainLink {
                common_name: "root",
                identifier: None,
            },
            ChainLink {
                common_name: "uploader",
                identifier: None,
            },
        ],
        &[DelegateFunction::Upload],
    )
    .unwrap();

    let owner = new_owner(&setup, Some(OwnerDelegate { chain, leaf_key }), false);
    let owner_transport = ServerTransport(Arc::new(owner));

    let error = device::run_to2(
        &owner_transport,
        &mut credential,
        Vec::new(),
        &DeviceConfig::default(),
        None,
    )
    .await
    .unwrap_err();
    assert_matches!(error, Error::Delegate(_));
}

#[tokio::test]
async fn foreign_owner_cannot_onboard() {
    let setup = initialize_device().await;
    let mut credential = setup.credential.clone();

    // An owner holding a key the voucher was never extended to.
    let foreign = TestSetup {
        credential: setup.credential.clone(),
        owner_vouchers: setup.owner_vouchers.clone(),
        owner_key: KeyPair::random_p256(),
        rv_blobs: setup.rv_blobs.clone(),
    };
    let owner = new_owner(&foreign, None, false);
    let owner_transport = ServerTransport(Arc::new(owner));

    let error = device::run_to2(
        &owner_transport,
        &mut credential,
        Vec::new(),
        &DeviceConfig::default(),
        None,
    )
    .await
    .unwrap_err();
    // The foreign key signed ProveOVHdr, but the voucher names a different
    // current owner.
    assert_matches!(error, Error::Voucher(_) | Error::Protocol(ProtocolError::Remote(_)));
}

#[tokio::test]
async fn unknown_device_is_turned_away_at_rendezvous() {
    let setup = initialize_device().await;
    let rendezvous = new_rendezvous(&setup);
    let transport = ServerTransport(Arc::new(rendezvous));

    // No TO0 registration happened, so TO1 cannot find the device.
    let error = device::run_to1(&transport, &setup.credential, &DeviceConfig::default())
        .await
        .unwrap_err();
    assert_matches!(
        error,
        Error::Protocol(ProtocolError::Remote(message))
            if message.0.code == crate::errors::ErrorCode::ResourceNotFound
    );
}

#[tokio::test]
async fn to1_after_to0_returns_owner_addresses() {
    let setup = initialize_device().await;
    let guid = setup.credential.guid.clone();

    let owner = new_owner(&setup, None, false);
    let rendezvous = new_rendezvous(&setup);
    let rv_transport = ServerTransport(Arc::new(rendezvous));

    owner
        .register_with_rendezvous(&rv_transport, &guid, owner_addresses(), 600)
        .await
        .unwrap();

    let to1d = device::run_to1(&rv_transport, &setup.credential, &DeviceConfig::default())
        .await
        .unwrap();
    let addresses = to1d.dangerous_parse_unverified().unwrap().0.addresses;
    assert_eq!(addresses[0].url().unwrap().as_str(), "http://owner.example.com:8043/");

    // The blob is signed by the owner key and verifies as such.
    let voucher = setup.owner_vouchers.get(&guid).await.unwrap().unwrap();
    to1d.verify(&voucher.verify().unwrap().verifying_key().unwrap(), &[])
        .unwrap();
}

#[tokio::test]
async fn onboarding_fails_cleanly_when_nothing_is_reachable() {
    let setup = initialize_device().await;
    let mut credential = setup.credential.clone();

    let factory = TestTransportFactory { routes: HashMap::new() };
    let modules = || Vec::<Box<dyn DeviceModule>>::new();

    let error = device::onboard(&factory, &mut credential, &modules, &DeviceConfig::default())
        .await
        .unwrap_err();
    assert_matches!(error, Error::Protocol(ProtocolError::TransferFailed));
    // The credential is untouched by the failed run.
    assert_eq!(credential, setup.credential);
}

/// Owner module that fails partway through its transfer.
struct FaultySender {
    sent_first: bool,
}

impl OwnerModule for FaultySender {
    fn name(&self) -> &str {
        "fdo.download"
    }

    fn handle_info(&mut self, _command: &str, _value: &[u8]) -> Result<(), ServiceInfoError> {
        Ok(())
    }

    fn produce_info(&mut self, producer: &mut ServiceInfoProducer) -> Result<ModuleDirective, ServiceInfoError> {
        if !self.sent_first {
            producer.add("data", vec![0u8; 64])?;
            self.sent_first = true;
            return Ok(ModuleDirective {
                block_peer: true,
                module_done: false,
            });
        }
        Err(ServiceInfoError::TransferError {
            module: "fdo.download".to_string(),
            message: "source stream interrupted".to_string(),
        })
    }
}

#[tokio::test]
async fn interrupted_stream_aborts_the_session() {
    let setup = initialize_device().await;
    let mut credential = setup.credential.clone();
    let original = credential.clone();

    let config = OwnerConfig {
        owner_key: setup.owner_key.clone(),
        delegate: None,
        replacement_rendezvous_info: single_directive(RendezvousProtocolValue::Http, RV_HOST, 8080),
        reuse_credential: false,
        mtu: 1500,
        capabilities: CapabilityFlags::default(),
    };
    let owner = Owner::new(
        config,
        setup.owner_vouchers.clone(),
        Box::new(|| vec![Box::new(FaultySender { sent_first: false }) as Box<dyn OwnerModule>]),
        UuidGenerator,
    );
    let owner_transport = ServerTransport(Arc::new(owner));

    let received = Arc::new(Mutex::new(Vec::new()));
    let modules: Vec<Box<dyn DeviceModule>> = vec![Box::new(DownloadReceiver {
        received: received.clone(),
        pending_ack: false,
        ended: false,
    })];

    let error = device::run_to2(&owner_transport, &mut credential, modules, &DeviceConfig::default(), None)
        .await
        .unwrap_err();
    assert_matches!(
        error,
        Error::Protocol(ProtocolError::Remote(message))
            if message.0.code == crate::errors::ErrorCode::ModuleError
    );
    // The session died before Done/Done2, so nothing was committed.
    assert_eq!(credential, original);
}

#[tokio::test]
async fn missing_session_token_is_rejected() {
    use crate::{
        messages::{to2::GetOvNextEntryKeyed, Message, MessageType},
        serialization::cbor_serialize as ser,
    };

    let setup = initialize_device().await;
    let owner = new_owner(&setup, None, false);

    let request: crate::messages::to2::GetOvNextEntry = GetOvNextEntryKeyed { entry_num: 0 }.into();
    let owner_transport = ServerTransport(Arc::new(owner));
    let response = owner_transport
        .send(
            crate::messages::to2::GetOvNextEntry::MESSAGE_TYPE,
            ser(&request).unwrap(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(response.message_type, MessageType::Error);
    let message: crate::errors::ErrorMessage = crate::serialization::cbor_deserialize(&response.body).unwrap();
    assert_eq!(message.0.code, crate::errors::ErrorCode::InvalidMessageType);
}
