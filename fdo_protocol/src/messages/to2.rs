//! Transfer Ownership 2: the full ownership transfer. Everything after
//! `ProveDevice` travels AES-GCM encrypted under the session key; the
//! encrypted carrier keeps the inner message's type.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::{
    cose::TypedSign1,
    crypto::{CipherSuite, KexSuite},
    publickey::PublicKey,
    rendezvous::RendezvousInfo,
    serialization::{CborSeq, EmbeddedCbor},
    serviceinfo::ServiceInfo,
    types::{CapabilityFlags, Guid, HMac, Nonce},
    voucher::{VoucherEntry, VoucherHeader},
};

use super::{Message, MessageType};

pub type HelloDevice = CborSeq<HelloDeviceKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HelloDeviceKeyed {
    pub guid: Guid,
    /// `NonceTO2ProveOV`: the owner must sign this back in `ProveOvHdr`.
    pub nonce_prove_ov: Nonce,
    pub kex_suite: KexSuite,
    pub cipher_suite: CipherSuite,
    pub capabilities: CapabilityFlags,
}

impl Message for HelloDevice {
    const MESSAGE_TYPE: MessageType = MessageType::To2HelloDevice;
}

/// The owner's opening proof, signed with the current owner key (or a
/// delegate leaf key authorized by it).
pub type ProveOvHdrPayload = CborSeq<ProveOvHdrPayloadKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProveOvHdrPayloadKeyed {
    pub header: EmbeddedCbor<VoucherHeader>,
    pub num_entries: u16,
    pub header_hmac: HMac,
    pub nonce_prove_ov: Nonce,
    /// `NonceTO2ProveDv`: the device must sign this back in `ProveDevice`.
    pub nonce_prove_device: Nonce,
    /// The owner's key exchange parameter.
    pub kex_a: ByteBuf,
    pub kex_suite: KexSuite,
    pub cipher_suite: CipherSuite,
    /// The key the signature verifies under; must equal the voucher tail key
    /// once the entries have been walked.
    pub public_key: PublicKey,
    pub capabilities: CapabilityFlags,
}

pub type ProveOvHdr = TypedSign1<ProveOvHdrPayload>;

impl Message for ProveOvHdr {
    const MESSAGE_TYPE: MessageType = MessageType::To2ProveOvHdr;
}

pub type GetOvNextEntry = CborSeq<GetOvNextEntryKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GetOvNextEntryKeyed {
    pub entry_num: u16,
}

impl Message for GetOvNextEntry {
    const MESSAGE_TYPE: MessageType = MessageType::To2GetOvNextEntry;
}

pub type OvNextEntry = CborSeq<OvNextEntryKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OvNextEntryKeyed {
    pub entry_num: u16,
    pub entry: VoucherEntry,
}

impl Message for OvNextEntry {
    const MESSAGE_TYPE: MessageType = MessageType::To2OvNextEntry;
}

/// The device's possession proof: the owner's nonce signed with the device
/// key, plus the device's key exchange parameter and its own fresh nonce.
pub type ProveDevicePayload = CborSeq<ProveDevicePayloadKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProveDevicePayloadKeyed {
    pub nonce_prove_device: Nonce,
    /// `NonceTO2SetupDv`: the owner must echo this in `SetupDevice` and the
    /// device proves liveness with it again in `Done2`.
    pub nonce_setup_device: Nonce,
    pub kex_b: ByteBuf,
}

pub type ProveDevice = TypedSign1<ProveDevicePayload>;

impl Message for ProveDevice {
    const MESSAGE_TYPE: MessageType = MessageType::To2ProveDevice;
}

/// The replacement identity, signed by the key the device must answer to
/// next. Encrypted under the session key.
pub type SetupDevicePayload = CborSeq<SetupDevicePayloadKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SetupDevicePayloadKeyed {
    pub rendezvous_info: RendezvousInfo,
    pub guid: Guid,
    pub nonce_setup_device: Nonce,
    pub owner_public_key: PublicKey,
    /// Keep the current credential instead of installing the new identity.
    pub reuse_credential: bool,
}

pub type SetupDevice = TypedSign1<SetupDevicePayload>;

impl Message for SetupDevice {
    const MESSAGE_TYPE: MessageType = MessageType::To2SetupDevice;
}

pub type DeviceServiceInfoReady = CborSeq<DeviceServiceInfoReadyKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeviceServiceInfoReadyKeyed {
    /// The device's HMAC over the replacement voucher header; absent on
    /// credential reuse.
    pub replacement_hmac: Option<HMac>,
    /// Largest ServiceInfo message the device will accept.
    pub mtu: Option<u16>,
}

impl Message for DeviceServiceInfoReady {
    const MESSAGE_TYPE: MessageType = MessageType::To2DeviceServiceInfoReady;
}

pub type OwnerServiceInfoReady = CborSeq<OwnerServiceInfoReadyKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OwnerServiceInfoReadyKeyed {
    /// Largest ServiceInfo message the owner will accept.
    pub mtu: Option<u16>,
}

impl Message for OwnerServiceInfoReady {
    const MESSAGE_TYPE: MessageType = MessageType::To2OwnerServiceInfoReady;
}

pub type DeviceServiceInfo = CborSeq<DeviceServiceInfoKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeviceServiceInfoKeyed {
    pub service_info: ServiceInfo,
    /// The sender has nothing further to contribute. The stream ends when
    /// both sides have sent this in the same round.
    pub is_done: bool,
}

impl Message for DeviceServiceInfo {
    const MESSAGE_TYPE: MessageType = MessageType::To2DeviceServiceInfo;
}

pub type OwnerServiceInfo = CborSeq<OwnerServiceInfoKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OwnerServiceInfoKeyed {
    pub service_info: ServiceInfo,
    pub is_done: bool,
}

impl Message for OwnerServiceInfo {
    const MESSAGE_TYPE: MessageType = MessageType::To2OwnerServiceInfo;
}

pub type Done = CborSeq<DoneKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DoneKeyed {
    /// Echo of `NonceTO2ProveDv`: the session key was alive to the end.
    pub nonce_prove_device: Nonce,
}

impl Message for Done {
    const MESSAGE_TYPE: MessageType = MessageType::To2Done;
}

pub type Done2 = CborSeq<Done2Keyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Done2Keyed {
    /// Echo of `NonceTO2SetupDv`.
    pub nonce_setup_device: Nonce,
}

impl Message for Done2 {
    const MESSAGE_TYPE: MessageType = MessageType::To2Done2;
}
