//! Device Initialize: the device presents its manufacturing info, receives a
//! voucher header bound to a fresh GUID, and returns its HMAC over it.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::{
    cose::TypedMac0,
    keys::KeyType,
    serialization::{CborSeq, EmbeddedCbor},
    voucher::VoucherHeader,
};

use super::{Message, MessageType};

/// What the device knows about itself at initialization time.
pub type DeviceMfgInfo = CborSeq<DeviceMfgInfoKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeviceMfgInfoKeyed {
    pub key_type: KeyType,
    pub serial_number: String,
    pub device_info: String,
    /// PKCS#10 CSR for the device key, DER-encoded, for the manufacturer to
    /// issue the device certificate chain from.
    pub csr: ByteBuf,
}

pub type AppStart = CborSeq<AppStartKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AppStartKeyed {
    pub mfg_info: DeviceMfgInfo,
}

impl Message for AppStart {
    const MESSAGE_TYPE: MessageType = MessageType::DiAppStart;
}

pub type SetCredentials = CborSeq<SetCredentialsKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SetCredentialsKeyed {
    pub header: EmbeddedCbor<VoucherHeader>,
}

impl Message for SetCredentials {
    const MESSAGE_TYPE: MessageType = MessageType::DiSetCredentials;
}

pub type SetHmac = CborSeq<SetHmacKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SetHmacKeyed {
    /// The device's MAC envelope over the header bytes it was handed; binds
    /// the device's HMAC secret to the voucher.
    pub hmac: TypedMac0<VoucherHeader>,
}

impl Message for SetHmac {
    const MESSAGE_TYPE: MessageType = MessageType::DiSetHmac;
}

pub type DiDone = CborSeq<DiDoneKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DiDoneKeyed {}

impl Message for DiDone {
    const MESSAGE_TYPE: MessageType = MessageType::DiDone;
}
