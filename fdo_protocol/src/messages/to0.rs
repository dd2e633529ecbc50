//! Transfer Ownership 0: the owner registers its current network addresses
//! with a rendezvous service, proving custody of the voucher.

use serde::{Deserialize, Serialize};

use crate::{
    rendezvous::To1d,
    serialization::{CborSeq, EmbeddedCbor},
    types::{CapabilityFlags, Nonce},
    voucher::OwnershipVoucher,
};

use super::{Message, MessageType};

pub type Hello = CborSeq<HelloKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HelloKeyed {
    pub capabilities: CapabilityFlags,
}

impl Message for Hello {
    const MESSAGE_TYPE: MessageType = MessageType::To0Hello;
}

pub type HelloAck = CborSeq<HelloAckKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HelloAckKeyed {
    /// Must be echoed inside the signed registration, preventing replay of a
    /// captured `OwnerSign`.
    pub nonce: Nonce,
    pub capabilities: CapabilityFlags,
}

impl Message for HelloAck {
    const MESSAGE_TYPE: MessageType = MessageType::To0HelloAck;
}

/// The registration the owner signs over (indirectly, via the `to0d_hash` in
/// [`To1d`]): the voucher proving custody, the requested registration
/// lifetime, and the rendezvous nonce.
pub type To0d = CborSeq<To0dKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct To0dKeyed {
    pub voucher: OwnershipVoucher,
    pub wait_seconds: u32,
    pub nonce: Nonce,
}

pub type OwnerSign = CborSeq<OwnerSignKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OwnerSignKeyed {
    pub to0d: EmbeddedCbor<To0d>,
    pub to1d: To1d,
}

impl Message for OwnerSign {
    const MESSAGE_TYPE: MessageType = MessageType::To0OwnerSign;
}

pub type AcceptOwner = CborSeq<AcceptOwnerKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AcceptOwnerKeyed {
    /// Granted registration lifetime; may be shorter than requested.
    pub wait_seconds: u32,
}

impl Message for AcceptOwner {
    const MESSAGE_TYPE: MessageType = MessageType::To0AcceptOwner;
}
