//! Transfer Ownership 1: the device proves possession of its key to the
//! rendezvous service and receives the owner's signed address blob.

use serde::{Deserialize, Serialize};

use crate::{
    cose::TypedSign1,
    rendezvous::To1d,
    serialization::CborSeq,
    types::{CapabilityFlags, Guid, Nonce},
};

use super::{Message, MessageType};

pub type HelloRv = CborSeq<HelloRvKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HelloRvKeyed {
    pub guid: Guid,
    pub capabilities: CapabilityFlags,
}

impl Message for HelloRv {
    const MESSAGE_TYPE: MessageType = MessageType::To1HelloRv;
}

pub type HelloRvAck = CborSeq<HelloRvAckKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HelloRvAckKeyed {
    pub nonce: Nonce,
    pub capabilities: CapabilityFlags,
}

impl Message for HelloRvAck {
    const MESSAGE_TYPE: MessageType = MessageType::To1HelloRvAck;
}

/// What the device signs to prove possession: the rendezvous nonce and its
/// own identity.
pub type ProveToRvPayload = CborSeq<ProveToRvPayloadKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProveToRvPayloadKeyed {
    pub nonce: Nonce,
    pub guid: Guid,
}

pub type ProveToRv = TypedSign1<ProveToRvPayload>;

impl Message for ProveToRv {
    const MESSAGE_TYPE: MessageType = MessageType::To1ProveToRv;
}

pub type RvRedirect = CborSeq<RvRedirectKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RvRedirectKeyed {
    /// Handed over as stored; the device uses the addresses without verifying
    /// the owner signature at this point.
    pub to1d: To1d,
}

impl Message for RvRedirect {
    const MESSAGE_TYPE: MessageType = MessageType::To1RvRedirect;
}
