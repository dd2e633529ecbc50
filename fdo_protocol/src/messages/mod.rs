//! The typed protocol messages of the four phases, and the numbering that
//! ties each message to its position in a protocol run.

use serde::{de::DeserializeOwned, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

pub mod di;
pub mod to0;
pub mod to1;
pub mod to2;

/// Wire message types. Each request maps to exactly one expected response
/// type; anything else is a protocol error.
#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    DiAppStart = 10,
    DiSetCredentials = 11,
    DiSetHmac = 12,
    DiDone = 13,

    To0Hello = 20,
    To0HelloAck = 21,
    To0OwnerSign = 22,
    To0AcceptOwner = 23,

    To1HelloRv = 30,
    To1HelloRvAck = 31,
    To1ProveToRv = 32,
    To1RvRedirect = 33,

    To2HelloDevice = 60,
    To2ProveOvHdr = 61,
    To2GetOvNextEntry = 62,
    To2OvNextEntry = 63,
    To2ProveDevice = 64,
    To2SetupDevice = 65,
    To2DeviceServiceInfoReady = 66,
    To2OwnerServiceInfoReady = 67,
    To2DeviceServiceInfo = 68,
    To2OwnerServiceInfo = 69,
    To2Done = 70,
    To2Done2 = 71,

    Error = 255,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}({})", *self as u8)
    }
}

/// A protocol message: a CBOR body bound to its wire message type.
pub trait Message: Serialize + DeserializeOwned {
    const MESSAGE_TYPE: MessageType;
}
