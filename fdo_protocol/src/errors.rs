//! The crate-wide error type, the wire-level error codes it maps onto, and
//! the error message that terminates a session.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_repr::{Deserialize_repr, Serialize_repr};
use uuid::Uuid;

use crate::{
    cose::CoseError,
    credential::CredentialError,
    crypto::CryptoError,
    delegate::DelegateError,
    keys::KeyError,
    messages::{Message, MessageType},
    publickey::PublicKeyError,
    rendezvous::RendezvousError,
    serialization::{CborError, CborSeq},
    server_state::SessionStoreError,
    serviceinfo::ServiceInfoError,
    transport::TransportError,
    types::TypeError,
    voucher::VoucherError,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Wire-level error codes carried in [`ErrorMessage`].
#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    InvalidMessageFormat = 100,
    InvalidMessageType = 101,
    CredentialUnreadable = 102,
    CryptoVerifyFailed = 104,
    ResourceNotFound = 106,
    ResourceUnavailable = 107,
    InternalServerError = 500,
    /// Base of the range reserved for ServiceInfo modules.
    ModuleError = 600,
}

/// Errors in the protocol flow itself, as opposed to the data it carries.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("unexpected message type {found}, expected {expected}")]
    UnexpectedMessageType { expected: MessageType, found: MessageType },
    #[error("request carries no session token")]
    MissingSessionToken,
    #[error("unknown or completed session")]
    UnknownSession,
    #[error("nonce in response does not match the one sent")]
    NonceMismatch,
    #[error("unknown device {0}")]
    UnknownGuid(crate::types::Guid),
    #[error("voucher entry count mismatch: announced {announced}, served {served}")]
    EntryCount { announced: u16, served: u16 },
    #[error("peer reported: {0:?}")]
    Remote(ErrorMessage),
    #[error("all contact attempts exhausted")]
    TransferFailed,
    #[error("registration expired")]
    RegistrationExpired,
    #[error("no device verification key available for this registration")]
    DeviceKeyUnavailable,
    #[error("device did not supply the replacement header HMAC")]
    MissingReplacementHmac,
    #[error("no signing key held for key type {0:?}")]
    UnsupportedKeyType(crate::keys::KeyType),
    #[error("device MAC does not cover the issued header")]
    HmacHeaderMismatch,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("CBOR error: {0}")]
    Cbor(#[from] CborError),
    #[error("COSE error: {0}")]
    Cose(#[from] CoseError),
    #[error("key error: {0}")]
    Keys(#[from] KeyError),
    #[error("public key error: {0}")]
    PublicKey(#[from] PublicKeyError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("type error: {0}")]
    Types(#[from] TypeError),
    #[error("voucher error: {0}")]
    Voucher(#[from] VoucherError),
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),
    #[error("delegate error: {0}")]
    Delegate(#[from] DelegateError),
    #[error("rendezvous error: {0}")]
    Rendezvous(#[from] RendezvousError),
    #[error("service info error: {0}")]
    ServiceInfo(#[from] ServiceInfoError),
    #[error("session store error: {0}")]
    SessionStore(#[from] SessionStoreError),
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl Error {
    /// The wire-level code for this error. Verification failures map to
    /// [`ErrorCode::CryptoVerifyFailed`] and nothing else does: the operator
    /// must be able to tell a possible attack from version skew.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::Cbor(_) | Error::Types(_) | Error::PublicKey(_) | Error::Rendezvous(_) => {
                ErrorCode::InvalidMessageFormat
            }
            Error::Cose(CoseError::Key(_)) | Error::Keys(_) | Error::Delegate(_) => ErrorCode::CryptoVerifyFailed,
            Error::Cose(_) => ErrorCode::InvalidMessageFormat,
            Error::Crypto(_) => ErrorCode::CryptoVerifyFailed,
            Error::Voucher(VoucherError::Cbor(_)) => ErrorCode::InvalidMessageFormat,
            Error::Voucher(_) => ErrorCode::CryptoVerifyFailed,
            Error::Credential(_) => ErrorCode::CredentialUnreadable,
            Error::ServiceInfo(_) => ErrorCode::ModuleError,
            Error::SessionStore(_) | Error::Store(_) => ErrorCode::ResourceUnavailable,
            Error::Transport(_) => ErrorCode::ResourceUnavailable,
            Error::Protocol(error) => match error {
                ProtocolError::UnexpectedMessageType { .. } => ErrorCode::InvalidMessageType,
                ProtocolError::MissingSessionToken | ProtocolError::UnknownSession => ErrorCode::InvalidMessageType,
                ProtocolError::UnknownGuid(_)
                | ProtocolError::RegistrationExpired
                | ProtocolError::DeviceKeyUnavailable
                | ProtocolError::UnsupportedKeyType(_) => ErrorCode::ResourceNotFound,
                ProtocolError::NonceMismatch
                | ProtocolError::EntryCount { .. }
                | ProtocolError::MissingReplacementHmac
                | ProtocolError::HmacHeaderMismatch => ErrorCode::CryptoVerifyFailed,
                ProtocolError::Remote(_) | ProtocolError::TransferFailed => ErrorCode::InternalServerError,
            },
        }
    }
}

/// The error message that terminates a session, emitted by whichever side
/// failed. Receipt of one terminates the session on the other side too.
pub type ErrorMessage = CborSeq<ErrorMessageKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorMessageKeyed {
    pub code: ErrorCode,
    /// The message type that triggered the error.
    pub previous_message_type: MessageType,
    pub message: String,
    /// Correlates both sides' logs for one failure.
    pub correlation_id: ByteBuf,
}

impl Message for ErrorMessage {
    const MESSAGE_TYPE: MessageType = MessageType::Error;
}

impl ErrorMessage {
    pub fn for_error(error: &Error, previous_message_type: MessageType) -> ErrorMessage {
        ErrorMessageKeyed {
            code: error.error_code(),
            previous_message_type,
            message: error.to_string(),
            correlation_id: ByteBuf::from(*Uuid::new_v4().as_bytes()),
        }
        .into()
    }

    pub fn correlation_id(&self) -> String {
        hex::encode(&self.0.correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        keys::KeyError,
        serialization::{cbor_deserialize, cbor_serialize},
    };

    use super::*;

    #[test]
    fn verification_errors_are_distinguishable_from_format_errors() {
        let verify: Error = CoseError::Key(KeyError::Verification).into();
        assert_eq!(verify.error_code(), ErrorCode::CryptoVerifyFailed);

        let shape: Error = CoseError::MissingPayload.into();
        assert_eq!(shape.error_code(), ErrorCode::InvalidMessageFormat);
    }

    #[test]
    fn unexpected_type_maps_to_invalid_message_type() {
        let error: Error = ProtocolError::UnexpectedMessageType {
            expected: MessageType::To2ProveOvHdr,
            found: MessageType::To2Done,
        }
        .into();
        assert_eq!(error.error_code(), ErrorCode::InvalidMessageType);
    }

    #[test]
    fn error_message_roundtrip() {
        let error: Error = CoseError::Key(KeyError::Verification).into();
        let message = ErrorMessage::for_error(&error, MessageType::To2ProveDevice);

        let serialized = cbor_serialize(&message).unwrap();
        let deserialized: ErrorMessage = cbor_deserialize(&serialized).unwrap();
        assert_eq!(deserialized, message);
        assert_eq!(deserialized.0.code, ErrorCode::CryptoVerifyFailed);
        assert_eq!(deserialized.0.previous_message_type, MessageType::To2ProveDevice);
    }
}
