//! The rendezvous service: accepts owner registrations (Transfer Ownership 0)
//! and serves them to devices that prove possession of their device key
//! (Transfer Ownership 1). Registrations live for their granted TTL and an
//! expired registration is never served.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fdo_common::generator::Generator;

use crate::{
    errors::{ProtocolError, Result},
    messages::{
        to0::{AcceptOwner, AcceptOwnerKeyed, Hello, HelloAck, HelloAckKeyed, OwnerSign},
        to1::{HelloRv, HelloRvAck, HelloRvAckKeyed, ProveToRv, RvRedirect, RvRedirectKeyed},
        Message, MessageType,
    },
    serialization::{cbor_deserialize, cbor_serialize},
    server_state::{Expirable, HasProgress, Progress, SessionState, SessionStore, SessionToken},
    store::{RendezvousBlob, RendezvousBlobStore},
    transport::{ProtocolServer, TransportResponse},
    types::{CapabilityFlags, Guid, Nonce},
};

/// Rendezvous session state, covering both protocols the service speaks.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RvData {
    To0Started { nonce: Nonce },
    To1Started { guid: Guid, nonce: Nonce },
    Done { has_succeeded: bool },
}

impl HasProgress for RvData {
    fn progress(&self) -> Progress {
        match self {
            RvData::To0Started { .. } | RvData::To1Started { .. } => Progress::Active,
            RvData::Done { has_succeeded } => Progress::Finished {
                has_succeeded: *has_succeeded,
            },
        }
    }
}

impl Expirable for RvData {
    fn is_expired(&self) -> bool {
        matches!(self, RvData::Done { has_succeeded: false })
    }

    fn expire(&mut self) {
        *self = RvData::Done { has_succeeded: false };
    }
}

pub struct RendezvousServer<S, G> {
    sessions: Arc<S>,
    blobs: Arc<dyn RendezvousBlobStore>,
    /// Upper bound on the registration lifetime an owner may request.
    max_wait_seconds: u32,
    capabilities: CapabilityFlags,
    times: G,
}

impl<S, G> RendezvousServer<S, G>
where
    S: SessionStore<RvData>,
    G: Generator<DateTime<Utc>> + Send + Sync,
{
    pub fn new(
        sessions: Arc<S>,
        blobs: Arc<dyn RendezvousBlobStore>,
        max_wait_seconds: u32,
        capabilities: CapabilityFlags,
        times: G,
    ) -> Self {
        RendezvousServer {
            sessions,
            blobs,
            max_wait_seconds,
            capabilities,
            times,
        }
    }

    async fn process_to0_hello(&self, _message: Hello) -> Result<(HelloAck, SessionToken)> {
        let nonce = Nonce::new();
        let token = SessionToken::new_random();
        self.sessions
            .write(
                SessionState::new(token.clone(), RvData::To0Started { nonce: nonce.clone() }),
                true,
            )
            .await?;

        Ok((
            HelloAckKeyed {
                nonce,
                capabilities: self.capabilities.clone(),
            }
            .into(),
            token,
        ))
    }

    async fn process_owner_sign(&self, token: &SessionToken, message: OwnerSign) -> Result<AcceptOwner> {
        let session = self
            .sessions
            .get(token)
            .await?
            .ok_or(ProtocolError::UnknownSession)?;
        let RvData::To0Started { nonce } = session.data else {
            return Err(ProtocolError::UnknownSession.into());
        };

        let to0d = message.0.to0d.parse()?;
        if to0d.0.nonce != nonce {
            return Err(ProtocolError::NonceMismatch.into());
        }

        // The voucher proves custody; its verified tail key must have signed
        // the address blob.
        let owner_key = to0d.0.voucher.verify()?;
        let to1d_payload = message.0.to1d.verify(&owner_key.verifying_key()?, &[])?;
        to1d_payload.0.to0d_hash.matches_data(message.0.to0d.as_bytes())?;

        let guid = to0d.0.voucher.header()?.0.guid;
        let wait_seconds = to0d.0.wait_seconds.min(self.max_wait_seconds);
        let expires_at = self.times.generate() + Duration::seconds(wait_seconds as i64);

        self.blobs
            .put(
                guid.clone(),
                RendezvousBlob {
                    to1d: message.0.to1d,
                    device_cert_chain: to0d.0.voucher.0.device_cert_chain.clone(),
                    expires_at,
                },
            )
            .await?;
        info!("registration stored for {guid}, ttl {wait_seconds}s");

        self.sessions
            .write(
                SessionState::new(token.clone(), RvData::Done { has_succeeded: true }),
                false,
            )
            .await?;

        Ok(AcceptOwnerKeyed { wait_seconds }.into())
    }

    async fn process_hello_rv(&self, message: HelloRv) -> Result<(HelloRvAck, SessionToken)> {
        let guid = message.0.guid;
        // Unknown devices are turned away before being handed a nonce.
        if self.blobs.get(&guid, self.times.generate()).await?.is_none() {
            return Err(ProtocolError::UnknownGuid(guid).into());
        }

        let nonce = Nonce::new();
        let token = SessionToken::new_random();
        self.sessions
            .write(
                SessionState::new(
                    token.clone(),
                    RvData::To1Started {
                        guid,
                        nonce: nonce.clone(),
                    },
                ),
                true,
            )
            .await?;

        Ok((
            HelloRvAckKeyed {
                nonce,
                capabilities: self.capabilities.clone(),
            }
            .into(),
            token,
        ))
    }

    async fn process_prove_to_rv(&self, token: &SessionToken, message: ProveToRv) -> Result<RvRedirect> {
        let session = self
            .sessions
            .get(token)
            .await?
            .ok_or(ProtocolError::UnknownSession)?;
        let RvData::To1Started { guid, nonce } = session.data else {
            return Err(ProtocolError::UnknownSession.into());
        };

        let blob = self
            .blobs
            .get(&guid, self.times.generate())
            .await?
            .ok_or(ProtocolError::RegistrationExpired)?;

        let device_key = blob
            .device_cert_chain
            .as_ref()
            .ok_or(ProtocolError::DeviceKeyUnavailable)?
            .leaf_verifying_key()?;
        let payload = message.verify(&device_key, &[])?;

        if payload.0.nonce != nonce || payload.0.guid != guid {
            return Err(ProtocolError::NonceMismatch.into());
        }
        debug!("device {guid} proved possession");

        self.sessions
            .write(
                SessionState::new(token.clone(), RvData::Done { has_succeeded: true }),
                false,
            )
            .await?;

        Ok(RvRedirectKeyed { to1d: blob.to1d }.into())
    }
}

#[async_trait]
impl<S, G> ProtocolServer for RendezvousServer<S, G>
where
    S: SessionStore<RvData>,
    G: Generator<DateTime<Utc>> + Send + Sync,
{
    async fn process_message(
        &self,
        message_type: MessageType,
        body: Vec<u8>,
        token: Option<SessionToken>,
    ) -> Result<TransportResponse> {
        match message_type {
            MessageType::To0Hello => {
                let (response, token) = self.process_to0_hello(cbor_deserialize(&body)?).await?;
                Ok(TransportResponse {
                    message_type: HelloAck::MESSAGE_TYPE,
                    body: cbor_serialize(&response)?,
                    token: Some(token),
                })
            }
            MessageType::To0OwnerSign => {
                let token = token.ok_or(ProtocolError::MissingSessionToken)?;
                let response = self.process_owner_sign(&token, cbor_deserialize(&body)?).await?;
                Ok(TransportResponse {
                    message_type: AcceptOwner::MESSAGE_TYPE,
                    body: cbor_serialize(&response)?,
                    token: Some(token),
                })
            }
            MessageType::To1HelloRv => {
                let (response, token) = self.process_hello_rv(cbor_deserialize(&body)?).await?;
                Ok(TransportResponse {
                    message_type: HelloRvAck::MESSAGE_TYPE,
                    body: cbor_serialize(&response)?,
                    token: Some(token),
                })
            }
            MessageType::To1ProveToRv => {
                let token = token.ok_or(ProtocolError::MissingSessionToken)?;
                let response = self.process_prove_to_rv(&token, cbor_deserialize(&body)?).await?;
                Ok(TransportResponse {
                    message_type: RvRedirect::MESSAGE_TYPE,
                    body: cbor_serialize(&response)?,
                    token: Some(token),
                })
            }
            other => Err(ProtocolError::UnexpectedMessageType {
                expected: MessageType::To0Hello,
                found: other,
            }
            .into()),
        }
    }
}
