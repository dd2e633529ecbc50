//! The transport contract: request/response exchange of `(message type,
//! CBOR body, session token)` triples. The concrete carrier (HTTP or
//! otherwise) is a collaborator behind this interface; an in-process
//! implementation connects clients directly to a server for tests.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    errors::{ErrorMessage, ProtocolError, Result},
    messages::{Message, MessageType},
    serialization::{cbor_deserialize, cbor_serialize},
    server_state::SessionToken,
};

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("transport failure: {0}")]
    Failure(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("protocol turn timed out")]
    Timeout,
    #[error("session cancelled")]
    Cancelled,
}

pub struct TransportResponse {
    pub message_type: MessageType,
    pub body: Vec<u8>,
    pub token: Option<SessionToken>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        message_type: MessageType,
        body: Vec<u8>,
        token: Option<SessionToken>,
    ) -> Result<TransportResponse, TransportError>;
}

/// A server-side protocol endpoint: one turn in, one turn out. Failures are
/// converted to wire [`ErrorMessage`]s by [`ServerTransport`].
#[async_trait]
pub trait ProtocolServer: Send + Sync {
    async fn process_message(
        &self,
        message_type: MessageType,
        body: Vec<u8>,
        token: Option<SessionToken>,
    ) -> Result<TransportResponse>;
}

#[async_trait]
impl<T: ProtocolServer + ?Sized> ProtocolServer for std::sync::Arc<T> {
    async fn process_message(
        &self,
        message_type: MessageType,
        body: Vec<u8>,
        token: Option<SessionToken>,
    ) -> Result<TransportResponse> {
        (**self).process_message(message_type, body, token).await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn send(
        &self,
        message_type: MessageType,
        body: Vec<u8>,
        token: Option<SessionToken>,
    ) -> Result<TransportResponse, TransportError> {
        (**self).send(message_type, body, token).await
    }
}

/// Client-side helper threading the session token through a protocol run and
/// enforcing the per-turn deadline.
pub struct ClientSession<'a> {
    transport: &'a dyn Transport,
    token: Option<SessionToken>,
    turn_timeout: Duration,
}

pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(60);

impl<'a> ClientSession<'a> {
    pub fn new(transport: &'a dyn Transport, turn_timeout: Duration) -> Self {
        ClientSession {
            transport,
            token: None,
            turn_timeout,
        }
    }

    /// Sends one turn and returns the raw response body after error-message
    /// and type checks. A wire error message, a type mismatch, or a deadline
    /// expiry each terminate the session.
    pub async fn request_raw(
        &mut self,
        request_type: MessageType,
        body: Vec<u8>,
        expected: MessageType,
    ) -> Result<Vec<u8>> {
        debug!("sending {request_type}");

        let response = tokio::time::timeout(
            self.turn_timeout,
            self.transport.send(request_type, body, self.token.clone()),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        if response.token.is_some() {
            self.token = response.token;
        }

        if response.message_type == MessageType::Error {
            let error: ErrorMessage = cbor_deserialize(&response.body)?;
            warn!(
                "peer reported error {:?} (correlation {})",
                error.0.code,
                error.correlation_id()
            );
            return Err(ProtocolError::Remote(error).into());
        }

        if response.message_type != expected {
            return Err(ProtocolError::UnexpectedMessageType {
                expected,
                found: response.message_type,
            }
            .into());
        }

        Ok(response.body)
    }

    /// Sends `request` and parses the response as `Resp`.
    pub async fn request<Req: Message, Resp: Message>(&mut self, request: &Req) -> Result<Resp> {
        let body = self
            .request_raw(Req::MESSAGE_TYPE, cbor_serialize(request)?, Resp::MESSAGE_TYPE)
            .await?;
        Ok(cbor_deserialize(&body)?)
    }
}

/// Opens transports to concrete network locations; how a URL becomes a
/// connection is the carrier's concern.
pub trait TransportFactory: Send + Sync {
    fn connect(&self, url: &url::Url) -> Result<Box<dyn Transport>, TransportError>;
}

/// Adapts a [`ProtocolServer`] into a [`Transport`], converting server-side
/// errors into wire error messages the way a real carrier endpoint would.
pub struct ServerTransport<S>(pub S);

#[async_trait]
impl<S: ProtocolServer> Transport for ServerTransport<S> {
    async fn send(
        &self,
        message_type: MessageType,
        body: Vec<u8>,
        token: Option<SessionToken>,
    ) -> Result<TransportResponse, TransportError> {
        match self.0.process_message(message_type, body, token).await {
            Ok(response) => Ok(response),
            Err(error) => {
                let message = ErrorMessage::for_error(&error, message_type);
                warn!(
                    "turn {message_type} failed: {error} (correlation {})",
                    message.correlation_id()
                );
                let body = cbor_serialize(&message).map_err(|e| TransportError::Failure(Box::new(e)))?;
                Ok(TransportResponse {
                    message_type: MessageType::Error,
                    body,
                    token: None,
                })
            }
        }
    }
}
