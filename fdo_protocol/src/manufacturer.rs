//! The manufacturer side of Device Initialize: mints a voucher header bound
//! to a fresh GUID, collects the device's HMAC over it, and stores the
//! finished voucher.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use fdo_common::generator::Generator;

use crate::{
    errors::{ProtocolError, Result},
    keys::KeyType,
    messages::{
        di::{AppStart, DiDone, DiDoneKeyed, SetCredentials, SetCredentialsKeyed, SetHmac},
        Message, MessageType,
    },
    publickey::{PublicKey, X5Chain},
    rendezvous::RendezvousInfo,
    serialization::{cbor_deserialize, cbor_serialize, EmbeddedCbor},
    server_state::{Expirable, HasProgress, Progress, SessionState, SessionStore, SessionToken},
    store::{KeyRing, VoucherStore},
    transport::{ProtocolServer, TransportResponse},
    types::{Guid, HMac, Hash, PROTOCOL_VERSION},
    voucher::{OwnershipVoucher, VoucherHeader, VoucherHeaderKeyed},
};

/// Issues the device certificate chain for a device's CSR. The rcgen-backed
/// implementation lives behind the `generate` feature; deployments may plug
/// in their own CA integration instead.
pub trait DeviceCertIssuer: Send + Sync {
    fn issue_chain(&self, csr: &[u8], device_info: &str) -> Result<X5Chain>;
}

/// Initialization session state.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum DiData {
    Created {
        header: EmbeddedCbor<VoucherHeader>,
        device_cert_chain: Option<X5Chain>,
        key_type: KeyType,
    },
    Done {
        has_succeeded: bool,
    },
}

impl HasProgress for DiData {
    fn progress(&self) -> Progress {
        match self {
            DiData::Created { .. } => Progress::Active,
            DiData::Done { has_succeeded } => Progress::Finished {
                has_succeeded: *has_succeeded,
            },
        }
    }
}

impl Expirable for DiData {
    fn is_expired(&self) -> bool {
        matches!(self, DiData::Done { has_succeeded: false })
    }

    fn expire(&mut self) {
        *self = DiData::Done { has_succeeded: false };
    }
}

pub struct Manufacturer<S, G> {
    keys: Arc<dyn KeyRing>,
    rendezvous_info: RendezvousInfo,
    cert_issuer: Option<Box<dyn DeviceCertIssuer>>,
    sessions: Arc<S>,
    vouchers: Arc<dyn VoucherStore>,
    uuids: G,
}

impl<S, G> Manufacturer<S, G>
where
    S: SessionStore<DiData>,
    G: Generator<Uuid> + Send + Sync,
{
    pub fn new(
        keys: Arc<dyn KeyRing>,
        rendezvous_info: RendezvousInfo,
        cert_issuer: Option<Box<dyn DeviceCertIssuer>>,
        sessions: Arc<S>,
        vouchers: Arc<dyn VoucherStore>,
        uuids: G,
    ) -> Self {
        Manufacturer {
            keys,
            rendezvous_info,
            cert_issuer,
            sessions,
            vouchers,
            uuids,
        }
    }

    async fn process_app_start(&self, message: AppStart) -> Result<(SetCredentials, SessionToken)> {
        let mfg_info = &message.0.mfg_info.0;
        let manufacturer_key = self
            .keys
            .private_key(mfg_info.key_type)
            .ok_or(ProtocolError::UnsupportedKeyType(mfg_info.key_type))?;
        let guid = Guid::new(&self.uuids);
        info!("initializing device {} as {guid}", mfg_info.serial_number);

        let (device_cert_chain, chain_hash) = match &self.cert_issuer {
            Some(issuer) => {
                let chain = issuer.issue_chain(&mfg_info.csr, &mfg_info.device_info)?;
                let hash = Hash::compute(manufacturer_key.algorithm().digest_algorithm(), &chain.serialized()?)?;
                (Some(chain), Some(hash))
            }
            None => (None, None),
        };

        let header: VoucherHeader = VoucherHeaderKeyed {
            version: PROTOCOL_VERSION,
            guid,
            rendezvous_info: self.rendezvous_info.clone(),
            device_info: mfg_info.device_info.clone(),
            manufacturer_public_key: PublicKey::from_keypair(manufacturer_key)?,
            device_cert_chain_hash: chain_hash,
        }
        .into();
        let header = EmbeddedCbor::new(&header)?;

        let token = SessionToken::new_random();
        let state = SessionState::new(
            token.clone(),
            DiData::Created {
                header: header.clone(),
                device_cert_chain,
                key_type: mfg_info.key_type,
            },
        );
        self.sessions.write(state, true).await?;

        Ok((SetCredentialsKeyed { header }.into(), token))
    }

    async fn process_set_hmac(&self, token: &SessionToken, message: SetHmac) -> Result<DiDone> {
        let session = self
            .sessions
            .get(token)
            .await?
            .ok_or(ProtocolError::UnknownSession)?;
        let DiData::Created {
            header,
            device_cert_chain,
            key_type,
        } = session.data
        else {
            return Err(ProtocolError::UnknownSession.into());
        };
        let manufacturer_key = self
            .keys
            .private_key(key_type)
            .ok_or(ProtocolError::UnsupportedKeyType(key_type))?;

        // The MAC envelope must cover exactly the header this session issued;
        // the voucher keeps the compact (algorithm, tag) pair.
        let mac0 = message.0.hmac;
        if mac0.payload_bytes()? != header.as_bytes() {
            return Err(ProtocolError::HmacHeaderMismatch.into());
        }
        let header_hmac = HMac::from_parts(mac0.algorithm()?, mac0.tag().to_vec());

        let voucher = OwnershipVoucher::create(header, header_hmac, device_cert_chain, manufacturer_key, None)?;
        let guid = voucher.header()?.0.guid;
        self.vouchers.insert(voucher).await?;
        debug!("voucher stored for {guid}");

        self.sessions
            .write(
                SessionState::new(token.clone(), DiData::Done { has_succeeded: true }),
                false,
            )
            .await?;

        Ok(DiDoneKeyed {}.into())
    }
}

#[async_trait]
impl<S, G> ProtocolServer for Manufacturer<S, G>
where
    S: SessionStore<DiData>,
    G: Generator<Uuid> + Send + Sync,
{
    async fn process_message(
        &self,
        message_type: MessageType,
        body: Vec<u8>,
        token: Option<SessionToken>,
    ) -> Result<TransportResponse> {
        match message_type {
            MessageType::DiAppStart => {
                let (response, token) = self.process_app_start(cbor_deserialize(&body)?).await?;
                Ok(TransportResponse {
                    message_type: SetCredentials::MESSAGE_TYPE,
                    body: cbor_serialize(&response)?,
                    token: Some(token),
                })
            }
            MessageType::DiSetHmac => {
                let token = token.ok_or(ProtocolError::MissingSessionToken)?;
                let response = self.process_set_hmac(&token, cbor_deserialize(&body)?).await?;
                Ok(TransportResponse {
                    message_type: DiDone::MESSAGE_TYPE,
                    body: cbor_serialize(&response)?,
                    token: Some(token),
                })
            }
            other => Err(ProtocolError::UnexpectedMessageType {
                expected: MessageType::DiAppStart,
                found: other,
            }
            .into()),
        }
    }
}

#[cfg(any(test, feature = "generate"))]
pub mod ca {
    //! rcgen-backed device certificate issuance.

    use rcgen::{BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName, DnType, IsCa};
    use rustls_pki_types::CertificateSigningRequestDer;

    use crate::{errors::Error, keys::KeyError};

    use super::*;

    fn key_error(e: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Keys(KeyError::Decoding(Box::new(e)))
    }

    pub struct RcgenDeviceCa {
        ca_cert: rcgen::Certificate,
        ca_key: rcgen::KeyPair,
    }

    impl RcgenDeviceCa {
        pub fn new(ca_key: &crate::keys::KeyPair, common_name: &str) -> Result<Self> {
            let rcgen_key = rcgen::KeyPair::try_from(ca_key.to_pkcs8_der()?.as_slice()).map_err(key_error)?;

            let mut params = CertificateParams::default();
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, common_name);
            params.distinguished_name = dn;
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

            let ca_cert = params.self_signed(&rcgen_key).map_err(key_error)?;
            Ok(RcgenDeviceCa {
                ca_cert,
                ca_key: rcgen_key,
            })
        }
    }

    impl DeviceCertIssuer for RcgenDeviceCa {
        fn issue_chain(&self, csr: &[u8], _device_info: &str) -> Result<X5Chain> {
            let der = CertificateSigningRequestDer::from(csr.to_vec());
            let params = CertificateSigningRequestParams::from_der(&der).map_err(key_error)?;
            let cert = params.signed_by(&self.ca_cert, &self.ca_key).map_err(key_error)?;

            Ok(X5Chain::new(vec![cert.der().to_vec(), self.ca_cert.der().to_vec()]))
        }
    }

    /// Builds a PKCS#10 CSR for the device key, as sent in `AppStart`.
    pub fn generate_csr(device_key: &crate::keys::KeyPair, common_name: &str) -> Result<Vec<u8>> {
        let rcgen_key = rcgen::KeyPair::try_from(device_key.to_pkcs8_der()?.as_slice()).map_err(key_error)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;

        let csr = params.serialize_request(&rcgen_key).map_err(key_error)?;
        Ok(csr.der().to_vec())
    }
}
