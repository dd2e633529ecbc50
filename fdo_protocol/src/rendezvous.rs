//! Rendezvous directives from the voucher header, and the owner-address
//! blob (`To1d`) that a rendezvous service hands to devices.
//!
//! Directives are a two-level array: the device walks the outer entries in
//! order until one of them leads to a completed onboarding; within an entry
//! all instructions combine into a single contact description.

use std::fmt::Display;

use ciborium::value::Value;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_repr::{Deserialize_repr, Serialize_repr};
use url::Url;

use crate::{
    cose::TypedSign1,
    serialization::CborSeq,
    types::Hash,
};

#[derive(thiserror::Error, Debug)]
pub enum RendezvousError {
    #[error("instruction {0:?} carries a value of the wrong shape")]
    MalformedValue(RendezvousVariable),
    #[error("directive yields no contactable address")]
    NoAddress,
    #[error("invalid URL from directive: {0}")]
    Url(#[from] url::ParseError),
}

/// The variables an instruction may set.
#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RendezvousVariable {
    DeviceOnly = 0,
    OwnerOnly = 1,
    IpAddress = 2,
    DevicePort = 3,
    OwnerPort = 4,
    Dns = 5,
    Protocol = 12,
    DelaySeconds = 13,
    Bypass = 14,
    OwnerKeyHash = 15,
}

#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RendezvousProtocolValue {
    Http = 0,
    Https = 1,
}

pub type RendezvousInstruction = CborSeq<RendezvousInstructionKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RendezvousInstructionKeyed {
    pub variable: RendezvousVariable,
    pub value: Value,
}

impl RendezvousInstruction {
    pub fn new(variable: RendezvousVariable, value: Value) -> Self {
        RendezvousInstructionKeyed { variable, value }.into()
    }
}

/// All instructions of one outer entry, combined.
pub type RendezvousDirective = Vec<RendezvousInstruction>;

/// The full two-level directive array from the voucher header.
pub type RendezvousInfo = Vec<RendezvousDirective>;

/// Which role is interpreting a directive; some instructions apply to only
/// one of the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousInterpreterSide {
    Device,
    Owner,
}

/// One resolved contact attempt, in directive order.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactAttempt {
    pub url: Url,
    pub delay_seconds: u32,
    pub bypass_to1: bool,
    pub owner_key_hash: Option<Hash>,
}

fn value_as_u64(variable: RendezvousVariable, value: &Value) -> Result<u64, RendezvousError> {
    value
        .as_integer()
        .and_then(|i| u64::try_from(i).ok())
        .ok_or(RendezvousError::MalformedValue(variable))
}

fn value_as_text(variable: RendezvousVariable, value: &Value) -> Result<String, RendezvousError> {
    value
        .as_text()
        .map(str::to_string)
        .ok_or(RendezvousError::MalformedValue(variable))
}

/// Resolves the directives into an ordered list of contact attempts for the
/// given side. Entries addressed exclusively to the other side are skipped;
/// an entry without DNS name or IP address resolves to nothing.
pub fn contact_attempts(
    info: &RendezvousInfo,
    side: RendezvousInterpreterSide,
) -> Result<Vec<ContactAttempt>, RendezvousError> {
    let mut attempts = Vec::new();

    for directive in info {
        let mut protocol = RendezvousProtocolValue::Https;
        let mut dns: Option<String> = None;
        let mut ip: Option<String> = None;
        let mut port: Option<u16> = None;
        let mut delay_seconds = 0u32;
        let mut bypass_to1 = false;
        let mut owner_key_hash = None;
        let mut skip = false;

        for instruction in directive {
            let RendezvousInstructionKeyed { variable, value } = &instruction.0;
            match variable {
                RendezvousVariable::DeviceOnly => skip |= side != RendezvousInterpreterSide::Device,
                RendezvousVariable::OwnerOnly => skip |= side != RendezvousInterpreterSide::Owner,
                RendezvousVariable::IpAddress => ip = Some(value_as_text(*variable, value)?),
                RendezvousVariable::Dns => dns = Some(value_as_text(*variable, value)?),
                RendezvousVariable::DevicePort => {
                    if side == RendezvousInterpreterSide::Device {
                        port = Some(value_as_u64(*variable, value)? as u16);
                    }
                }
                RendezvousVariable::OwnerPort => {
                    if side == RendezvousInterpreterSide::Owner {
                        port = Some(value_as_u64(*variable, value)? as u16);
                    }
                }
                RendezvousVariable::Protocol => {
                    protocol = match value_as_u64(*variable, value)? {
                        0 => RendezvousProtocolValue::Http,
                        1 => RendezvousProtocolValue::Https,
                        _ => return Err(RendezvousError::MalformedValue(*variable)),
                    };
                }
                RendezvousVariable::DelaySeconds => delay_seconds = value_as_u64(*variable, value)? as u32,
                RendezvousVariable::Bypass => bypass_to1 = true,
                RendezvousVariable::OwnerKeyHash => {
                    let hash: Hash = value
                        .deserialized()
                        .map_err(|_| RendezvousError::MalformedValue(*variable))?;
                    owner_key_hash = Some(hash);
                }
            }
        }

        if skip {
            continue;
        }
        let Some(host) = dns.or(ip) else {
            continue;
        };

        let (scheme, default_port) = match protocol {
            RendezvousProtocolValue::Http => ("http", 80),
            RendezvousProtocolValue::Https => ("https", 443),
        };
        let url = Url::parse(&format!("{scheme}://{host}:{}/", port.unwrap_or(default_port)))?;

        attempts.push(ContactAttempt {
            url,
            delay_seconds,
            bypass_to1,
            owner_key_hash,
        });
    }

    if attempts.is_empty() {
        return Err(RendezvousError::NoAddress);
    }
    Ok(attempts)
}

/// Builds a single-directive [`RendezvousInfo`] pointing at one host.
pub fn single_directive(protocol: RendezvousProtocolValue, dns: &str, port: u16) -> RendezvousInfo {
    vec![vec![
        RendezvousInstruction::new(RendezvousVariable::Dns, Value::Text(dns.to_string())),
        RendezvousInstruction::new(RendezvousVariable::DevicePort, Value::Integer(port.into())),
        RendezvousInstruction::new(RendezvousVariable::OwnerPort, Value::Integer(port.into())),
        RendezvousInstruction::new(RendezvousVariable::Protocol, Value::Integer((protocol as u8).into())),
    ]]
}

/// Transport protocols for owner addresses in [`To1dPayload`].
#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportProtocol {
    Tcp = 1,
    Tls = 2,
    Http = 3,
    Https = 5,
}

/// One network address at which the owner accepts onboarding.
pub type To2AddressEntry = CborSeq<To2AddressEntryKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct To2AddressEntryKeyed {
    pub ip: Option<ByteBuf>,
    pub dns: Option<String>,
    pub port: u16,
    pub protocol: TransportProtocol,
}

impl To2AddressEntry {
    pub fn url(&self) -> Result<Url, RendezvousError> {
        let host = match (&self.0.dns, &self.0.ip) {
            (Some(dns), _) => dns.clone(),
            (None, Some(ip)) if ip.len() == 4 => format!("{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]),
            _ => return Err(RendezvousError::NoAddress),
        };
        let scheme = match self.0.protocol {
            TransportProtocol::Http | TransportProtocol::Tcp => "http",
            TransportProtocol::Tls | TransportProtocol::Https => "https",
        };
        Ok(Url::parse(&format!("{scheme}://{host}:{}/", self.0.port))?)
    }
}

/// The payload of the owner-address blob: the addresses plus the hash of the
/// registration (`to0d`) it was part of.
pub type To1dPayload = CborSeq<To1dPayloadKeyed>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct To1dPayloadKeyed {
    pub addresses: Vec<To2AddressEntry>,
    pub to0d_hash: Hash,
}

/// The owner-address blob: [`To1dPayload`] signed by the current owner key.
pub type To1d = TypedSign1<To1dPayload>;

impl Display for RendezvousVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
