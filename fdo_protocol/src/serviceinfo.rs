//! The ServiceInfo stream: bidirectional key/value exchange between device
//! and owner modules during ownership transfer. Keys have the form
//! `module:command`; each side dispatches incoming KVs to its registered
//! module of that name and polls its modules, in registration order, to fill
//! outgoing messages up to the peer's advertised MTU.
//!
//! A single KV is atomic: a value that cannot fit in one message is the
//! module's problem to chunk, not the core's.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tracing::debug;

use crate::serialization::{cbor_deserialize, cbor_serialize, CborError};

/// ServiceInfo message sizes are clamped to this range.
pub const MTU_MIN: u16 = 256;
pub const MTU_MAX: u16 = 65535;
pub const MTU_DEFAULT: u16 = 1300;

/// Fixed allowance for the message framing around the KV list.
pub const MESSAGE_OVERHEAD: usize = 16;

/// The effective outgoing budget against a peer that advertised `peer_mtu`.
pub fn effective_mtu(peer_mtu: Option<u16>) -> u16 {
    peer_mtu.unwrap_or(MTU_DEFAULT).clamp(MTU_MIN, MTU_MAX)
}

#[derive(thiserror::Error, Debug)]
pub enum ServiceInfoError {
    #[error("no module registered under {0}")]
    UnknownModule(String),
    #[error("malformed ServiceInfo key {0}")]
    MalformedKey(String),
    #[error("malformed value for an `active` command")]
    MalformedActive,
    #[error("single value of {size} bytes exceeds the peer MTU of {mtu}")]
    OversizedValue { size: usize, mtu: usize },
    #[error("module {module} failed: {message}")]
    Module { module: String, message: String },
    #[error("transfer aborted by module {module}: {message}")]
    TransferError { module: String, message: String },
    #[error("CBOR error in ServiceInfo: {0}")]
    Cbor(#[from] CborError),
}

/// One key/value chunk. Serialized as `[key, value]`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfoKv(String, ByteBuf);

impl ServiceInfoKv {
    pub fn new(module: &str, command: &str, value: Vec<u8>) -> Self {
        ServiceInfoKv(format!("{module}:{command}"), ByteBuf::from(value))
    }

    pub fn key(&self) -> &str {
        &self.0
    }

    pub fn module_and_command(&self) -> Result<(&str, &str), ServiceInfoError> {
        self.0
            .split_once(':')
            .ok_or_else(|| ServiceInfoError::MalformedKey(self.0.clone()))
    }

    pub fn value(&self) -> &[u8] {
        &self.1
    }

    fn serialized_size(&self) -> usize {
        // Exact size of this KV as part of a message.
        cbor_serialize(self).map(|bts| bts.len()).unwrap_or(usize::MAX)
    }
}

/// The KV list of one ServiceInfo message.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceInfo(pub Vec<ServiceInfoKv>);

impl ServiceInfo {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The well-known command that switches a module on or off.
pub const ACTIVE_COMMAND: &str = "active";

pub fn active_value(active: bool) -> Vec<u8> {
    cbor_serialize(&active).expect("bool serialization cannot fail")
}

/// Collects a module's outgoing KVs against the remaining MTU budget.
pub struct ServiceInfoProducer<'a> {
    module: &'a str,
    budget: usize,
    used: &'a mut usize,
    out: &'a mut Vec<ServiceInfoKv>,
    full: bool,
}

impl ServiceInfoProducer<'_> {
    /// Queues one KV. Returns `false` without queueing when the message is
    /// full: the module should offer the same KV again next turn. A KV that
    /// could never fit in an empty message is an error.
    pub fn add(&mut self, command: &str, value: Vec<u8>) -> Result<bool, ServiceInfoError> {
        let kv = ServiceInfoKv::new(self.module, command, value);
        let size = kv.serialized_size();
        if size + MESSAGE_OVERHEAD > self.budget {
            return Err(ServiceInfoError::OversizedValue {
                size,
                mtu: self.budget,
            });
        }
        if *self.used + size + MESSAGE_OVERHEAD > self.budget {
            self.full = true;
            return Ok(false);
        }
        *self.used += size;
        self.out.push(kv);
        Ok(true)
    }

    pub fn is_full(&self) -> bool {
        self.full
    }
}

/// What an owner module reports after producing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleDirective {
    /// The peer must send a message before this module produces more.
    pub block_peer: bool,
    /// This module has nothing further to contribute, ever.
    pub module_done: bool,
}

/// An owner-side ServiceInfo module.
pub trait OwnerModule: Send {
    fn name(&self) -> &str;

    /// Consumes one incoming KV addressed to this module.
    fn handle_info(&mut self, command: &str, value: &[u8]) -> Result<(), ServiceInfoError>;

    /// Produces outgoing KVs while the scheduler polls it.
    fn produce_info(&mut self, producer: &mut ServiceInfoProducer) -> Result<ModuleDirective, ServiceInfoError>;
}

/// What a device module reports from its yield callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceYield {
    /// Nothing to say right now, but not finished.
    NotNow,
    /// Nothing further to contribute.
    Done,
}

/// A device-side ServiceInfo module.
pub trait DeviceModule: Send {
    fn name(&self) -> &str;

    /// Called when the module is switched on or off by an `active` command.
    fn transition(&mut self, active: bool) -> Result<(), ServiceInfoError>;

    /// Consumes one incoming KV; replies go through `responder` with a
    /// command of the module's choosing.
    fn receive(
        &mut self,
        command: &str,
        value: &[u8],
        responder: &mut ServiceInfoProducer,
    ) -> Result<(), ServiceInfoError>;

    /// Proactively produce KVs when the peer is not speaking.
    fn yield_info(&mut self, responder: &mut ServiceInfoProducer) -> Result<DeviceYield, ServiceInfoError>;
}

struct RegisteredDeviceModule {
    module: Box<dyn DeviceModule>,
    active: bool,
    done: bool,
}

/// The device side of the stream: routes incoming KVs, polls modules for
/// replies, and reports when every module is finished.
pub struct DeviceModuleRegistry {
    modules: Vec<RegisteredDeviceModule>,
}

impl DeviceModuleRegistry {
    pub fn new(modules: Vec<Box<dyn DeviceModule>>) -> Self {
        DeviceModuleRegistry {
            modules: modules
                .into_iter()
                .map(|module| RegisteredDeviceModule {
                    module,
                    active: false,
                    done: false,
                })
                .collect(),
        }
    }

    fn position(&mut self, name: &str) -> Result<&mut RegisteredDeviceModule, ServiceInfoError> {
        self.modules
            .iter_mut()
            .find(|entry| entry.module.name() == name)
            .ok_or_else(|| ServiceInfoError::UnknownModule(name.to_string()))
    }

    /// Processes one incoming message and assembles the reply. Returns the
    /// outgoing KVs and whether the device side is done.
    pub fn handle_turn(&mut self, incoming: &ServiceInfo, mtu: u16) -> Result<(ServiceInfo, bool), ServiceInfoError> {
        let budget = mtu as usize;
        let mut used = 0usize;
        let mut out = Vec::new();

        for kv in &incoming.0 {
            let (module_name, command) = kv.module_and_command()?;
            let module_name = module_name.to_string();
            let entry = self.position(&module_name)?;

            if command == ACTIVE_COMMAND {
                let active: bool = cbor_deserialize(kv.value()).map_err(|_| ServiceInfoError::MalformedActive)?;
                debug!("module {module_name}: active = {active}");
                entry.active = active;
                entry.module.transition(active)?;
                continue;
            }

            let mut responder = ServiceInfoProducer {
                module: &module_name,
                budget,
                used: &mut used,
                out: &mut out,
                full: false,
            };
            entry.module.receive(command, kv.value(), &mut responder)?;
        }

        // Give every active module a chance to speak on its own initiative.
        for index in 0..self.modules.len() {
            let (name, active, done) = {
                let entry = &self.modules[index];
                (entry.module.name().to_string(), entry.active, entry.done)
            };
            if !active || done {
                continue;
            }
            let mut responder = ServiceInfoProducer {
                module: &name,
                budget,
                used: &mut used,
                out: &mut out,
                full: false,
            };
            let result = self.modules[index].module.yield_info(&mut responder)?;
            if matches!(result, DeviceYield::Done) {
                self.modules[index].done = true;
            }
        }

        let device_done = self
            .modules
            .iter()
            .all(|entry| !entry.active || entry.done);
        Ok((ServiceInfo(out), device_done))
    }
}

struct RegisteredOwnerModule {
    module: Box<dyn OwnerModule>,
    activated: bool,
    blocked: bool,
    done: bool,
}

/// The owner side of the stream: dispatches device KVs and fills outgoing
/// messages module by module, in stable registration order, until the MTU
/// budget is spent or every module is done.
pub struct OwnerModuleScheduler {
    modules: Vec<RegisteredOwnerModule>,
}

impl OwnerModuleScheduler {
    pub fn new(modules: Vec<Box<dyn OwnerModule>>) -> Self {
        OwnerModuleScheduler {
            modules: modules
                .into_iter()
                .map(|module| RegisteredOwnerModule {
                    module,
                    activated: false,
                    blocked: false,
                    done: false,
                })
                .collect(),
        }
    }

    /// Processes the device's message and produces the owner's next one.
    /// Returns the outgoing KVs and whether the owner side is done.
    pub fn next_message(&mut self, incoming: &ServiceInfo, mtu: u16) -> Result<(ServiceInfo, bool), ServiceInfoError> {
        // A message from the peer unblocks every module that asked to wait.
        for entry in &mut self.modules {
            entry.blocked = false;
        }

        for kv in &incoming.0 {
            let (module_name, command) = kv.module_and_command()?;
            let entry = self
                .modules
                .iter_mut()
                .find(|entry| entry.module.name() == module_name)
                .ok_or_else(|| ServiceInfoError::UnknownModule(module_name.to_string()))?;
            entry.module.handle_info(command, kv.value())?;
        }

        let budget = mtu as usize;
        let mut used = 0usize;
        let mut out = Vec::new();
        let mut message_full = false;

        for entry in &mut self.modules {
            if entry.done || entry.blocked || message_full {
                continue;
            }

            let name = entry.module.name().to_string();
            if !entry.activated {
                // Activate before the first real KV.
                let kv = ServiceInfoKv::new(&name, ACTIVE_COMMAND, active_value(true));
                used += kv.serialized_size();
                out.push(kv);
                entry.activated = true;
            }

            let mut producer = ServiceInfoProducer {
                module: &name,
                budget,
                used: &mut used,
                out: &mut out,
                full: false,
            };
            let directive = entry.module.produce_info(&mut producer)?;
            message_full = producer.is_full();
            entry.blocked = directive.block_peer;
            entry.done = directive.module_done;
        }

        let owner_done = self.modules.iter().all(|entry| entry.done) && !message_full;
        Ok((ServiceInfo(out), owner_done))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    /// Owner module that streams a payload in fixed-size chunks, waiting for
    /// an ack after each one.
    struct ChunkSender {
        name: String,
        data: Vec<u8>,
        chunk_size: usize,
        offset: usize,
        acked: usize,
        begun: bool,
    }

    impl OwnerModule for ChunkSender {
        fn name(&self) -> &str {
            &self.name
        }

        fn handle_info(&mut self, command: &str, _value: &[u8]) -> Result<(), ServiceInfoError> {
            if command == "ack" {
                self.acked += 1;
            }
            Ok(())
        }

        fn produce_info(&mut self, producer: &mut ServiceInfoProducer) -> Result<ModuleDirective, ServiceInfoError> {
            if !self.begun {
                producer.add("begin", cbor_serialize(&(self.data.len() as u64))?)?;
                self.begun = true;
            }
            if self.offset < self.data.len() {
                let end = (self.offset + self.chunk_size).min(self.data.len());
                if producer.add("data", self.data[self.offset..end].to_vec())? {
                    self.offset = end;
                }
                // Wait for the ack before the next chunk.
                return Ok(ModuleDirective {
                    block_peer: true,
                    module_done: false,
                });
            }
            producer.add("end", Vec::new())?;
            Ok(ModuleDirective {
                block_peer: false,
                module_done: true,
            })
        }
    }

    /// Device module that collects the chunks and acks each one.
    struct ChunkReceiver {
        name: String,
        received: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
        ended: bool,
        pending_ack: bool,
        active: bool,
    }

    impl ChunkReceiver {
        fn new(name: &str) -> (Self, std::sync::Arc<std::sync::Mutex<Vec<u8>>>) {
            let received = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
            let receiver = ChunkReceiver {
                name: name.to_string(),
                received: received.clone(),
                ended: false,
                pending_ack: false,
                active: false,
            };
            (receiver, received)
        }
    }

    impl DeviceModule for ChunkReceiver {
        fn name(&self) -> &str {
            &self.name
        }

        fn transition(&mut self, active: bool) -> Result<(), ServiceInfoError> {
            self.active = active;
            Ok(())
        }

        fn receive(
            &mut self,
            command: &str,
            value: &[u8],
            _responder: &mut ServiceInfoProducer,
        ) -> Result<(), ServiceInfoError> {
            match command {
                "begin" => {}
                "data" => {
                    self.received.lock().unwrap().extend_from_slice(value);
                    self.pending_ack = true;
                }
                "end" => self.ended = true,
                other => {
                    return Err(ServiceInfoError::Module {
                        module: self.name.clone(),
                        message: format!("unknown command {other}"),
                    })
                }
            }
            Ok(())
        }

        fn yield_info(&mut self, responder: &mut ServiceInfoProducer) -> Result<DeviceYield, ServiceInfoError> {
            if self.pending_ack {
                responder.add("ack", Vec::new())?;
                self.pending_ack = false;
            }
            if self.ended {
                return Ok(DeviceYield::Done);
            }
            Ok(DeviceYield::NotNow)
        }
    }

    fn run_stream(payload_len: usize, chunk_size: usize, mtu: u16) -> (Vec<u8>, usize) {
        let payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();

        let mut owner = OwnerModuleScheduler::new(vec![Box::new(ChunkSender {
            name: "fdo.download".to_string(),
            data: payload.clone(),
            chunk_size,
            offset: 0,
            acked: 0,
            begun: false,
        })]);
        let (receiver, received) = ChunkReceiver::new("fdo.download");
        let mut device = DeviceModuleRegistry::new(vec![Box::new(receiver)]);

        let mut device_message = ServiceInfo::default();
        let mut rounds = 0;
        loop {
            rounds += 1;
            assert!(rounds < 100, "stream did not converge");

            let (owner_message, owner_done) = owner.next_message(&device_message, mtu).unwrap();
            let (next_device_message, device_done) = device.handle_turn(&owner_message, mtu).unwrap();
            device_message = next_device_message;

            if owner_done && device_done && device_message.is_empty() {
                break;
            }
        }

        let received = received.lock().unwrap().clone();
        (received, rounds)
    }

    #[test]
    fn chunked_transfer_delivers_in_order() {
        let (received, _) = run_stream(4096, 1366, 1500);
        let expected: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn ack_cadence_paces_the_sender() {
        // One data chunk per round: blockPeer forces a device turn between chunks.
        let (received, rounds) = run_stream(1000, 100, 1500);
        assert_eq!(received.len(), 1000);
        assert!(rounds >= 10, "expected at least one round per chunk, got {rounds}");
    }

    #[test]
    fn oversized_value_is_rejected_before_sending() {
        let mut owner = OwnerModuleScheduler::new(vec![Box::new(ChunkSender {
            name: "fdo.download".to_string(),
            data: vec![0u8; 4096],
            chunk_size: 4096,
            offset: 0,
            acked: 0,
            begun: true,
        })]);

        assert_matches!(
            owner.next_message(&ServiceInfo::default(), 1200),
            Err(ServiceInfoError::OversizedValue { .. })
        );
    }

    #[test]
    fn unknown_module_is_an_error() {
        let mut device = DeviceModuleRegistry::new(vec![]);
        let incoming = ServiceInfo(vec![ServiceInfoKv::new("fdo.wifi", "ssid", Vec::new())]);
        assert_matches!(
            device.handle_turn(&incoming, 1300),
            Err(ServiceInfoError::UnknownModule(name)) if name == "fdo.wifi"
        );
    }

    #[test]
    fn malformed_key_is_an_error() {
        let mut device = DeviceModuleRegistry::new(vec![]);
        let incoming = ServiceInfo(vec![ServiceInfoKv("no-colon".to_string(), ByteBuf::new())]);
        assert_matches!(
            device.handle_turn(&incoming, 1300),
            Err(ServiceInfoError::MalformedKey(_))
        );
    }

    #[test]
    fn effective_mtu_clamps() {
        assert_eq!(effective_mtu(None), MTU_DEFAULT);
        assert_eq!(effective_mtu(Some(100)), MTU_MIN);
        assert_eq!(effective_mtu(Some(1200)), 1200);
    }
}
