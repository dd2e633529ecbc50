//! Device onboarding: the protocol runtime binding unprovisioned devices to
//! remote owners over untrusted transports, with a rendezvous service
//! mediating discovery.
//!
//! The crate is organized around the four protocol phases (initialization in
//! [`manufacturer`]/[`device`], rendezvous registration and lookup in
//! [`owner`]/[`rendezvous_server`], and the ownership transfer spanning
//! [`device`] and [`owner`]), with the data model ([`voucher`],
//! [`credential`], [`delegate`], [`publickey`]) and the CBOR/COSE plumbing
//! ([`serialization`], [`cose`], [`crypto`]) underneath. Transports and
//! stores are collaborator interfaces; see [`transport`] and [`store`].

pub mod cose;
pub mod credential;
pub mod crypto;
pub mod delegate;
pub mod device;
pub mod errors;
pub mod keys;
pub mod manufacturer;
pub mod messages;
pub mod owner;
pub mod publickey;
pub mod rendezvous;
pub mod rendezvous_server;
pub mod serialization;
pub mod server_state;
pub mod serviceinfo;
pub mod store;
pub mod transport;
pub mod types;
pub mod voucher;

pub use errors::{Error, Result};

#[cfg(test)]
mod tests;
