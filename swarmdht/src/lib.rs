//! Authenticated, end-to-end encrypted peer connections over a Kademlia-style DHT, with
//! cooperative UDP hole-punching mediated by a well-known relay node.
//!
//! This crate implements the connection-establishment subsystem of such an overlay: the
//! [`store`] that backs announce/mutable/immutable lookups, the [`router`] table a listening
//! [`server::Server`] installs itself into, the [`connector::Connector`] state machine that
//! looks a remote identity up and negotiates a direct path to it, and the [`holepunch`]
//! state machine that actually gets two NATted peers talking on one UDP 5-tuple. The Kademlia
//! RPC layer, the Noise_IK handshake/AEAD cipher, and the reliable UDP stream transport are
//! external collaborators, represented here as the traits in [`rpc`] so this crate can be built
//! and tested without a concrete instance of any of them.
//!
//! The [`dht::Dht`] handle ties the pieces together and is the type an embedder constructs.

mod admission;
mod connector;
pub mod dht;
pub mod error;
pub mod holepunch;
pub mod identity;
pub mod options;
mod router;
pub mod rpc;
pub mod server;
pub mod socket;
mod store;
pub mod wire;

pub use connector::{Connector, ConnectorState};
pub use dht::Dht;
pub use error::{Error, Result, WireError};
pub use holepunch::FirewallClass;
pub use identity::{Hash, Keypair, PublicKey};
pub use options::{ConnectOptions, DhtOptions, HolepunchOptions, ServerOptions};
pub use server::Server;
pub use socket::{Socket, SocketEvent};

#[cfg(test)]
pub(crate) mod test_support;

/// End-to-end scenarios driven against the in-memory doubles in [`test_support`]. Kept
/// in-crate rather than under `tests/` because the doubles reach into private modules
/// (`store`) that an external test crate cannot see.
#[cfg(test)]
mod integration_tests;
