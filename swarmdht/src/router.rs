//! The router table: maps a locally-served target to the hooks a [`Server`]
//! registered for it.
//!
//! A dynamically-typed host can get away with `onconnect`/`onholepunch` callback fields assigned
//! directly onto a router entry, but in Rust that invites a cyclic `Box<dyn Fn>`-holding-a-
//! `Box<dyn Fn>` mess. Instead the router table stays a plain `HashMap` keyed by target, storing a
//! small tagged [`RouterAction`] enum that the [`crate::server::Server`] matches on, keeping
//! callback wiring out of the hot data structure.
//!
//! [`Server`]: crate::server::Server

use crate::{holepunch::FirewallClass, identity::Hash, options::HolepunchHook, wire::Peer};
use std::{collections::HashMap, net::SocketAddr};

/// What a router entry does with a connection attempt once it has been routed to the right
/// target.
pub enum RouterAction {
    /// Accept the inbound connection unconditionally; no hole-punch veto hook was registered.
    Accept,
    /// Run the registered veto hook before admitting a hole-punch attempt.
    Holepunch(HolepunchHook),
    /// Refuse the connection outright (the server closed this target but the router entry has
    /// not yet been pruned).
    Reject,
}

impl RouterAction {
    pub fn evaluate(
        &self,
        local: FirewallClass,
        remote: FirewallClass,
        remote_addr: SocketAddr,
    ) -> bool {
        match self {
            RouterAction::Accept => true,
            RouterAction::Holepunch(hook) => hook(local, remote, remote_addr),
            RouterAction::Reject => false,
        }
    }
}

struct RouterEntry {
    action: RouterAction,
    /// The peer record this entry's `Server` advertised on the network; a node serving as that
    /// server's relay answers `findPeer`/`lookup` against this target straight out of the router,
    /// without needing a round trip into the persistent store's announce LRU.
    record: Peer,
}

/// Maps a served target (`hash(serverPublicKey)`) to its [`RouterAction`] and advertised
/// [`Peer`] record, so an inbound connect or relayed hole-punch negotiation can be dispatched to
/// the right locally-listening server without the connector needing a handle to every `Server`
/// directly.
#[derive(Default)]
pub struct RouterTable {
    entries: HashMap<Hash, RouterEntry>,
}

impl RouterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, target: Hash, action: RouterAction, record: Peer) {
        self.entries.insert(target, RouterEntry { action, record });
    }

    pub fn remove(&mut self, target: &Hash) {
        self.entries.remove(target);
    }

    pub fn contains(&self, target: &Hash) -> bool {
        self.entries.contains_key(target)
    }

    /// The advertised record for a locally-served target, if any — what `findPeer` returns when
    /// this node is the one serving as the target's relay.
    pub fn record(&self, target: &Hash) -> Option<Peer> {
        self.entries.get(target).map(|entry| entry.record.clone())
    }

    pub fn evaluate(
        &self,
        target: &Hash,
        local: FirewallClass,
        remote: FirewallClass,
        remote_addr: SocketAddr,
    ) -> bool {
        match self.entries.get(target) {
            Some(entry) => entry.action.evaluate(local, remote, remote_addr),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
