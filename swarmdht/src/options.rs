//! Typed configuration. There is no argument-parsing crate
//! here: this is a library, and its embedder constructs [`DhtOptions`]/[`ServerOptions`]/
//! [`ConnectOptions`] programmatically.

use crate::holepunch::FirewallClass;
use bytes::Bytes;
use std::{net::SocketAddr, sync::Arc, time::Duration};

/// Options for a whole [`crate::dht::Dht`] node.
#[derive(Clone)]
pub struct DhtOptions {
    /// Bootstrap nodes used to join the DHT.
    pub bootstrap: Vec<SocketAddr>,
    /// An ephemeral node does not get inserted into other nodes' routing tables.
    pub ephemeral: bool,
    /// Skip active firewall classification and trust the relay's reflexive-address report.
    pub quick_firewall: bool,
    /// Advertise local LAN addresses in announced records, enabling same-LAN shortcuts.
    pub share_local_address: bool,
    /// Persistent store capacity, shared across the announce, mutable and immutable caches.
    pub max_size: usize,
    /// Maximum age of a stored record before it is evicted regardless of LRU order.
    pub max_age: Duration,
    /// Per-hop RPC timeout used by lookups and relayed requests.
    pub rpc_timeout: Duration,
    /// Hole-punch probing parameters.
    pub holepunch: HolepunchOptions,
}

impl Default for DhtOptions {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            ephemeral: false,
            quick_firewall: false,
            share_local_address: false,
            max_size: 10_000,
            max_age: Duration::from_secs(30 * 60),
            rpc_timeout: Duration::from_secs(4),
            holepunch: HolepunchOptions::default(),
        }
    }
}

/// Hole-punch probing parameters.
#[derive(Clone, Copy)]
pub struct HolepunchOptions {
    /// Datagrams sent per burst (`N`).
    pub probe_count: u8,
    /// Interval between datagrams within a burst (`Δ`).
    pub probe_interval: Duration,
    /// Number of bursts retried before giving up (`K`).
    pub probe_rounds: u8,
    /// Extra slack added on top of `K·N·Δ` to account for relay + network RTT.
    pub rtt_max: Duration,
}

impl HolepunchOptions {
    /// `K·N·Δ + RTTmax`: the full burst schedule plus one last round-trip's worth of slack.
    pub fn total_timeout(&self) -> Duration {
        self.probe_interval * (self.probe_count as u32) * (self.probe_rounds as u32) + self.rtt_max
    }
}

impl Default for HolepunchOptions {
    fn default() -> Self {
        Self {
            probe_count: 6,
            probe_interval: Duration::from_millis(50),
            probe_rounds: 4,
            rtt_max: Duration::from_millis(500),
        }
    }
}

/// Hook vetoing a hole-punch before probing starts.
///
/// Takes the local and remote firewall classifications and the remote candidate address about to
/// be probed; returning `false` aborts the connection attempt with
/// [`crate::error::Error::HolepunchAborted`].
pub type HolepunchHook =
    Arc<dyn Fn(FirewallClass, FirewallClass, SocketAddr) -> bool + Send + Sync + 'static>;

/// Hook run by a [`crate::server::Server`] on each inbound connection attempt, prior to
/// hole-punching.
pub type FirewallHook = Arc<dyn Fn(SocketAddr) -> bool + Send + Sync + 'static>;

/// Per-`listen()` options for a [`crate::server::Server`].
#[derive(Clone, Default)]
pub struct ServerOptions {
    pub firewall: Option<FirewallHook>,
    pub holepunch: Option<HolepunchHook>,
}

/// Per-`connect()` options for a [`crate::connector::Connector`].
#[derive(Clone)]
pub struct ConnectOptions {
    /// Piggyback the first application write onto the final handshake message.
    pub fast_open: bool,
    /// The payload to piggyback when `fast_open` is set. Ignored if `fast_open` is `false` or this
    /// is `None`.
    pub initial_payload: Option<Bytes>,
    pub holepunch: Option<HolepunchHook>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            fast_open: true,
            initial_payload: None,
            holepunch: None,
        }
    }
}
