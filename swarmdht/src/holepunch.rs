//! The cooperative NAT hole-punching state machine.
//!
//! A `scoped_task` fires periodic UDP datagrams at a peer's reflexive address until a reply
//! arrives or the attempt is dropped, driven as the full `NEW -> CLASSIFYING -> NEGOTIATING ->
//! PROBING -> LOCKED` state machine, with a firewall-pairing strategy table deciding which side
//! leads.

use crate::{
    error::{Error, Result},
    options::HolepunchOptions,
};
use scoped_task::ScopedJoinHandle;
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

/// A node's inferred NAT behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallClass {
    /// No NAT, or a NAT that accepts unsolicited inbound traffic on the mapped port.
    Open,
    /// Endpoint-independent mapping: the external port for a given local socket is stable across
    /// destinations, so a prediction-free punch works.
    Consistent,
    /// Endpoint-dependent mapping: the external port varies per destination, and hole-punching
    /// this side requires the peer to guess (or brute-force) ports.
    Random,
}

impl FirewallClass {
    /// Per the pairing table: two `Random` peers cannot punch through each other at all; every
    /// other combination has a usable strategy.
    pub fn can_punch(local: FirewallClass, remote: FirewallClass) -> bool {
        !matches!((local, remote), (FirewallClass::Random, FirewallClass::Random))
    }

    /// The numeric tag carried in a [`crate::wire::HolepunchPayload`].
    pub fn to_wire(self) -> u8 {
        match self {
            FirewallClass::Open => 0,
            FirewallClass::Consistent => 1,
            FirewallClass::Random => 2,
        }
    }

    /// The inverse of [`FirewallClass::to_wire`]; an unrecognized tag is treated as the most
    /// conservative classification.
    pub fn from_wire(tag: u8) -> Self {
        match tag {
            0 => FirewallClass::Open,
            1 => FirewallClass::Consistent,
            _ => FirewallClass::Random,
        }
    }
}

/// Which side leads the simultaneous-open probing burst, decided by the pairing table above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStrategy {
    /// Both sides send a synchronized burst at each other's reflexive address immediately.
    Simultaneous,
    /// The `Random`-classified side leads with a wider port fan-out while the other side holds a
    /// single predicted port open.
    PortPrediction,
}

impl ProbeStrategy {
    pub fn for_pair(local: FirewallClass, remote: FirewallClass) -> Option<Self> {
        use FirewallClass::*;
        if !FirewallClass::can_punch(local, remote) {
            return None;
        }
        match (local, remote) {
            (Open, _) | (_, Open) | (Consistent, Consistent) => Some(ProbeStrategy::Simultaneous),
            _ => Some(ProbeStrategy::PortPrediction),
        }
    }
}

/// Observable lifecycle of one hole-punch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolepunchState {
    New,
    Classifying,
    Negotiating,
    Probing,
    Locked,
    Closed,
    Vetoed,
    TimedOut,
}

/// Sends one UDP probe datagram. Implemented by whatever transport the embedding [`crate::dht::Dht`]
/// is using; kept minimal so this module stays transport-agnostic.
#[async_trait::async_trait]
pub trait ProbeSink: Send + Sync + 'static {
    async fn send_probe(&self, to: SocketAddr) -> Result<()>;
}

/// Drives one probing burst against `remote`: send a marker datagram every `probe_interval`,
/// `probe_count` times per round, for up to `probe_rounds` rounds, stopping early the moment
/// `locked` fires.
///
/// Returns `Ok(())` once `locked` resolves (a reply was observed by the caller's receive path),
/// or [`Error::HolepunchTimeout`] once the whole budget in [`HolepunchOptions::total_timeout`]
/// elapses.
#[instrument(skip(sink, locked), fields(remote = %remote))]
pub async fn run_probe_burst(
    sink: &dyn ProbeSink,
    remote: SocketAddr,
    options: &HolepunchOptions,
    mut locked: oneshot::Receiver<()>,
) -> Result<()> {
    for round in 0..options.probe_rounds {
        for _ in 0..options.probe_count {
            if sink.send_probe(remote).await.is_err() {
                warn!(round, "probe datagram failed to send, continuing burst");
            }

            tokio::select! {
                _ = &mut locked => {
                    debug!(round, "hole punched");
                    return Ok(());
                }
                _ = tokio::time::sleep(options.probe_interval) => {}
            }
        }
    }

    tokio::select! {
        _ = &mut locked => Ok(()),
        _ = tokio::time::sleep(options.rtt_max) => Err(Error::HolepunchTimeout),
    }
}

/// No pairing-table strategy exists for this attempt (a `Random`/`Random` pairing): there is
/// nothing to probe, but the attempt must still fail with the same `HolepunchTimeout` a doomed
/// real burst would eventually report, within the same bound, rather than an instant error a
/// remote peer has no wire code for (§8 B3).
pub async fn wait_out_unreachable(options: &HolepunchOptions) -> Error {
    tokio::time::sleep(options.total_timeout()).await;
    Error::HolepunchTimeout
}

/// Lets any `Arc`-wrapped transport double as a [`ProbeSink`] by forwarding to
/// [`crate::rpc::StreamTransport::send_probe`], so a `Connector`/`Server` can hand its shared
/// transport handle straight to [`Attempt::spawn_burst`] without a separate adapter type.
#[async_trait::async_trait]
impl<T: crate::rpc::StreamTransport> ProbeSink for std::sync::Arc<T> {
    async fn send_probe(&self, to: SocketAddr) -> Result<()> {
        crate::rpc::StreamTransport::send_probe(self.as_ref(), to).await
    }
}

/// Owns the background probing task for one in-flight attempt; dropping it cancels the burst via
/// the abort-on-drop discipline `scoped_task` gives every spawned task.
pub struct Attempt {
    state: HolepunchState,
    task: Option<ScopedJoinHandle<Result<()>>>,
}

impl Attempt {
    pub fn new() -> Self {
        Self {
            state: HolepunchState::New,
            task: None,
        }
    }

    pub fn state(&self) -> HolepunchState {
        self.state
    }

    /// Runs the veto hook against whatever is known before a relayed negotiation has confirmed
    /// the remote's real firewall class — `remote_hint` is a best guess, good enough for a user
    /// hook that only cares about the remote address, but not for picking a probing strategy.
    /// Transitions `Classifying -> Negotiating`, then to `Vetoed` on a refusal.
    pub fn veto(
        &mut self,
        local: FirewallClass,
        remote_hint: FirewallClass,
        remote_addr: SocketAddr,
        veto: impl FnOnce(FirewallClass, FirewallClass, SocketAddr) -> bool,
    ) -> Result<()> {
        self.state = HolepunchState::Classifying;
        self.state = HolepunchState::Negotiating;

        if !veto(local, remote_hint, remote_addr) {
            self.state = HolepunchState::Vetoed;
            return Err(Error::HolepunchAborted);
        }

        Ok(())
    }

    /// Looks up the pairing-table strategy for the firewall classes actually negotiated with the
    /// peer, and transitions into `Probing` regardless of the outcome — an unreachable pairing
    /// still has to run out its probing budget before failing (see [`wait_out_unreachable`]),
    /// not bail out of the state machine early.
    pub fn select_strategy(&mut self, local: FirewallClass, remote: FirewallClass) -> Option<ProbeStrategy> {
        self.state = HolepunchState::Probing;
        ProbeStrategy::for_pair(local, remote)
    }

    /// Marks a doomed (`Random`/`Random`) attempt as having run out its probing budget.
    pub fn mark_timed_out(&mut self) {
        self.state = HolepunchState::TimedOut;
        self.task = None;
    }

    pub fn spawn_burst(
        &mut self,
        sink: impl ProbeSink,
        remote: SocketAddr,
        options: HolepunchOptions,
        locked: oneshot::Receiver<()>,
    ) {
        let task = scoped_task::spawn(async move {
            run_probe_burst(&sink, remote, &options, locked).await
        });
        self.task = Some(task);
    }

    pub fn lock(&mut self) {
        self.state = HolepunchState::Locked;
    }

    pub fn close(&mut self) {
        if !matches!(self.state, HolepunchState::Locked) {
            self.state = HolepunchState::Closed;
        }
        self.task = None;
    }
}

impl Default for Attempt {
    fn default() -> Self {
        Self::new()
    }
}
