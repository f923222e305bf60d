//! External-collaborator trait boundaries.
//!
//! Three concerns are explicitly out of scope for this crate and are instead modeled as traits an
//! embedder plugs in: the Kademlia RPC/lookup layer (`DhtRpc`), the Noise_IK handshake + AEAD
//! stream cipher (`HandshakeCipher`), and the reliable UDP stream transport (`StreamTransport`).
//! Each stays behind a narrow trait boundary rather than having its logic folded into this crate.

use crate::{
    error::Result,
    identity::{Hash, PublicKey},
    wire::{Announce, Holepunch, MutableRecord, Peer},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::{SocketAddr, SocketAddrV4};
use tokio::sync::mpsc;

/// A single round-trip DHT query: "ask the network about `target`", abstracting away iterative
/// lookup, k-bucket maintenance, and request/reply framing.
#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    /// This node's id, `= hash(publicKey)` of whatever identity the RPC layer advertises.
    fn node_id(&self) -> Hash;

    /// Looks up the closest known peer record for `target`, if any node in the swarm has one.
    async fn find_peer(&self, target: Hash) -> Result<Option<Peer>>;

    /// Publishes (or refreshes) an announce record at `target` on the nodes closest to it.
    async fn put_announce(&self, target: Hash, announce: Announce) -> Result<()>;

    /// Removes a previously-announced record at `target`.
    async fn unannounce(&self, target: Hash, announce: Announce) -> Result<()>;

    /// Fetches the current mutable record stored at `target`, if any.
    async fn get_mutable(&self, target: Hash) -> Result<Option<MutableRecord>>;

    /// Publishes a mutable record at `target`, provided its `seq` beats whatever is already
    /// stored network-side.
    async fn put_mutable(&self, target: Hash, record: MutableRecord) -> Result<()>;

    /// Fetches an immutable value by its content hash.
    async fn get_immutable(&self, target: Hash) -> Result<Option<Vec<u8>>>;

    /// Publishes a content-addressed immutable value under the `target` the requester claims for
    /// it. A storing node must verify `target == hash(value)` itself rather than trusting the
    /// claim, since `target` arrives as part of the request envelope, not as something derivable
    /// purely from `value` until it is unpacked.
    async fn put_immutable(&self, target: Hash, value: Vec<u8>) -> Result<()>;

    /// Relays a hole-punch negotiation payload to the peer identified by `target`, used while no
    /// direct path exists yet.
    async fn relay_holepunch(&self, target: Hash, payload: Holepunch) -> Result<()>;

    /// Registers this node as the recipient of hole-punch messages relayed to `mailbox`, and
    /// returns a channel of `(senderNodeId, payload)` pairs as they arrive. `mailbox` is either a
    /// server's own target or a connector's ad hoc rendezvous id for one `connect()` call.
    /// Dropping the receiver unregisters the mailbox.
    fn holepunch_inbox(&self, mailbox: Hash) -> mpsc::UnboundedReceiver<(Hash, Holepunch)>;

    /// Joins the DHT via `nodes`; `ephemeral` is forwarded so a bootstrap peer knows not to
    /// insert this node into its own routing table. Defaults to a no-op, fitting an RPC layer
    /// that already joined eagerly at construction time.
    async fn bootstrap(&self, nodes: &[SocketAddr], ephemeral: bool) -> Result<()> {
        let _ = (nodes, ephemeral);
        Ok(())
    }

    /// Cheaply renews an already-announced record using a previously issued refresh token.
    /// Returns the replacement token, or `None` if the token is unknown or expired, in which case
    /// the caller should fall back to a fresh signed `put_announce`.
    async fn refresh_announce(&self, refresh: [u8; 32]) -> Result<Option<[u8; 32]>>;
}

/// The Noise_IK handshake and the AEAD transport cipher it derives, kept behind a trait so this
/// crate never touches raw key material itself.
///
/// An implementation owns exactly one handshake: `initiate`/`respond` consume `self` and return a
/// cipher for the resulting session, matching the one-shot nature of a Noise handshake object.
#[async_trait]
pub trait HandshakeCipher: Send + Sync + 'static {
    type Session: CipherSession;

    /// Runs the initiator side of Noise_IK against `remote_static`, the peer's known long-term
    /// public key.
    async fn initiate(self: Box<Self>, remote_static: &PublicKey) -> Result<Self::Session>;

    /// Runs the responder side, learning the remote's static key as part of the handshake.
    async fn respond(self: Box<Self>) -> Result<(PublicKey, Self::Session)>;
}

/// An established AEAD session used to encrypt/decrypt the application stream after the Noise
/// handshake completes. `split` hands out the send and receive directions separately (a real
/// Noise_IK handshake already produces two independent cipher states, one per direction), so a
/// socket's reader and writer tasks never need to share a lock to use them.
pub trait CipherSession: Send + Sync + 'static {
    fn split(self: Box<Self>) -> (Box<dyn Encryptor>, Box<dyn Decryptor>);
}

pub trait Encryptor: Send + Sync + 'static {
    fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8>;
}

pub trait Decryptor: Send + Sync + 'static {
    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// A reliable, ordered byte stream over UDP between two 5-tuples, the transport a hole-punch
/// attempt is racing to establish.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    type Stream: AsyncByteStream;

    /// Opens a stream to `remote`, assuming a direct (already-punched or relay-free) path.
    async fn connect(&self, remote: SocketAddr) -> Result<Self::Stream>;

    /// Accepts the next inbound stream on whatever local socket this transport owns.
    async fn accept(&self) -> Result<(Self::Stream, SocketAddr)>;

    /// Sends one bare hole-punch probe datagram to `remote` on the same local UDP socket this
    /// transport's streams ride on, without establishing a stream — a best-effort "knock" used to
    /// open or refresh a NAT mapping. A failed probe is not fatal to the burst it's part of.
    async fn send_probe(&self, remote: SocketAddr) -> Result<()>;

    /// This transport's own local candidate address, advertised to a peer during hole-punch
    /// negotiation.
    fn local_addr(&self) -> SocketAddrV4;
}

/// The minimal async byte-stream surface this crate needs from a transport's connection type.
///
/// `split` hands ownership of the two halves to independent tasks so a read loop and a writer can
/// run concurrently without contending on one lock.
pub trait AsyncByteStream: Send + Sync + 'static {
    fn split(self: Box<Self>) -> (Box<dyn ReadHalf>, Box<dyn crate::socket::WriteHalf>);
}

/// The read half of a split [`AsyncByteStream`].
#[async_trait]
pub trait ReadHalf: Send + Sync + 'static {
    async fn read(&mut self) -> Result<Option<Bytes>>;
}
