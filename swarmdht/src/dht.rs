//! The top-level `Dht` handle: the entry point an embedder constructs once per
//! node, owning the persistent store, router table, and the three injected collaborators.
//!
//! A cheap `Dht` handle wraps an `Arc<Inner>` so `create_server`/`connect` can be called
//! concurrently from many call sites while sharing one store and router table.

use crate::{
    connector::Connector,
    error::{Error, Result},
    holepunch::FirewallClass,
    identity::{Keypair, PublicKey, Sig64},
    options::{ConnectOptions, DhtOptions, ServerOptions},
    router::RouterTable,
    rpc::{DhtRpc, HandshakeCipher, StreamTransport},
    server::Server,
    socket::Socket,
    store::PersistentStore,
    wire::{Announce, MutableRecord, Peer},
};
use std::{
    net::SocketAddrV4,
    sync::{Arc, Mutex},
};
use tracing::instrument;

/// Cap on the number of records [`Dht::handle_lookup`] returns for one target, matching
/// [`crate::store::PersistentStore`]'s own `lookup` limit.
const LOOKUP_LIMIT: usize = 20;

struct Inner<Rpc, Transport, Cipher> {
    keypair: Keypair,
    rpc: Arc<Rpc>,
    transport: Arc<Transport>,
    cipher_template: Cipher,
    store: Mutex<PersistentStore>,
    router: Arc<Mutex<RouterTable>>,
    options: DhtOptions,
    firewall: Mutex<Option<FirewallClass>>,
}

/// A single DHT node's handle, generic over the three external collaborators it was built with:
/// the DHT RPC layer, the handshake cipher, and the stream transport.
///
/// Cheap to clone: every clone shares the same store, router table and collaborators through one
/// `Arc<Inner>`.
pub struct Dht<Rpc, Transport, Cipher> {
    inner: Arc<Inner<Rpc, Transport, Cipher>>,
}

impl<Rpc, Transport, Cipher> Clone for Dht<Rpc, Transport, Cipher> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Rpc, Transport, Cipher> Dht<Rpc, Transport, Cipher>
where
    Rpc: DhtRpc,
    Transport: StreamTransport,
    Cipher: HandshakeCipher + Clone,
{
    /// `new(options)`: takes ownership of the three collaborators and a local keypair, and
    /// constructs the store/router the rest of this node's lifetime shares.
    pub fn new(
        keypair: Keypair,
        rpc: Rpc,
        transport: Transport,
        cipher_template: Cipher,
        options: DhtOptions,
    ) -> Self {
        let store = PersistentStore::new(options.max_size, options.max_age);
        Self {
            inner: Arc::new(Inner {
                keypair,
                rpc: Arc::new(rpc),
                transport: Arc::new(transport),
                cipher_template,
                store: Mutex::new(store),
                router: Arc::new(Mutex::new(RouterTable::new())),
                options,
                firewall: Mutex::new(None),
            }),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.inner.keypair.public_key()
    }

    /// The last firewall classification performed for this node, if any. `None` before the first
    /// classification completes or when `quick_firewall` skips it in favor of the relay's
    /// reflexive-address report.
    pub fn firewalled(&self) -> Option<FirewallClass> {
        *self.inner.firewall.lock().unwrap()
    }

    /// Records a firewall classification result. Called by whatever external classification flow
    /// (relay round-trip probing) the embedder runs; this crate only stores the outcome.
    pub fn set_firewalled(&self, class: FirewallClass) {
        *self.inner.firewall.lock().unwrap() = class.into();
    }

    /// Creates and starts listening on a new server identity.
    #[instrument(skip(self, keypair, options))]
    pub fn create_server(
        &self,
        keypair: Keypair,
        relay_addresses: Vec<SocketAddrV4>,
        options: ServerOptions,
    ) -> Server<Transport> {
        let local_firewall = self.firewalled().unwrap_or(FirewallClass::Random);
        Server::start(
            Arc::new(keypair),
            self.inner.rpc.clone(),
            self.inner.transport.clone(),
            self.inner.cipher_template.clone(),
            self.inner.router.clone(),
            local_firewall,
            relay_addresses,
            self.inner.options.holepunch,
            options,
        )
    }

    /// Connects to a remote identity by its public key.
    #[instrument(skip(self, options), fields(target = %public_key.target()))]
    pub async fn connect(&self, public_key: PublicKey, options: ConnectOptions) -> Result<Socket> {
        let local_firewall = self.firewalled().unwrap_or(FirewallClass::Random);
        let connector = Connector::new(
            self.inner.rpc.clone(),
            self.inner.transport.clone(),
            self.inner.cipher_template.clone(),
            local_firewall,
            self.inner.options.rpc_timeout,
            self.inner.options.holepunch,
        );
        connector
            .connect(public_key, &self.inner.keypair, &options)
            .await
    }

    /// This node's own id, `= hash(publicKey)` of whatever identity the RPC layer advertises. The
    /// actual host/port pair is a transport concern and lives on whatever `Transport` the embedder
    /// constructed.
    pub fn node_id(&self) -> crate::identity::Hash {
        self.inner.rpc.node_id()
    }

    pub fn options(&self) -> &DhtOptions {
        &self.inner.options
    }

    /// Handler for an inbound `LOOKUP` request: up to [`LOOKUP_LIMIT`] live announce records for
    /// `target` from the persistent store, with this node's own router record for `target`
    /// appended if it hosts a matching `Server` and room remains.
    pub fn handle_lookup(&self, target: crate::identity::Hash) -> Vec<Peer> {
        let mut peers = self.inner.store.lock().unwrap().lookup(target);
        if peers.len() < LOOKUP_LIMIT {
            if let Some(record) = self.inner.router.lock().unwrap().record(&target) {
                if !peers.iter().any(|peer| peer.public_key == record.public_key) {
                    peers.push(record);
                }
            }
        }
        peers
    }

    /// Handler for an inbound `FIND_PEER` request: the record this node's router holds for
    /// `target`, i.e. whether this node itself is currently serving as `target`'s relay. Unlike
    /// `lookup`, this never consults the persistent store's announce LRU — a single targeted
    /// fetch, not a fan-out collect.
    pub fn handle_find_peer(&self, target: crate::identity::Hash) -> Option<Peer> {
        self.inner.router.lock().unwrap().record(&target)
    }

    /// Handler for an inbound `ANNOUNCE` request. A refresh-only payload is redeemed against the
    /// single-use refresh-token table; otherwise the signed announce is verified and installed.
    /// Returns the renewed record and its replacement token when this was a refresh. Per the
    /// silent-drop policy (§4.1/§7), a malformed payload or a failed signature check is swallowed
    /// rather than surfaced as an error.
    #[instrument(skip(self, token, announce), fields(target = %target))]
    pub fn handle_announce(
        &self,
        target: crate::identity::Hash,
        token: &[u8],
        announce: Announce,
    ) -> Result<Option<(Peer, [u8; 32])>> {
        if announce.is_refresh_only() {
            let refresh = announce
                .refresh
                .expect("is_refresh_only guarantees refresh is present");
            return Ok(self.inner.store.lock().unwrap().refresh(&refresh));
        }

        let (peer, signature) = match (announce.peer, announce.signature) {
            (Some(peer), Some(signature)) => (peer, signature),
            _ => return Ok(None),
        };

        let node_id = self.node_id();
        let result = self.inner.store.lock().unwrap().apply_announce(
            target,
            node_id,
            token,
            peer,
            announce.refresh,
            &signature,
        );
        swallow_validation_failure(result)?;
        Ok(None)
    }

    /// Handler for an inbound `UNANNOUNCE` request. Already silent on a bad signature or an
    /// unknown announcer by construction — see [`crate::store::PersistentStore::unannounce`].
    pub fn handle_unannounce(
        &self,
        target: crate::identity::Hash,
        token: &[u8],
        peer: &Peer,
        signature: &Sig64,
    ) {
        let node_id = self.node_id();
        self.inner
            .store
            .lock()
            .unwrap()
            .unannounce(target, node_id, token, peer, signature);
    }

    /// Handler for an inbound `MUTABLE_GET` request.
    pub fn handle_mutable_get(
        &self,
        target: crate::identity::Hash,
        requested_seq: u64,
    ) -> Option<MutableRecord> {
        self.inner.store.lock().unwrap().mutable_get(target, requested_seq)
    }

    /// Handler for an inbound `MUTABLE_PUT` request. `SEQ_REUSED`/`SEQ_TOO_LOW` propagate as
    /// typed errors to aid the writer; every other validation failure is silently dropped.
    pub fn handle_mutable_put(&self, record: MutableRecord) -> Result<()> {
        let result = self.inner.store.lock().unwrap().mutable_put(record);
        swallow_validation_failure(result)
    }

    /// Handler for an inbound `IMMUTABLE_GET` request.
    pub fn handle_immutable_get(&self, target: crate::identity::Hash) -> Option<Vec<u8>> {
        self.inner.store.lock().unwrap().immutable_get(target)
    }

    /// Handler for an inbound `IMMUTABLE_PUT` request. A `target` that doesn't match
    /// `hash(value)` is silently dropped rather than surfaced.
    pub fn handle_immutable_put(&self, target: crate::identity::Hash, value: Vec<u8>) -> Result<()> {
        let result = self.inner.store.lock().unwrap().immutable_put(target, value);
        swallow_validation_failure(result)
    }
}

/// Every validation failure is a silent drop except `SeqReused`/`SeqTooLow`, which a writer needs
/// back to correct its next attempt (§4.1's handler policy).
fn swallow_validation_failure(result: Result<()>) -> Result<()> {
    match result {
        Err(Error::SeqReused { .. }) | Err(Error::SeqTooLow { .. }) => result,
        Err(_) => Ok(()),
        Ok(()) => Ok(()),
    }
}
