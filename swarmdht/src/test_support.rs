//! Deterministic in-memory doubles for the three external collaborators, used by the
//! integration tests in `tests/` and exercised as executable documentation of what a real
//! `DhtRpc`/`HandshakeCipher`/`StreamTransport` implementation needs to provide.
//!
//! None of this ships to an embedder; it exists purely so end-to-end scenarios can run against two
//! or three in-process nodes without a real Kademlia swarm, Noise handshake, or UDP socket.

use crate::{
    error::{Error, Result},
    identity::{Hash, PublicKey},
    rpc::{AsyncByteStream, CipherSession, DhtRpc, Decryptor, Encryptor, HandshakeCipher, ReadHalf, StreamTransport},
    socket::WriteHalf,
    wire::{Announce, MutableRecord},
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf as IoReadHalf, WriteHalf as IoWriteHalf},
    sync::mpsc,
};

/// A single shared "network" every [`InMemoryRpc`] handle in a test points at, standing in for
/// the swarm of real DHT nodes that would otherwise store announce/mutable/immutable records
///.
pub(crate) struct Network {
    store: Mutex<crate::store::PersistentStore>,
    relays: Mutex<HashMap<Hash, mpsc::UnboundedSender<(Hash, crate::wire::Holepunch)>>>,
}

impl Network {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            store: Mutex::new(crate::store::PersistentStore::new(
                1000,
                std::time::Duration::from_secs(3600),
            )),
            relays: Mutex::new(HashMap::new()),
        })
    }

    /// Number of distinct announcers currently stored for `target`, i.e. how many peer records a
    /// `findPeer(target)` draws from.
    pub(crate) fn announce_count(&self, target: Hash) -> usize {
        self.store.lock().unwrap().lookup(target).len()
    }
}

/// A `DhtRpc` handle bound to one [`Network`], with its own node id. Every "node" in a test gets
/// its own handle; they all read and write through the same shared store, the simplification
/// licensed by treating the Kademlia RPC layer as opaque.
pub(crate) struct InMemoryRpc {
    network: Arc<Network>,
    node_id: Hash,
}

impl InMemoryRpc {
    pub(crate) fn new(network: Arc<Network>, node_id: Hash) -> Self {
        Self { network, node_id }
    }
}

#[async_trait]
impl DhtRpc for InMemoryRpc {
    fn node_id(&self) -> Hash {
        self.node_id
    }

    async fn find_peer(&self, target: Hash) -> Result<Option<crate::wire::Peer>> {
        Ok(self.network.store.lock().unwrap().find_peer(target))
    }

    async fn put_announce(&self, target: Hash, announce: Announce) -> Result<()> {
        let (peer, signature) = match (announce.peer, announce.signature) {
            (Some(peer), Some(signature)) => (peer, signature),
            _ => return Ok(()),
        };
        self.network
            .store
            .lock()
            .unwrap()
            .apply_announce(target, self.node_id, &[], peer, announce.refresh, &signature)
    }

    async fn unannounce(&self, target: Hash, announce: Announce) -> Result<()> {
        let (peer, signature) = match (announce.peer, announce.signature) {
            (Some(peer), Some(signature)) => (peer, signature),
            _ => return Ok(()),
        };
        self.network
            .store
            .lock()
            .unwrap()
            .unannounce(target, self.node_id, &[], &peer, &signature);
        Ok(())
    }

    async fn get_mutable(&self, target: Hash) -> Result<Option<MutableRecord>> {
        Ok(self.network.store.lock().unwrap().mutable_get(target, 0))
    }

    async fn put_mutable(&self, _target: Hash, record: MutableRecord) -> Result<()> {
        self.network.store.lock().unwrap().mutable_put(record)
    }

    async fn get_immutable(&self, target: Hash) -> Result<Option<Vec<u8>>> {
        Ok(self.network.store.lock().unwrap().immutable_get(target))
    }

    async fn put_immutable(&self, target: Hash, value: Vec<u8>) -> Result<()> {
        self.network.store.lock().unwrap().immutable_put(target, value)
    }

    async fn relay_holepunch(&self, target: Hash, payload: crate::wire::Holepunch) -> Result<()> {
        let sender = self.network.relays.lock().unwrap().get(&target).cloned();
        match sender {
            Some(sender) => {
                let _ = sender.send((self.node_id, payload));
                Ok(())
            }
            None => Err(Error::PeerNotFound(target)),
        }
    }

    fn holepunch_inbox(&self, mailbox: Hash) -> mpsc::UnboundedReceiver<(Hash, crate::wire::Holepunch)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.network.relays.lock().unwrap().insert(mailbox, tx);
        rx
    }

    async fn refresh_announce(&self, refresh: [u8; 32]) -> Result<Option<[u8; 32]>> {
        Ok(self
            .network
            .store
            .lock()
            .unwrap()
            .refresh(&refresh)
            .map(|(_peer, new_token)| new_token))
    }
}

/// An in-memory "network fabric": [`InMemoryTransport::connect`] finds the matching listener
/// registered by [`InMemoryTransport::accept`] and splices a `tokio::io::duplex` pipe between
/// them, length-prefix framed so [`AsyncByteStream`] reads come back as discrete messages.
pub(crate) struct InMemoryTransport {
    local_addr: SocketAddr,
    listeners: Arc<Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<(DuplexStream, SocketAddr)>>>>,
    incoming: Mutex<mpsc::UnboundedReceiver<(DuplexStream, SocketAddr)>>,
}

type DuplexStream = tokio::io::DuplexStream;

impl InMemoryTransport {
    /// `listeners` is shared across every node in a test so `connect` can find any of their
    /// `accept` registrations.
    pub(crate) fn new(
        local_addr: SocketAddr,
        listeners: Arc<Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<(DuplexStream, SocketAddr)>>>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.lock().unwrap().insert(local_addr, tx);
        Self {
            local_addr,
            listeners,
            incoming: Mutex::new(rx),
        }
    }

    pub(crate) fn shared_registry(
    ) -> Arc<Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<(DuplexStream, SocketAddr)>>>> {
        Arc::new(Mutex::new(HashMap::new()))
    }
}

#[async_trait]
impl StreamTransport for InMemoryTransport {
    type Stream = FramedDuplex;

    async fn connect(&self, remote: SocketAddr) -> Result<Self::Stream> {
        let sender = self
            .listeners
            .lock()
            .unwrap()
            .get(&remote)
            .cloned()
            .ok_or(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "no listener at that address",
            )))?;

        let (local_half, remote_half) = tokio::io::duplex(64 * 1024);
        sender
            .send((remote_half, self.local_addr))
            .map_err(|_| Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "listener gone")))?;
        Ok(FramedDuplex::new(local_half))
    }

    async fn accept(&self) -> Result<(Self::Stream, SocketAddr)> {
        let mut incoming = self.incoming.lock().unwrap();
        let (stream, from) = incoming
            .recv()
            .await
            .ok_or(Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "transport closed")))?;
        Ok((FramedDuplex::new(stream), from))
    }
}

/// Wraps a [`tokio::io::DuplexStream`] with a length-prefixed frame boundary so it satisfies
/// [`AsyncByteStream`]'s discrete-message contract.
pub(crate) struct FramedDuplex(DuplexStream);

impl FramedDuplex {
    fn new(stream: DuplexStream) -> Self {
        Self(stream)
    }
}

impl AsyncByteStream for FramedDuplex {
    fn split(self: Box<Self>) -> (Box<dyn ReadHalf>, Box<dyn WriteHalf>) {
        let (read_half, write_half) = tokio::io::split(self.0);
        (
            Box::new(FramedReadHalf(read_half)),
            Box::new(FramedWriteHalf(write_half)),
        )
    }
}

struct FramedReadHalf(IoReadHalf<DuplexStream>);

#[async_trait]
impl ReadHalf for FramedReadHalf {
    async fn read(&mut self) -> Result<Option<Bytes>> {
        let mut len_buf = [0u8; 4];
        match self.0.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(error) => return Err(Error::Io(error)),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = BytesMut::zeroed(len);
        self.0.read_exact(&mut payload).await.map_err(Error::Io)?;
        Ok(Some(payload.freeze()))
    }
}

struct FramedWriteHalf(IoWriteHalf<DuplexStream>);

#[async_trait]
impl WriteHalf for FramedWriteHalf {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        let len = (data.len() as u32).to_be_bytes();
        self.0.write_all(&len).await.map_err(Error::Io)?;
        self.0.write_all(&data).await.map_err(Error::Io)
    }

    async fn close(&mut self) -> Result<()> {
        self.0.shutdown().await.map_err(Error::Io)
    }
}

/// A no-op "handshake": skips Noise_IK entirely and hands back an identity cipher, since exercising
/// the real AEAD session is the concern of the crate that implements `HandshakeCipher` for
/// production, not of this crate's own test suite.
#[derive(Clone)]
pub(crate) struct PlaintextCipher {
    pub(crate) responder_key: PublicKey,
}

#[async_trait]
impl HandshakeCipher for PlaintextCipher {
    type Session = PlaintextSession;

    async fn initiate(self: Box<Self>, _remote_static: &PublicKey) -> Result<Self::Session> {
        Ok(PlaintextSession)
    }

    async fn respond(self: Box<Self>) -> Result<(PublicKey, Self::Session)> {
        Ok((self.responder_key, PlaintextSession))
    }
}

pub(crate) struct PlaintextSession;

impl CipherSession for PlaintextSession {
    fn split(self: Box<Self>) -> (Box<dyn Encryptor>, Box<dyn Decryptor>) {
        (Box::new(PlaintextCoder), Box::new(PlaintextCoder))
    }
}

struct PlaintextCoder;

impl Encryptor for PlaintextCoder {
    fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        plaintext.to_vec()
    }
}

impl Decryptor for PlaintextCoder {
    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}
