//! The connector state machine: `IDLE -> LOOKING_UP -> RELAYING -> PUNCHING -> OPEN`, with
//! `CLOSED` reachable from any state.
//!
//! Look the peer up, attempt a direct/relayed path, race a hole-punch against a handshake, and
//! hand back a live stream. This module is generic over the three external collaborators so
//! the state machine itself stays free of DHT, crypto and transport specifics.

use crate::{
    error::{Error, Result},
    holepunch::{Attempt, FirewallClass, HolepunchState},
    identity::{Hash, Keypair, PublicKey},
    options::{ConnectOptions, HolepunchOptions},
    rpc::{AsyncByteStream, CipherSession, DhtRpc, HandshakeCipher, StreamTransport},
    socket::{self, Socket, SocketEvent, SocketSink, WriteHalf},
    wire::{holepunch_mode, Holepunch, HolepunchPayload},
};
use bytes::Bytes;
use rand::{rngs::OsRng, RngCore};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, instrument, warn};

/// Observable state of one outbound connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Idle,
    LookingUp,
    Relaying,
    Punching,
    Open,
    Closed,
}

impl From<HolepunchState> for ConnectorState {
    fn from(state: HolepunchState) -> Self {
        match state {
            HolepunchState::New | HolepunchState::Classifying | HolepunchState::Negotiating => {
                ConnectorState::Relaying
            }
            HolepunchState::Probing => ConnectorState::Punching,
            HolepunchState::Locked => ConnectorState::Open,
            HolepunchState::Closed | HolepunchState::Vetoed | HolepunchState::TimedOut => {
                ConnectorState::Closed
            }
        }
    }
}

/// Drives a single outbound connect attempt to completion. Not `Clone`/reusable: one `Connector`
/// corresponds to one `connect()` call, mirroring the one-shot nature of the state machine above.
pub struct Connector<Rpc, Transport, Cipher> {
    rpc: Arc<Rpc>,
    transport: Arc<Transport>,
    cipher_template: Cipher,
    local_firewall: FirewallClass,
    state: ConnectorState,
    rpc_timeout: Duration,
    holepunch_options: HolepunchOptions,
}

impl<Rpc, Transport, Cipher> Connector<Rpc, Transport, Cipher>
where
    Rpc: DhtRpc,
    Transport: StreamTransport,
    Cipher: HandshakeCipher + Clone,
{
    pub fn new(
        rpc: Arc<Rpc>,
        transport: Arc<Transport>,
        cipher_template: Cipher,
        local_firewall: FirewallClass,
        rpc_timeout: Duration,
        holepunch_options: HolepunchOptions,
    ) -> Self {
        Self {
            rpc,
            transport,
            cipher_template,
            local_firewall,
            state: ConnectorState::Idle,
            rpc_timeout,
            holepunch_options,
        }
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    /// Runs the connect attempt to completion.
    #[instrument(skip(self, local_keypair, options), fields(target = %remote.target()))]
    pub async fn connect(
        mut self,
        remote: PublicKey,
        local_keypair: &Keypair,
        options: &ConnectOptions,
    ) -> Result<Socket> {
        self.state = ConnectorState::LookingUp;
        let target = remote.target();
        let peer = tokio::time::timeout(self.rpc_timeout, self.rpc.find_peer(target))
            .await
            .map_err(|_| Error::Rpc("find_peer timed out".to_string()))??
            .ok_or(Error::PeerNotFound(target))?;

        // A direct relay address lets us skip straight to the handshake (fastOpen); otherwise we
        // fall back to a relayed hole-punch negotiation.
        if let Some(addr) = peer.relay_addresses.first().copied() {
            self.state = ConnectorState::Relaying;
            if let Ok(stream) = self.transport.connect(addr.into()).await {
                return match complete_handshake(stream, &self.cipher_template, &remote).await? {
                    Some(mut socket) => {
                        self.state = ConnectorState::Open;
                        finish_fast_open(&mut socket, options).await?;
                        Ok(socket)
                    }
                    None => {
                        self.state = ConnectorState::Closed;
                        Err(Error::HolepunchAborted)
                    }
                };
            }
        }

        self.state = ConnectorState::Relaying;
        let mut attempt = Attempt::new();
        let remote_addr: SocketAddr = peer
            .relay_addresses
            .first()
            .copied()
            .ok_or(Error::PeerNotFound(target))?
            .into();

        let veto = options.holepunch.clone();
        attempt.veto(self.local_firewall, FirewallClass::Random, remote_addr, |l, r, a| {
            veto.as_ref().map(|hook| hook(l, r, a)).unwrap_or(true)
        })?;

        // Register an ad hoc mailbox for this one connect() call, then propose a rendezvous to
        // whatever node is relaying for `target`. The peer's server-side responder answers with
        // its own candidate/firewall class, or `ABORT` if its router hook refuses us.
        let mailbox = random_mailbox();
        let mut inbox = self.rpc.holepunch_inbox(mailbox);
        let negotiate_payload = HolepunchPayload {
            reply_target: mailbox,
            candidate: self.transport.local_addr(),
            firewall: self.local_firewall.to_wire(),
        };
        self.rpc
            .relay_holepunch(target, Holepunch::negotiate(&negotiate_payload))
            .await?;

        let (_, message) = tokio::time::timeout(self.rpc_timeout, inbox.recv())
            .await
            .map_err(|_| Error::HolepunchTimeout)?
            .ok_or(Error::HolepunchTimeout)?;

        if message.mode == holepunch_mode::ABORT {
            self.state = ConnectorState::Closed;
            return Err(Error::HolepunchAborted);
        }
        let ack = message.decode_payload()?;
        let remote_firewall = FirewallClass::from_wire(ack.firewall);
        let remote_addr: SocketAddr = ack.candidate.into();

        self.state = ConnectorState::Punching;
        let Some(strategy) = attempt.select_strategy(self.local_firewall, remote_firewall) else {
            let error = crate::holepunch::wait_out_unreachable(&self.holepunch_options).await;
            attempt.mark_timed_out();
            self.state = ConnectorState::Closed;
            return Err(error);
        };
        info!(?strategy, "starting hole-punch probing");

        let (locked_tx, locked_rx) = oneshot::channel();
        attempt.spawn_burst(self.transport.clone(), remote_addr, self.holepunch_options, locked_rx);

        let deadline = tokio::time::Instant::now() + self.holepunch_options.total_timeout();
        let stream = loop {
            match self.transport.connect(remote_addr).await {
                Ok(stream) => {
                    let _ = locked_tx.send(());
                    break stream;
                }
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(self.holepunch_options.probe_interval).await;
                }
                Err(_) => {
                    attempt.mark_timed_out();
                    self.state = ConnectorState::Closed;
                    return Err(Error::HolepunchTimeout);
                }
            }
        };
        attempt.lock();

        match complete_handshake(stream, &self.cipher_template, &remote).await? {
            Some(mut socket) => {
                self.state = ConnectorState::Open;
                finish_fast_open(&mut socket, options).await?;
                Ok(socket)
            }
            None => {
                self.state = ConnectorState::Closed;
                Err(Error::HolepunchAborted)
            }
        }
    }
}

/// Draws a fresh random [`Hash`] to use as a one-shot hole-punch negotiation mailbox, distinct
/// from any real DHT target so a reply can never be confused with an announce/mutable lookup.
fn random_mailbox() -> Hash {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    Hash(bytes)
}

/// Piggybacks `options.initial_payload` onto the just-opened socket when `fast_open` is set
/// (§4.3): the first application write rides the same round trip as the final handshake message
/// instead of waiting for a second one.
async fn finish_fast_open(socket: &mut Socket, options: &ConnectOptions) -> Result<()> {
    if options.fast_open {
        if let Some(payload) = &options.initial_payload {
            socket.write(payload.clone()).await?;
        }
    }
    Ok(())
}

/// Splits the freshly-opened stream, reads the peer's admission decision, and — if
/// admitted — drives the initiator side of the handshake and wraps the result as a [`Socket`].
/// Returns `Ok(None)` on a veto rather than an error, since a veto is an expected outcome of
/// `connect`, not a transport failure.
async fn complete_handshake<S, Cipher>(
    stream: S,
    cipher_template: &Cipher,
    remote: &PublicKey,
) -> Result<Option<Socket>>
where
    S: AsyncByteStream,
    Cipher: HandshakeCipher + Clone,
{
    let (mut read_half, write_half) = Box::new(stream).split();
    if !crate::admission::read_decision(&mut *read_half).await? {
        return Ok(None);
    }

    let cipher = Box::new(cipher_template.clone());
    let session = cipher.initiate(remote).await?;
    Ok(Some(open_socket(read_half, write_half, session)))
}

/// Wraps an already-split stream and `session` into a [`Socket`]: spawns a background read loop
/// that decrypts inbound data onto the event channel, and wraps the write half in a
/// [`SocketSink`] so writes go straight through the encryptor.
///
/// Takes split halves rather than the whole stream because both callers (the connector and the
/// server's accept loop) need to exchange an admission-decision byte over the same halves first
///.
pub(crate) fn open_socket<C: CipherSession>(
    read_half: Box<dyn crate::rpc::ReadHalf>,
    write_half: Box<dyn WriteHalf>,
    session: C,
) -> Socket {
    let (encryptor, decryptor) = Box::new(session).split();

    let (tx, rx) = socket::event_channel();
    let reader = scoped_task::spawn(read_loop(read_half, decryptor, tx));

    Socket::with_reader(
        SocketSink::new(Box::new(EncryptingWriteHalf { write_half, encryptor })),
        rx,
        reader,
    )
}

async fn read_loop(
    mut read_half: Box<dyn crate::rpc::ReadHalf>,
    mut decryptor: Box<dyn crate::rpc::Decryptor>,
    events: mpsc::Sender<SocketEvent>,
) {
    let _ = events.send(SocketEvent::Open).await;
    loop {
        match read_half.read().await {
            Ok(Some(ciphertext)) => match decryptor.decrypt(&ciphertext) {
                Ok(plaintext) => {
                    if events
                        .send(SocketEvent::Data(Bytes::from(plaintext)))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(error) => {
                    warn!(%error, "dropping undecryptable datagram");
                }
            },
            Ok(None) => {
                let _ = events.send(SocketEvent::End).await;
                return;
            }
            Err(error) => {
                let _ = events.send(SocketEvent::Error(error.to_string())).await;
                return;
            }
        }
    }
}

struct EncryptingWriteHalf {
    write_half: Box<dyn WriteHalf>,
    encryptor: Box<dyn crate::rpc::Encryptor>,
}

#[async_trait::async_trait]
impl WriteHalf for EncryptingWriteHalf {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        let ciphertext = self.encryptor.encrypt(&data);
        self.write_half.write(Bytes::from(ciphertext)).await
    }

    async fn close(&mut self) -> Result<()> {
        self.write_half.close().await
    }
}
