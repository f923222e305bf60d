//! The server side of a listening identity: accepts inbound connections, keeps its
//! announce record fresh, and tears both down on close.
//!
//! A long-lived handle owns the background announce-refresh task and unwinds it via
//! `scoped_task` when the handle is dropped.

use crate::{
    connector::open_socket,
    error::Result,
    holepunch::{run_probe_burst, FirewallClass, ProbeStrategy},
    identity::{Hash, Keypair, Namespace, PublicKey},
    options::{FirewallHook, HolepunchOptions, ServerOptions},
    rpc::{AsyncByteStream, DhtRpc, HandshakeCipher, StreamTransport},
    router::{RouterAction, RouterTable},
    socket::Socket,
    wire::{holepunch_mode, Announce, Holepunch, HolepunchPayload, Peer},
};
use rand::RngCore;
use scoped_task::ScopedJoinHandle;
use std::{
    net::{SocketAddr, SocketAddrV4},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, instrument, warn};

/// The interval on which an open server refreshes its own announce record, kept well inside the
/// store's `max_age` so a live server is never evicted out from under it.
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A listening identity. Created by [`crate::dht::Dht::create_server`], accepting connections
/// targeted at `public_key.target()` until [`Server::close`] is called or the handle is dropped.
pub struct Server<Transport> {
    keypair: Arc<Keypair>,
    transport: Arc<Transport>,
    router: Arc<Mutex<RouterTable>>,
    connections: mpsc::Receiver<Socket>,
    _accept_task: ScopedJoinHandle<()>,
    _refresh_task: ScopedJoinHandle<()>,
    _holepunch_task: ScopedJoinHandle<()>,
}

impl<Transport> Server<Transport>
where
    Transport: StreamTransport,
{
    #[instrument(skip(rpc, transport, cipher_template, router, keypair, options), fields(target = %keypair.public_key().target()))]
    pub(crate) fn start<Rpc: DhtRpc, Cipher: HandshakeCipher + Clone>(
        keypair: Arc<Keypair>,
        rpc: Arc<Rpc>,
        transport: Arc<Transport>,
        cipher_template: Cipher,
        router: Arc<Mutex<RouterTable>>,
        local_firewall: FirewallClass,
        relay_addresses: Vec<SocketAddrV4>,
        holepunch_options: HolepunchOptions,
        options: ServerOptions,
    ) -> Self {
        let target = keypair.public_key().target();
        let record = Peer::new(keypair.public_key(), relay_addresses);
        let action = match options.holepunch {
            Some(hook) => RouterAction::Holepunch(hook),
            None => RouterAction::Accept,
        };
        router.lock().unwrap().insert(target, action, record.clone());

        let (conn_tx, conn_rx) = mpsc::channel(32);
        let accept_transport = transport.clone();
        let accept_router = router.clone();
        let accept_task: ScopedJoinHandle<()> = scoped_task::spawn(accept_loop(
            accept_transport,
            cipher_template,
            options.firewall,
            accept_router,
            target,
            local_firewall,
            conn_tx,
        ));

        let inbox = rpc.holepunch_inbox(target);
        let holepunch_task = scoped_task::spawn(holepunch_responder_loop(
            rpc.clone(),
            transport.clone(),
            router.clone(),
            target,
            local_firewall,
            holepunch_options,
            inbox,
        ));

        let refresh_keypair = keypair.clone();
        let refresh_rpc = rpc.clone();
        let refresh_task = scoped_task::spawn(refresh_loop(refresh_rpc, refresh_keypair, record));

        info!("server listening");
        Self {
            keypair,
            transport,
            router,
            connections: conn_rx,
            _accept_task: accept_task,
            _refresh_task: refresh_task,
            _holepunch_task: holepunch_task,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// The next inbound connection. Returns `None` once the server is closed and no more
    /// connections will arrive.
    pub async fn accept(&mut self) -> Option<Socket> {
        self.connections.recv().await
    }

    /// Stops accepting new connections, unannounces, and drops the refresh task. Already-open
    /// sockets are unaffected.
    #[instrument(skip(self, rpc), fields(target = %self.public_key().target()))]
    pub async fn close<Rpc: DhtRpc>(self, rpc: &Rpc) -> Result<()> {
        let target = self.public_key().target();
        self.router.lock().unwrap().remove(&target);

        let peer = Peer::new(self.public_key(), Vec::new());
        let signable = Announce::signable(&target, &rpc.node_id(), &[], &peer, None, Namespace::Unannounce);
        let signature = self.keypair.sign(&signable.0);
        let announce = Announce {
            peer: Some(peer),
            refresh: None,
            signature: Some(signature),
        };
        rpc.unannounce(target, announce).await
    }
}

/// Accepts inbound streams from the transport, applies the optional `firewall` hook, consults
/// this server's `RouterAction`, completes the responder side of the Noise handshake, and forwards the
/// resulting [`Socket`] to whoever is awaiting [`Server::accept`].
///
/// The remote's firewall classification isn't known at this trait boundary (the real
/// classification round-trip happens inside whichever concrete `Transport`/`DhtRpc` pair an
/// embedder plugs in), so the veto hook is evaluated with [`FirewallClass::Open`] standing in for
/// the remote side — a stream only reaches here once *some* path to it already worked.
async fn accept_loop<Transport: StreamTransport, Cipher: HandshakeCipher + Clone>(
    transport: Arc<Transport>,
    cipher_template: Cipher,
    firewall: Option<FirewallHook>,
    router: Arc<Mutex<RouterTable>>,
    target: Hash,
    local_firewall: FirewallClass,
    connections: mpsc::Sender<Socket>,
) {
    loop {
        match transport.accept().await {
            Ok((stream, remote_addr)) => {
                info!(%remote_addr, "inbound connection");

                if let Some(hook) = &firewall {
                    if !hook(remote_addr) {
                        warn!(%remote_addr, "inbound connection rejected by firewall hook");
                        continue;
                    }
                }

                let admitted =
                    router
                        .lock()
                        .unwrap()
                        .evaluate(&target, local_firewall, FirewallClass::Open, remote_addr);

                let (read_half, mut write_half) = Box::new(stream).split();

                if !admitted {
                    warn!(%remote_addr, "inbound connection vetoed by router hook");
                    let _ = crate::admission::write_decision(&mut *write_half, false).await;
                    let _ = write_half.close().await;
                    continue;
                }

                if let Err(error) = crate::admission::write_decision(&mut *write_half, true).await {
                    warn!(%error, %remote_addr, "failed to send admission decision, dropping connection");
                    continue;
                }

                let cipher = Box::new(cipher_template.clone());
                match cipher.respond().await {
                    Ok((remote_key, session)) => {
                        info!(%remote_addr, remote = %remote_key.target(), "handshake complete");
                        let socket = open_socket(read_half, write_half, session);
                        if connections.send(socket).await.is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        warn!(%error, %remote_addr, "handshake failed, dropping connection");
                    }
                }
            }
            Err(error) => {
                warn!(%error, "accept loop ending");
                return;
            }
        }
        if connections.is_closed() {
            return;
        }
    }
}

/// Announces `peer` immediately, then re-announces with a
/// fresh `refresh` nonce every [`DEFAULT_REFRESH_INTERVAL`] (step 3) for as long as the server is
/// listening.
async fn refresh_loop<Rpc: DhtRpc>(rpc: Arc<Rpc>, keypair: Arc<Keypair>, peer: Peer) {
    let target = keypair.public_key().target();
    let mut first = true;
    loop {
        if first {
            first = false;
        } else {
            tokio::time::sleep(DEFAULT_REFRESH_INTERVAL).await;
        }

        let mut refresh = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut refresh);

        let signable = Announce::signable(
            &target,
            &rpc.node_id(),
            &[],
            &peer,
            Some(&refresh),
            Namespace::Announce,
        );
        let signature = keypair.sign(&signable.0);
        let announce = Announce {
            peer: Some(peer.clone()),
            refresh: Some(refresh),
            signature: Some(signature),
        };

        if let Err(error) = rpc.put_announce(target, announce).await {
            warn!(%error, "announce refresh failed, retrying next interval");
        }
    }
}

/// Answers relayed hole-punch negotiations addressed to this server's own target: the responder
/// side of the `NEGOTIATE -> ACK`/`ABORT` exchange a remote [`crate::connector::Connector`] drives
/// from its side of [`crate::connector::Connector::connect`].
///
/// A router veto (the same [`RouterAction`] an inbound stream is checked against in
/// [`accept_loop`]) is evaluated here too, before any probing starts, so a refused peer never
/// gets as far as a wasted burst of UDP datagrams (§4.4 Cancellation).
async fn holepunch_responder_loop<Rpc: DhtRpc, Transport: StreamTransport>(
    rpc: Arc<Rpc>,
    transport: Arc<Transport>,
    router: Arc<Mutex<RouterTable>>,
    target: Hash,
    local_firewall: FirewallClass,
    options: HolepunchOptions,
    mut inbox: mpsc::UnboundedReceiver<(Hash, Holepunch)>,
) {
    while let Some((sender, message)) = inbox.recv().await {
        if message.mode != holepunch_mode::NEGOTIATE {
            continue;
        }

        let payload = match message.decode_payload() {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, %sender, "dropping malformed holepunch negotiation");
                continue;
            }
        };

        let remote_firewall = FirewallClass::from_wire(payload.firewall);
        let remote_addr: SocketAddr = payload.candidate.into();

        let admitted = router
            .lock()
            .unwrap()
            .evaluate(&target, local_firewall, remote_firewall, remote_addr);
        if !admitted {
            warn!(%remote_addr, "holepunch negotiation vetoed by router hook");
            let _ = rpc.relay_holepunch(payload.reply_target, Holepunch::abort()).await;
            continue;
        }

        let ack_payload = HolepunchPayload {
            reply_target: target,
            candidate: transport.local_addr(),
            firewall: local_firewall.to_wire(),
        };
        if let Err(error) = rpc
            .relay_holepunch(payload.reply_target, Holepunch::ack(&ack_payload))
            .await
        {
            warn!(%error, "failed to relay holepunch ack");
            continue;
        }

        // Mirrors the connector's own probing burst (§4.4 step 3): the pairing table says which
        // side leads, but both sides fire a burst regardless so a `Simultaneous` pairing actually
        // is simultaneous. An unreachable (`Random`/`Random`) pairing has nothing to probe with.
        if ProbeStrategy::for_pair(local_firewall, remote_firewall).is_some() {
            let sink = transport.clone();
            let burst_options = options;
            let (_locked_tx, locked_rx) = oneshot::channel();
            scoped_task::spawn(async move {
                let _ = run_probe_burst(&sink, remote_addr, &burst_options, locked_rx).await;
            })
            .detach();
        }
    }
}
