//! End-to-end scenarios driven against the in-memory doubles in
//! [`crate::test_support`]: two or three in-process [`Dht`] instances wired through a shared
//! [`Network`], with no real Kademlia swarm, Noise handshake, or UDP socket involved.

use crate::{
    dht::Dht,
    error::Error,
    holepunch::FirewallClass,
    identity::{hash, Hash, Keypair, Namespace},
    options::{ConnectOptions, DhtOptions, ServerOptions},
    rpc::DhtRpc,
    socket::SocketEvent,
    test_support::{InMemoryRpc, InMemoryTransport, Network, PlaintextCipher},
    wire::{Announce, MutablePutRequest, MutableRecord, Peer},
};
use bytes::Bytes;
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};
use tokio_stream::StreamExt;

fn local_addr(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

fn seeded_keypair(tag: &str) -> Keypair {
    Keypair::from_seed(*hash(tag.as_bytes()).as_bytes())
}

/// Polls the shared store until `target` has at least one announcer, standing in for "wait for
/// the server's refresh loop to land its first announce" without a fixed sleep.
async fn wait_until_announced(network: &Arc<Network>, target: Hash) {
    for _ in 0..500 {
        if network.announce_count(target) > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("announce for {target:?} never landed in the shared store");
}

/// Publishes a peer record directly against `rpc`, bypassing a live `Server`/`Transport` — used to
/// advertise a relay address that nothing is actually listening on.
async fn publish_peer(rpc: &InMemoryRpc, keypair: &Keypair, relay_addresses: Vec<SocketAddrV4>) {
    let target = keypair.public_key().target();
    let peer = Peer::new(keypair.public_key(), relay_addresses);
    let signable = Announce::signable(&target, &rpc.node_id(), &[], &peer, None, Namespace::Announce);
    let signature = keypair.sign(&signable.0);
    let announce = Announce {
        peer: Some(peer),
        refresh: None,
        signature: Some(signature),
    };
    rpc.put_announce(target, announce).await.unwrap();
}

async fn put_mutable(
    rpc: &InMemoryRpc,
    keypair: &Keypair,
    seq: u64,
    value: &[u8],
) -> crate::error::Result<()> {
    let signature = keypair.sign(&MutablePutRequest::signable(seq, value).0);
    rpc.put_mutable(
        keypair.public_key().target(),
        MutableRecord {
            public_key: keypair.public_key(),
            seq,
            value: value.to_vec(),
            signature,
        },
    )
    .await
}

/// (1) Basic connect: A listens with the seeded keypair `H("s")`, B connects, both sides end and
/// close, and Z's (the shared [`Network`]'s) store holds exactly one announce for A's target.
#[tokio::test]
async fn basic_connect_round_trips_and_leaves_exactly_one_announce() {
    let network = Network::new();
    let registry = InMemoryTransport::shared_registry();

    let server_identity = seeded_keypair("s");
    let server_public = server_identity.public_key();
    let server_addr = local_addr(19101);

    let dht_a = Dht::new(
        seeded_keypair("s"),
        InMemoryRpc::new(network.clone(), hash(b"node-a")),
        InMemoryTransport::new(server_addr.into(), registry.clone()),
        PlaintextCipher { responder_key: server_public },
        DhtOptions::default(),
    );

    let mut server = dht_a.create_server(seeded_keypair("s"), vec![server_addr], ServerOptions::default());
    wait_until_announced(&network, server_public.target()).await;

    let dht_b = Dht::new(
        Keypair::generate(),
        InMemoryRpc::new(network.clone(), hash(b"node-b")),
        InMemoryTransport::new(local_addr(19102).into(), registry.clone()),
        PlaintextCipher { responder_key: Keypair::generate().public_key() },
        DhtOptions::default(),
    );

    let (client_result, server_result) = tokio::join!(
        dht_b.connect(server_public, ConnectOptions::default()),
        server.accept(),
    );

    let mut client_socket = client_result.expect("client connect should succeed");
    let mut server_socket = server_result.expect("server should admit the connection");

    client_socket.end().await.unwrap();
    client_socket.close().await.unwrap();
    server_socket.end().await.unwrap();
    server_socket.close().await.unwrap();

    assert_eq!(network.announce_count(server_public.target()), 1);

    let closing_rpc = InMemoryRpc::new(network.clone(), hash(b"node-a"));
    server.close(&closing_rpc).await.unwrap();
    assert_eq!(network.announce_count(server_public.target()), 0);
}

/// (2) Abort by server hook: the server's `holepunch` veto unconditionally refuses, so the client
/// sees `HOLEPUNCH_ABORTED` and the server's `accept()` never yields anything.
#[tokio::test]
async fn server_side_veto_aborts_before_the_connection_opens() {
    let network = Network::new();
    let registry = InMemoryTransport::shared_registry();

    let server_identity = seeded_keypair("vetoing-server");
    let server_public = server_identity.public_key();
    let server_addr = local_addr(19111);

    let dht_a = Dht::new(
        seeded_keypair("vetoing-server"),
        InMemoryRpc::new(network.clone(), hash(b"veto-node-a")),
        InMemoryTransport::new(server_addr.into(), registry.clone()),
        PlaintextCipher { responder_key: server_public },
        DhtOptions::default(),
    );

    let mut server = dht_a.create_server(
        seeded_keypair("vetoing-server"),
        vec![server_addr],
        ServerOptions {
            firewall: None,
            holepunch: Some(Arc::new(|_local, _remote, _addr| false)),
        },
    );
    wait_until_announced(&network, server_public.target()).await;

    let dht_b = Dht::new(
        Keypair::generate(),
        InMemoryRpc::new(network.clone(), hash(b"veto-node-b")),
        InMemoryTransport::new(local_addr(19112).into(), registry.clone()),
        PlaintextCipher { responder_key: Keypair::generate().public_key() },
        DhtOptions::default(),
    );

    let connect_result = dht_b.connect(server_public, ConnectOptions::default()).await;
    assert!(matches!(connect_result, Err(Error::HolepunchAborted)));

    let accept_result = tokio::time::timeout(Duration::from_millis(50), server.accept()).await;
    assert!(accept_result.is_err(), "server's onConnection must never fire");
}

/// (3) Abort by client hook, symmetric to (2): the advertised relay address has no listener, so
/// the connector falls into the hole-punch path, where the client's own veto hook refuses.
#[tokio::test]
async fn client_side_veto_aborts_before_probing_locks() {
    let network = Network::new();
    let registry = InMemoryTransport::shared_registry();

    let server_identity = seeded_keypair("unreachable-server");
    let server_public = server_identity.public_key();
    let decoy_addr = local_addr(19121); // advertised, but nothing is ever listening here

    let publisher = InMemoryRpc::new(network.clone(), hash(b"veto-node-a"));
    publish_peer(&publisher, &server_identity, vec![decoy_addr]).await;

    let dht_b = Dht::new(
        Keypair::generate(),
        InMemoryRpc::new(network.clone(), hash(b"veto-node-b")),
        InMemoryTransport::new(local_addr(19122).into(), registry.clone()),
        PlaintextCipher { responder_key: Keypair::generate().public_key() },
        DhtOptions::default(),
    );
    // Random-Random can never punch; pick a local class that makes the pairing punchable so the
    // veto hook is actually what stops the attempt.
    dht_b.set_firewalled(FirewallClass::Open);

    let options = ConnectOptions {
        holepunch: Some(Arc::new(|_local, _remote, _addr| false)),
        ..ConnectOptions::default()
    };

    let result = dht_b.connect(server_public, options).await;
    assert!(matches!(result, Err(Error::HolepunchAborted)));
}

/// (4) 10-connect fan-in: the server ends every inbound socket immediately with payload "hi"; all
/// 10 concurrent connects observe it and reach end-of-stream.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_concurrent_connects_all_observe_the_immediate_payload_and_close() {
    let network = Network::new();
    let registry = InMemoryTransport::shared_registry();

    let server_identity = seeded_keypair("fan-in-server");
    let server_public = server_identity.public_key();
    let server_addr = local_addr(19131);

    let dht_a = Dht::new(
        seeded_keypair("fan-in-server"),
        InMemoryRpc::new(network.clone(), hash(b"fan-in-node-a")),
        InMemoryTransport::new(server_addr.into(), registry.clone()),
        PlaintextCipher { responder_key: server_public },
        DhtOptions::default(),
    );

    let server = dht_a.create_server(seeded_keypair("fan-in-server"), vec![server_addr], ServerOptions::default());
    wait_until_announced(&network, server_public.target()).await;

    const CONNECTIONS: usize = 10;

    let responder = tokio::spawn(async move {
        let mut server = server;
        for _ in 0..CONNECTIONS {
            let mut socket = server.accept().await.expect("server should admit every connect");
            tokio::spawn(async move {
                socket.write(Bytes::from_static(b"hi")).await.unwrap();
                socket.close().await.unwrap();
            });
        }
        server
    });

    let connects = futures_util::future::join_all((0..CONNECTIONS).map(|i| {
        let network = network.clone();
        let registry = registry.clone();
        async move {
            let dht_b = Dht::new(
                Keypair::generate(),
                InMemoryRpc::new(network.clone(), hash(format!("fan-in-client-{i}").as_bytes())),
                InMemoryTransport::new(local_addr(19200 + i as u16).into(), registry.clone()),
                PlaintextCipher { responder_key: Keypair::generate().public_key() },
                DhtOptions::default(),
            );
            let mut socket = dht_b
                .connect(server_public, ConnectOptions::default())
                .await
                .expect("connect should succeed");

            let events = socket.events();
            assert!(matches!(events.next().await, Some(SocketEvent::Open)));

            match events.next().await {
                Some(SocketEvent::Data(data)) => assert_eq!(data.as_ref(), b"hi"),
                other => panic!("expected the \"hi\" payload, got {other:?}"),
            }

            let end = events.next().await;
            assert!(matches!(end, Some(SocketEvent::End) | None));
        }
    }))
    .await;

    assert_eq!(connects.len(), CONNECTIONS);
    responder.await.unwrap();
}

/// (5) Mutable put/get round-trip: monotonic `seq` is accepted, a seq-equal conflicting value is
/// rejected with `SEQ_REUSED`, and a lower `seq` is rejected with `SEQ_TOO_LOW`.
#[tokio::test]
async fn mutable_put_get_round_trip_and_conflicts() {
    let network = Network::new();
    let rpc = InMemoryRpc::new(network.clone(), hash(b"mutable-node"));
    let keypair = seeded_keypair("mutable-owner");
    let target = keypair.public_key().target();

    put_mutable(&rpc, &keypair, 1, b"a").await.unwrap();
    let got = rpc.get_mutable(target).await.unwrap().unwrap();
    assert_eq!(got.seq, 1);
    assert_eq!(got.value, b"a");

    let err = put_mutable(&rpc, &keypair, 1, b"b").await.unwrap_err();
    assert!(matches!(err, Error::SeqReused { seq: 1 }));

    let err = put_mutable(&rpc, &keypair, 0, b"anything").await.unwrap_err();
    assert!(matches!(err, Error::SeqTooLow { seq: 0, stored: 1 }));

    put_mutable(&rpc, &keypair, 2, b"b").await.unwrap();
    let got = rpc.get_mutable(target).await.unwrap().unwrap();
    assert_eq!(got.seq, 2);
    assert_eq!(got.value, b"b");
}

/// (6) Immutable put mismatch: a `target` that doesn't match `hash(value)` is rejected and never
/// stored.
#[tokio::test]
async fn immutable_put_mismatch_is_rejected_and_not_stored() {
    let network = Network::new();
    let rpc = InMemoryRpc::new(network.clone(), hash(b"immutable-node"));
    let value = b"hello world".to_vec();
    let wrong_target = Hash([0xffu8; 32]);

    let err = rpc.put_immutable(wrong_target, value.clone()).await.unwrap_err();
    assert!(matches!(err, Error::TargetMismatch));
    assert!(rpc.get_immutable(wrong_target).await.unwrap().is_none());

    let real_target = hash(&value);
    rpc.put_immutable(real_target, value.clone()).await.unwrap();
    assert_eq!(rpc.get_immutable(real_target).await.unwrap(), Some(value));
}
