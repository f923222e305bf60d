//! Wire payload schemas and their compact encoding.
//!
//! Every schema here round-trips through MessagePack (`rmp-serde`), which gives us the
//! "canonical byte order, varint integers" shape asked for without hand-rolling a codec.

use crate::{
    error::{Error, Result},
    identity::{self, Hash, Namespace, PublicKey, Sig64},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddrV4;

/// Peer records store at most this many relay addresses; longer lists are truncated on the way in.
pub const MAX_RELAY_ADDRESSES: usize = 3;

/// Mutable and immutable record values are capped at this many bytes.
pub const MAX_VALUE_LEN: usize = 1000;

pub fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    rmp_serde::to_vec(value).expect("wire schemas are always serializable")
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(|_| Error::Malformed("could not decode wire payload"))
}

/// `peer := { publicKey: [32], relayAddresses: list<ipv4+port> (≤3) }`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub public_key: PublicKey,
    pub relay_addresses: Vec<SocketAddrV4>,
}

impl Peer {
    /// Builds a peer record, truncating `relay_addresses` to [`MAX_RELAY_ADDRESSES`].
    pub fn new(public_key: PublicKey, mut relay_addresses: Vec<SocketAddrV4>) -> Self {
        relay_addresses.truncate(MAX_RELAY_ADDRESSES);
        Self {
            public_key,
            relay_addresses,
        }
    }
}

/// `announce := { peer?, refresh?: [32], signature?: [64] }`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Announce {
    pub peer: Option<Peer>,
    pub refresh: Option<[u8; 32]>,
    #[serde(with = "option_signature")]
    pub signature: Option<Sig64>,
}

impl Announce {
    /// An announce carrying only a refresh nonce and no peer/signature is a cheap renewal, not a
    /// fresh announce.
    pub fn is_refresh_only(&self) -> bool {
        self.peer.is_none() && self.signature.is_none() && self.refresh.is_some()
    }

    /// The exact signable construction: `BLAKE2b([target, nodeId, token, encode(peer),
    /// refresh ?? ∅], namespace)`.
    pub fn signable(
        target: &Hash,
        node_id: &Hash,
        token: &[u8],
        peer: &Peer,
        refresh: Option<&[u8; 32]>,
        namespace: Namespace,
    ) -> Hash {
        let encoded_peer = encode(peer);
        let refresh_bytes: &[u8] = refresh.map(|r| r.as_slice()).unwrap_or(&[]);
        identity::signable_hash(
            &[
                target.as_bytes(),
                node_id.as_bytes(),
                token,
                &encoded_peer,
                refresh_bytes,
            ],
            namespace,
        )
    }
}

/// `mutablePutRequest := { publicKey: [32], seq: varint, value: bytes, signature: [64] }`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MutablePutRequest {
    pub public_key: PublicKey,
    pub seq: u64,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
    #[serde(with = "signature")]
    pub signature: Sig64,
}

impl MutablePutRequest {
    /// `BLAKE2b(encode({seq, value}), NS_MUTABLE_PUT)`.
    pub fn signable(seq: u64, value: &[u8]) -> Hash {
        #[derive(Serialize)]
        struct SeqValue<'a> {
            seq: u64,
            #[serde(with = "serde_bytes")]
            value: &'a [u8],
        }

        let encoded = encode(&SeqValue { seq, value });
        identity::signable_hash(&[&encoded], Namespace::MutablePut)
    }
}

/// A stored mutable record, as returned by `mutableGet`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MutableRecord {
    pub public_key: PublicKey,
    pub seq: u64,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
    #[serde(with = "signature")]
    pub signature: Sig64,
}

/// Tags for the payload carried inside a [`Holepunch`] message.
pub mod holepunch_mode {
    /// Proposes a rendezvous: the sender's candidate address, firewall class, and the mailbox
    /// it wants the reply delivered to.
    pub const NEGOTIATE: u8 = 0;
    /// Answers a `NEGOTIATE` with the responder's own candidate and firewall class.
    pub const ACK: u8 = 1;
    /// Refuses the negotiation outright (router veto); carries no payload.
    pub const ABORT: u8 = 2;
}

/// `holepunch := { mode: u8, payload: bytes }`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Holepunch {
    pub mode: u8,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// The body of a `NEGOTIATE`/`ACK` message: a candidate address to probe/connect to, the
/// classification the sender has for itself, and the mailbox a reply should be relayed back to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HolepunchPayload {
    pub reply_target: Hash,
    pub candidate: SocketAddrV4,
    pub firewall: u8,
}

impl Holepunch {
    pub fn negotiate(payload: &HolepunchPayload) -> Self {
        Self {
            mode: holepunch_mode::NEGOTIATE,
            payload: encode(payload),
        }
    }

    pub fn ack(payload: &HolepunchPayload) -> Self {
        Self {
            mode: holepunch_mode::ACK,
            payload: encode(payload),
        }
    }

    pub fn abort() -> Self {
        Self {
            mode: holepunch_mode::ABORT,
            payload: Vec::new(),
        }
    }

    pub fn decode_payload(&self) -> Result<HolepunchPayload> {
        decode(&self.payload)
    }
}

pub fn validate_value_len(value: &[u8]) -> Result<()> {
    if value.len() > MAX_VALUE_LEN {
        Err(Error::ValueTooLarge { len: value.len() })
    } else {
        Ok(())
    }
}

mod signature {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(sig: &Sig64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::Bytes::new(&sig.to_bytes()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Sig64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        let bytes: [u8; 64] = bytes
            .into_vec()
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected a 64-byte signature"))?;
        Ok(Sig64::from_bytes(&bytes))
    }
}

mod option_signature {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(sig: &Option<Sig64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        sig.map(|s| s.to_bytes()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Sig64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Option<[u8; 64]> = Deserialize::deserialize(deserializer)?;
        Ok(bytes.map(|b| Sig64::from_bytes(&b)))
    }
}
