//! Ed25519 identities and the BLAKE2b hashing used to derive DHT targets and namespaced
//! signatures.
//!
//! A node id and a server's public key are both bare 32-byte Ed25519 public keys; they are kept
//! as distinct newtypes so the two identity spaces (ephemeral DHT peer vs. long-lived service)
//! can't be accidentally swapped at a call site.

use blake2::{digest::consts::U32, Blake2b, Digest};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{rngs::OsRng, CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

type Blake2b256 = Blake2b<U32>;

/// A 32-byte BLAKE2b hash. Used both as a DHT `target` and as the key of an immutable record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "…")
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Namespace tags mixed into every signable construction so a signature produced for one purpose
/// can never be replayed as a signature for another.
#[derive(Clone, Copy)]
pub enum Namespace {
    Announce,
    Unannounce,
    MutablePut,
}

impl Namespace {
    fn tag(self) -> &'static [u8] {
        match self {
            Namespace::Announce => b"swarmdht:announce",
            Namespace::Unannounce => b"swarmdht:unannounce",
            Namespace::MutablePut => b"swarmdht:mutable-put",
        }
    }
}

/// Hashes `parts` (concatenated in order) together with `namespace`'s tag.
///
/// This is the one BLAKE2b call site every signable construction funnels through, so
/// the exact byte layout only needs auditing in one place.
pub fn signable_hash(parts: &[&[u8]], namespace: Namespace) -> Hash {
    let mut hasher = Blake2b256::new();
    hasher.update(namespace.tag());
    for part in parts {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    Hash(hasher.finalize().into())
}

/// BLAKE2b of a single buffer, used for `target = hash(publicKey)` and `target = hash(value)`.
pub fn hash(bytes: &[u8]) -> Hash {
    let mut hasher = Blake2b256::new();
    hasher.update(bytes);
    Hash(hasher.finalize().into())
}

/// An Ed25519 public key, identifying either a DHT node or a long-lived server.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "serde_big_array")] [u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// `target = BLAKE2b(publicKey)`.
    pub fn target(&self) -> Hash {
        hash(&self.0)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        VerifyingKey::from_bytes(&self.0)
            .map(|key| key.verify(message, signature).is_ok())
            .unwrap_or(false)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hash(&self.0))
    }
}

/// An Ed25519 keypair. Owned exclusively by the [`crate::server::Server`] (or test harness) that
/// generated or loaded it; never serialized.
pub struct Keypair(SigningKey);

impl Keypair {
    /// Generates a fresh keypair from system randomness.
    pub fn generate() -> Self {
        Self::generate_from(&mut OsRng)
    }

    /// Deterministically derives a keypair from a 32-byte seed. Used by tests and by callers who
    /// want a stable identity across restarts without persisting the secret key on disk
    /// themselves.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self(SigningKey::from_bytes(&seed))
    }

    fn generate_from<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(SigningKey::generate(rng))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.0.sign(message)
    }
}

// `ed25519_dalek::Signature` already (de)serializes as a 64-byte array; re-exported here so
// callers never need to depend on `ed25519_dalek` directly.
pub use ed25519_dalek::Signature as Sig64;

mod serde_big_array {
    // `serde`'s derive only special-cases arrays up to length 32 natively on recent versions, but
    // we spell it out explicitly to not depend on that implementation detail.
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::Bytes::new(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        bytes
            .into_vec()
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected a 32-byte public key"))
    }
}
