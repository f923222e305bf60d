//! The persistent store: an in-memory, LRU-bounded cache of announce, mutable and
//! immutable records, each subject to `maxAge` eviction in addition to `maxSize` LRU eviction.
//!
//! Built on the `lru` crate: this is a bounded in-memory cache, not a durable database, so
//! the three record kinds each get their own capacity-bounded table instead of a disk-backed
//! store.

use crate::{
    error::{Error, Result},
    identity::{Hash, Namespace},
    wire::{self, Announce, MutableRecord, Peer},
};
use lru::LruCache;
use rand::RngCore;
use std::{collections::HashMap, num::NonZeroUsize, time::{Duration, Instant}};

/// Cap on the number of records `lookup` returns for one target.
const LOOKUP_LIMIT: usize = 20;

/// What a single-use refresh token resolves back to: the target and the specific announcer under
/// it whose entry should be renewed.
struct RefreshBinding {
    target: Hash,
    announcer: Hash,
}

struct Aged<T> {
    value: T,
    inserted_at: Instant,
}

impl<T> Aged<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
        }
    }

    fn is_expired(&self, max_age: Duration) -> bool {
        self.inserted_at.elapsed() > max_age
    }
}

/// One announcer's peer record under a given `target`.
struct AnnounceEntry {
    peer: Peer,
    refresh: Option<[u8; 32]>,
}

/// The bounded cache backing `lookup`/`findPeer`/`announce`/`unannounce`/`refresh`/`mutableGet`/
/// `mutablePut`/`immutableGet`/`immutablePut`.
///
/// `max_size` bounds the number of distinct *targets* held in the announce table and the number
/// of entries in each of the mutable/immutable tables independently; this is a practical reading
/// of the single `maxSize` knob rather than a single shared LRU across record kinds, since
/// the three record kinds have unrelated key spaces.
pub struct PersistentStore {
    max_age: Duration,
    announces: LruCache<Hash, HashMap<Hash, Aged<AnnounceEntry>>>,
    mutables: LruCache<Hash, Aged<MutableRecord>>,
    immutables: LruCache<Hash, Aged<Vec<u8>>>,
    refreshes: LruCache<Hash, RefreshBinding>,
}

impl PersistentStore {
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        let cap = NonZeroUsize::new(max_size.max(1)).expect("max_size coerced to at least 1");
        Self {
            max_age,
            announces: LruCache::new(cap),
            mutables: LruCache::new(cap),
            immutables: LruCache::new(cap),
            refreshes: LruCache::new(cap),
        }
    }

    /// Verifies and stores one announcer's peer record at `target`.
    ///
    /// `token` is whatever anti-amplification token the RPC layer attached to this request; it is
    /// folded into the signable construction but never itself validated here — that is the RPC
    /// layer's job. If `refresh` is present, binds a cheap-renewal token to this entry so a later
    /// `refresh` call can skip re-verifying the signature.
    pub fn apply_announce(
        &mut self,
        target: Hash,
        node_id: Hash,
        token: &[u8],
        peer: Peer,
        refresh: Option<[u8; 32]>,
        signature: &ed25519_dalek::Signature,
    ) -> Result<()> {
        let signable = Announce::signable(&target, &node_id, token, &peer, refresh.as_ref(), Namespace::Announce);
        if !peer.public_key.verify(&signable.0, signature) {
            return Err(Error::InvalidSignature);
        }

        let announcer = peer.public_key.target();
        let entries = self.announces.get_or_insert_mut(target, HashMap::new);
        entries.insert(announcer, Aged::new(AnnounceEntry { peer, refresh }));

        if let Some(token) = refresh {
            self.refreshes.put(
                crate::identity::hash(&token),
                RefreshBinding { target, announcer },
            );
        }
        Ok(())
    }

    /// Removes one announcer's record at `target`. A mismatched signature or an unknown announcer
    /// is a silent no-op: there is no oracle value in distinguishing "wrong signature" from
    /// "nothing to remove" over the wire.
    pub fn unannounce(
        &mut self,
        target: Hash,
        node_id: Hash,
        token: &[u8],
        peer: &Peer,
        signature: &ed25519_dalek::Signature,
    ) {
        let signable = Announce::signable(&target, &node_id, token, peer, None, Namespace::Unannounce);
        if !peer.public_key.verify(&signable.0, signature) {
            return;
        }

        if let Some(entries) = self.announces.peek_mut(&target) {
            entries.remove(&peer.public_key.target());
            if entries.is_empty() {
                self.announces.pop(&target);
            }
        }
    }

    /// Renews an existing announce entry's age without re-verifying the original signature,
    /// consuming `token` and handing back a fresh one — a refresh token is single-use. Returns
    /// the renewed peer record and its replacement token, or `None` if
    /// `token` is unknown, already spent, or its entry has since been evicted.
    pub fn refresh(&mut self, token: &[u8; 32]) -> Option<(Peer, [u8; 32])> {
        let binding = self.refreshes.pop(&crate::identity::hash(token))?;
        let entries = self.announces.peek_mut(&binding.target)?;
        let entry = entries.get_mut(&binding.announcer)?;
        entry.inserted_at = Instant::now();
        let peer = entry.peer.clone();

        let mut new_token = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut new_token);
        self.refreshes
            .put(crate::identity::hash(&new_token), binding);

        Some((peer, new_token))
    }

    /// Returns up to [`LOOKUP_LIMIT`] live (non-expired) peer records announced for `target`,
    /// most recently inserted first.
    pub fn lookup(&mut self, target: Hash) -> Vec<Peer> {
        let max_age = self.max_age;
        let Some(entries) = self.announces.get_mut(&target) else {
            return Vec::new();
        };
        entries.retain(|_, entry| !entry.is_expired(max_age));

        let mut live: Vec<&Aged<AnnounceEntry>> = entries.values().collect();
        live.sort_by_key(|entry| std::cmp::Reverse(entry.inserted_at));

        let peers = live
            .into_iter()
            .take(LOOKUP_LIMIT)
            .map(|entry| entry.peer.clone())
            .collect();

        if entries.is_empty() {
            self.announces.pop(&target);
        }
        peers
    }

    /// Returns one live (non-expired) peer record for `target`, if any.
    /// Prefers the most recently inserted entry when several announcers share the target.
    pub fn find_peer(&mut self, target: Hash) -> Option<Peer> {
        let max_age = self.max_age;
        let entries = self.announces.get_mut(&target)?;
        entries.retain(|_, entry| !entry.is_expired(max_age));
        let peer = entries
            .values()
            .max_by_key(|entry| entry.inserted_at)
            .map(|entry| entry.peer.clone());
        if entries.is_empty() {
            self.announces.pop(&target);
        }
        peer
    }

    /// Returns the stored record iff its `seq` is at least `requested_seq`,
    /// letting a requester that already knows a fresh-enough value skip re-fetching it.
    pub fn mutable_get(&mut self, target: Hash, requested_seq: u64) -> Option<MutableRecord> {
        let max_age = self.max_age;
        if self.mutables.peek(&target).is_some_and(|e| e.is_expired(max_age)) {
            self.mutables.pop(&target);
            return None;
        }
        self.mutables
            .get(&target)
            .filter(|aged| aged.value.seq >= requested_seq)
            .map(|aged| aged.value.clone())
    }

    /// Stores a mutable record, enforcing monotonic `seq` per public key.
    pub fn mutable_put(&mut self, record: MutableRecord) -> Result<()> {
        wire::validate_value_len(&record.value)?;

        let signable = wire::MutablePutRequest::signable(record.seq, &record.value);
        if !record.public_key.verify(&signable.0, &record.signature) {
            return Err(Error::InvalidSignature);
        }

        let target = record.public_key.target();
        if let Some(existing) = self.mutables.peek(&target) {
            if record.seq < existing.value.seq {
                return Err(Error::SeqTooLow {
                    seq: record.seq,
                    stored: existing.value.seq,
                });
            }
            if record.seq == existing.value.seq && record.value != existing.value.value {
                return Err(Error::SeqReused { seq: record.seq });
            }
        }

        self.mutables.put(target, Aged::new(record));
        Ok(())
    }

    pub fn immutable_get(&mut self, target: Hash) -> Option<Vec<u8>> {
        let max_age = self.max_age;
        if self.immutables.peek(&target).is_some_and(|e| e.is_expired(max_age)) {
            self.immutables.pop(&target);
            return None;
        }
        self.immutables.get(&target).map(|aged| aged.value.clone())
    }

    /// Stores a content-addressed value under the caller-claimed `target`, verifying
    /// `target == hash(value)`. A mismatch is rejected rather than silently re-keyed under the
    /// true hash, since a request envelope's `target` is what routed this put to this node in the
    /// first place; storing it elsewhere would just get it lost.
    pub fn immutable_put(&mut self, target: Hash, value: Vec<u8>) -> Result<()> {
        wire::validate_value_len(&value)?;
        if crate::identity::hash(&value) != target {
            return Err(Error::TargetMismatch);
        }
        self.immutables.put(target, Aged::new(value));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.announces.len() + self.mutables.len() + self.immutables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
