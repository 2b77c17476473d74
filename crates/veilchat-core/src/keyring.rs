//! Per-peer key lifecycle.
//!
//! The [`KeyRing`] is the single authoritative store of conversation key
//! state. Every mutation goes through [`KeyRing::open`], [`KeyRing::apply`],
//! [`KeyRing::apply_for`] or [`KeyRing::close`]; nothing else touches key
//! fields.
//!
//! # State Machine
//!
//! ```text
//!            KeyOffered            KeyAnnounced (ack)
//! Pending ─────────────▶ AwaitingPeerKey ─────────────▶ Ready ◀──┐
//!    │                          │            KeyWrapped   │  │    │ RotationConfirmed
//!    └──────── KeyWrapped ──────┴────────────────────────▶│  │    │ RotationAborted
//!                                                KeyRotated  ▼    │
//!                                                         Rotating┘
//!
//! any non-terminal state ── Revoked ──▶ Revoked (terminal)
//! ```
//!
//! # Invariants
//!
//! - Generation only increases; a transition carrying a generation below
//!   the entry's current one is stale and has no effect
//! - Two keys for the same generation resolve to the one that outranks the
//!   other; the loser stays available for decryption at that generation
//! - Only an announce creates an entry besides [`KeyRing::open`]; wraps for
//!   an unknown or closed peer are dropped
//! - Invalid transitions (e.g. anything after `Revoked`) are ignored, never
//!   surfaced as errors
//! - Key material is available only in `Ready` and `Rotating`
//! - Entries are independent: each sits behind its own mutex, so different
//!   peers never contend, and a reader never sees a half-applied transition

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use veilchat_crypto::{PublicKeyBytes, SymmetricKey};

use crate::{error::ExchangeError, peer::PeerId};

/// Capacity of the status change broadcast channel.
const STATUS_CHANNEL_CAPACITY: usize = 256;

type Entries = HashMap<PeerId, Arc<Mutex<PeerKeyEntry>>>;

/// Lifecycle state of a peer's conversation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyState {
    /// Conversation requested, no key material yet.
    Pending,
    /// Local wrap sent, waiting for the peer's acknowledgement or key.
    AwaitingPeerKey,
    /// A usable conversation key is active.
    Ready,
    /// A local rotation is in flight; the previous key stays active.
    Rotating,
    /// Terminal. The peer closed the conversation or was removed.
    Revoked,
}

impl KeyState {
    /// True for the states in which a conversation key may be used.
    pub fn has_usable_key(self) -> bool {
        matches!(self, Self::Ready | Self::Rotating)
    }

    /// True for `Revoked`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Revoked)
    }
}

/// A requested change to one peer's key state.
#[derive(Debug, Clone)]
pub enum Transition {
    /// Peer's public identity key, as announced by the peer.
    ///
    /// Announces are not signed: the key is trusted as far as the push
    /// channel that delivered it.
    KeyAnnounced {
        /// Announced key
        public_key: PublicKeyBytes,
        /// Announcement counter, independent of the key generation
        generation: u64,
    },
    /// Local key wrapped and published, usable once the peer acknowledges.
    KeyOffered {
        /// Offered conversation key
        key: SymmetricKey,
        /// Generation of the offered key
        generation: u64,
    },
    /// Committed conversation key (peer's wrap, or our own wrap when the
    /// conversation is usable immediately).
    KeyWrapped {
        /// Unwrapped conversation key
        key: SymmetricKey,
        /// Generation of the key
        generation: u64,
    },
    /// Local rotation started; the new key is pending until confirmed.
    KeyRotated {
        /// New conversation key
        key: SymmetricKey,
        /// Generation of the new key
        generation: u64,
    },
    /// Local rotation published; the pending key becomes active.
    RotationConfirmed {
        /// Generation being confirmed
        generation: u64,
    },
    /// Local rotation could not be published; the pending key is dropped.
    RotationAborted {
        /// Generation being abandoned
        generation: u64,
    },
    /// Conversation closed by the peer.
    Revoked,
}

impl Transition {
    /// Variant name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::KeyAnnounced { .. } => "KeyAnnounced",
            Self::KeyOffered { .. } => "KeyOffered",
            Self::KeyWrapped { .. } => "KeyWrapped",
            Self::KeyRotated { .. } => "KeyRotated",
            Self::RotationConfirmed { .. } => "RotationConfirmed",
            Self::RotationAborted { .. } => "RotationAborted",
            Self::Revoked => "Revoked",
        }
    }

    /// Whether this transition may bring a new entry into existence.
    fn creates_entry(&self) -> bool {
        matches!(self, Self::KeyAnnounced { .. })
    }
}

/// Result of applying a transition. Informational only: none of these are
/// errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The entry changed.
    Applied,
    /// Generation at or below the current one; dropped.
    Stale,
    /// Not valid in the current state (or the entry is gone); dropped.
    Ignored,
}

/// Proof of which incarnation of an entry an in-flight operation started
/// against. Responses carrying a ticket for a closed or reopened entry are
/// dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    peer: PeerId,
    incarnation: u64,
}

impl Ticket {
    /// Peer the ticket refers to.
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }
}

/// Key-free view of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    /// Peer
    pub peer: PeerId,
    /// Creation number of this entry
    pub incarnation: u64,
    /// Current state
    pub state: KeyState,
    /// Generation of the active key (0 before any key)
    pub generation: u64,
    /// Generation of a pending key, if any
    pub pending_generation: Option<u64>,
    /// Generations of retired keys still usable for decryption, newest first
    pub retired_generations: Vec<u64>,
    /// Whether the peer's public identity key is known
    pub has_public_key: bool,
}

impl EntrySnapshot {
    /// Ticket for operations started from this snapshot.
    pub fn ticket(&self) -> Ticket {
        Ticket { peer: self.peer.clone(), incarnation: self.incarnation }
    }
}

/// Notification emitted whenever an entry's state or generation changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStatusChange {
    /// Peer whose entry changed
    pub peer: PeerId,
    /// New state, `None` once the entry was closed
    pub state: Option<KeyState>,
    /// Generation after the change
    pub generation: u64,
}

/// The key currently used for encryption.
#[derive(Debug, Clone)]
pub struct ActiveKey {
    /// Generation of `key`
    pub generation: u64,
    /// Conversation key
    pub key: SymmetricKey,
}

/// Why no key was found for a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    NotReady,
    Expired,
}

/// Cryptographic state for one peer.
struct PeerKeyEntry {
    peer: PeerId,
    incarnation: u64,
    state: KeyState,
    generation: u64,
    public_key: Option<PublicKeyBytes>,
    public_key_generation: Option<u64>,
    active: Option<SymmetricKey>,
    pending: Option<(u64, SymmetricKey)>,
    retired: VecDeque<(u64, SymmetricKey)>,
    handshake_in_flight: bool,
    detached: bool,
}

impl PeerKeyEntry {
    fn new(peer: PeerId, incarnation: u64) -> Self {
        Self {
            peer,
            incarnation,
            state: KeyState::Pending,
            generation: 0,
            public_key: None,
            public_key_generation: None,
            active: None,
            pending: None,
            retired: VecDeque::new(),
            handshake_in_flight: false,
            detached: false,
        }
    }

    fn state(&self) -> KeyState {
        self.state
    }

    fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            peer: self.peer.clone(),
            incarnation: self.incarnation,
            state: self.state,
            generation: self.generation,
            pending_generation: self.pending.as_ref().map(|(generation, _)| *generation),
            retired_generations: self.retired.iter().map(|(generation, _)| *generation).collect(),
            has_public_key: self.public_key.is_some(),
        }
    }

    fn apply(&mut self, transition: Transition, retain: usize) -> ApplyOutcome {
        if self.detached || self.state.is_terminal() {
            return ApplyOutcome::Ignored;
        }

        match transition {
            Transition::Revoked => {
                self.revoke();
                ApplyOutcome::Applied
            },
            Transition::KeyAnnounced { public_key, generation } => {
                self.on_announced(public_key, generation, retain)
            },
            Transition::KeyOffered { key, generation } => self.on_offered(key, generation, retain),
            Transition::KeyWrapped { key, generation } => self.on_wrapped(key, generation, retain),
            Transition::KeyRotated { key, generation } => self.on_rotated(key, generation),
            Transition::RotationConfirmed { generation } => self.on_confirmed(generation, retain),
            Transition::RotationAborted { generation } => self.on_aborted(generation),
        }
    }

    fn on_announced(
        &mut self,
        public_key: PublicKeyBytes,
        generation: u64,
        retain: usize,
    ) -> ApplyOutcome {
        if self.public_key_generation.is_some_and(|current| generation <= current) {
            return ApplyOutcome::Stale;
        }

        self.public_key = Some(public_key);
        self.public_key_generation = Some(generation);

        // The peer announcing itself while we wait is its acknowledgement.
        if self.state == KeyState::AwaitingPeerKey {
            if let Some((offered, key)) = self.pending.take() {
                self.promote(offered, key, retain);
            }
        }

        ApplyOutcome::Applied
    }

    fn on_offered(&mut self, key: SymmetricKey, generation: u64, retain: usize) -> ApplyOutcome {
        if generation < self.generation {
            return ApplyOutcome::Stale;
        }
        if generation == self.generation {
            return self.contest_active(key, retain);
        }
        if self.state != KeyState::Pending {
            return ApplyOutcome::Ignored;
        }

        self.pending = Some((generation, key));
        self.state = KeyState::AwaitingPeerKey;
        self.handshake_in_flight = false;
        ApplyOutcome::Applied
    }

    fn on_wrapped(&mut self, key: SymmetricKey, generation: u64, retain: usize) -> ApplyOutcome {
        if generation < self.generation {
            return ApplyOutcome::Stale;
        }
        if generation == self.generation {
            return self.contest_active(key, retain);
        }

        // Both sides minted a key for the same generation. Both evaluate the
        // same tie-break, so both keep the same key.
        let ours_wins = match &self.pending {
            Some((pending, ours)) => *pending == generation && !key.outranks(ours),
            None => false,
        };
        if ours_wins {
            // The peer may already have sealed messages under its own key.
            self.keep_alternate(generation, key, retain);
            if self.state == KeyState::AwaitingPeerKey {
                if let Some((offered, ours)) = self.pending.take() {
                    self.promote(offered, ours, retain);
                    return ApplyOutcome::Applied;
                }
            }
            return ApplyOutcome::Stale;
        }

        // A local rotation past this generation is still in flight.
        let mut ahead = None;
        if let Some((pending, ours)) = self.pending.take() {
            if pending > generation {
                if self.state == KeyState::Rotating {
                    ahead = Some((pending, ours));
                }
            } else {
                self.keep_alternate(pending, ours, retain);
            }
        }

        self.promote(generation, key, retain);
        if ahead.is_some() {
            self.pending = ahead;
            self.state = KeyState::Rotating;
        }
        self.handshake_in_flight = false;
        ApplyOutcome::Applied
    }

    fn on_rotated(&mut self, key: SymmetricKey, generation: u64) -> ApplyOutcome {
        if generation <= self.generation {
            return ApplyOutcome::Stale;
        }
        if self.state != KeyState::Ready {
            return ApplyOutcome::Ignored;
        }

        self.pending = Some((generation, key));
        self.state = KeyState::Rotating;
        ApplyOutcome::Applied
    }

    fn on_confirmed(&mut self, generation: u64, retain: usize) -> ApplyOutcome {
        if self.state != KeyState::Rotating {
            return ApplyOutcome::Ignored;
        }

        match self.pending.take() {
            Some((pending, key)) if pending == generation => {
                self.promote(pending, key, retain);
                ApplyOutcome::Applied
            },
            other => {
                self.pending = other;
                ApplyOutcome::Stale
            },
        }
    }

    fn on_aborted(&mut self, generation: u64) -> ApplyOutcome {
        let matches_pending = self.pending.as_ref().is_some_and(|(pending, _)| *pending == generation);
        if self.state != KeyState::Rotating || !matches_pending {
            return ApplyOutcome::Ignored;
        }

        self.pending = None;
        self.state = KeyState::Ready;
        ApplyOutcome::Applied
    }

    /// Both sides committed a key for the current generation. Every side
    /// keeps whichever key outranks the other, so they converge; the other
    /// key is kept for messages already sealed under it.
    fn contest_active(&mut self, key: SymmetricKey, retain: usize) -> ApplyOutcome {
        let Some(active) = self.active.take() else {
            return ApplyOutcome::Stale;
        };

        if key.outranks(&active) {
            self.keep_alternate(self.generation, active, retain);
            self.active = Some(key);
            self.handshake_in_flight = false;
            ApplyOutcome::Applied
        } else {
            self.active = Some(active);
            self.keep_alternate(self.generation, key, retain);
            ApplyOutcome::Stale
        }
    }

    /// Retain `key` for `generation` unless it is already held.
    fn keep_alternate(&mut self, generation: u64, key: SymmetricKey, retain: usize) {
        let same = |candidate: &SymmetricKey| candidate.as_bytes() == key.as_bytes();
        let known = (generation == self.generation && self.active.as_ref().is_some_and(same))
            || self.pending.as_ref().is_some_and(|(pending, k)| *pending == generation && same(k))
            || self.retired.iter().any(|(retired, k)| *retired == generation && same(k));

        if !known {
            self.retire(generation, key, retain);
        }
    }

    fn promote(&mut self, generation: u64, key: SymmetricKey, retain: usize) {
        if let Some(previous) = self.active.take() {
            self.retire(self.generation, previous, retain);
        }
        self.active = Some(key);
        self.generation = generation;
        self.state = KeyState::Ready;
    }

    fn retire(&mut self, generation: u64, key: SymmetricKey, retain: usize) {
        if retain == 0 {
            return;
        }
        self.retired.push_front((generation, key));
        self.retired.truncate(retain);
    }

    fn revoke(&mut self) {
        self.drop_key_material();
        self.state = KeyState::Revoked;
    }

    fn detach(&mut self) {
        self.drop_key_material();
        self.detached = true;
    }

    fn drop_key_material(&mut self) {
        self.active = None;
        self.pending = None;
        self.retired.clear();
        self.public_key = None;
        self.handshake_in_flight = false;
    }

    fn active_key(&self) -> Option<ActiveKey> {
        if !self.state.has_usable_key() {
            return None;
        }
        self.active.clone().map(|key| ActiveKey { generation: self.generation, key })
    }

    /// Every key held for `generation`, the preferred one first.
    fn keys_for_generation(&self, generation: u64) -> Result<Vec<SymmetricKey>, Lookup> {
        if !self.state.has_usable_key() {
            return Err(Lookup::NotReady);
        }

        let mut keys = Vec::new();
        if generation == self.generation {
            keys.extend(self.active.clone());
        }
        if let Some((_, key)) = self.pending.as_ref().filter(|(pending, _)| *pending == generation)
        {
            keys.push(key.clone());
        }
        keys.extend(
            self.retired
                .iter()
                .filter(|(retired, _)| *retired == generation)
                .map(|(_, key)| key.clone()),
        );

        if !keys.is_empty() {
            Ok(keys)
        } else if generation >= self.generation {
            Err(Lookup::NotReady)
        } else {
            Err(Lookup::Expired)
        }
    }
}

/// Authoritative store of per-peer key state.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct KeyRing {
    entries: RwLock<Entries>,
    next_incarnation: AtomicU64,
    retained_generations: usize,
    changes: broadcast::Sender<KeyStatusChange>,
}

impl KeyRing {
    /// Create an empty key ring keeping up to `retained_generations`
    /// previous keys per peer for late-arriving messages.
    pub fn new(retained_generations: usize) -> Self {
        let (changes, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            next_incarnation: AtomicU64::new(1),
            retained_generations,
            changes,
        }
    }

    /// Open a conversation entry for `peer`.
    ///
    /// Idempotent: an existing entry is returned unchanged.
    pub fn open(&self, peer: &PeerId) -> EntrySnapshot {
        let (entry, created) = self.entry_or_create(peer);
        let snapshot = lock(&entry).snapshot();

        if created {
            tracing::info!("Opened conversation entry for {peer}");
            self.notify(&snapshot);
        }

        snapshot
    }

    /// Apply a transition to `peer`'s entry.
    ///
    /// `KeyAnnounced` creates the entry if the peer is unknown (a
    /// peer-initiated conversation); every other transition on an unknown
    /// peer is ignored, so a late wrap cannot resurrect a closed
    /// conversation.
    pub fn apply(&self, peer: &PeerId, transition: Transition) -> ApplyOutcome {
        let entry = if transition.creates_entry() {
            let (entry, created) = self.entry_or_create(peer);
            if created {
                tracing::info!("Peer {peer} started a conversation ({})", transition.name());
            }
            entry
        } else if let Some(entry) = self.entry(peer) {
            entry
        } else {
            tracing::debug!("Ignoring {} for unknown peer {peer}", transition.name());
            return ApplyOutcome::Ignored;
        };

        self.transition(&entry, None, transition)
    }

    /// Apply a transition only if the entry is still the incarnation the
    /// ticket was issued for. Never creates an entry.
    ///
    /// Used for completions of operations that awaited the transport: if
    /// the conversation was closed (or closed and reopened) meanwhile, the
    /// late result is dropped.
    pub fn apply_for(&self, ticket: &Ticket, transition: Transition) -> ApplyOutcome {
        let Some(entry) = self.entry(&ticket.peer) else {
            tracing::debug!(
                "Dropping {} for {}: conversation closed while in flight",
                transition.name(),
                ticket.peer
            );
            return ApplyOutcome::Ignored;
        };

        self.transition(&entry, Some(ticket.incarnation), transition)
    }

    /// Remove `peer`'s entry. Later lookups report `KeyNotReady`.
    ///
    /// Returns false if there was no entry.
    pub fn close(&self, peer: &PeerId) -> bool {
        let removed = self.write_entries().remove(peer);

        let Some(entry) = removed else {
            return false;
        };

        let generation = {
            let mut entry = lock(&entry);
            entry.detach();
            entry.generation
        };

        tracing::info!("Closed conversation with {peer}");
        let _ = self.changes.send(KeyStatusChange { peer: peer.clone(), state: None, generation });
        true
    }

    /// Current state, `None` if no entry exists.
    pub fn status(&self, peer: &PeerId) -> Option<KeyState> {
        self.with_entry(peer, PeerKeyEntry::state)
    }

    /// Key-free view of `peer`'s entry.
    pub fn snapshot(&self, peer: &PeerId) -> Option<EntrySnapshot> {
        self.with_entry(peer, PeerKeyEntry::snapshot)
    }

    /// Active key for encryption. Only available in `Ready` and `Rotating`.
    pub fn symmetric_key_for(&self, peer: &PeerId) -> Result<ActiveKey, ExchangeError> {
        self.with_entry(peer, PeerKeyEntry::active_key)
            .flatten()
            .ok_or_else(|| ExchangeError::KeyNotReady { peer: peer.clone() })
    }

    /// Key valid at `generation`: the active key, a pending rotation key or
    /// a retained previous key.
    ///
    /// # Errors
    ///
    /// - `KeyNotReady` if no key is usable yet, or `generation` is newer than
    ///   anything we hold (its key has not arrived)
    /// - `GenerationExpired` if `generation` is older than every retained key
    pub fn key_for_generation(
        &self,
        peer: &PeerId,
        generation: u64,
    ) -> Result<SymmetricKey, ExchangeError> {
        self.keys_for_generation(peer, generation)?
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::KeyNotReady { peer: peer.clone() })
    }

    /// All keys held for `generation`, preferred first. More than one exists
    /// when both sides minted a key for the same generation.
    ///
    /// Fails like [`KeyRing::key_for_generation`].
    pub fn keys_for_generation(
        &self,
        peer: &PeerId,
        generation: u64,
    ) -> Result<Vec<SymmetricKey>, ExchangeError> {
        match self.with_entry(peer, |entry| entry.keys_for_generation(generation)) {
            Some(Ok(keys)) => Ok(keys),
            Some(Err(Lookup::Expired)) => {
                Err(ExchangeError::GenerationExpired { peer: peer.clone(), generation })
            },
            Some(Err(Lookup::NotReady)) | None => {
                Err(ExchangeError::KeyNotReady { peer: peer.clone() })
            },
        }
    }

    /// Peer's public identity key, if known.
    pub fn public_key(&self, peer: &PeerId) -> Option<PublicKeyBytes> {
        self.with_entry(peer, |entry| entry.public_key.clone()).flatten()
    }

    /// Record a public key obtained by fetching it, if none is known yet.
    ///
    /// Announce counters are untouched, so a later announce still applies.
    pub fn remember_public_key(&self, ticket: &Ticket, public_key: PublicKeyBytes) -> bool {
        let Some(entry) = self.entry(&ticket.peer) else {
            return false;
        };
        let mut entry = lock(&entry);

        if entry.detached
            || entry.state.is_terminal()
            || entry.incarnation != ticket.incarnation
            || entry.public_key.is_some()
        {
            return false;
        }

        entry.public_key = Some(public_key);
        true
    }

    /// True if the ticket's entry still exists, is the same incarnation and
    /// is not revoked. Checked before anything leaves for the peer.
    pub fn is_live(&self, ticket: &Ticket) -> bool {
        self.entry(&ticket.peer).is_some_and(|entry| {
            let entry = lock(&entry);
            entry.incarnation == ticket.incarnation && !entry.detached && !entry.state.is_terminal()
        })
    }

    /// Reserve the initial handshake for a `Pending` entry.
    ///
    /// Returns `None` if the entry is missing, past `Pending`, or another
    /// handshake is already in flight. The reservation is released by the
    /// next committed key or by [`KeyRing::release_handshake`].
    pub fn claim_handshake(&self, peer: &PeerId) -> Option<Ticket> {
        let entry = self.entry(peer)?;
        let mut entry = lock(&entry);

        if entry.state != KeyState::Pending || entry.handshake_in_flight {
            return None;
        }

        entry.handshake_in_flight = true;
        Some(Ticket { peer: entry.peer.clone(), incarnation: entry.incarnation })
    }

    /// Release a handshake reservation after a failed attempt.
    pub fn release_handshake(&self, ticket: &Ticket) {
        if let Some(entry) = self.entry(&ticket.peer) {
            let mut entry = lock(&entry);
            if entry.incarnation == ticket.incarnation {
                entry.handshake_in_flight = false;
            }
        }
    }

    /// True if a key at `generation` is older than the active one and would
    /// be dropped without a look at the key itself. Lets callers skip an
    /// unwrap that cannot matter.
    pub fn is_stale(&self, peer: &PeerId, generation: u64) -> bool {
        self.with_entry(peer, |entry| generation < entry.generation).unwrap_or(false)
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<KeyStatusChange> {
        self.changes.subscribe()
    }

    /// Peers with an entry.
    pub fn peers(&self) -> Vec<PeerId> {
        self.read_entries().keys().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    /// True if no entries exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn transition(
        &self,
        entry: &Mutex<PeerKeyEntry>,
        expected_incarnation: Option<u64>,
        transition: Transition,
    ) -> ApplyOutcome {
        let name = transition.name();
        let mut entry = lock(&entry);

        if expected_incarnation.is_some_and(|incarnation| incarnation != entry.incarnation) {
            tracing::debug!("Dropping {name} for {}: conversation was reopened", entry.peer);
            return ApplyOutcome::Ignored;
        }

        let before = (entry.state, entry.generation);
        let outcome = entry.apply(transition, self.retained_generations);
        let after = (entry.state, entry.generation);

        match outcome {
            ApplyOutcome::Applied => {
                tracing::debug!(
                    "{name} for {}: {:?}@{} -> {:?}@{}",
                    entry.peer,
                    before.0,
                    before.1,
                    after.0,
                    after.1
                );
                if before != after {
                    let snapshot = entry.snapshot();
                    drop(entry);
                    self.notify(&snapshot);
                }
            },
            ApplyOutcome::Stale => {
                tracing::debug!("Discarding stale {name} for {} (at {:?}@{})", entry.peer, after.0, after.1);
            },
            ApplyOutcome::Ignored => {
                tracing::debug!("Ignoring {name} for {} in state {:?}", entry.peer, after.0);
            },
        }

        outcome
    }

    fn notify(&self, snapshot: &EntrySnapshot) {
        // No subscribers is fine.
        let _ = self.changes.send(KeyStatusChange {
            peer: snapshot.peer.clone(),
            state: Some(snapshot.state),
            generation: snapshot.generation,
        });
    }

    #[allow(clippy::expect_used)]
    fn read_entries(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().expect("KeyRing map lock poisoned")
    }

    #[allow(clippy::expect_used)]
    fn write_entries(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().expect("KeyRing map lock poisoned")
    }

    fn entry(&self, peer: &PeerId) -> Option<Arc<Mutex<PeerKeyEntry>>> {
        self.read_entries().get(peer).cloned()
    }

    fn entry_or_create(&self, peer: &PeerId) -> (Arc<Mutex<PeerKeyEntry>>, bool) {
        if let Some(entry) = self.entry(peer) {
            return (entry, false);
        }

        let mut entries = self.write_entries();
        let mut created = false;
        let entry = entries
            .entry(peer.clone())
            .or_insert_with(|| {
                created = true;
                let incarnation = self.next_incarnation.fetch_add(1, Ordering::Relaxed);
                Arc::new(Mutex::new(PeerKeyEntry::new(peer.clone(), incarnation)))
            })
            .clone();

        (entry, created)
    }

    fn with_entry<R>(&self, peer: &PeerId, f: impl FnOnce(&PeerKeyEntry) -> R) -> Option<R> {
        let entry = self.entry(peer)?;
        let entry = lock(&entry);
        Some(f(&entry))
    }
}

impl Default for KeyRing {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_RETAINED_GENERATIONS)
    }
}

#[allow(clippy::expect_used)]
fn lock(entry: &Mutex<PeerKeyEntry>) -> MutexGuard<'_, PeerKeyEntry> {
    entry.lock().expect("KeyRing entry mutex poisoned")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> SymmetricKey {
        SymmetricKey::from_bytes(&[byte; 32]).unwrap()
    }

    fn public_key(byte: u8) -> PublicKeyBytes {
        PublicKeyBytes::from_der(vec![byte; 8])
    }

    fn peer() -> PeerId {
        PeerId::new("B")
    }

    fn ready_ring(generation: u64) -> KeyRing {
        let ring = KeyRing::new(4);
        ring.open(&peer());
        ring.apply(&peer(), Transition::KeyWrapped { key: key(generation as u8), generation });
        ring
    }

    #[test]
    fn open_is_idempotent() {
        let ring = KeyRing::new(4);
        let first = ring.open(&peer());
        let second = ring.open(&peer());

        assert_eq!(first.state, KeyState::Pending);
        assert_eq!(first, second);
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn wrapped_key_makes_entry_ready() {
        let ring = ready_ring(1);

        assert_eq!(ring.status(&peer()), Some(KeyState::Ready));
        let active = ring.symmetric_key_for(&peer()).unwrap();
        assert_eq!(active.generation, 1);
        assert_eq!(active.key.as_bytes(), key(1).as_bytes());
    }

    #[test]
    fn pending_entry_has_no_key() {
        let ring = KeyRing::new(4);
        ring.open(&peer());

        assert!(matches!(
            ring.symmetric_key_for(&peer()),
            Err(ExchangeError::KeyNotReady { .. })
        ));
    }

    #[test]
    fn stale_wrap_is_noop() {
        let ring = ready_ring(1);

        let outcome = ring.apply(&peer(), Transition::KeyWrapped { key: key(9), generation: 0 });
        assert_eq!(outcome, ApplyOutcome::Stale);

        // Same generation, same key: a redelivery.
        let outcome = ring.apply(&peer(), Transition::KeyWrapped { key: key(1), generation: 1 });
        assert_eq!(outcome, ApplyOutcome::Stale);

        assert_eq!(ring.symmetric_key_for(&peer()).unwrap().key.as_bytes(), key(1).as_bytes());
    }

    #[test]
    fn equal_generation_keys_converge_on_the_larger() {
        let ring = ready_ring(1);

        let outcome = ring.apply(&peer(), Transition::KeyWrapped { key: key(0), generation: 1 });
        assert_eq!(outcome, ApplyOutcome::Stale);

        let outcome = ring.apply(&peer(), Transition::KeyWrapped { key: key(9), generation: 1 });
        assert_eq!(outcome, ApplyOutcome::Applied);

        let active = ring.symmetric_key_for(&peer()).unwrap();
        assert_eq!(active.generation, 1);
        assert_eq!(active.key.as_bytes(), key(9).as_bytes());
    }

    #[test]
    fn local_rotation_keeps_old_key_active_until_confirmed() {
        let ring = ready_ring(1);

        let outcome = ring.apply(&peer(), Transition::KeyRotated { key: key(2), generation: 2 });
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(ring.status(&peer()), Some(KeyState::Rotating));

        let active = ring.symmetric_key_for(&peer()).unwrap();
        assert_eq!(active.generation, 1);
        assert_eq!(ring.key_for_generation(&peer(), 2).unwrap().as_bytes(), key(2).as_bytes());

        let outcome = ring.apply(&peer(), Transition::RotationConfirmed { generation: 2 });
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(ring.status(&peer()), Some(KeyState::Ready));
        assert_eq!(ring.symmetric_key_for(&peer()).unwrap().generation, 2);

        // Previous generation still decrypts.
        assert_eq!(ring.key_for_generation(&peer(), 1).unwrap().as_bytes(), key(1).as_bytes());
    }

    #[test]
    fn rotation_requires_ready() {
        let ring = KeyRing::new(4);
        ring.open(&peer());

        let outcome = ring.apply(&peer(), Transition::KeyRotated { key: key(2), generation: 2 });
        assert_eq!(outcome, ApplyOutcome::Ignored);
        assert_eq!(ring.status(&peer()), Some(KeyState::Pending));
    }

    #[test]
    fn aborted_rotation_returns_to_ready() {
        let ring = ready_ring(1);
        ring.apply(&peer(), Transition::KeyRotated { key: key(2), generation: 2 });

        assert_eq!(
            ring.apply(&peer(), Transition::RotationAborted { generation: 2 }),
            ApplyOutcome::Applied
        );
        assert_eq!(ring.status(&peer()), Some(KeyState::Ready));
        assert_eq!(ring.snapshot(&peer()).unwrap().pending_generation, None);
    }

    #[test]
    fn mismatched_confirmation_is_stale() {
        let ring = ready_ring(1);
        ring.apply(&peer(), Transition::KeyRotated { key: key(2), generation: 2 });

        assert_eq!(
            ring.apply(&peer(), Transition::RotationConfirmed { generation: 3 }),
            ApplyOutcome::Stale
        );
        assert_eq!(ring.status(&peer()), Some(KeyState::Rotating));
    }

    #[test]
    fn peer_rotation_during_local_rotation_resolves_by_tie_break() {
        // Peer's key outranks ours: theirs wins, our confirmation is dropped.
        let ring = ready_ring(1);
        ring.apply(&peer(), Transition::KeyRotated { key: key(0x10), generation: 2 });
        assert_eq!(
            ring.apply(&peer(), Transition::KeyWrapped { key: key(0x20), generation: 2 }),
            ApplyOutcome::Applied
        );
        assert_eq!(
            ring.apply(&peer(), Transition::RotationConfirmed { generation: 2 }),
            ApplyOutcome::Ignored
        );
        assert_eq!(ring.symmetric_key_for(&peer()).unwrap().key.as_bytes(), key(0x20).as_bytes());

        // Our key outranks theirs: their wrap is dropped, ours confirms.
        let ring = ready_ring(1);
        ring.apply(&peer(), Transition::KeyRotated { key: key(0x30), generation: 2 });
        assert_eq!(
            ring.apply(&peer(), Transition::KeyWrapped { key: key(0x20), generation: 2 }),
            ApplyOutcome::Stale
        );
        ring.apply(&peer(), Transition::RotationConfirmed { generation: 2 });
        assert_eq!(ring.symmetric_key_for(&peer()).unwrap().key.as_bytes(), key(0x30).as_bytes());
    }

    #[test]
    fn older_peer_wrap_keeps_local_rotation_in_flight() {
        let ring = ready_ring(1);
        ring.apply(&peer(), Transition::KeyRotated { key: key(3), generation: 3 });

        assert_eq!(
            ring.apply(&peer(), Transition::KeyWrapped { key: key(2), generation: 2 }),
            ApplyOutcome::Applied
        );
        let snapshot = ring.snapshot(&peer()).unwrap();
        assert_eq!(snapshot.state, KeyState::Rotating);
        assert_eq!(snapshot.generation, 2);
        assert_eq!(snapshot.pending_generation, Some(3));

        ring.apply(&peer(), Transition::RotationConfirmed { generation: 3 });
        assert_eq!(ring.symmetric_key_for(&peer()).unwrap().generation, 3);
        assert_eq!(ring.snapshot(&peer()).unwrap().retired_generations, vec![2, 1]);
    }

    #[test]
    fn offered_key_waits_for_acknowledgement() {
        let ring = KeyRing::new(4);
        ring.open(&peer());

        ring.apply(&peer(), Transition::KeyOffered { key: key(1), generation: 1 });
        assert_eq!(ring.status(&peer()), Some(KeyState::AwaitingPeerKey));
        assert!(ring.symmetric_key_for(&peer()).is_err());

        ring.apply(&peer(), Transition::KeyAnnounced { public_key: public_key(1), generation: 1 });
        assert_eq!(ring.status(&peer()), Some(KeyState::Ready));
        assert_eq!(ring.symmetric_key_for(&peer()).unwrap().key.as_bytes(), key(1).as_bytes());
    }

    #[test]
    fn stale_announce_is_dropped() {
        let ring = KeyRing::new(4);
        ring.apply(&peer(), Transition::KeyAnnounced { public_key: public_key(1), generation: 3 });

        let outcome =
            ring.apply(&peer(), Transition::KeyAnnounced { public_key: public_key(2), generation: 2 });
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(ring.public_key(&peer()), Some(public_key(1)));
    }

    #[test]
    fn revocation_is_terminal() {
        let ring = ready_ring(1);

        assert_eq!(ring.apply(&peer(), Transition::Revoked), ApplyOutcome::Applied);
        assert_eq!(ring.status(&peer()), Some(KeyState::Revoked));
        assert!(ring.symmetric_key_for(&peer()).is_err());

        let outcome = ring.apply(&peer(), Transition::KeyWrapped { key: key(5), generation: 5 });
        assert_eq!(outcome, ApplyOutcome::Ignored);
        assert_eq!(ring.status(&peer()), Some(KeyState::Revoked));
        assert!(ring.key_for_generation(&peer(), 5).is_err());
    }

    #[test]
    fn close_removes_entry() {
        let ring = ready_ring(1);

        assert!(ring.close(&peer()));
        assert_eq!(ring.status(&peer()), None);
        assert!(matches!(
            ring.symmetric_key_for(&peer()),
            Err(ExchangeError::KeyNotReady { .. })
        ));
        assert!(!ring.close(&peer()));
    }

    #[test]
    fn ticket_from_closed_incarnation_is_dropped() {
        let ring = KeyRing::new(4);
        let ticket = ring.open(&peer()).ticket();

        ring.close(&peer());
        assert_eq!(
            ring.apply_for(&ticket, Transition::KeyWrapped { key: key(1), generation: 1 }),
            ApplyOutcome::Ignored
        );
        assert_eq!(ring.status(&peer()), None);

        // Reopened entry is a new incarnation.
        ring.open(&peer());
        assert_eq!(
            ring.apply_for(&ticket, Transition::KeyWrapped { key: key(1), generation: 1 }),
            ApplyOutcome::Ignored
        );
        assert_eq!(ring.status(&peer()), Some(KeyState::Pending));
    }

    #[test]
    fn non_creating_transition_on_unknown_peer_is_ignored() {
        let ring = KeyRing::new(4);

        assert_eq!(ring.apply(&peer(), Transition::Revoked), ApplyOutcome::Ignored);
        assert_eq!(
            ring.apply(&peer(), Transition::KeyRotated { key: key(1), generation: 1 }),
            ApplyOutcome::Ignored
        );
        assert!(ring.is_empty());
    }

    #[test]
    fn only_an_announce_starts_a_conversation() {
        let ring = KeyRing::new(4);

        assert_eq!(
            ring.apply(&peer(), Transition::KeyWrapped { key: key(1), generation: 1 }),
            ApplyOutcome::Ignored
        );
        assert_eq!(ring.status(&peer()), None);

        ring.apply(&peer(), Transition::KeyAnnounced { public_key: public_key(1), generation: 1 });
        ring.apply(&peer(), Transition::KeyWrapped { key: key(1), generation: 1 });
        assert_eq!(ring.status(&peer()), Some(KeyState::Ready));
    }

    #[test]
    fn late_wrap_does_not_reopen_closed_conversation() {
        let ring = ready_ring(1);
        ring.close(&peer());

        assert_eq!(
            ring.apply(&peer(), Transition::KeyWrapped { key: key(2), generation: 2 }),
            ApplyOutcome::Ignored
        );
        assert_eq!(ring.status(&peer()), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn displaced_equal_generation_key_still_decrypts() {
        let ring = ready_ring(1);
        ring.apply(&peer(), Transition::KeyRotated { key: key(0x30), generation: 2 });

        // Peer rotated too and loses the tie-break, but may have sealed
        // messages under its key already.
        ring.apply(&peer(), Transition::KeyWrapped { key: key(0x20), generation: 2 });
        ring.apply(&peer(), Transition::RotationConfirmed { generation: 2 });

        let keys: Vec<_> = ring
            .keys_for_generation(&peer(), 2)
            .unwrap()
            .iter()
            .map(|key| *key.as_bytes())
            .collect();
        assert_eq!(keys, vec![*key(0x30).as_bytes(), *key(0x20).as_bytes()]);
        assert_eq!(ring.key_for_generation(&peer(), 2).unwrap().as_bytes(), key(0x30).as_bytes());

        // Redelivery of the losing key is not retained twice.
        ring.apply(&peer(), Transition::KeyWrapped { key: key(0x20), generation: 2 });
        assert_eq!(ring.keys_for_generation(&peer(), 2).unwrap().len(), 2);
    }

    #[test]
    fn handshake_claim_is_exclusive() {
        let ring = KeyRing::new(4);
        ring.open(&peer());

        let ticket = ring.claim_handshake(&peer()).unwrap();
        assert!(ring.claim_handshake(&peer()).is_none());

        ring.release_handshake(&ticket);
        assert!(ring.claim_handshake(&peer()).is_some());
    }

    #[test]
    fn retired_keys_are_bounded() {
        let ring = KeyRing::new(2);
        ring.open(&peer());
        for generation in 1..=5u64 {
            ring.apply(&peer(), Transition::KeyWrapped { key: key(generation as u8), generation });
        }

        let snapshot = ring.snapshot(&peer()).unwrap();
        assert_eq!(snapshot.generation, 5);
        assert_eq!(snapshot.retired_generations, vec![4, 3]);
        assert!(matches!(
            ring.key_for_generation(&peer(), 2),
            Err(ExchangeError::GenerationExpired { generation: 2, .. })
        ));
        assert!(matches!(
            ring.key_for_generation(&peer(), 6),
            Err(ExchangeError::KeyNotReady { .. })
        ));
    }

    #[test]
    fn status_changes_are_broadcast() {
        let ring = KeyRing::new(4);
        let mut changes = ring.subscribe();

        ring.open(&peer());
        ring.apply(&peer(), Transition::KeyWrapped { key: key(1), generation: 1 });
        ring.close(&peer());

        let states: Vec<_> =
            std::iter::from_fn(|| changes.try_recv().ok()).map(|change| change.state).collect();
        assert_eq!(states, vec![Some(KeyState::Pending), Some(KeyState::Ready), None]);
    }
}
