//! Session State Management
//!
//! Two shared structures coordinate the discovery workers: the peer-state
//! table, which collapses the same peer seen on several channels into one
//! entry and serializes connection attempts against it, and the session-state
//! cell, whose single `Roaming → Connected` compare-and-swap decides which
//! candidate becomes the authenticated peer.

use super::peer::PeerState;
use libp2p::PeerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use tracing::trace;

/// Lifecycle of the whole session. Moves forward only; `Connected` is
/// reachable solely from `Roaming`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Roaming = 1,
    Connected = 2,
}

/// Atomic cell holding the [`SessionState`].
#[derive(Debug)]
pub struct SessionStateCell(AtomicU8);

impl SessionStateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(SessionState::Idle as u8))
    }

    pub fn get(&self) -> SessionState {
        match self.0.load(Ordering::SeqCst) {
            0 => SessionState::Idle,
            1 => SessionState::Roaming,
            _ => SessionState::Connected,
        }
    }

    pub fn set_roaming(&self) {
        self.0.store(SessionState::Roaming as u8, Ordering::SeqCst);
    }

    /// The `Roaming → Connected` transition. Exactly one caller per session
    /// observes `true`; every later attempt fails.
    pub fn try_connect(&self) -> bool {
        self.0
            .compare_exchange(
                SessionState::Roaming as u8,
                SessionState::Connected as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

impl Default for SessionStateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of an atomic attempt to claim a peer for a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionDecision {
    /// The peer was `NotConnected` or `FailedConnecting`; it is now
    /// `Connecting` and the caller owns the attempt. `retry` is set when a
    /// previous attempt failed to connect.
    Proceed { retry: bool },
    /// Another worker already owns an attempt against this peer.
    AlreadyConnecting,
    /// The peer failed authentication earlier; final for this session.
    Blacklisted,
    /// The peer is already the authenticated one.
    AlreadyConnected,
}

/// Thread-safe mapping from peer-ID to [`PeerState`].
///
/// Entries are created on first sight and never removed during a session, so
/// a peer rediscovered on a second channel lands on the same entry.
#[derive(Debug, Default)]
pub struct PeerStateTable {
    inner: Mutex<HashMap<PeerId, PeerState>>,
}

impl PeerStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state for `peer_id`, inserting `NotConnected`
    /// first if the peer was never seen.
    pub fn load_or_store(&self, peer_id: PeerId) -> PeerState {
        let mut inner = self.inner.lock().expect("peer-state table poisoned");
        *inner.entry(peer_id).or_insert(PeerState::NotConnected)
    }

    pub fn store(&self, peer_id: PeerId, state: PeerState) {
        let mut inner = self.inner.lock().expect("peer-state table poisoned");
        trace!(peer_id = %peer_id, state = ?state, "Peer state stored");
        inner.insert(peer_id, state);
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<PeerState> {
        self.inner
            .lock()
            .expect("peer-state table poisoned")
            .get(peer_id)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("peer-state table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically claims `peer_id` for a connection attempt. Loading the
    /// current state and writing `Connecting` happens under one lock, so two
    /// workers discovering the same peer concurrently cannot both proceed.
    pub fn try_begin_connecting(&self, peer_id: PeerId) -> TransitionDecision {
        let mut inner = self.inner.lock().expect("peer-state table poisoned");
        let entry = inner.entry(peer_id).or_insert(PeerState::NotConnected);
        match *entry {
            PeerState::NotConnected => {
                *entry = PeerState::Connecting;
                TransitionDecision::Proceed { retry: false }
            }
            PeerState::FailedConnecting => {
                *entry = PeerState::Connecting;
                TransitionDecision::Proceed { retry: true }
            }
            PeerState::Connecting => TransitionDecision::AlreadyConnecting,
            PeerState::FailedAuthentication => TransitionDecision::Blacklisted,
            PeerState::Connected => TransitionDecision::AlreadyConnected,
        }
    }
}
