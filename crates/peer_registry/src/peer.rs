use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{PeerAddress, PeerId, Properties};

/// Lifecycle of a peer. See [`PeerState::can_advance_to`] for the allowed transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Discovered,
    Introspecting,
    Active,
    /// Introspection failed. The entry lingers for a grace period and is never announced.
    Failed,
    Removed,
}

impl PeerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Failed | PeerState::Removed)
    }

    /// Whether a peer currently counts as present on the bus.
    pub fn is_live(self) -> bool {
        matches!(self, PeerState::Discovered | PeerState::Introspecting | PeerState::Active)
    }

    pub fn can_advance_to(self, next: PeerState) -> bool {
        use PeerState::*;
        match (self, next) {
            (Discovered, Introspecting) | (Introspecting, Active) => true,
            (Discovered | Introspecting, Failed) => true,
            (Removed, Removed) => false,
            (_, Removed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// The local mirror of one remote object.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub address: PeerAddress,
    pub generation: u64,
    pub properties: Properties,
    state: PeerState,
    /// Whether an Added record was emitted for this generation, i.e. whether a Removed record is owed.
    announced: bool,
    /// Cancels the property watcher of an active peer.
    pub(crate) watcher: Option<CancellationToken>,
    /// Set once the single resubscription attempt after a lost subscription was made.
    pub(crate) resubscribed: bool,
}

impl Peer {
    pub fn new(id: PeerId, address: PeerAddress, generation: u64) -> Self {
        Self {
            id,
            address,
            generation,
            properties: Properties::new(),
            state: PeerState::Discovered,
            announced: false,
            watcher: None,
            resubscribed: false,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn announced(&self) -> bool {
        self.announced
    }

    /// Move to `next`, refusing any transition that would go backwards.
    pub(crate) fn advance(&mut self, next: PeerState) -> bool {
        if !self.state.can_advance_to(next) {
            log::error!("refusing transition of {} (generation {}) from {} to {}", self.id, self.generation, self.state, next);
            return false;
        }
        self.state = next;
        if next == PeerState::Active {
            self.announced = true;
        }
        if next.is_terminal() {
            if let Some(token) = self.watcher.take() {
                token.cancel();
            }
        }
        true
    }

    /// Merge `delta` into the mirrored properties, returning the entries that actually changed.
    pub(crate) fn merge(&mut self, delta: Properties) -> Properties {
        let mut changed = Properties::new();
        for (name, value) in delta {
            if self.properties.get(&name) != Some(&value) {
                self.properties.insert(name.clone(), value.clone());
                changed.insert(name, value);
            }
        }
        changed
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id.clone(),
            state: self.state,
            generation: self.generation,
            properties: self.properties.clone(),
        }
    }
}

/// Point-in-time copy of a [`Peer`], handed out to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub state: PeerState,
    pub generation: u64,
    pub properties: Properties,
}
