use std::collections::BTreeSet;

use peer_registry::{PeerId, Record};

/// Decides which player to bind, following the records of the player registry.
///
/// A player matching the preferred prefix is bound as soon as it shows up, unless a preferred one
/// is bound already. Otherwise the first player to show up is bound while nothing is, and when the
/// bound player goes away, the remaining ones are searched for a replacement.
///
/// A choice counts as made as soon as it is handed out, not only once the registry confirms it
/// with a selection record, so a burst of new players yields a single choice.
#[derive(Debug, Default)]
pub struct AutoSelect {
    prefer: Option<String>,
    active: BTreeSet<PeerId>,
    selected: Option<PeerId>,
    /// Handed out, but not confirmed by the registry yet.
    pending: Option<PeerId>,
}

impl AutoSelect {
    pub fn new(prefer: Option<String>) -> Self {
        Self { prefer, ..Self::default() }
    }

    fn preferred(&self, id: &str) -> bool {
        self.prefer.as_deref().map_or(false, |prefix| id.starts_with(prefix))
    }

    /// The player that is bound, or about to be.
    pub fn current(&self) -> Option<&str> {
        self.pending.as_deref().or(self.selected.as_deref())
    }

    fn choose(&mut self, id: PeerId) -> Option<PeerId> {
        self.pending = Some(id.clone());
        Some(id)
    }

    /// Feed a record, returning the player that should be selected next, if any.
    pub fn observe(&mut self, record: &Record) -> Option<PeerId> {
        match record {
            Record::Added { id, .. } => {
                self.active.insert(id.clone());
                let current = self.current();
                let upgrade = self.preferred(id) && !current.map_or(false, |c| self.preferred(c));
                if current.is_none() || upgrade {
                    self.choose(id.clone())
                } else {
                    None
                }
            }
            Record::Removed { id, .. } => {
                self.active.remove(id);
                if self.current() != Some(id.as_str()) {
                    return None;
                }
                self.pending = None;
                if self.selected.as_deref() == Some(id.as_str()) {
                    self.selected = None;
                }
                self.replacement().and_then(|id| self.choose(id))
            }
            Record::Selection { id, .. } => {
                if self.pending == *id {
                    self.pending = None;
                }
                self.selected = id.clone();
                None
            }
            Record::Status { .. } | Record::Updated { .. } => None,
        }
    }

    /// Selecting `id` failed, so it is no longer about to be bound.
    pub fn select_failed(&mut self, id: &str) {
        if self.pending.as_deref() == Some(id) {
            self.pending = None;
        }
    }

    fn replacement(&self) -> Option<PeerId> {
        self.active.iter().find(|id| self.preferred(id)).or_else(|| self.active.iter().next()).cloned()
    }
}
