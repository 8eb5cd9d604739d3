//! Session arena plus a peer index of published sessions.

use std::collections::HashMap;

use crate::address::HttpAddress;
use crate::error::SessionError;
use crate::identity::PeerId;
use crate::session::{Session, SessionId};

#[derive(Debug, Default)]
pub struct SessionTable {
    arena: HashMap<SessionId, Session>,
    /// Published sessions only. A session leaves this index when teardown begins.
    by_peer: HashMap<PeerId, Vec<SessionId>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Published session for `peer`, optionally restricted to one correlation tag.
    pub fn find(&self, peer: &PeerId, tag: Option<u32>) -> Option<SessionId> {
        self.by_peer.get(peer)?.iter().copied().find(|id| match tag {
            None => true,
            Some(tag) => self.arena.get(id).is_some_and(|s| s.tag == tag),
        })
    }

    pub fn find_by_address(&self, peer: &PeerId, address: &HttpAddress) -> Option<SessionId> {
        self.by_peer
            .get(peer)?
            .iter()
            .copied()
            .find(|id| self.arena.get(id).is_some_and(|s| &s.address == address))
    }

    /// Publish a session. Fails if one with the same `(peer, tag)` is already published.
    pub fn insert(&mut self, session: Session) -> Result<SessionId, SessionError> {
        let (id, peer, tag) = (session.id, session.peer, session.tag);
        if self.find(&peer, Some(tag)).is_some() {
            return Err(SessionError::DuplicateConnection { peer, tag });
        }
        self.arena.insert(id, session);
        self.by_peer.entry(peer).or_default().push(id);
        Ok(id)
    }

    /// Drop from the peer index; the session stays addressable by id.
    pub fn unpublish(&mut self, id: SessionId) {
        let Some(peer) = self.arena.get(&id).map(|s| s.peer) else {
            return;
        };
        if let Some(ids) = self.by_peer.get_mut(&peer) {
            ids.retain(|x| *x != id);
            if ids.is_empty() {
                self.by_peer.remove(&peer);
            }
        }
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.unpublish(id);
        self.arena.remove(&id)
    }

    /// Snapshot of the published sessions for `peer`.
    pub fn sessions_of(&self, peer: &PeerId) -> Vec<SessionId> {
        self.by_peer.get(peer).cloned().unwrap_or_default()
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.arena.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.arena.get_mut(&id)
    }

    /// Every session in the arena, published or not.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.arena.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn published(&self) -> usize {
        self.by_peer.values().map(Vec::len).sum()
    }
}
