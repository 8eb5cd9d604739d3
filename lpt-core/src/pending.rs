//! Accepting side: halves of a session waiting for their counterpart.
//! Nothing here is visible to the upper layer until both halves are bound.

use std::collections::HashMap;

use crate::address::HttpAddress;
use crate::channel::{ChannelHandle, Direction};
use crate::error::SessionError;
use crate::identity::PeerId;
use crate::network::NetworkType;
use crate::session::SessionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HalfOpen {
    pub id: SessionId,
    pub peer: PeerId,
    pub tag: u32,
    pub address: HttpAddress,
    pub network: NetworkType,
    pub send: Option<ChannelHandle>,
    pub recv: Option<ChannelHandle>,
}

impl HalfOpen {
    pub fn new(id: SessionId, peer: PeerId, tag: u32, address: HttpAddress, network: NetworkType) -> Self {
        Self {
            id,
            peer,
            tag,
            address,
            network,
            send: None,
            recv: None,
        }
    }

    fn slot(&mut self, direction: Direction) -> &mut Option<ChannelHandle> {
        match direction {
            Direction::Send => &mut self.send,
            Direction::Recv => &mut self.recv,
        }
    }

    pub fn handles(&self) -> impl Iterator<Item = ChannelHandle> + '_ {
        self.send.iter().chain(self.recv.iter()).copied()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Offer {
    /// Bound; still waiting for the other half.
    Waiting(SessionId),
    /// Both halves present. The entry has left the table.
    Complete(HalfOpen),
}

#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<(PeerId, u32), HalfOpen>,
    by_handle: HashMap<ChannelHandle, (PeerId, u32)>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, peer: &PeerId, tag: u32) -> bool {
        self.entries.contains_key(&(*peer, tag))
    }

    /// Start waiting for `(entry.peer, entry.tag)`. Replaces nothing: callers check `contains` first.
    pub fn open(&mut self, entry: HalfOpen) {
        self.entries.entry((entry.peer, entry.tag)).or_insert(entry);
    }

    /// Bind `handle` as the `direction` half of an open entry.
    pub fn offer(
        &mut self,
        peer: PeerId,
        tag: u32,
        direction: Direction,
        handle: ChannelHandle,
    ) -> Result<Offer, SessionError> {
        let key = (peer, tag);
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or(SessionError::InvalidSession)?;
        let slot = entry.slot(direction);
        if slot.is_some() {
            return Err(SessionError::DuplicateConnection { peer, tag });
        }
        *slot = Some(handle);
        let (id, complete) = (entry.id, entry.send.is_some() && entry.recv.is_some());
        if !complete {
            self.by_handle.insert(handle, key);
            return Ok(Offer::Waiting(id));
        }
        let done = self.entries.remove(&key).ok_or(SessionError::InvalidSession)?;
        for h in done.handles() {
            self.by_handle.remove(&h);
        }
        Ok(Offer::Complete(done))
    }

    pub fn owner(&self, handle: ChannelHandle) -> Option<SessionId> {
        let key = self.by_handle.get(&handle)?;
        self.entries.get(key).map(|e| e.id)
    }

    /// Forget a handle that went away. Returns the entry if it has no halves left.
    pub fn release_handle(&mut self, handle: ChannelHandle) -> Option<HalfOpen> {
        let key = self.by_handle.remove(&handle)?;
        let entry = self.entries.get_mut(&key)?;
        if entry.send == Some(handle) {
            entry.send = None;
        }
        if entry.recv == Some(handle) {
            entry.recv = None;
        }
        if entry.send.is_none() && entry.recv.is_none() {
            return self.entries.remove(&key);
        }
        None
    }

    /// Remove the entry that owns `id`, e.g. when its sub-timeout fires.
    pub fn expire(&mut self, id: SessionId) -> Option<HalfOpen> {
        let key = self
            .entries
            .iter()
            .find(|(_, e)| e.id == id)
            .map(|(k, _)| *k)?;
        let entry = self.entries.remove(&key)?;
        for h in entry.handles() {
            self.by_handle.remove(&h);
        }
        Some(entry)
    }

    pub fn is_pending(&self, id: SessionId) -> bool {
        self.entries.values().any(|e| e.id == id)
    }

    /// Channels held by half-open entries.
    pub fn connections(&self) -> usize {
        self.by_handle.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> Vec<HalfOpen> {
        self.by_handle.clear();
        self.entries.drain().map(|(_, e)| e).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, tag: u32) -> HalfOpen {
        let addr = HttpAddress::from_url("http://10.0.0.2:4000/", 0).unwrap();
        HalfOpen::new(SessionId(id), PeerId::from_bytes([9; 32]), tag, addr, NetworkType::Lan)
    }

    fn peer() -> PeerId {
        PeerId::from_bytes([9; 32])
    }

    #[test]
    fn two_halves_complete() {
        let mut p = PendingTable::new();
        p.open(entry(1, 4));
        assert_eq!(
            p.offer(peer(), 4, Direction::Recv, ChannelHandle(10)).unwrap(),
            Offer::Waiting(SessionId(1))
        );
        assert_eq!(p.owner(ChannelHandle(10)), Some(SessionId(1)));
        assert_eq!(p.connections(), 1);
        let Offer::Complete(done) = p.offer(peer(), 4, Direction::Send, ChannelHandle(11)).unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(done.recv, Some(ChannelHandle(10)));
        assert_eq!(done.send, Some(ChannelHandle(11)));
        assert!(p.is_empty());
        assert_eq!(p.connections(), 0);
        assert_eq!(p.owner(ChannelHandle(10)), None);
    }

    #[test]
    fn same_direction_twice_is_duplicate() {
        let mut p = PendingTable::new();
        p.open(entry(1, 4));
        p.offer(peer(), 4, Direction::Recv, ChannelHandle(10)).unwrap();
        let err = p.offer(peer(), 4, Direction::Recv, ChannelHandle(12)).unwrap_err();
        assert!(matches!(err, SessionError::DuplicateConnection { tag: 4, .. }));
        assert_eq!(p.connections(), 1);
    }

    #[test]
    fn release_last_handle_drops_entry() {
        let mut p = PendingTable::new();
        p.open(entry(1, 4));
        p.offer(peer(), 4, Direction::Send, ChannelHandle(10)).unwrap();
        let gone = p.release_handle(ChannelHandle(10)).unwrap();
        assert_eq!(gone.id, SessionId(1));
        assert!(p.is_empty());
    }

    #[test]
    fn expire_by_id() {
        let mut p = PendingTable::new();
        p.open(entry(1, 4));
        p.open(entry(2, 5));
        p.offer(peer(), 5, Direction::Send, ChannelHandle(20)).unwrap();
        assert!(p.is_pending(SessionId(2)));
        let e = p.expire(SessionId(2)).unwrap();
        assert_eq!(e.send, Some(ChannelHandle(20)));
        assert_eq!(p.len(), 1);
        assert_eq!(p.connections(), 0);
        assert!(p.expire(SessionId(2)).is_none());
    }
}
