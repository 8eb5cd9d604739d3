//! Session identity, lifecycle states and per-session state.

use std::fmt;
use std::time::Instant;

use crate::address::HttpAddress;
use crate::channel::{ChannelHandle, Direction};
use crate::error::{EndReason, SessionError};
use crate::identity::PeerId;
use crate::network::NetworkType;
use crate::queue::MessageQueue;
use crate::wire::FrameReader;

/// Stable handle into the session arena. Never reused within a plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Active,
    Disconnecting,
    Closed,
}

impl SessionState {
    /// Forward-only transitions. `Connecting -> Disconnecting` covers a failed handshake.
    pub fn advance(self, to: SessionState) -> Result<SessionState, SessionError> {
        use SessionState::*;
        match (self, to) {
            (Connecting, Active)
            | (Connecting, Disconnecting)
            | (Active, Disconnecting)
            | (Disconnecting, Closed) => Ok(to),
            (from, to) => Err(SessionError::InvalidTransition { from, to }),
        }
    }

    /// Whether the session still accepts payload.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Active)
    }
}

/// Originating side: condition of the push (PUT) channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushLink {
    Open,
    /// Close requested; reopen once it completes if `reconnect` is set.
    Closing { reconnect: bool },
    /// Temporarily disconnected after going idle.
    Closed,
}

pub struct Session {
    pub(crate) id: SessionId,
    pub(crate) peer: PeerId,
    pub(crate) tag: u32,
    pub(crate) address: HttpAddress,
    pub(crate) network: NetworkType,
    pub(crate) state: SessionState,
    pub(crate) send: Option<ChannelHandle>,
    pub(crate) recv: Option<ChannelHandle>,
    /// Correlation URL; set on the originating side so channels can be reopened.
    pub(crate) url: Option<String>,
    pub(crate) queue: MessageQueue,
    pub(crate) reader: Option<FrameReader>,
    /// Inbound bytes held back while throttled.
    pub(crate) held: Vec<u8>,
    pub(crate) next_receive: Option<Instant>,
    /// Channel overhead not yet attributed to a completion.
    pub(crate) overhead: usize,
    pub(crate) push: PushLink,
    /// Closes requested during teardown that have not been confirmed yet.
    pub(crate) closes_pending: usize,
    pub(crate) end_reason: Option<EndReason>,
}

impl Session {
    pub fn new(
        id: SessionId,
        peer: PeerId,
        tag: u32,
        address: HttpAddress,
        network: NetworkType,
    ) -> Self {
        Self {
            id,
            peer,
            tag,
            address,
            network,
            state: SessionState::Connecting,
            send: None,
            recv: None,
            url: None,
            queue: MessageQueue::new(peer),
            reader: None,
            held: Vec::new(),
            next_receive: None,
            overhead: 0,
            push: PushLink::Closed,
            closes_pending: 0,
            end_reason: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn address(&self) -> &HttpAddress {
        &self.address
    }

    pub fn network(&self) -> NetworkType {
        self.network
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn queued_messages(&self) -> usize {
        self.queue.len()
    }

    pub fn bytes_queued(&self) -> usize {
        self.queue.bytes_queued()
    }

    pub fn next_receive(&self) -> Option<Instant> {
        self.next_receive
    }

    pub(crate) fn handle(&self, direction: Direction) -> Option<ChannelHandle> {
        match direction {
            Direction::Send => self.send,
            Direction::Recv => self.recv,
        }
    }

    pub(crate) fn slot(&mut self, direction: Direction) -> &mut Option<ChannelHandle> {
        match direction {
            Direction::Send => &mut self.send,
            Direction::Recv => &mut self.recv,
        }
    }

    pub(crate) fn set_state(&mut self, to: SessionState) -> Result<(), SessionError> {
        self.state = self.state.advance(to)?;
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("tag", &self.tag)
            .field("state", &self.state)
            .field("send", &self.send)
            .field("recv", &self.recv)
            .field("queued", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn forward_transitions_allowed() {
        assert_eq!(Connecting.advance(Active), Ok(Active));
        assert_eq!(Connecting.advance(Disconnecting), Ok(Disconnecting));
        assert_eq!(Active.advance(Disconnecting), Ok(Disconnecting));
        assert_eq!(Disconnecting.advance(Closed), Ok(Closed));
    }

    #[test]
    fn backward_and_skipping_transitions_rejected() {
        for (from, to) in [
            (Active, Connecting),
            (Disconnecting, Active),
            (Closed, Connecting),
            (Closed, Active),
            (Active, Closed),
            (Connecting, Closed),
            (Active, Active),
        ] {
            assert!(matches!(
                from.advance(to),
                Err(SessionError::InvalidTransition { .. })
            ));
        }
    }

    #[test]
    fn new_session_starts_connecting() {
        let addr = HttpAddress::from_url("http://127.0.0.1:8080/", 0).unwrap();
        let s = Session::new(SessionId(1), PeerId::from_bytes([3; 32]), 7, addr, NetworkType::Loopback);
        assert_eq!(s.state(), Connecting);
        assert!(s.state().is_live());
        assert_eq!(s.bytes_queued(), 0);
        assert_eq!(s.handle(Direction::Send), None);
    }
}
