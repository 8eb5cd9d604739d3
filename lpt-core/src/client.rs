//! Originating side: opens a long-poll GET and a PUT per session.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::address::{correlation_url, HttpAddress};
use crate::channel::{ChannelError, ChannelHandle, ChannelTarget, Channels, CloseStatus, Direction};
use crate::config::PluginConfig;
use crate::env::Env;
use crate::error::{EndReason, SessionError};
use crate::identity::PeerId;
use crate::manager::{Closed, Flush, ReceiveOutcome, SessionManager};
use crate::network::NetworkType;
use crate::plugin::Transport;
use crate::queue::Completion;
use crate::session::{PushLink, Session, SessionId, SessionState};
use crate::timeout::TimerKind;

pub const KEEPALIVE_FACTOR: u32 = 3;

pub struct ClientPlugin<C, E> {
    own: PeerId,
    next_tag: u32,
    manager: SessionManager<C, E>,
}

impl<C: Channels, E: Env> ClientPlugin<C, E> {
    pub fn new(own: PeerId, config: PluginConfig, channels: C, env: E) -> Self {
        Self {
            own,
            next_tag: 1,
            manager: SessionManager::new(config, channels, env),
        }
    }

    pub fn own_peer(&self) -> &PeerId {
        &self.own
    }

    pub fn manager(&self) -> &SessionManager<C, E> {
        &self.manager
    }

    pub fn channels_mut(&mut self) -> &mut C {
        self.manager.channels_mut()
    }

    pub fn env_mut(&mut self) -> &mut E {
        self.manager.env_mut()
    }

    /// Tags are never zero; the counter wraps past it.
    fn allocate_tag(&mut self) -> u32 {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.checked_add(1).unwrap_or(1);
        tag
    }

    fn reopen(&mut self, id: SessionId, direction: Direction) -> Result<ChannelHandle, ChannelError> {
        let url = self
            .manager
            .session(id)
            .and_then(|s| s.url.clone())
            .ok_or(ChannelError::Refused)?;
        let handle = self.manager.open(&ChannelTarget { url, direction })?;
        if self.manager.bind(id, direction, handle).is_err() {
            self.manager.channels_mut().close(handle);
            return Err(ChannelError::Refused);
        }
        if direction == Direction::Send {
            if let Some(s) = self.manager.session_mut(id) {
                s.push = PushLink::Open;
            }
        }
        debug!(session = %id, %handle, ?direction, "channel reopened");
        Ok(handle)
    }

    fn set_push(&mut self, id: SessionId, link: PushLink) {
        if let Some(s) = self.manager.session_mut(id) {
            s.push = link;
        }
    }

    /// The push channel sat empty long enough: disconnect it until there is data again.
    fn push_idle(&mut self, id: SessionId) {
        let Some(s) = self.manager.session(id) else {
            return;
        };
        if s.state() != SessionState::Active || s.push != PushLink::Open || !s.queue.is_empty() {
            return;
        }
        let link = match self.manager.close_half(id, Direction::Send) {
            Some(CloseStatus::Pending) => PushLink::Closing { reconnect: false },
            Some(CloseStatus::Closed) | None => PushLink::Closed,
        };
        debug!(session = %id, ?link, "push channel idle");
        self.set_push(id, link);
    }

    fn half_closed(&mut self, id: SessionId, direction: Direction, now: Instant) {
        let Some(s) = self.manager.session(id) else {
            return;
        };
        if s.state() != SessionState::Active {
            return;
        }
        if direction == Direction::Recv {
            debug!(session = %id, "long poll ended by remote");
            self.manager.begin_disconnect(id, EndReason::Disconnect, now);
            return;
        }
        let backlog = !s.queue.is_empty();
        let reopen = match s.push {
            PushLink::Closing { reconnect } => reconnect || backlog,
            PushLink::Open | PushLink::Closed => backlog,
        };
        self.set_push(id, PushLink::Closed);
        if !reopen {
            return;
        }
        if let Err(err) = self.reopen(id, Direction::Send) {
            warn!(session = %id, error = %err, "push reopen failed");
            self.manager.begin_disconnect(id, EndReason::Channel(err), now);
        }
    }

    fn after_close(&mut self, closed: Closed, now: Instant) {
        if let Closed::Half {
            session, direction, ..
        } = closed
        {
            self.half_closed(session, direction, now);
        }
    }
}

impl<C: Channels, E: Env> Transport for ClientPlugin<C, E> {
    fn get_session(&mut self, peer: PeerId, address: &HttpAddress, now: Instant) -> Result<SessionId, SessionError> {
        if let Some(id) = self.manager.table().find_by_address(&peer, address) {
            trace!(session = %id, "reusing session");
            return Ok(id);
        }
        if self.manager.connections() + 2 > self.manager.config().max_connections {
            warn!(peer = %peer.short(), "connection limit reached");
            return Err(SessionError::Overloaded);
        }
        let network = self.manager.env().classify(address);
        if network == NetworkType::Unspecified {
            return Err(SessionError::UnclassifiedAddress);
        }
        let tag = self.allocate_tag();
        let url = correlation_url(address, &self.own, tag);
        let id = self.manager.allocate_id();
        let mut session = Session::new(id, peer, tag, address.clone(), network);

        let recv = self.manager.open(&ChannelTarget {
            url: url.clone(),
            direction: Direction::Recv,
        })?;
        let send = match self.manager.open(&ChannelTarget {
            url: url.clone(),
            direction: Direction::Send,
        }) {
            Ok(h) => h,
            Err(err) => {
                self.manager.channels_mut().close(recv);
                debug!(peer = %peer.short(), error = %err, "push channel failed to open");
                return Err(err.into());
            }
        };
        session.recv = Some(recv);
        session.send = Some(send);
        session.url = Some(url);
        session.push = PushLink::Open;
        let id = self.manager.publish(session, now)?;
        debug!(session = %id, peer = %peer.short(), %address, tag, "session created");
        Ok(id)
    }

    fn send(
        &mut self,
        session: SessionId,
        payload: Bytes,
        timeout_hint: Duration,
        completion: Option<Completion>,
        now: Instant,
    ) -> Result<usize, SessionError> {
        // Checked before touching the push channel so a refused send leaves it alone.
        let push = self.manager.has_room(session, payload.len())?.push;
        match push {
            PushLink::Open => {}
            PushLink::Closing { .. } => self.set_push(session, PushLink::Closing { reconnect: true }),
            PushLink::Closed => {
                self.reopen(session, Direction::Send)?;
            }
        }
        self.manager.cancel_timer((session, TimerKind::PutIdle));
        trace!(%session, len = payload.len(), ?timeout_hint, "send");
        self.manager.enqueue(session, payload, completion, now)
    }

    fn disconnect_session(&mut self, session: SessionId, now: Instant) -> Result<(), SessionError> {
        self.manager.disconnect(session, now)
    }

    fn disconnect_peer(&mut self, peer: &PeerId, now: Instant) -> usize {
        self.manager.disconnect_peer(peer, now)
    }

    fn update_session_timeout(&mut self, session: SessionId, now: Instant) -> Result<(), SessionError> {
        self.manager.update_timeout(session, now)
    }

    fn query_network_type(&self, session: SessionId) -> Result<NetworkType, SessionError> {
        self.manager.network_type(session)
    }

    fn on_channel_writable(&mut self, handle: ChannelHandle, max: usize, now: Instant) {
        if let Flush::Progress {
            session,
            drained: true,
        } = self.manager.on_writable(handle, max, now)
        {
            let after = self.manager.config().put_disconnect_timeout();
            self.manager.schedule((session, TimerKind::PutIdle), after, now);
        }
    }

    fn on_channel_data(&mut self, handle: ChannelHandle, bytes: &[u8], now: Instant) -> ReceiveOutcome {
        self.manager.on_data(handle, bytes, now)
    }

    fn on_channel_overhead(&mut self, handle: ChannelHandle, bytes: usize) {
        self.manager.on_overhead(handle, bytes);
    }

    fn on_channel_error(&mut self, handle: ChannelHandle, err: ChannelError, now: Instant) {
        let closed = self.manager.on_error(handle, err, now);
        self.after_close(closed, now);
    }

    fn on_channel_closed(&mut self, handle: ChannelHandle, now: Instant) {
        let closed = self.manager.on_closed(handle, now);
        self.after_close(closed, now);
    }

    fn poll_timeouts(&mut self, now: Instant) {
        while let Some(key) = self.manager.pop_timer(now) {
            if let Some((id, TimerKind::PutIdle)) = self.manager.handle_timer(key, now) {
                self.push_idle(id);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.manager.next_deadline()
    }

    fn session_count(&self) -> usize {
        self.manager.table().len()
    }

    fn session_state(&self, session: SessionId) -> Option<SessionState> {
        self.manager.session(session).map(Session::state)
    }

    fn shutdown(&mut self, now: Instant) {
        debug!(sessions = self.manager.table().len(), "client shutting down");
        self.manager.shutdown(now);
    }

    fn keepalive_factor(&self) -> u32 {
        KEEPALIVE_FACTOR
    }

    /// The originating side listens nowhere.
    fn check_address(&self, _address: &HttpAddress) -> bool {
        false
    }
}
