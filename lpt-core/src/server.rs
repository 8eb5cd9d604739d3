//! Accepting side: pairs an inbound PUT and GET into one session.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::address::{parse_correlation, HttpAddress};
use crate::channel::{ChannelError, ChannelHandle, Channels, Direction};
use crate::client::KEEPALIVE_FACTOR;
use crate::config::PluginConfig;
use crate::env::Env;
use crate::error::{EndReason, SessionError};
use crate::identity::PeerId;
use crate::manager::{Closed, ReceiveOutcome, SessionManager};
use crate::network::NetworkType;
use crate::pending::{HalfOpen, Offer, PendingTable};
use crate::plugin::Transport;
use crate::queue::Completion;
use crate::session::{Session, SessionId, SessionState};
use crate::timeout::TimerKind;

/// How an inbound request was bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// First half; waiting for the other direction.
    HalfOpen(SessionId),
    /// Second half arrived; the session is active.
    Established(SessionId),
    /// A free half of an active session was filled again (renewed GET, next PUT).
    Rebound(SessionId),
}

pub struct ServerPlugin<C, E> {
    manager: SessionManager<C, E>,
    pending: PendingTable,
    /// Where this node can be reached; compared by url, options ignored.
    addresses: Vec<HttpAddress>,
}

impl<C: Channels, E: Env> ServerPlugin<C, E> {
    pub fn new(config: PluginConfig, channels: C, env: E) -> Self {
        Self {
            manager: SessionManager::new(config, channels, env),
            pending: PendingTable::new(),
            addresses: Vec::new(),
        }
    }

    pub fn add_address(&mut self, address: HttpAddress) {
        if !self.addresses.iter().any(|a| a.url() == address.url()) {
            debug!(%address, "serving on address");
            self.addresses.push(address);
        }
    }

    pub fn addresses(&self) -> &[HttpAddress] {
        &self.addresses
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

    /// Channels held by sessions and by half-open entries.
    pub fn connections(&self) -> usize {
        self.manager.connections() + self.pending.connections()
    }

    /// Bind an inbound request. `url` is the request target, `remote` the client's address.
    /// On error the host rejects the request; nothing was retained.
    pub fn on_incoming(
        &mut self,
        handle: ChannelHandle,
        direction: Direction,
        url: &str,
        remote: &HttpAddress,
        now: Instant,
    ) -> Result<Accepted, SessionError> {
        let (peer, tag) = parse_correlation(url).map_err(|e| {
            debug!(%handle, url, error = %e, "malformed correlation");
            SessionError::from(e)
        })?;
        if self.connections() >= self.manager.config().max_connections {
            warn!(peer = %peer.short(), "connection limit reached");
            return Err(SessionError::Overloaded);
        }
        if let Some(id) = self.manager.table().find(&peer, Some(tag)) {
            self.manager.bind(id, direction, handle)?;
            self.manager.update_timeout(id, now)?;
            trace!(session = %id, %handle, ?direction, "rebound");
            return Ok(Accepted::Rebound(id));
        }
        if !self.pending.contains(&peer, tag) {
            let network = self.manager.env().classify(remote);
            if network == NetworkType::Unspecified {
                return Err(SessionError::UnclassifiedAddress);
            }
            let id = self.manager.allocate_id();
            self.pending
                .open(HalfOpen::new(id, peer, tag, remote.clone(), network));
            let wait = self.manager.config().half_open_timeout();
            self.manager.schedule((id, TimerKind::HalfOpen), wait, now);
        }
        match self.pending.offer(peer, tag, direction, handle)? {
            Offer::Waiting(id) => {
                debug!(session = %id, peer = %peer.short(), tag, ?direction, "half open");
                Ok(Accepted::HalfOpen(id))
            }
            Offer::Complete(half) => {
                self.manager.cancel_timer((half.id, TimerKind::HalfOpen));
                let mut session = Session::new(half.id, peer, tag, half.address.clone(), half.network);
                session.send = half.send;
                session.recv = half.recv;
                let id = self.manager.publish(session, now)?;
                self.manager.env_mut().session_start(id, &peer, &half.address);
                Ok(Accepted::Established(id))
            }
        }
    }

    fn expire_half_open(&mut self, id: SessionId) {
        let Some(half) = self.pending.expire(id) else {
            return;
        };
        debug!(session = %id, peer = %half.peer.short(), tag = half.tag, "half-open session expired");
        for handle in half.handles() {
            self.manager.channels_mut().close(handle);
        }
    }

    /// A half-open channel went away. True if the handle was half-open.
    fn release_half_open(&mut self, handle: ChannelHandle) -> bool {
        if self.pending.owner(handle).is_none() {
            return false;
        }
        if let Some(gone) = self.pending.release_handle(handle) {
            trace!(session = %gone.id, "half-open entry abandoned");
            self.manager.cancel_timer((gone.id, TimerKind::HalfOpen));
        }
        true
    }
}

impl<C: Channels, E: Env> Transport for ServerPlugin<C, E> {
    /// The accepting side never initiates; only existing sessions are returned.
    fn get_session(&mut self, peer: PeerId, address: &HttpAddress, _now: Instant) -> Result<SessionId, SessionError> {
        self.manager
            .table()
            .find_by_address(&peer, address)
            .ok_or(SessionError::CannotInitiate)
    }

    fn send(
        &mut self,
        session: SessionId,
        payload: Bytes,
        timeout_hint: Duration,
        completion: Option<Completion>,
        now: Instant,
    ) -> Result<usize, SessionError> {
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
        if self.pending.owner(handle).is_some() {
            return;
        }
        self.manager.on_writable(handle, max, now);
    }

    fn on_channel_data(&mut self, handle: ChannelHandle, bytes: &[u8], now: Instant) -> ReceiveOutcome {
        if let Some(id) = self.pending.owner(handle) {
            trace!(session = %id, len = bytes.len(), "data on half-open channel discarded");
            return ReceiveOutcome::Discarded;
        }
        self.manager.on_data(handle, bytes, now)
    }

    fn on_channel_overhead(&mut self, handle: ChannelHandle, bytes: usize) {
        self.manager.on_overhead(handle, bytes);
    }

    fn on_channel_error(&mut self, handle: ChannelHandle, err: ChannelError, now: Instant) {
        if self.release_half_open(handle) {
            trace!(%handle, error = %err, "half-open channel failed");
            return;
        }
        self.manager.on_error(handle, err, now);
    }

    fn on_channel_closed(&mut self, handle: ChannelHandle, now: Instant) {
        if self.release_half_open(handle) {
            return;
        }
        let Closed::Half {
            session, direction, ..
        } = self.manager.on_closed(handle, now)
        else {
            return;
        };
        let orphaned = self
            .manager
            .session(session)
            .is_some_and(|s| s.state() == SessionState::Active && s.send.is_none() && s.recv.is_none());
        if orphaned {
            debug!(%session, "both halves gone");
            self.manager.begin_disconnect(session, EndReason::Disconnect, now);
        } else {
            trace!(%session, ?direction, "waiting for peer to renew channel");
        }
    }

    fn poll_timeouts(&mut self, now: Instant) {
        while let Some(key) = self.manager.pop_timer(now) {
            if let Some((id, TimerKind::HalfOpen)) = self.manager.handle_timer(key, now) {
                self.expire_half_open(id);
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
        self.manager
            .session(session)
            .map(Session::state)
            .or_else(|| self.pending.is_pending(session).then_some(SessionState::Connecting))
    }

    fn shutdown(&mut self, now: Instant) {
        debug!(
            sessions = self.manager.table().len(),
            half_open = self.pending.len(),
            "server shutting down"
        );
        for half in self.pending.drain() {
            self.manager.cancel_timer((half.id, TimerKind::HalfOpen));
            for handle in half.handles() {
                self.manager.channels_mut().close(handle);
            }
        }
        self.manager.shutdown(now);
    }

    fn keepalive_factor(&self) -> u32 {
        KEEPALIVE_FACTOR
    }

    fn check_address(&self, address: &HttpAddress) -> bool {
        self.addresses.iter().any(|a| a.url() == address.url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CloseStatus;
    use crate::error::TransmitError;
    use crate::test_utils::{addr, completion_log, frame_bytes, peer, MockChannels, RecordingEnv};

    type Server = ServerPlugin<MockChannels, RecordingEnv>;

    fn server() -> Server {
        server_with(PluginConfig::default())
    }

    fn server_with(config: PluginConfig) -> Server {
        ServerPlugin::new(config, MockChannels::new(), RecordingEnv::new())
    }

    fn target(p: u8, tag: u32) -> String {
        format!("/{};{}", peer(p), tag)
    }

    fn remote() -> HttpAddress {
        addr("http://10.0.0.9:40000/")
    }

    const PUT: Direction = Direction::Recv;
    const GET: Direction = Direction::Send;

    /// Bind PUT as handle `base` and GET as `base + 1`.
    fn establish(s: &mut Server, p: u8, tag: u32, base: u64, now: Instant) -> SessionId {
        let first = s
            .on_incoming(ChannelHandle(base), PUT, &target(p, tag), &remote(), now)
            .unwrap();
        assert!(matches!(first, Accepted::HalfOpen(_)));
        match s
            .on_incoming(ChannelHandle(base + 1), GET, &target(p, tag), &remote(), now)
            .unwrap()
        {
            Accepted::Established(id) => id,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn both_halves_establish_session() {
        let mut s = server();
        let now = Instant::now();
        let first = s
            .on_incoming(ChannelHandle(1), GET, &target(1, 7), &remote(), now)
            .unwrap();
        let Accepted::HalfOpen(id) = first else {
            panic!("expected half open");
        };
        assert_eq!(s.session_state(id), Some(SessionState::Connecting));
        assert_eq!(s.session_count(), 0);
        assert!(s.manager().env().starts.is_empty());

        let second = s
            .on_incoming(ChannelHandle(2), PUT, &target(1, 7), &remote(), now)
            .unwrap();
        assert_eq!(second, Accepted::Established(id));
        assert_eq!(s.session_state(id), Some(SessionState::Active));
        assert_eq!(s.manager().env().starts, vec![(id, peer(1))]);
        assert_eq!(s.manager().table().find(&peer(1), Some(7)), Some(id));
        assert_eq!(s.query_network_type(id), Ok(NetworkType::Lan));
        assert_eq!(s.connections(), 2);
    }

    #[test]
    fn malformed_correlation_rejected() {
        let mut s = server();
        let urls = vec![
            "/nopeer".to_string(),
            "/abcd;1".to_string(),
            format!("/{};0", peer(1)),
            format!("/{};x", peer(1)),
        ];
        for url in &urls {
            let err = s
                .on_incoming(ChannelHandle(1), PUT, url, &remote(), Instant::now())
                .unwrap_err();
            assert!(matches!(err, SessionError::MalformedCorrelation(_)), "{url}");
        }
        assert_eq!(s.connections(), 0);
        assert_eq!(s.session_count(), 0);
    }

    #[test]
    fn same_direction_twice_while_half_open_is_duplicate() {
        let mut s = server();
        let now = Instant::now();
        s.on_incoming(ChannelHandle(1), PUT, &target(1, 3), &remote(), now)
            .unwrap();
        let err = s
            .on_incoming(ChannelHandle(2), PUT, &target(1, 3), &remote(), now)
            .unwrap_err();
        assert!(matches!(err, SessionError::DuplicateConnection { tag: 3, .. }));
        assert_eq!(s.connections(), 1);
    }

    #[test]
    fn bound_half_of_active_session_is_duplicate() {
        let mut s = server();
        let now = Instant::now();
        establish(&mut s, 1, 3, 10, now);
        let err = s
            .on_incoming(ChannelHandle(20), GET, &target(1, 3), &remote(), now)
            .unwrap_err();
        assert!(matches!(err, SessionError::DuplicateConnection { .. }));
    }

    #[test]
    fn next_put_rebinds_after_previous_completes() {
        let mut s = server();
        let now = Instant::now();
        let id = establish(&mut s, 1, 3, 10, now);
        s.on_channel_data(ChannelHandle(10), &frame_bytes(5, b"hello"), now);
        s.on_channel_closed(ChannelHandle(10), now);
        assert_eq!(s.session_state(id), Some(SessionState::Active));
        let again = s
            .on_incoming(ChannelHandle(30), PUT, &target(1, 3), &remote(), now)
            .unwrap();
        assert_eq!(again, Accepted::Rebound(id));
        assert_eq!(
            s.on_channel_data(ChannelHandle(30), &frame_bytes(6, b"again"), now),
            ReceiveOutcome::Forwarded(1)
        );
        assert_eq!(s.manager().env().frames.len(), 2);
    }

    #[test]
    fn frames_split_across_puts_reassemble() {
        let mut s = server();
        let now = Instant::now();
        establish(&mut s, 1, 3, 10, now);
        let bytes = frame_bytes(5, b"split body");
        s.on_channel_data(ChannelHandle(10), &bytes[..6], now);
        s.on_channel_closed(ChannelHandle(10), now);
        s.on_incoming(ChannelHandle(30), PUT, &target(1, 3), &remote(), now)
            .unwrap();
        assert_eq!(
            s.on_channel_data(ChannelHandle(30), &bytes[6..], now),
            ReceiveOutcome::Forwarded(1)
        );
    }

    #[test]
    fn data_on_half_open_channel_discarded() {
        let mut s = server();
        let now = Instant::now();
        s.on_incoming(ChannelHandle(1), PUT, &target(1, 3), &remote(), now)
            .unwrap();
        assert_eq!(
            s.on_channel_data(ChannelHandle(1), &frame_bytes(1, b"early"), now),
            ReceiveOutcome::Discarded
        );
        assert!(s.manager().env().frames.is_empty());
    }

    #[test]
    fn half_open_expires_silently() {
        let mut s = server();
        let now = Instant::now();
        let Accepted::HalfOpen(id) = s
            .on_incoming(ChannelHandle(1), PUT, &target(1, 3), &remote(), now)
            .unwrap()
        else {
            panic!("expected half open");
        };
        s.poll_timeouts(now + s.manager().config().half_open_timeout());
        assert_eq!(s.session_state(id), None);
        assert_eq!(s.manager().channels().closed, vec![ChannelHandle(1)]);
        assert!(s.manager().env().ends.is_empty());
        assert_eq!(s.connections(), 0);
        assert_eq!(s.next_deadline(), None);
    }

    #[test]
    fn abandoned_half_open_cancels_its_timer() {
        let mut s = server();
        let now = Instant::now();
        s.on_incoming(ChannelHandle(1), GET, &target(1, 3), &remote(), now)
            .unwrap();
        s.on_channel_closed(ChannelHandle(1), now);
        assert_eq!(s.connections(), 0);
        assert_eq!(s.next_deadline(), None);
    }

    #[test]
    fn connection_cap_includes_half_open() {
        let mut s = server_with(PluginConfig {
            max_connections: 2,
            ..PluginConfig::default()
        });
        let now = Instant::now();
        establish(&mut s, 1, 1, 10, now);
        let err = s
            .on_incoming(ChannelHandle(20), PUT, &target(2, 1), &remote(), now)
            .unwrap_err();
        assert_eq!(err, SessionError::Overloaded);
    }

    #[test]
    fn unspecified_remote_rejected() {
        let mut s = server();
        let err = s
            .on_incoming(
                ChannelHandle(1),
                PUT,
                &target(1, 1),
                &addr("http://0.0.0.0:1/"),
                Instant::now(),
            )
            .unwrap_err();
        assert_eq!(err, SessionError::UnclassifiedAddress);
        assert_eq!(s.connections(), 0);
    }

    #[test]
    fn get_session_never_initiates() {
        let mut s = server();
        let now = Instant::now();
        assert_eq!(
            s.get_session(peer(1), &remote(), now),
            Err(SessionError::CannotInitiate)
        );
        let id = establish(&mut s, 1, 1, 10, now);
        assert_eq!(s.get_session(peer(1), &remote(), now), Ok(id));
    }

    #[test]
    fn queued_payload_waits_for_renewed_get() {
        let mut s = server();
        let now = Instant::now();
        let id = establish(&mut s, 1, 1, 10, now);
        s.on_channel_closed(ChannelHandle(11), now);
        let (log, make) = completion_log();
        s.send(id, Bytes::from_static(b"hi"), Duration::ZERO, Some(make(1)), now)
            .unwrap();
        assert!(s.manager().channels().wanted.is_empty());

        s.on_incoming(ChannelHandle(40), GET, &target(1, 1), &remote(), now)
            .unwrap();
        assert_eq!(s.manager().channels().wanted, vec![ChannelHandle(40)]);
        s.on_channel_writable(ChannelHandle(40), 1024, now);
        assert_eq!(log.ids(), vec![1]);
        assert!(log.all_ok());
    }

    #[test]
    fn disconnect_peer_with_two_tags() {
        let mut s = server();
        let now = Instant::now();
        let a = establish(&mut s, 1, 1, 10, now);
        let b = establish(&mut s, 1, 2, 20, now);
        assert_eq!(s.manager().table().sessions_of(&peer(1)).len(), 2);
        assert_eq!(s.disconnect_peer(&peer(1), now), 2);
        assert_eq!(s.manager().table().find(&peer(1), Some(1)), None);
        assert_eq!(s.manager().table().find(&peer(1), Some(2)), None);
        let ends = &s.manager().env().ends;
        assert_eq!(ends.len(), 2);
        assert!(ends.iter().any(|e| e.0 == a && e.2 == EndReason::Disconnect));
        assert!(ends.iter().any(|e| e.0 == b && e.2 == EndReason::Disconnect));
        assert_eq!(s.session_count(), 0);
    }

    #[test]
    fn disconnect_peer_fails_queued_messages_once() {
        let mut s = server();
        let now = Instant::now();
        let a = establish(&mut s, 1, 1, 10, now);
        let b = establish(&mut s, 1, 2, 20, now);
        let (log, make) = completion_log();
        s.send(a, Bytes::from_static(b"to a"), Duration::ZERO, Some(make(1)), now)
            .unwrap();
        s.send(b, Bytes::from_static(b"to b"), Duration::ZERO, Some(make(2)), now)
            .unwrap();
        s.channels_mut().close_status = CloseStatus::Pending;

        assert_eq!(s.disconnect_peer(&peer(1), now), 2);
        assert_eq!(log.ids(), vec![1, 2]);
        assert!(log.reports().iter().all(|r| matches!(
            r.result,
            Err(TransmitError::SessionEnded(EndReason::Disconnect))
        )));
        assert_eq!(
            s.send(b, Bytes::from_static(b"late"), Duration::ZERO, Some(make(3)), now),
            Err(SessionError::SessionClosing)
        );
        assert!(s.manager().env().ends.is_empty());

        s.on_channel_closed(ChannelHandle(10), now);
        s.on_channel_closed(ChannelHandle(11), now);
        assert_eq!(s.manager().env().ends.len(), 1);
        assert_eq!(s.session_state(b), Some(SessionState::Disconnecting));

        let linger = s.manager().config().disconnect_linger();
        s.poll_timeouts(now + linger);
        s.on_channel_closed(ChannelHandle(20), now + linger);
        s.on_channel_closed(ChannelHandle(21), now + linger);
        s.on_channel_closed(ChannelHandle(10), now + linger);
        s.poll_timeouts(now + linger * 2);

        let ended: Vec<SessionId> = s.manager().env().ends.iter().map(|e| e.0).collect();
        assert_eq!(ended, vec![a, b]);
        assert_eq!(log.ids(), vec![1, 2]);
        assert_eq!(s.session_count(), 0);
        assert_eq!(s.connections(), 0);
    }

    #[test]
    fn check_address_matches_own_urls_only() {
        let mut s = server();
        let own = addr("http://node.example:9000/lpt/");
        assert!(!s.check_address(&own));
        s.add_address(own.clone());
        s.add_address(addr("http://node.example:9000/lpt"));
        assert_eq!(s.addresses().len(), 1);
        assert!(s.check_address(&addr("http://node.example:9000/lpt/")));
        assert!(s.check_address(&HttpAddress::from_url("http://node.example:9000/lpt/", 4).unwrap()));
        assert!(!s.check_address(&addr("https://node.example:9000/lpt/")));
        assert!(!s.check_address(&remote()));
    }

    #[test]
    fn losing_both_halves_ends_session() {
        let mut s = server();
        let now = Instant::now();
        let id = establish(&mut s, 1, 1, 10, now);
        s.on_channel_closed(ChannelHandle(10), now);
        assert_eq!(s.session_state(id), Some(SessionState::Active));
        s.on_channel_closed(ChannelHandle(11), now);
        assert_eq!(s.session_state(id), None);
        assert_eq!(s.manager().env().ends, vec![(id, peer(1), EndReason::Disconnect)]);
    }

    #[test]
    fn new_tag_after_teardown_starts_fresh() {
        let mut s = server();
        let now = Instant::now();
        let first = establish(&mut s, 1, 1, 10, now);
        s.disconnect_session(first, now).unwrap();
        let second = establish(&mut s, 1, 1, 20, now);
        assert_ne!(first, second);
    }

    #[test]
    fn shutdown_closes_half_open_too() {
        let mut s = server();
        let now = Instant::now();
        establish(&mut s, 1, 1, 10, now);
        s.on_incoming(ChannelHandle(50), PUT, &target(2, 1), &remote(), now)
            .unwrap();
        s.shutdown(now);
        assert_eq!(s.session_count(), 0);
        assert_eq!(s.connections(), 0);
        assert!(s.manager().channels().closed.contains(&ChannelHandle(50)));
        assert_eq!(s.manager().env().ends.len(), 1);
        assert_eq!(s.next_deadline(), None);
    }
}
