//! Session engine shared by both plugin roles: send queue draining, receive path with
//! throttling, idle timers and two-phase teardown.
//!
//! Every entry point runs to completion before returning. Completions and `Env` upcalls
//! are invoked only after the session's own state has been updated.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::channel::{ChannelError, ChannelHandle, ChannelTarget, Channels, CloseStatus, Direction};
use crate::config::{PluginConfig, ThrottlePolicy};
use crate::env::Env;
use crate::error::{EndReason, SessionError};
use crate::identity::PeerId;
use crate::network::NetworkType;
use crate::queue::Completion;
use crate::session::{Session, SessionId, SessionState};
use crate::table::SessionTable;
use crate::timeout::{TimerKey, TimerKind, Timers};
use crate::wire::FrameReader;

/// What happened to a chunk of inbound bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Fed to the frame reader; this many frames went to the upper layer.
    Forwarded(usize),
    /// Held back until the throttle elapses; the channel was paused.
    Withheld { until: Instant },
    /// Arrived while throttled and was discarded.
    Dropped,
    /// Arrived on a half-open channel and was discarded.
    Discarded,
    /// Unknown, closing or wrong-direction handle.
    Ignored,
    /// The stream could not be framed; the session is being torn down.
    TornDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flush {
    Ignored,
    Progress { session: SessionId, drained: bool },
    TornDown,
}

/// Result of a channel going away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Closed {
    Ignored,
    /// A teardown close was confirmed.
    Teardown,
    /// The channel hit an error; its session is being torn down.
    Failed(SessionId),
    /// One half of a live session is gone. `requested` is set when we asked for the close.
    Half {
        session: SessionId,
        direction: Direction,
        requested: bool,
    },
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    session: SessionId,
    direction: Direction,
    /// Close requested while the session stays up.
    detaching: bool,
}

pub struct SessionManager<C, E> {
    config: PluginConfig,
    channels: C,
    env: E,
    table: SessionTable,
    timers: Timers,
    handles: HashMap<ChannelHandle, Binding>,
    /// Handles closed by a teardown that have not confirmed yet.
    closing: HashMap<ChannelHandle, SessionId>,
    next_id: u64,
}

impl<C: Channels, E: Env> SessionManager<C, E> {
    pub fn new(config: PluginConfig, channels: C, env: E) -> Self {
        Self {
            config,
            channels,
            env,
            table: SessionTable::new(),
            timers: Timers::new(),
            handles: HashMap::new(),
            closing: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn channels(&self) -> &C {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut C {
        &mut self.channels
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut E {
        &mut self.env
    }

    pub fn table(&self) -> &SessionTable {
        &self.table
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.table.get(id)
    }

    pub(crate) fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.table.get_mut(id)
    }

    pub fn allocate_id(&mut self) -> SessionId {
        self.next_id += 1;
        SessionId(self.next_id)
    }

    /// Channels currently held by sessions, including those still closing.
    pub fn connections(&self) -> usize {
        self.handles.len() + self.closing.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub(crate) fn schedule(&mut self, key: TimerKey, after: Duration, now: Instant) {
        self.timers.schedule(key, now + after);
    }

    pub(crate) fn cancel_timer(&mut self, key: TimerKey) {
        self.timers.cancel(key);
    }

    pub(crate) fn pop_timer(&mut self, now: Instant) -> Option<TimerKey> {
        self.timers.pop_expired(now)
    }

    #[cfg(test)]
    pub(crate) fn timer_deadline(&self, key: TimerKey) -> Option<Instant> {
        self.timers.deadline(key)
    }

    pub(crate) fn open(&mut self, target: &ChannelTarget) -> Result<ChannelHandle, ChannelError> {
        self.channels.open(target)
    }

    /// Make a fully bound session visible and start its idle timer.
    pub(crate) fn publish(&mut self, mut session: Session, now: Instant) -> Result<SessionId, SessionError> {
        session.set_state(SessionState::Active)?;
        let bound: Vec<(Direction, ChannelHandle)> = [Direction::Send, Direction::Recv]
            .into_iter()
            .filter_map(|d| session.handle(d).map(|h| (d, h)))
            .collect();
        let (peer, tag) = (session.peer, session.tag);
        let id = match self.table.insert(session) {
            Ok(id) => id,
            Err(e) => {
                for (_, h) in bound {
                    self.channels.close(h);
                }
                return Err(e);
            }
        };
        for (direction, handle) in bound {
            self.handles.insert(
                handle,
                Binding {
                    session: id,
                    direction,
                    detaching: false,
                },
            );
        }
        self.timers.schedule((id, TimerKind::Idle), now + self.config.idle_timeout());
        debug!(session = %id, peer = %peer.short(), tag, "session active");
        Ok(id)
    }

    /// Attach a channel to a free half of a live session.
    pub(crate) fn bind(&mut self, id: SessionId, direction: Direction, handle: ChannelHandle) -> Result<(), SessionError> {
        let session = self.table.get_mut(id).ok_or(SessionError::InvalidSession)?;
        if !session.state.is_live() {
            return Err(SessionError::SessionClosing);
        }
        let slot = session.slot(direction);
        if slot.is_some() {
            return Err(SessionError::DuplicateConnection {
                peer: session.peer,
                tag: session.tag,
            });
        }
        *slot = Some(handle);
        self.handles.insert(
            handle,
            Binding {
                session: id,
                direction,
                detaching: false,
            },
        );
        if direction == Direction::Send && !session.queue.is_empty() {
            self.channels.want_write(handle);
        }
        trace!(session = %id, %handle, ?direction, "channel bound");
        Ok(())
    }

    /// Close one half without ending the session. `None` if the half was not bound.
    pub(crate) fn close_half(&mut self, id: SessionId, direction: Direction) -> Option<CloseStatus> {
        let handle = self.table.get_mut(id)?.slot(direction).take()?;
        let status = self.channels.close(handle);
        match status {
            CloseStatus::Closed => {
                self.handles.remove(&handle);
            }
            CloseStatus::Pending => {
                if let Some(b) = self.handles.get_mut(&handle) {
                    b.detaching = true;
                }
            }
        }
        trace!(session = %id, %handle, ?status, "half closed");
        Some(status)
    }

    /// The session exists and accepts payload.
    pub(crate) fn sendable(&self, id: SessionId) -> Result<&Session, SessionError> {
        let session = self.table.get(id).ok_or(SessionError::InvalidSession)?;
        if session.state != SessionState::Active {
            return Err(SessionError::SessionClosing);
        }
        Ok(session)
    }

    /// Like `sendable`, and the queue can also take `len` more bytes.
    pub(crate) fn has_room(&self, id: SessionId, len: usize) -> Result<&Session, SessionError> {
        let session = self.sendable(id)?;
        if session.queue.bytes_queued() + len > self.config.max_queue_bytes {
            warn!(session = %id, queued = session.queue.bytes_queued(), "send queue full");
            return Err(SessionError::Overloaded);
        }
        Ok(session)
    }

    pub fn enqueue(
        &mut self,
        id: SessionId,
        payload: Bytes,
        completion: Option<Completion>,
        now: Instant,
    ) -> Result<usize, SessionError> {
        self.has_room(id, payload.len())?;
        let session = self.table.get_mut(id).ok_or(SessionError::InvalidSession)?;
        let len = payload.len();
        session.queue.push(payload, completion);
        if let Some(handle) = session.send {
            self.channels.want_write(handle);
        }
        self.timers.extend((id, TimerKind::Idle), now + self.config.idle_timeout());
        trace!(session = %id, len, "message queued");
        Ok(len)
    }

    /// The send channel can take up to `max` bytes.
    pub(crate) fn on_writable(&mut self, handle: ChannelHandle, max: usize, now: Instant) -> Flush {
        let Some(b) = self.handles.get(&handle).copied() else {
            trace!(%handle, "writable on unknown channel");
            return Flush::Ignored;
        };
        if b.direction != Direction::Send || b.detaching {
            return Flush::Ignored;
        }
        let id = b.session;
        let Some(session) = self.table.get_mut(id) else {
            return Flush::Ignored;
        };
        if session.state != SessionState::Active || session.send != Some(handle) {
            return Flush::Ignored;
        }
        let chunk = session.queue.peek_chunk(max);
        if chunk.is_empty() {
            return Flush::Progress {
                session: id,
                drained: true,
            };
        }
        match self.channels.write(handle, &chunk) {
            Ok(n) => {
                let deliveries = session.queue.advance(n, &mut session.overhead);
                let drained = session.queue.is_empty();
                if !drained {
                    self.channels.want_write(handle);
                }
                self.timers.extend((id, TimerKind::Idle), now + self.config.idle_timeout());
                trace!(session = %id, written = n, completed = deliveries.len(), "flushed");
                for d in deliveries {
                    d.fire();
                }
                Flush::Progress { session: id, drained }
            }
            Err(err) => {
                warn!(session = %id, %handle, error = %err, "write failed");
                self.begin_disconnect(id, EndReason::Channel(err), now);
                Flush::TornDown
            }
        }
    }

    pub(crate) fn on_data(&mut self, handle: ChannelHandle, bytes: &[u8], now: Instant) -> ReceiveOutcome {
        let Some(b) = self.handles.get(&handle).copied() else {
            trace!(%handle, len = bytes.len(), "data on unknown channel");
            return ReceiveOutcome::Ignored;
        };
        if b.direction != Direction::Recv || b.detaching {
            return ReceiveOutcome::Ignored;
        }
        let id = b.session;
        let Some(session) = self.table.get_mut(id) else {
            return ReceiveOutcome::Ignored;
        };
        if session.state != SessionState::Active {
            return ReceiveOutcome::Ignored;
        }
        if let Some(until) = session.next_receive.filter(|t| *t > now) {
            return match self.config.throttle {
                ThrottlePolicy::Drop => {
                    debug!(session = %id, len = bytes.len(), "throttled, dropping chunk");
                    ReceiveOutcome::Dropped
                }
                ThrottlePolicy::Buffer => {
                    session.held.extend_from_slice(bytes);
                    self.channels.pause(handle);
                    self.timers.extend((id, TimerKind::RecvWakeup), until);
                    trace!(session = %id, held = session.held.len(), "throttled, holding chunk");
                    ReceiveOutcome::Withheld { until }
                }
            };
        }
        if session.held.is_empty() {
            return self.deliver(id, bytes, now);
        }
        let mut data = std::mem::take(&mut session.held);
        data.extend_from_slice(bytes);
        self.timers.cancel((id, TimerKind::RecvWakeup));
        self.channels.resume(handle);
        self.deliver(id, &data, now)
    }

    /// Feed the frame reader and hand every completed frame to the upper layer.
    fn deliver(&mut self, id: SessionId, data: &[u8], now: Instant) -> ReceiveOutcome {
        let Some(session) = self.table.get_mut(id) else {
            return ReceiveOutcome::Ignored;
        };
        let frames = match session.reader.get_or_insert_with(FrameReader::new).feed(data) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(session = %id, error = %e, "inbound stream desynchronized");
                self.begin_disconnect(id, EndReason::Channel(ChannelError::Desync), now);
                return ReceiveOutcome::TornDown;
            }
        };
        let peer = session.peer;
        let mut hold = Duration::ZERO;
        for frame in &frames {
            hold = hold.max(self.env.receive(id, &peer, frame));
        }
        if hold > Duration::ZERO {
            let until = now + hold;
            session.next_receive = Some(session.next_receive.map_or(until, |t| t.max(until)));
        }
        if !frames.is_empty() {
            self.timers.extend((id, TimerKind::Idle), now + self.config.idle_timeout());
        }
        trace!(session = %id, frames = frames.len(), ?hold, "received");
        ReceiveOutcome::Forwarded(frames.len())
    }

    /// Throttle elapsed: resume the channel and replay anything held.
    fn wake(&mut self, id: SessionId, now: Instant) {
        let Some(session) = self.table.get_mut(id) else {
            return;
        };
        if session.state != SessionState::Active || session.held.is_empty() {
            return;
        }
        if let Some(until) = session.next_receive.filter(|t| *t > now) {
            self.timers.extend((id, TimerKind::RecvWakeup), until);
            return;
        }
        let data = std::mem::take(&mut session.held);
        if let Some(handle) = session.recv {
            self.channels.resume(handle);
        }
        trace!(session = %id, len = data.len(), "replaying held bytes");
        self.deliver(id, &data, now);
    }

    pub(crate) fn on_overhead(&mut self, handle: ChannelHandle, bytes: usize) {
        let Some(b) = self.handles.get(&handle) else {
            return;
        };
        if let Some(session) = self.table.get_mut(b.session) {
            session.overhead += bytes;
        }
    }

    pub(crate) fn on_error(&mut self, handle: ChannelHandle, err: ChannelError, now: Instant) -> Closed {
        if self.closing.contains_key(&handle) {
            return self.on_closed(handle, now);
        }
        let Some(b) = self.handles.get(&handle).copied() else {
            trace!(%handle, error = %err, "error on unknown channel");
            return Closed::Ignored;
        };
        if b.detaching {
            return self.on_closed(handle, now);
        }
        warn!(session = %b.session, %handle, error = %err, "channel failed");
        self.begin_disconnect(b.session, EndReason::Channel(err), now);
        Closed::Failed(b.session)
    }

    pub(crate) fn on_closed(&mut self, handle: ChannelHandle, _now: Instant) -> Closed {
        if let Some(id) = self.closing.remove(&handle) {
            let remaining = match self.table.get_mut(id) {
                Some(session) => {
                    session.closes_pending = session.closes_pending.saturating_sub(1);
                    session.closes_pending
                }
                None => return Closed::Teardown,
            };
            if remaining == 0 {
                self.finalize(id);
            }
            return Closed::Teardown;
        }
        let Some(b) = self.handles.remove(&handle) else {
            trace!(%handle, "close of unknown channel");
            return Closed::Ignored;
        };
        if let Some(session) = self.table.get_mut(b.session) {
            let slot = session.slot(b.direction);
            if *slot == Some(handle) {
                *slot = None;
            }
        }
        debug!(session = %b.session, %handle, direction = ?b.direction, requested = b.detaching, "half closed");
        Closed::Half {
            session: b.session,
            direction: b.direction,
            requested: b.detaching,
        }
    }

    /// First teardown phase. Returns false if the session was unknown or already ending.
    pub(crate) fn begin_disconnect(&mut self, id: SessionId, reason: EndReason, now: Instant) -> bool {
        let Some(session) = self.table.get_mut(id) else {
            return false;
        };
        if !session.state.is_live() {
            return false;
        }
        if let Err(e) = session.set_state(SessionState::Disconnecting) {
            warn!(session = %id, error = %e, "cannot disconnect");
            return false;
        }
        session.end_reason = Some(reason.clone());
        let deliveries = session.queue.fail_all(&reason, &mut session.overhead);
        session.send = None;
        session.recv = None;
        session.held.clear();

        let owned: Vec<(ChannelHandle, bool)> = self
            .handles
            .iter()
            .filter(|(_, b)| b.session == id)
            .map(|(h, b)| (*h, b.detaching))
            .collect();
        let mut pending = 0;
        for (handle, detaching) in owned {
            self.handles.remove(&handle);
            let status = if detaching {
                CloseStatus::Pending
            } else {
                self.channels.close(handle)
            };
            if status == CloseStatus::Pending {
                self.closing.insert(handle, id);
                pending += 1;
            }
        }
        if let Some(session) = self.table.get_mut(id) {
            session.closes_pending = pending;
        }
        self.timers.cancel_all(id);
        self.table.unpublish(id);
        debug!(session = %id, ?reason, pending, failed = deliveries.len(), "session disconnecting");

        for d in deliveries {
            d.fire();
        }
        if pending == 0 {
            self.finalize(id);
        } else {
            self.timers
                .schedule((id, TimerKind::Linger), now + self.config.disconnect_linger());
        }
        true
    }

    /// Second teardown phase: notify the upper layer and release the session.
    fn finalize(&mut self, id: SessionId) {
        let Some(mut session) = self.table.remove(id) else {
            return;
        };
        self.timers.cancel_all(id);
        self.closing.retain(|_, s| *s != id);
        let reason = session.end_reason.take().unwrap_or(EndReason::Disconnect);
        self.env.session_end(id, &session.peer, &reason);
        if let Err(e) = session.set_state(SessionState::Closed) {
            warn!(session = %id, error = %e, "unexpected state at finalize");
        }
        debug!(session = %id, peer = %session.peer.short(), ?reason, "session closed");
    }

    pub fn disconnect(&mut self, id: SessionId, now: Instant) -> Result<(), SessionError> {
        let session = self.table.get(id).ok_or(SessionError::InvalidSession)?;
        if session.state.is_live() {
            self.begin_disconnect(id, EndReason::Disconnect, now);
        }
        Ok(())
    }

    /// Tear down every published session of `peer`. Returns how many were started.
    pub fn disconnect_peer(&mut self, peer: &PeerId, now: Instant) -> usize {
        let ids = self.table.sessions_of(peer);
        debug!(peer = %peer.short(), sessions = ids.len(), "disconnecting peer");
        ids.into_iter()
            .filter(|id| self.begin_disconnect(*id, EndReason::Disconnect, now))
            .count()
    }

    pub fn update_timeout(&mut self, id: SessionId, now: Instant) -> Result<(), SessionError> {
        self.sendable(id)?;
        self.timers.extend((id, TimerKind::Idle), now + self.config.idle_timeout());
        Ok(())
    }

    pub fn network_type(&self, id: SessionId) -> Result<NetworkType, SessionError> {
        self.table
            .get(id)
            .map(|s| s.network)
            .ok_or(SessionError::InvalidSession)
    }

    /// End everything now, without waiting for channels to confirm.
    pub fn shutdown(&mut self, now: Instant) {
        for id in self.table.ids() {
            self.begin_disconnect(id, EndReason::Shutdown, now);
        }
        for id in self.table.ids() {
            self.finalize(id);
        }
        self.closing.clear();
    }

    /// Run a shared timer. Role-specific kinds are handed back to the caller.
    pub(crate) fn handle_timer(&mut self, key: TimerKey, now: Instant) -> Option<TimerKey> {
        let (id, kind) = key;
        match kind {
            TimerKind::Idle => {
                debug!(session = %id, "idle timeout");
                self.begin_disconnect(id, EndReason::Timeout, now);
                None
            }
            TimerKind::RecvWakeup => {
                self.wake(id, now);
                None
            }
            TimerKind::Linger => {
                debug!(session = %id, "close not confirmed in time");
                self.finalize(id);
                None
            }
            TimerKind::PutIdle | TimerKind::HalfOpen => Some(key),
        }
    }
}
