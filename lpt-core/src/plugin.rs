//! Boundary API consumed by the overlay's transport-selection layer.

use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::address::HttpAddress;
use crate::channel::{ChannelError, ChannelHandle};
use crate::error::SessionError;
use crate::identity::PeerId;
use crate::manager::ReceiveOutcome;
use crate::network::NetworkType;
use crate::queue::Completion;
use crate::session::{SessionId, SessionState};

/// Implemented by both plugin roles. Every method runs on the host's event loop;
/// time is passed in, never read.
pub trait Transport {
    /// Existing live session for `(peer, address)`, or a new one.
    fn get_session(&mut self, peer: PeerId, address: &HttpAddress, now: Instant) -> Result<SessionId, SessionError>;

    /// Queue `payload`. Returns the number of payload bytes accepted.
    /// On error the completion is dropped without being called.
    fn send(
        &mut self,
        session: SessionId,
        payload: Bytes,
        timeout_hint: Duration,
        completion: Option<Completion>,
        now: Instant,
    ) -> Result<usize, SessionError>;

    fn disconnect_session(&mut self, session: SessionId, now: Instant) -> Result<(), SessionError>;

    /// Returns how many sessions were torn down.
    fn disconnect_peer(&mut self, peer: &PeerId, now: Instant) -> usize;

    fn update_session_timeout(&mut self, session: SessionId, now: Instant) -> Result<(), SessionError>;

    fn query_network_type(&self, session: SessionId) -> Result<NetworkType, SessionError>;

    fn on_channel_writable(&mut self, handle: ChannelHandle, max: usize, now: Instant);

    fn on_channel_data(&mut self, handle: ChannelHandle, bytes: &[u8], now: Instant) -> ReceiveOutcome;

    /// Framing bytes the channel added on top of payload (HTTP headers and the like).
    fn on_channel_overhead(&mut self, handle: ChannelHandle, bytes: usize);

    fn on_channel_error(&mut self, handle: ChannelHandle, err: ChannelError, now: Instant);

    fn on_channel_closed(&mut self, handle: ChannelHandle, now: Instant);

    /// Run every timer due at `now`.
    fn poll_timeouts(&mut self, now: Instant);

    fn next_deadline(&self) -> Option<Instant>;

    /// Sessions that exist, published or still tearing down.
    fn session_count(&self) -> usize;

    fn session_state(&self, session: SessionId) -> Option<SessionState>;

    /// Tear every session down immediately.
    fn shutdown(&mut self, now: Instant);

    /// How many keepalive intervals fit into one idle timeout.
    fn keepalive_factor(&self) -> u32;

    /// Whether `address`, suggested by the overlay, is one this plugin serves on.
    fn check_address(&self, address: &HttpAddress) -> bool;
}
