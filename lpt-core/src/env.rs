//! Upper-layer environment: where received frames and session lifecycle events go.

use std::time::Duration;

use crate::address::HttpAddress;
use crate::error::EndReason;
use crate::identity::PeerId;
use crate::network::{self, NetworkType};
use crate::session::SessionId;
use crate::wire::Frame;

pub trait Env {
    /// Deliver one framed message. The returned delay asks the session to hold back further reads.
    fn receive(&mut self, session: SessionId, peer: &PeerId, frame: &Frame) -> Duration;

    /// An accepting-side session became fully bound.
    fn session_start(&mut self, _session: SessionId, _peer: &PeerId, _address: &HttpAddress) {}

    /// Called exactly once per announced session, before its state is released.
    fn session_end(&mut self, session: SessionId, peer: &PeerId, reason: &EndReason);

    fn classify(&self, address: &HttpAddress) -> NetworkType {
        network::classify(address)
    }
}
