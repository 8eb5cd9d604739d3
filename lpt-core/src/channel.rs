//! Channel collaborator: one directional HTTP connection owned by the host.

use std::fmt;

/// Host-assigned handle for an open channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelHandle(pub u64);

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch#{}", self.0)
    }
}

/// Direction from this side's point of view.
/// Originating side: `Recv` is the long-poll GET, `Send` the PUT.
/// Accepting side: `Recv` is the inbound PUT, `Send` the GET response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Recv,
}

/// What the originating side asks the host to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    pub url: String,
    pub direction: Direction,
}

/// Result of a close request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    /// Gone; no further callbacks will arrive for the handle.
    Closed,
    /// The host will report `on_channel_closed` later.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("connection refused")]
    Refused,
    #[error("tls failure: {0}")]
    Tls(String),
    #[error("i/o error: {0}")]
    Io(String),
    #[error("http status {0}")]
    Status(u16),
    #[error("inbound stream desynchronized")]
    Desync,
}

/// Channel operations the session manager needs from its host.
/// All calls happen on the host's event loop; callbacks come back through the plugin's `on_channel_*` methods.
pub trait Channels {
    /// Open an outbound channel (originating side only).
    fn open(&mut self, target: &ChannelTarget) -> Result<ChannelHandle, ChannelError>;

    /// Hand bytes to a send channel; returns how many were accepted.
    fn write(&mut self, handle: ChannelHandle, bytes: &[u8]) -> Result<usize, ChannelError>;

    fn close(&mut self, handle: ChannelHandle) -> CloseStatus;

    /// Data is queued for `handle`; the host should signal writability when it can take it.
    fn want_write(&mut self, _handle: ChannelHandle) {}

    /// Stop delivering inbound data until `resume`.
    fn pause(&mut self, _handle: ChannelHandle) {}

    fn resume(&mut self, _handle: ChannelHandle) {}
}
