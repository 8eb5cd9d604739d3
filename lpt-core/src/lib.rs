//! HTTP long-poll transport: session and message-delivery manager.
//! Host-driven: no I/O and no clock; the host passes events and the current time,
//! the core calls back into its `Channels` and `Env` collaborators.

pub mod address;
pub mod channel;
pub mod client;
pub mod config;
pub mod env;
pub mod error;
pub mod identity;
pub mod manager;
pub mod network;
pub mod pending;
pub mod plugin;
pub mod queue;
pub mod server;
pub mod session;
pub mod table;
pub mod timeout;
pub mod wire;

#[cfg(test)]
mod test_utils;

pub use address::{correlation_url, parse_correlation, AddressError, CorrelationError, HttpAddress, Protocol};
pub use channel::{ChannelError, ChannelHandle, ChannelTarget, Channels, CloseStatus, Direction};
pub use client::ClientPlugin;
pub use config::{PluginConfig, ThrottlePolicy};
pub use env::Env;
pub use error::{EndReason, SessionError, TransmitError};
pub use identity::PeerId;
pub use manager::ReceiveOutcome;
pub use network::NetworkType;
pub use plugin::Transport;
pub use queue::{Completion, TransmitReport};
pub use server::{Accepted, ServerPlugin};
pub use session::{SessionId, SessionState};
pub use wire::{decode_frame, encode_frame, Frame, FrameDecodeError, FrameEncodeError, FrameReader};
