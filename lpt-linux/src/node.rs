//! Dispatcher: owns both plugins and feeds them channel events, timers and keepalives
//! from a single task.

use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lpt_core::{
    encode_frame, ClientPlugin, EndReason, Env, Frame, HttpAddress, PeerId, PluginConfig, Protocol,
    ServerPlugin, SessionId, Transport,
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::channels::{ChannelEvent, ClientChannels, Event, HandleSource, Incoming, Role, ServerChannels};
use crate::config::PeerEntry;

/// Message type of the keepalive frame.
pub const KEEPALIVE_MSG_TYPE: u16 = 381;

/// Upper layer of the daemon: logs what arrives, never throttles.
#[derive(Debug)]
pub struct NodeEnv {
    role: Role,
    frames: u64,
}

impl NodeEnv {
    pub fn new(role: Role) -> Self {
        Self { role, frames: 0 }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl Env for NodeEnv {
    fn receive(&mut self, session: SessionId, peer: &PeerId, frame: &Frame) -> Duration {
        self.frames += 1;
        if frame.msg_type == KEEPALIVE_MSG_TYPE {
            trace!(role = ?self.role, %session, peer = %peer.short(), "keepalive");
        } else {
            info!(
                role = ?self.role,
                %session,
                peer = %peer.short(),
                msg_type = frame.msg_type,
                len = frame.body.len(),
                "frame received"
            );
        }
        Duration::ZERO
    }

    fn session_start(&mut self, session: SessionId, peer: &PeerId, address: &HttpAddress) {
        info!(role = ?self.role, %session, peer = %peer.short(), %address, "session up");
    }

    fn session_end(&mut self, session: SessionId, peer: &PeerId, reason: &EndReason) {
        info!(role = ?self.role, %session, peer = %peer.short(), ?reason, "session down");
    }
}

pub struct Node {
    client: ClientPlugin<ClientChannels, NodeEnv>,
    server: ServerPlugin<ServerChannels, NodeEnv>,
    peers: Vec<(PeerId, HttpAddress)>,
    keepalive: Bytes,
}

impl Node {
    pub fn new(
        own: PeerId,
        config: PluginConfig,
        peers: &[PeerEntry],
        events: mpsc::UnboundedSender<Event>,
        handles: HandleSource,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let client_channels = ClientChannels::new(events, handles)?;
        let mut resolved = Vec::with_capacity(peers.len());
        for entry in peers {
            match HttpAddress::from_url(&entry.address, 0) {
                Ok(address) => resolved.push((entry.peer, address)),
                Err(e) => warn!(peer = %entry.peer.short(), address = %entry.address, error = %e, "skipping peer"),
            }
        }
        Ok(Self {
            client: ClientPlugin::new(own, config.clone(), client_channels, NodeEnv::new(Role::Client)),
            server: ServerPlugin::new(config, ServerChannels::new(), NodeEnv::new(Role::Server)),
            peers: resolved,
            keepalive: Bytes::from(encode_frame(KEEPALIVE_MSG_TYPE, &[])?),
        })
    }

    pub fn client(&self) -> &ClientPlugin<ClientChannels, NodeEnv> {
        &self.client
    }

    pub fn server(&self) -> &ServerPlugin<ServerChannels, NodeEnv> {
        &self.server
    }

    fn plugin(&mut self, role: Role) -> &mut dyn Transport {
        match role {
            Role::Client => &mut self.client,
            Role::Server => &mut self.server,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.client.next_deadline(), self.server.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn poll_timeouts(&mut self, now: Instant) {
        self.client.poll_timeouts(now);
        self.server.poll_timeouts(now);
    }

    pub fn handle(&mut self, event: Event, now: Instant) {
        match event {
            Event::Incoming(incoming) => self.on_incoming(incoming, now),
            Event::Channel { role, handle, event } => {
                let gone = matches!(event, ChannelEvent::Error(_) | ChannelEvent::Closed);
                let plugin = self.plugin(role);
                match event {
                    ChannelEvent::Writable(max) => plugin.on_channel_writable(handle, max, now),
                    ChannelEvent::Data(bytes) => {
                        let outcome = plugin.on_channel_data(handle, &bytes, now);
                        trace!(%handle, ?outcome, "data");
                    }
                    ChannelEvent::Overhead(n) => plugin.on_channel_overhead(handle, n),
                    ChannelEvent::Error(err) => plugin.on_channel_error(handle, err, now),
                    ChannelEvent::Closed => plugin.on_channel_closed(handle, now),
                }
                if gone {
                    match role {
                        Role::Client => self.client.channels_mut().forget(handle),
                        Role::Server => self.server.channels_mut().forget(handle),
                    }
                }
            }
        }
    }

    fn on_incoming(&mut self, incoming: Incoming, now: Instant) {
        let Incoming {
            handle,
            direction,
            url,
            remote,
            commands,
            verdict,
        } = incoming;
        self.server.channels_mut().register(handle, commands);
        let remote = HttpAddress::from_socket(Protocol::Http, remote);
        match self.server.on_incoming(handle, direction, &url, &remote, now) {
            Ok(accepted) => {
                trace!(%handle, ?accepted, "request bound");
                let _ = verdict.send(true);
            }
            Err(e) => {
                debug!(%handle, url = %url, error = %e, "request refused");
                self.server.channels_mut().forget(handle);
                let _ = verdict.send(false);
            }
        }
    }

    /// One keepalive frame to every configured peer, opening sessions as needed.
    pub fn keepalive(&mut self, now: Instant) {
        for (peer, address) in &self.peers {
            let session = match self.client.get_session(*peer, address, now) {
                Ok(id) => id,
                Err(e) => {
                    debug!(peer = %peer.short(), %address, error = %e, "no session for keepalive");
                    continue;
                }
            };
            if let Err(e) = self
                .client
                .send(session, self.keepalive.clone(), Duration::from_secs(5), None, now)
            {
                debug!(%session, error = %e, "keepalive not queued");
            }
        }
    }

    /// Record the URL peers reach this node at.
    pub fn serve_on(&mut self, url: &str) -> Result<(), lpt_core::AddressError> {
        self.server.add_address(HttpAddress::from_url(url, 0)?);
        Ok(())
    }

    pub fn keepalive_factor(&self) -> u32 {
        self.client.keepalive_factor()
    }

    pub fn shutdown(&mut self, now: Instant) {
        self.client.shutdown(now);
        self.server.shutdown(now);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}

/// Drive `node` until `shutdown` resolves or every event source is gone.
pub async fn run(
    mut node: Node,
    mut events: mpsc::UnboundedReceiver<Event>,
    keepalive_every: Duration,
    shutdown: impl Future<Output = ()>,
) {
    let mut ticker = tokio::time::interval(keepalive_every);
    tokio::pin!(shutdown);
    loop {
        let deadline = node.next_deadline();
        tokio::select! {
            ev = events.recv() => match ev {
                Some(ev) => node.handle(ev, Instant::now()),
                None => break,
            },
            _ = sleep_until(deadline) => node.poll_timeouts(Instant::now()),
            _ = ticker.tick() => node.keepalive(Instant::now()),
            _ = &mut shutdown => {
                info!(
                    client_sessions = node.client().session_count(),
                    server_sessions = node.server().session_count(),
                    client_channels = node.client().manager().channels().len(),
                    server_channels = node.server().manager().channels().len(),
                    frames = node.client().manager().env().frames() + node.server().manager().env().frames(),
                    "shutting down"
                );
                node.shutdown(Instant::now());
                break;
            }
        }
    }
}

/// Bind the listener for `port` on all interfaces.
pub fn listen_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], port))
}
