//! Real channels behind the core's `Channels` trait.
//!
//! Every channel is a tokio task. Tasks never touch the plugins: they report back
//! through [`Event`]s on one queue, and the dispatcher feeds those to the owning
//! plugin in order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lpt_core::{ChannelError, ChannelHandle, ChannelTarget, Channels, CloseStatus, Direction};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Largest body handed to one PUT or one GET write.
pub const MAX_WRITE: usize = 64 * 1024;

/// How long an opening PUT waits for the GET of the same session to get its response head.
const PULL_READY_WAIT: Duration = Duration::from_secs(5);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Which plugin a channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug)]
pub enum ChannelEvent {
    Writable(usize),
    Data(Bytes),
    Overhead(usize),
    Error(ChannelError),
    Closed,
}

/// A request reached the listener and waits to be bound.
#[derive(Debug)]
pub struct Incoming {
    pub handle: ChannelHandle,
    pub direction: Direction,
    pub url: String,
    pub remote: SocketAddr,
    pub commands: mpsc::UnboundedSender<Command>,
    /// `true` when the server plugin kept the request.
    pub verdict: oneshot::Sender<bool>,
}

#[derive(Debug)]
pub enum Event {
    Incoming(Incoming),
    Channel {
        role: Role,
        handle: ChannelHandle,
        event: ChannelEvent,
    },
}

/// Instructions from the dispatcher to a channel task.
#[derive(Debug)]
pub enum Command {
    /// Report `Writable` once the channel is idle.
    Wanted,
    Write(Bytes),
    Pause,
    Resume,
    Close,
}

/// Handle numbers shared by both roles so the dispatcher never sees a clash.
#[derive(Debug, Clone, Default)]
pub struct HandleSource(Arc<AtomicU64>);

impl HandleSource {
    pub fn next(&self) -> ChannelHandle {
        ChannelHandle(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Sends one channel's events to the dispatcher.
#[derive(Debug, Clone)]
pub struct Emitter {
    role: Role,
    handle: ChannelHandle,
    events: mpsc::UnboundedSender<Event>,
}

impl Emitter {
    pub fn new(role: Role, handle: ChannelHandle, events: mpsc::UnboundedSender<Event>) -> Self {
        Self { role, handle, events }
    }

    /// False once the dispatcher is gone.
    pub fn emit(&self, event: ChannelEvent) -> bool {
        self.events
            .send(Event::Channel {
                role: self.role,
                handle: self.handle,
                event,
            })
            .is_ok()
    }
}

/// Map a reqwest failure onto the core's channel errors.
pub fn channel_error(e: &reqwest::Error) -> ChannelError {
    if let Some(status) = e.status() {
        return ChannelError::Status(status.as_u16());
    }
    if e.is_connect() {
        return ChannelError::Refused;
    }
    ChannelError::Io(e.to_string())
}

/// Bytes of an HTTP/1.1 response head carrying `headers`.
fn head_len(headers: &reqwest::header::HeaderMap) -> usize {
    let status_line = "HTTP/1.1 200 OK\r\n".len();
    let fields: usize = headers
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len() + 4)
        .sum();
    status_line + fields + 2
}

struct Pull {
    task: JoinHandle<()>,
    paused: watch::Sender<bool>,
    url: String,
}

struct Push {
    commands: mpsc::UnboundedSender<Command>,
}

/// Originating side: the pull channel is a long-poll GET, the push channel a series of PUTs.
pub struct ClientChannels {
    http: reqwest::Client,
    events: mpsc::UnboundedSender<Event>,
    handles: HandleSource,
    pulls: HashMap<ChannelHandle, Pull>,
    pushes: HashMap<ChannelHandle, Push>,
    /// Set once the GET of a correlation URL has its response head.
    ready: HashMap<String, watch::Receiver<bool>>,
}

impl ClientChannels {
    pub fn new(events: mpsc::UnboundedSender<Event>, handles: HandleSource) -> Result<Self, reqwest::Error> {
        // Peers are dialed directly.
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            events,
            handles,
            pulls: HashMap::new(),
            pushes: HashMap::new(),
            ready: HashMap::new(),
        })
    }

    /// The channel's task has finished; drop what is left of it.
    pub fn forget(&mut self, handle: ChannelHandle) {
        if let Some(pull) = self.pulls.remove(&handle) {
            self.ready.remove(&pull.url);
        }
        self.pushes.remove(&handle);
    }

    pub fn len(&self) -> usize {
        self.pulls.len() + self.pushes.len()
    }
}

impl Channels for ClientChannels {
    fn open(&mut self, target: &ChannelTarget) -> Result<ChannelHandle, ChannelError> {
        let handle = self.handles.next();
        let emitter = Emitter::new(Role::Client, handle, self.events.clone());
        match target.direction {
            Direction::Recv => {
                let (ready_tx, ready_rx) = watch::channel(false);
                let (paused_tx, paused_rx) = watch::channel(false);
                let task = tokio::spawn(run_pull(
                    self.http.clone(),
                    target.url.clone(),
                    emitter,
                    ready_tx,
                    paused_rx,
                ));
                self.ready.insert(target.url.clone(), ready_rx);
                self.pulls.insert(
                    handle,
                    Pull {
                        task,
                        paused: paused_tx,
                        url: target.url.clone(),
                    },
                );
            }
            Direction::Send => {
                let (tx, rx) = mpsc::unbounded_channel();
                let ready = self.ready.get(&target.url).cloned();
                tokio::spawn(run_push(self.http.clone(), target.url.clone(), emitter, rx, ready));
                self.pushes.insert(handle, Push { commands: tx });
            }
        }
        debug!(%handle, url = %target.url, direction = ?target.direction, "channel opened");
        Ok(handle)
    }

    fn write(&mut self, handle: ChannelHandle, bytes: &[u8]) -> Result<usize, ChannelError> {
        let push = self
            .pushes
            .get(&handle)
            .ok_or_else(|| ChannelError::Io("channel is gone".into()))?;
        let n = bytes.len().min(MAX_WRITE);
        push.commands
            .send(Command::Write(Bytes::copy_from_slice(&bytes[..n])))
            .map_err(|_| ChannelError::Io("channel is gone".into()))?;
        Ok(n)
    }

    /// A pull is aborted on the spot. A push finishes the PUTs already handed to it first.
    fn close(&mut self, handle: ChannelHandle) -> CloseStatus {
        if let Some(pull) = self.pulls.remove(&handle) {
            pull.task.abort();
            self.ready.remove(&pull.url);
            return CloseStatus::Closed;
        }
        match self.pushes.remove(&handle) {
            Some(push) if push.commands.send(Command::Close).is_ok() => CloseStatus::Pending,
            _ => CloseStatus::Closed,
        }
    }

    fn want_write(&mut self, handle: ChannelHandle) {
        if let Some(push) = self.pushes.get(&handle) {
            let _ = push.commands.send(Command::Wanted);
        }
    }

    fn pause(&mut self, handle: ChannelHandle) {
        if let Some(pull) = self.pulls.get(&handle) {
            pull.paused.send_replace(true);
        }
    }

    fn resume(&mut self, handle: ChannelHandle) {
        if let Some(pull) = self.pulls.get(&handle) {
            pull.paused.send_replace(false);
        }
    }
}

async fn run_pull(
    http: reqwest::Client,
    url: String,
    emitter: Emitter,
    ready: watch::Sender<bool>,
    mut paused: watch::Receiver<bool>,
) {
    let mut resp = match http.get(&url).header("Cache-Control", "no-cache").send().await {
        Ok(r) => r,
        Err(e) => {
            emitter.emit(ChannelEvent::Error(channel_error(&e)));
            return;
        }
    };
    if !resp.status().is_success() {
        emitter.emit(ChannelEvent::Error(ChannelError::Status(resp.status().as_u16())));
        return;
    }
    emitter.emit(ChannelEvent::Overhead(head_len(resp.headers())));
    ready.send_replace(true);
    loop {
        if paused.wait_for(|p| !*p).await.is_err() {
            return;
        }
        match resp.chunk().await {
            Ok(Some(bytes)) => {
                trace!(url = %url, len = bytes.len(), "pull chunk");
                if !emitter.emit(ChannelEvent::Data(bytes)) {
                    return;
                }
            }
            Ok(None) => {
                emitter.emit(ChannelEvent::Closed);
                return;
            }
            Err(e) => {
                emitter.emit(ChannelEvent::Error(channel_error(&e)));
                return;
            }
        }
    }
}

/// PUT `body`; returns the response head size.
async fn put(http: &reqwest::Client, url: &str, body: Bytes) -> Result<usize, ChannelError> {
    let resp = http
        .put(url)
        .timeout(PUT_TIMEOUT)
        .header("Content-Type", "application/octet-stream")
        .body(body)
        .send()
        .await
        .map_err(|e| channel_error(&e))?;
    if !resp.status().is_success() {
        return Err(ChannelError::Status(resp.status().as_u16()));
    }
    Ok(head_len(resp.headers()))
}

async fn run_push(
    http: reqwest::Client,
    url: String,
    emitter: Emitter,
    mut commands: mpsc::UnboundedReceiver<Command>,
    ready: Option<watch::Receiver<bool>>,
) {
    if let Some(mut ready) = ready {
        let _ = tokio::time::timeout(PULL_READY_WAIT, ready.wait_for(|r| *r)).await;
    }
    // Empty PUT so the accepting side can bind this half.
    if let Err(err) = put(&http, &url, Bytes::new()).await {
        emitter.emit(ChannelEvent::Error(err));
        return;
    }
    while let Some(cmd) = commands.recv().await {
        match cmd {
            Command::Wanted => {
                if !emitter.emit(ChannelEvent::Writable(MAX_WRITE)) {
                    return;
                }
            }
            Command::Write(body) => {
                let len = body.len();
                match put(&http, &url, body).await {
                    Ok(overhead) => {
                        trace!(url = %url, len, "pushed");
                        emitter.emit(ChannelEvent::Overhead(overhead));
                    }
                    Err(err) => {
                        emitter.emit(ChannelEvent::Error(err));
                        return;
                    }
                }
            }
            Command::Close => break,
            Command::Pause | Command::Resume => {}
        }
    }
    emitter.emit(ChannelEvent::Closed);
}

/// Accepting side: channels are requests the listener holds open, steered by command queues.
#[derive(Debug, Default)]
pub struct ServerChannels {
    commands: HashMap<ChannelHandle, mpsc::UnboundedSender<Command>>,
}

impl ServerChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handle: ChannelHandle, commands: mpsc::UnboundedSender<Command>) {
        self.commands.insert(handle, commands);
    }

    pub fn forget(&mut self, handle: ChannelHandle) {
        self.commands.remove(&handle);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    fn send(&self, handle: ChannelHandle, cmd: Command) -> bool {
        self.commands
            .get(&handle)
            .map_or(false, |tx| tx.send(cmd).is_ok())
    }
}

impl Channels for ServerChannels {
    fn open(&mut self, _target: &ChannelTarget) -> Result<ChannelHandle, ChannelError> {
        Err(ChannelError::Refused)
    }

    fn write(&mut self, handle: ChannelHandle, bytes: &[u8]) -> Result<usize, ChannelError> {
        let n = bytes.len().min(MAX_WRITE);
        if self.send(handle, Command::Write(Bytes::copy_from_slice(&bytes[..n]))) {
            Ok(n)
        } else {
            Err(ChannelError::Io("request is gone".into()))
        }
    }

    fn close(&mut self, handle: ChannelHandle) -> CloseStatus {
        let status = if self.send(handle, Command::Close) {
            CloseStatus::Pending
        } else {
            CloseStatus::Closed
        };
        self.commands.remove(&handle);
        status
    }

    fn want_write(&mut self, handle: ChannelHandle) {
        self.send(handle, Command::Wanted);
    }

    fn pause(&mut self, handle: ChannelHandle) {
        self.send(handle, Command::Pause);
    }

    fn resume(&mut self, handle: ChannelHandle) {
        self.send(handle, Command::Resume);
    }
}
