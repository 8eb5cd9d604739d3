//! Mock collaborators for plugin tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::address::HttpAddress;
use crate::channel::{ChannelError, ChannelHandle, ChannelTarget, Channels, CloseStatus, Direction};
use crate::env::Env;
use crate::error::EndReason;
use crate::identity::PeerId;
use crate::queue::{Completion, TransmitReport};
use crate::session::SessionId;
use crate::wire::{encode_frame, Frame};

pub(crate) fn peer(b: u8) -> PeerId {
    PeerId::from_bytes([b; 32])
}

pub(crate) fn addr(url: &str) -> HttpAddress {
    HttpAddress::from_url(url, 0).unwrap()
}

pub(crate) fn frame_bytes(msg_type: u16, body: &[u8]) -> Vec<u8> {
    encode_frame(msg_type, body).unwrap()
}

/// Records every call; behaviour is switched through the public fields.
#[derive(Debug)]
pub(crate) struct MockChannels {
    next: u64,
    pub opened: Vec<(ChannelHandle, ChannelTarget)>,
    /// Bytes actually accepted per write.
    pub writes: Vec<(ChannelHandle, Vec<u8>)>,
    pub closed: Vec<ChannelHandle>,
    pub wanted: Vec<ChannelHandle>,
    pub paused: Vec<ChannelHandle>,
    pub resumed: Vec<ChannelHandle>,
    pub fail_open: Option<Direction>,
    pub fail_write: Option<ChannelError>,
    pub accept_limit: Option<usize>,
    pub close_status: CloseStatus,
}

impl MockChannels {
    pub fn new() -> Self {
        Self {
            next: 1,
            opened: Vec::new(),
            writes: Vec::new(),
            closed: Vec::new(),
            wanted: Vec::new(),
            paused: Vec::new(),
            resumed: Vec::new(),
            fail_open: None,
            fail_write: None,
            accept_limit: None,
            close_status: CloseStatus::Closed,
        }
    }

    pub fn closed_pair(&self) -> (ChannelHandle, ChannelHandle) {
        (self.closed[0], self.closed[1])
    }
}

impl Channels for MockChannels {
    fn open(&mut self, target: &ChannelTarget) -> Result<ChannelHandle, ChannelError> {
        if self.fail_open == Some(target.direction) {
            return Err(ChannelError::Refused);
        }
        let handle = ChannelHandle(self.next);
        self.next += 1;
        self.opened.push((handle, target.clone()));
        Ok(handle)
    }

    fn write(&mut self, handle: ChannelHandle, bytes: &[u8]) -> Result<usize, ChannelError> {
        if let Some(err) = &self.fail_write {
            return Err(err.clone());
        }
        let n = self.accept_limit.map_or(bytes.len(), |l| l.min(bytes.len()));
        self.writes.push((handle, bytes[..n].to_vec()));
        Ok(n)
    }

    fn close(&mut self, handle: ChannelHandle) -> CloseStatus {
        self.closed.push(handle);
        self.close_status
    }

    fn want_write(&mut self, handle: ChannelHandle) {
        self.wanted.push(handle);
    }

    fn pause(&mut self, handle: ChannelHandle) {
        self.paused.push(handle);
    }

    fn resume(&mut self, handle: ChannelHandle) {
        self.resumed.push(handle);
    }
}

/// Upper layer that remembers everything and asks for a fixed receive delay.
#[derive(Debug, Default)]
pub(crate) struct RecordingEnv {
    pub delay: Duration,
    pub frames: Vec<(SessionId, Frame)>,
    pub starts: Vec<(SessionId, PeerId)>,
    pub ends: Vec<(SessionId, PeerId, EndReason)>,
}

impl RecordingEnv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Env for RecordingEnv {
    fn receive(&mut self, session: SessionId, _peer: &PeerId, frame: &Frame) -> Duration {
        self.frames.push((session, frame.clone()));
        self.delay
    }

    fn session_start(&mut self, session: SessionId, peer: &PeerId, _address: &HttpAddress) {
        self.starts.push((session, *peer));
    }

    fn session_end(&mut self, session: SessionId, peer: &PeerId, reason: &EndReason) {
        self.ends.push((session, *peer, reason.clone()));
    }
}

/// Completion reports in the order they fired, tagged with the id given to `make`.
#[derive(Clone, Default)]
pub(crate) struct CompletionLog(Arc<Mutex<Vec<(usize, TransmitReport)>>>);

impl CompletionLog {
    pub fn ids(&self) -> Vec<usize> {
        self.0.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    pub fn reports(&self) -> Vec<TransmitReport> {
        self.0.lock().unwrap().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn all_ok(&self) -> bool {
        self.0.lock().unwrap().iter().all(|(_, r)| r.result.is_ok())
    }
}

pub(crate) fn completion_log() -> (CompletionLog, impl Fn(usize) -> Completion) {
    let log = CompletionLog::default();
    let sink = log.clone();
    let make = move |id: usize| -> Completion {
        let sink = sink.clone();
        Box::new(move |report: TransmitReport| sink.0.lock().unwrap().push((id, report)))
    };
    (log, make)
}
