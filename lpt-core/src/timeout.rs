//! Deadline registry. The host sleeps until `next_deadline` and then drains `pop_expired`.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use crate::session::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    /// Session silent for too long.
    Idle,
    /// Receive throttle has elapsed; replay held bytes.
    RecvWakeup,
    /// Originating side: push channel empty for too long.
    PutIdle,
    /// Bound on waiting for channels to confirm close.
    Linger,
    /// Accepting side: one half waiting for the other.
    HalfOpen,
}

pub type TimerKey = (SessionId, TimerKind);

#[derive(Debug, Default)]
pub struct Timers {
    queue: BTreeSet<(Instant, u64, TimerKey)>,
    index: HashMap<TimerKey, (Instant, u64)>,
    seq: u64,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `key` at `at`, replacing any existing deadline.
    pub fn schedule(&mut self, key: TimerKey, at: Instant) {
        self.cancel(key);
        self.seq += 1;
        self.queue.insert((at, self.seq, key));
        self.index.insert(key, (at, self.seq));
    }

    /// Arm `key` at `at` unless it is already armed for a later instant.
    pub fn extend(&mut self, key: TimerKey, at: Instant) {
        match self.index.get(&key) {
            Some(&(current, _)) if current >= at => {}
            _ => self.schedule(key, at),
        }
    }

    pub fn cancel(&mut self, key: TimerKey) -> bool {
        match self.index.remove(&key) {
            Some((at, seq)) => {
                self.queue.remove(&(at, seq, key));
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self, session: SessionId) {
        let keys: Vec<TimerKey> = self
            .index
            .keys()
            .filter(|(s, _)| *s == session)
            .copied()
            .collect();
        for key in keys {
            self.cancel(key);
        }
    }

    pub fn deadline(&self, key: TimerKey) -> Option<Instant> {
        self.index.get(&key).map(|&(at, _)| at)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.first().map(|&(at, _, _)| at)
    }

    /// Remove and return the earliest timer due at or before `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<TimerKey> {
        let &(at, seq, key) = self.queue.first()?;
        if at > now {
            return None;
        }
        self.queue.remove(&(at, seq, key));
        self.index.remove(&key);
        Some(key)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
