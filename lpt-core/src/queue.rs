//! Per-session FIFO of outbound payloads and their completion continuations.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::{EndReason, TransmitError};
use crate::identity::PeerId;

/// Continuation invoked exactly once with the outcome of a transmission.
pub type Completion = Box<dyn FnOnce(TransmitReport) + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmitReport {
    pub peer: PeerId,
    pub result: Result<(), TransmitError>,
    pub payload_len: usize,
    /// Bytes put on the wire for this message, including channel overhead.
    pub bytes_on_wire: usize,
}

pub struct QueuedMessage {
    payload: Bytes,
    offset_sent: usize,
    completion: Option<Completion>,
}

impl QueuedMessage {
    fn remaining(&self) -> &[u8] {
        &self.payload[self.offset_sent..]
    }
}

/// A finished (or failed) message whose continuation has not been run yet.
/// Fired by the owner once its own state is consistent.
#[must_use]
pub struct Delivery {
    completion: Option<Completion>,
    pub report: TransmitReport,
}

impl Delivery {
    pub fn fire(self) {
        if let Some(cont) = self.completion {
            cont(self.report);
        }
    }
}

pub struct MessageQueue {
    peer: PeerId,
    entries: VecDeque<QueuedMessage>,
    bytes_queued: usize,
}

impl MessageQueue {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            entries: VecDeque::new(),
            bytes_queued: 0,
        }
    }

    pub fn push(&mut self, payload: Bytes, completion: Option<Completion>) {
        self.bytes_queued += payload.len();
        self.entries.push_back(QueuedMessage {
            payload,
            offset_sent: 0,
            completion,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Bytes not yet handed to a channel.
    pub fn bytes_queued(&self) -> usize {
        self.bytes_queued
    }

    /// Copy up to `max` pending bytes, in order, across message boundaries. Does not consume.
    pub fn peek_chunk(&self, max: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(max.min(self.bytes_queued));
        for msg in &self.entries {
            let room = max - out.len();
            if room == 0 {
                break;
            }
            let rem = msg.remaining();
            out.extend_from_slice(&rem[..rem.len().min(room)]);
        }
        out
    }

    /// Consume `n` bytes accepted by the channel. Fully sent messages are popped in FIFO order.
    /// `overhead` is attributed to the first finished message and reset.
    pub fn advance(&mut self, mut n: usize, overhead: &mut usize) -> Vec<Delivery> {
        n = n.min(self.bytes_queued);
        self.bytes_queued -= n;
        let mut done = Vec::new();
        while n > 0 {
            let Some(head) = self.entries.front_mut() else {
                break;
            };
            let take = head.remaining().len().min(n);
            head.offset_sent += take;
            n -= take;
            if head.offset_sent < head.payload.len() {
                break;
            }
            if let Some(msg) = self.entries.pop_front() {
                let len = msg.payload.len();
                done.push(Delivery {
                    completion: msg.completion,
                    report: TransmitReport {
                        peer: self.peer,
                        result: Ok(()),
                        payload_len: len,
                        bytes_on_wire: len + std::mem::take(overhead),
                    },
                });
            }
        }
        done
    }

    /// Empty the queue, failing every entry.
    pub fn fail_all(&mut self, reason: &EndReason, overhead: &mut usize) -> Vec<Delivery> {
        self.bytes_queued = 0;
        self.entries
            .drain(..)
            .map(|msg| Delivery {
                report: TransmitReport {
                    peer: self.peer,
                    result: Err(TransmitError::SessionEnded(reason.clone())),
                    payload_len: msg.payload.len(),
                    bytes_on_wire: msg.offset_sent + std::mem::take(overhead),
                },
                completion: msg.completion,
            })
            .collect()
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        let mut overhead = 0;
        for d in self.fail_all(&EndReason::Shutdown, &mut overhead) {
            d.fire();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<(usize, bool, usize)>>>, impl Fn(usize) -> Completion) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let make = move |id: usize| -> Completion {
            let l = l.clone();
            Box::new(move |r: TransmitReport| {
                l.lock().unwrap().push((id, r.result.is_ok(), r.bytes_on_wire));
            })
        };
        (log, make)
    }

    fn fire_all(ds: Vec<Delivery>) {
        for d in ds {
            d.fire();
        }
    }

    #[test]
    fn peek_spans_messages_without_consuming() {
        let mut q = MessageQueue::new(PeerId::from_bytes([1; 32]));
        q.push(Bytes::from_static(b"abc"), None);
        q.push(Bytes::from_static(b"defg"), None);
        assert_eq!(q.peek_chunk(5), b"abcde");
        assert_eq!(q.peek_chunk(100), b"abcdefg");
        assert_eq!(q.bytes_queued(), 7);
    }

    #[test]
    fn advance_completes_in_order() {
        let (log, make) = recorder();
        let mut q = MessageQueue::new(PeerId::from_bytes([1; 32]));
        q.push(Bytes::from(vec![0u8; 10]), Some(make(1)));
        q.push(Bytes::from(vec![0u8; 20]), Some(make(2)));
        q.push(Bytes::from(vec![0u8; 30]), Some(make(3)));
        let mut overhead = 0;

        fire_all(q.advance(15, &mut overhead));
        assert_eq!(*log.lock().unwrap(), vec![(1, true, 10)]);
        assert_eq!(q.peek_chunk(5), vec![0u8; 5]);

        fire_all(q.advance(45, &mut overhead));
        assert_eq!(
            *log.lock().unwrap(),
            vec![(1, true, 10), (2, true, 20), (3, true, 30)]
        );
        assert!(q.is_empty());
        assert_eq!(q.bytes_queued(), 0);
    }

    #[test]
    fn overhead_goes_to_next_completion_only() {
        let (log, make) = recorder();
        let mut q = MessageQueue::new(PeerId::from_bytes([1; 32]));
        q.push(Bytes::from(vec![0u8; 4]), Some(make(1)));
        q.push(Bytes::from(vec![0u8; 4]), Some(make(2)));
        let mut overhead = 100;
        fire_all(q.advance(8, &mut overhead));
        assert_eq!(*log.lock().unwrap(), vec![(1, true, 104), (2, true, 4)]);
        assert_eq!(overhead, 0);
    }

    #[test]
    fn fail_all_reports_partial_progress() {
        let (log, make) = recorder();
        let mut q = MessageQueue::new(PeerId::from_bytes([1; 32]));
        q.push(Bytes::from(vec![0u8; 10]), Some(make(1)));
        q.push(Bytes::from(vec![0u8; 10]), Some(make(2)));
        let mut overhead = 0;
        fire_all(q.advance(4, &mut overhead));
        fire_all(q.fail_all(&EndReason::Disconnect, &mut overhead));
        assert_eq!(*log.lock().unwrap(), vec![(1, false, 4), (2, false, 0)]);
        assert!(q.is_empty());
    }

    #[test]
    fn dropping_a_queue_fails_leftovers_once() {
        let (log, make) = recorder();
        {
            let mut q = MessageQueue::new(PeerId::from_bytes([1; 32]));
            q.push(Bytes::from_static(b"x"), Some(make(9)));
        }
        assert_eq!(*log.lock().unwrap(), vec![(9, false, 0)]);
    }
}
