//! Byte queue and line framing between the transport reader and the
//! session loop.
//!
//! The reader task appends raw transport bytes to a shared append-only log;
//! the session drains it through [`LineFramer`], which owns an independent
//! read cursor. When only part of a record has arrived the cursor stays put,
//! so records are atomic under short reads.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::message::CONTROL_TOKENS;

const LF: u8 = b'\n';
const CR: u8 = b'\r';

#[derive(Debug, Default)]
struct State {
    log: Vec<u8>,
    closed: bool,
}

/// Shared byte log. Cloning yields another handle onto the same log.
#[derive(Debug, Clone, Default)]
pub struct ByteQueue {
    shared: Arc<(Mutex<State>, Condvar)>,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes from the transport reader and wakes the framer.
    pub fn push(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let (state, cond) = &*self.shared;
        state.lock().unwrap().log.extend_from_slice(bytes);
        cond.notify_all();
    }

    /// Marks the transport dead. Already-buffered complete records remain
    /// readable; the framer reports closure once they are drained.
    pub fn close(&self) {
        let (state, cond) = &*self.shared;
        state.lock().unwrap().closed = true;
        cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.0.lock().unwrap().closed
    }
}

/// The framer's answer for one poll of the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete record (terminators stripped, never empty).
    Record(Vec<u8>),
    /// No complete record arrived within the wait window.
    Pending,
    /// The queue is closed and fully drained.
    Closed,
}

/// Splits the byte log into LF-terminated records and one-byte control
/// tokens. Holds the session-side read cursor.
#[derive(Debug)]
pub struct LineFramer {
    queue: ByteQueue,
    pos: usize,
}

impl LineFramer {
    pub fn new(queue: ByteQueue) -> Self {
        Self { queue, pos: 0 }
    }

    /// Returns the next record, waiting up to `wait` for more bytes.
    pub fn next_record(&mut self, wait: Duration) -> Frame {
        let shared = self.queue.shared.clone();
        let (state, cond) = &*shared;
        let mut state = state.lock().unwrap();

        loop {
            match self.scan(&state.log) {
                Some(record) => return Frame::Record(record),
                None => {
                    if state.closed {
                        return Frame::Closed;
                    }
                    let (next, timeout) = cond.wait_timeout(state, wait).unwrap();
                    state = next;
                    if timeout.timed_out() {
                        // One last look in case the writer raced the timeout.
                        match self.scan(&state.log) {
                            Some(record) => return Frame::Record(record),
                            None if state.closed => return Frame::Closed,
                            None => return Frame::Pending,
                        }
                    }
                }
            }
        }
    }

    /// Advances the cursor over the log, returning the first complete
    /// record. Leaves the cursor at the start of any partial record.
    fn scan(&mut self, log: &[u8]) -> Option<Vec<u8>> {
        while self.pos < log.len() {
            let rest = &log[self.pos..];

            // Control tokens only count at the start of a would-be record;
            // inside a line (e.g. a NUL-joined failure trace) they are
            // ordinary payload bytes.
            if CONTROL_TOKENS.contains(&rest[0]) {
                self.pos += 1;
                return Some(vec![rest[0]]);
            }

            let Some(lf) = rest.iter().position(|&b| b == LF) else {
                // Partial record: rewind by not advancing.
                return None;
            };

            let mut record = &rest[..lf];
            if record.last() == Some(&CR) {
                record = &record[..record.len() - 1];
            }
            self.pos += lf + 1;

            if record.is_empty() {
                continue;
            }
            return Some(record.to_vec());
        }
        None
    }
}
