//! Sent-Item Ledger
//!
//! A [`SentItem`] is the application's view of one request or response
//! awaiting confirmation. It moves from `Waiting` to `Done` or `Failed`
//! exactly once. The ledger keeps the retry bookkeeping for every item that
//! is still in flight as plain data; the resend policy itself lives in the
//! connection's tick.

use crate::message::Response;
use crate::sequence::{MessageId, PacketId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll interval of [`SentItem::wait`]
const WAIT_POLL: Duration = Duration::from_millis(10);

/// Delivery policy for a sent item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Guarantee {
    /// Sent once; failed if presumed lost
    #[default]
    None,
    /// Resent once before failing
    ResendOnce,
    /// Resent until the try limit; exhausting it closes the connection
    Critical,
}

/// Completion state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Completion {
    Waiting = 0,
    Done = 1,
    Failed = 2,
}

impl Completion {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Completion::Done,
            2 => Completion::Failed,
            _ => Completion::Waiting,
        }
    }
}

/// Completion callback; receives `true` on success
pub type CompletionCallback = Box<dyn FnOnce(bool, &SentItem) + Send>;

/// Handle to a request or response awaiting confirmation
pub struct SentItem {
    message_id: MessageId,
    guarantee: Guarantee,
    is_request: bool,
    state: AtomicU8,
    timed: AtomicBool,
    round_trip: Mutex<Option<Duration>>,
    response: Mutex<Option<Response>>,
    callback: Mutex<Option<CompletionCallback>>,
}

impl SentItem {
    pub(crate) fn new(message_id: MessageId, guarantee: Guarantee, is_request: bool) -> Self {
        SentItem {
            message_id,
            guarantee,
            is_request,
            state: AtomicU8::new(Completion::Waiting as u8),
            timed: AtomicBool::new(false),
            round_trip: Mutex::new(None),
            response: Mutex::new(None),
            callback: Mutex::new(None),
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn guarantee(&self) -> Guarantee {
        self.guarantee
    }

    pub fn is_request(&self) -> bool {
        self.is_request
    }

    /// Current completion state
    pub fn status(&self) -> Completion {
        Completion::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_finalized(&self) -> bool {
        self.status() != Completion::Waiting
    }

    /// Block until finalized; returns true on success
    ///
    /// Polls the state flag, so it cannot miss a completion that happened
    /// before the call. Meant for tests and bootstrap code.
    pub fn wait(&self) -> bool {
        loop {
            match self.status() {
                Completion::Waiting => std::thread::sleep(WAIT_POLL),
                status => return status == Completion::Done,
            }
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.status() {
                Completion::Waiting if Instant::now() >= deadline => return None,
                Completion::Waiting => std::thread::sleep(WAIT_POLL),
                status => return Some(status == Completion::Done),
            }
        }
    }

    /// Register the completion callback
    ///
    /// Runs immediately (on the calling thread) if the item is already
    /// finalized. Replaces any callback registered earlier.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(bool, &SentItem) + Send + 'static,
    {
        let mut slot = self.callback.lock();
        match self.status() {
            Completion::Waiting => *slot = Some(Box::new(callback)),
            status => {
                drop(slot);
                callback(status == Completion::Done, self);
            }
        }
    }

    /// Record the round-trip time when this item completes
    pub fn set_as_timed(&self) {
        self.timed.store(true, Ordering::Release);
    }

    pub fn is_timed(&self) -> bool {
        self.timed.load(Ordering::Acquire)
    }

    /// Time between the last transmission and its confirmation
    pub fn round_trip(&self) -> Option<Duration> {
        *self.round_trip.lock()
    }

    /// Response that answered this request, if one arrived
    pub fn response(&self) -> Option<Response> {
        self.response.lock().clone()
    }

    pub(crate) fn attach_response(&self, response: Response) {
        *self.response.lock() = Some(response);
    }

    /// Move out of `Waiting`; false if already finalized
    pub(crate) fn finalize(&self, succeeded: bool, round_trip: Option<Duration>) -> bool {
        let target = if succeeded {
            Completion::Done
        } else {
            Completion::Failed
        };

        // Held across the exchange so a reader that sees `Done` also sees the timing
        let mut slot = self.round_trip.lock();
        let won = self
            .state
            .compare_exchange(
                Completion::Waiting as u8,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if won && succeeded && self.is_timed() {
            *slot = round_trip;
        }
        won
    }

    /// Run the registered callback, if any
    ///
    /// Called after [`finalize`](Self::finalize) once no connection lock is
    /// held, so the callback may call back into the connection.
    pub(crate) fn run_callback(&self) {
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback(self.status() == Completion::Done, self);
        }
    }
}

impl fmt::Debug for SentItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SentItem")
            .field("message_id", &self.message_id)
            .field("guarantee", &self.guarantee)
            .field("is_request", &self.is_request)
            .field("status", &self.status())
            .finish()
    }
}

/// Retry bookkeeping for one in-flight item
#[derive(Debug, Clone)]
pub struct Outstanding {
    pub item: Arc<SentItem>,
    /// Packet id of the most recent transmission
    pub packet_id: PacketId,
    /// Transmissions so far, starting at 1
    pub attempt: u32,
    /// When the most recent transmission went out
    pub started: Instant,
    /// Encoded message frame, resent unchanged
    pub frame: Bytes,
}

impl Outstanding {
    pub fn new(item: Arc<SentItem>, packet_id: PacketId, started: Instant, frame: Bytes) -> Self {
        Outstanding {
            item,
            packet_id,
            attempt: 1,
            started,
            frame,
        }
    }
}

/// In-flight items of one connection
#[derive(Debug, Default)]
pub struct SentLedger {
    entries: Vec<Outstanding>,
    /// Requests confirmed by ack whose response may still arrive
    awaiting_response: VecDeque<(Arc<SentItem>, Instant)>,
}

impl SentLedger {
    pub fn new() -> Self {
        SentLedger::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record(&mut self, entry: Outstanding) {
        self.entries.push(entry);
    }

    /// Remove the entry whose latest transmission used `packet_id`
    pub fn take_by_packet(&mut self, packet_id: PacketId) -> Option<Outstanding> {
        let pos = self.entries.iter().position(|e| e.packet_id == packet_id)?;
        Some(self.entries.remove(pos))
    }

    /// Find the entry for `message_id`
    pub fn find_by_message(&self, message_id: MessageId) -> Option<&Outstanding> {
        self.entries
            .iter()
            .find(|e| e.item.message_id() == message_id)
    }

    pub fn find_by_message_mut(&mut self, message_id: MessageId) -> Option<&mut Outstanding> {
        self.entries
            .iter_mut()
            .find(|e| e.item.message_id() == message_id)
    }

    /// Remove the outstanding request with `message_id`
    pub fn take_request(&mut self, message_id: MessageId) -> Option<Outstanding> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.item.is_request() && e.item.message_id() == message_id)?;
        Some(self.entries.remove(pos))
    }

    /// Keep a confirmed request around so a later response can reach it
    pub fn await_response(&mut self, item: Arc<SentItem>, now: Instant) {
        self.awaiting_response.push_back((item, now));
    }

    /// Confirmed request answered by `response_to`, removing it
    pub fn take_awaiting(&mut self, response_to: MessageId) -> Option<Arc<SentItem>> {
        let pos = self
            .awaiting_response
            .iter()
            .position(|(item, _)| item.message_id() == response_to)?;
        self.awaiting_response.remove(pos).map(|(item, _)| item)
    }

    /// Forget confirmed requests older than `retention`
    pub fn prune_awaiting(&mut self, now: Instant, retention: Duration) {
        while let Some((_, since)) = self.awaiting_response.front() {
            if now.saturating_duration_since(*since) <= retention {
                break;
            }
            self.awaiting_response.pop_front();
        }
    }

    pub fn awaiting_len(&self) -> usize {
        self.awaiting_response.len()
    }

    /// Move every entry out, leaving the ledger empty
    pub fn take_entries(&mut self) -> Vec<Outstanding> {
        std::mem::take(&mut self.entries)
    }

    /// Put entries back after a sweep
    pub fn restore(&mut self, mut entries: Vec<Outstanding>) {
        entries.append(&mut self.entries);
        self.entries = entries;
    }

    /// Drop every entry and every awaiting request
    pub fn drain_all(&mut self) -> Vec<Arc<SentItem>> {
        self.awaiting_response.clear();
        self.entries.drain(..).map(|e| e.item).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Outstanding> {
        self.entries.iter()
    }
}
