//! The send queue sub-component (spec §4.2): buffers outbound messages
//! between `send_async` calls and the sender link actually being open, and
//! times out messages that sit too long before the library accepts them.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use fe2o3_amqp_types::messaging::{Data, Message};

use crate::error::SendResult;

/// Default enqueue timeout, matching the C source's default (spec §4.2).
pub const DEFAULT_MAX_ENQUEUED_TIME_SECS: u64 = 600;

/// A send completion callback. Replaces the C source's function-pointer +
/// `void*` context pair (SPEC_FULL.md §3, Design deviation).
pub type SendCompletion = Box<dyn FnOnce(SendResult) + Send>;

pub(crate) struct QueuedMessage {
    pub(crate) message: Message<Data>,
    pub(crate) enqueued_at: Instant,
    pub(crate) on_complete: Option<SendCompletion>,
}

impl std::fmt::Debug for QueuedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedMessage")
            .field("enqueued_at", &self.enqueued_at)
            .finish_non_exhaustive()
    }
}

/// Two ordered lists, not one list with a cursor: the C source's Open
/// Question about a cursor/removal bug does not exist here because
/// `in_progress` and `pending` are separate `VecDeque`s (SPEC_FULL.md §4.2).
#[derive(Debug)]
pub struct SendQueue {
    pending: VecDeque<QueuedMessage>,
    in_progress: VecDeque<QueuedMessage>,
    max_enqueued_time: Duration,
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            in_progress: VecDeque::new(),
            max_enqueued_time: Duration::from_secs(DEFAULT_MAX_ENQUEUED_TIME_SECS),
        }
    }

    /// Enqueues a fully-formed message. Plain telemetry sends typically pass
    /// a single-[`Data`]-section message with no properties; the twin layer
    /// passes one with a correlation-id and message annotations set.
    pub(crate) fn add(&mut self, message: Message<Data>, on_complete: Option<SendCompletion>) {
        self.pending.push_back(QueuedMessage {
            message,
            enqueued_at: Instant::now(),
            on_complete,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.in_progress.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.in_progress.len()
    }

    pub fn set_max_enqueued_time_secs(&mut self, secs: u64) {
        self.max_enqueued_time = Duration::from_secs(secs);
    }

    pub fn max_enqueued_time_secs(&self) -> u64 {
        self.max_enqueued_time.as_secs()
    }

    /// Moves the next pending message into `in_progress` and returns a
    /// reference to it, ready to be handed to the sender link. Returns
    /// `None` if nothing is pending.
    pub(crate) fn promote_next(&mut self) -> Option<&QueuedMessage> {
        if let Some(item) = self.pending.pop_front() {
            self.in_progress.push_back(item);
        }
        self.in_progress.back()
    }

    /// Completes and removes the oldest in-progress message, invoking its
    /// completion callback with `result`.
    pub(crate) fn complete_head(&mut self, result: SendResult) {
        if let Some(item) = self.in_progress.pop_front() {
            if let Some(on_complete) = item.on_complete {
                on_complete(result);
            }
        }
    }

    /// Removes every message (pending or in-progress) that has been
    /// enqueued longer than `max_enqueued_time`, completing each with
    /// [`SendResult::Timeout`] (spec §4.1 step 6).
    pub(crate) fn sweep_timeouts(&mut self, now: Instant) -> usize {
        let max = self.max_enqueued_time;
        let mut timed_out = 0;
        Self::drain_expired(&mut self.in_progress, now, max, &mut timed_out);
        Self::drain_expired(&mut self.pending, now, max, &mut timed_out);
        timed_out
    }

    fn drain_expired(
        queue: &mut VecDeque<QueuedMessage>,
        now: Instant,
        max: Duration,
        timed_out: &mut usize,
    ) {
        let mut i = 0;
        while i < queue.len() {
            if now.saturating_duration_since(queue[i].enqueued_at) >= max {
                let item = queue.remove(i).expect("index in bounds");
                if let Some(on_complete) = item.on_complete {
                    on_complete(SendResult::Timeout);
                }
                *timed_out += 1;
            } else {
                i += 1;
            }
        }
    }

    /// Moves every in-progress message back to the front of `pending`, in
    /// original order, so a lost send attempt (link detached mid-send) is
    /// retried in full once the link reopens.
    pub(crate) fn move_all_back_to_pending(&mut self) {
        while let Some(item) = self.in_progress.pop_back() {
            self.pending.push_front(item);
        }
    }

    /// Completes every queued message with [`SendResult::Cancelled`],
    /// emptying the queue (spec §4.1 `destroy`).
    pub(crate) fn cancel_all(&mut self) {
        for mut queue in [std::mem::take(&mut self.in_progress), std::mem::take(&mut self.pending)] {
            for item in queue.drain(..) {
                if let Some(on_complete) = item.on_complete {
                    on_complete(SendResult::Cancelled);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn recorder() -> (SendCompletion, Arc<AtomicUsize>, Arc<std::sync::Mutex<Option<SendResult>>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(std::sync::Mutex::new(None));
        let calls2 = calls.clone();
        let last2 = last.clone();
        let cb: SendCompletion = Box::new(move |r| {
            calls2.fetch_add(1, Ordering::SeqCst);
            *last2.lock().unwrap() = Some(r);
        });
        (cb, calls, last)
    }

    fn test_message(body: &'static [u8]) -> Message<Data> {
        Message::builder().data(Data(Bytes::from_static(body))).build()
    }

    #[test]
    fn promotes_in_fifo_order() {
        let mut q = SendQueue::new();
        q.add(test_message(b"a"), None);
        q.add(test_message(b"b"), None);
        assert_eq!(q.len(), 2);
        q.promote_next();
        q.complete_head(SendResult::Ok);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn timeout_sweep_completes_with_timeout_result() {
        let mut q = SendQueue::new();
        q.set_max_enqueued_time_secs(0);
        let (cb, calls, last) = recorder();
        q.add(test_message(b"a"), Some(cb));
        let later = Instant::now() + Duration::from_secs(1);
        let n = q.sweep_timeouts(later);
        assert_eq!(n, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*last.lock().unwrap(), Some(SendResult::Timeout));
        assert!(q.is_empty());
    }

    #[test]
    fn cancel_all_reports_cancelled_for_both_lists() {
        let mut q = SendQueue::new();
        let (cb1, calls1, _) = recorder();
        let (cb2, calls2, _) = recorder();
        q.add(test_message(b"a"), Some(cb1));
        q.promote_next();
        q.add(test_message(b"b"), Some(cb2));
        q.cancel_all();
        assert_eq!(calls1.load(Ordering::SeqCst), 1);
        assert_eq!(calls2.load(Ordering::SeqCst), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn move_all_back_to_pending_preserves_order() {
        let mut q = SendQueue::new();
        q.add(test_message(b"a"), None);
        q.add(test_message(b"b"), None);
        q.promote_next();
        q.promote_next();
        q.move_all_back_to_pending();
        assert_eq!(q.pending.len(), 2);
        assert!(q.in_progress.is_empty());
    }
}
