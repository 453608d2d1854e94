//! Per-federate event queue
//!
//! Holds incoming messages until the time core lets them out. The queue has
//! two partitions:
//! - **RO**: receive order, first-in/first-out
//! - **TSO**: timestamp order, sorted by timestamp with stable insertion so
//!   equal timestamps keep arrival order
//!
//! Time advance grants live in the TSO partition behind every other message
//! with the same timestamp, so a federate sees all events at `t` before it is
//! told it has reached `t`.
//!
//! # Release Rules
//!
//! 1. RO messages go first. A constrained federate that has not enabled
//!    asynchronous delivery and has no advance outstanding only gets RO
//!    callbacks that are not reflect/interaction/remove.
//! 2. The head TSO message is released when it is a grant, or when its
//!    timestamp is `<=` both the federation LBTS and the federate's release time.
//!
//! A queue that is not constrained stores TSO messages as RO.

use crate::models::message::Message;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::VecDeque;

/// Federate state the release rules depend on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReleaseContext {
    pub constrained: bool,
    pub asynchronous: bool,
    pub advancing: bool,
    pub federation_lbts: f64,
    /// Requested time while advancing, current time otherwise
    pub release_time: f64,
}

/// Result of flushing the queue up to a time
#[derive(Debug, Clone, PartialEq)]
pub struct FlushResult {
    /// RO messages first, then TSO messages in increasing timestamp order
    pub messages: Vec<Message>,
    /// Time the federate is moved to; the queue sets `max_time`, since every
    /// remaining TSO message lies after it
    pub grant_time: f64,
}

/// Ordered holding area for one federate's incoming messages
///
/// # Example
///
/// ```rust
/// use hla_time_core::models::message::{Message, Payload};
/// use hla_time_core::models::queue::EventQueue;
///
/// let mut queue = EventQueue::new();
/// queue.set_constrained(true);
/// queue.offer(Message::timestamped(Some(1), 8.0, Payload::RemoveObject { object: 1 }));
/// queue.offer(Message::timestamped(Some(1), 3.0, Payload::RemoveObject { object: 2 }));
///
/// assert_eq!(queue.peek_next_tso_timestamp(), Some(3.0));
///
/// let flushed = queue.flush(5.0, false);
/// assert_eq!(flushed.messages.len(), 1);
/// assert_eq!(flushed.grant_time, 5.0);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventQueue {
    constrained: bool,
    ro: VecDeque<Message>,
    /// Sorted by (timestamp, grant-last); insertion is stable
    tso: Vec<Message>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_constrained(&self) -> bool {
        self.constrained
    }

    /// Start keeping TSO messages in timestamp order
    pub fn set_constrained(&mut self, constrained: bool) {
        if self.constrained && !constrained {
            self.became_unconstrained();
        }
        self.constrained = constrained;
    }

    /// Move every queued TSO message to the RO partition, dropping timestamps
    ///
    /// Called when the owning federate disables time constrained.
    pub fn became_unconstrained(&mut self) {
        self.constrained = false;
        for message in self.tso.drain(..) {
            self.ro.push_back(message.into_receive_order());
        }
    }

    /// Insert a message according to its delivery order
    pub fn offer(&mut self, message: Message) {
        if !self.constrained || !message.is_timestamped() {
            self.ro.push_back(message.into_receive_order());
            return;
        }

        let index = self
            .tso
            .partition_point(|queued| tso_order(queued, &message) != Ordering::Greater);
        self.tso.insert(index, message);
    }

    /// Smallest timestamp among queued TSO events (grants excluded)
    pub fn peek_next_tso_timestamp(&self) -> Option<f64> {
        self.tso
            .iter()
            .find(|message| !message.is_time_advance())
            .and_then(Message::timestamp)
    }

    /// Smallest queued TSO event timestamp strictly after `time`
    pub fn next_event_after(&self, time: f64) -> Option<f64> {
        self.tso
            .iter()
            .filter(|message| !message.is_time_advance())
            .filter_map(Message::timestamp)
            .find(|timestamp| *timestamp > time)
    }

    /// Release the next deliverable message, if any
    pub fn poll(&mut self, ctx: &ReleaseContext) -> Option<Message> {
        if !self.ro.is_empty() {
            if ctx.constrained && !ctx.asynchronous && !ctx.advancing {
                if let Some(index) = self.ro.iter().position(|m| !m.is_object_message()) {
                    return self.ro.remove(index);
                }
            } else {
                return self.ro.pop_front();
            }
        }

        let head = self.tso.first()?;
        let releasable = match head.timestamp() {
            _ if head.is_time_advance() => true,
            Some(timestamp) => {
                timestamp <= ctx.federation_lbts && timestamp <= ctx.release_time
            }
            None => true,
        };

        if releasable {
            Some(self.tso.remove(0))
        } else {
            None
        }
    }

    /// Remove every TSO message with timestamp `<= max_time`
    ///
    /// RO messages are drained first when `include_receive_order` is set. The
    /// queue stays usable; flushing again with the same `max_time` and no new
    /// messages returns nothing.
    pub fn flush(&mut self, max_time: f64, include_receive_order: bool) -> FlushResult {
        let mut messages = Vec::new();
        if include_receive_order {
            messages.extend(self.ro.drain(..));
        }

        let cut = self
            .tso
            .partition_point(|message| message.timestamp().map_or(true, |t| t <= max_time));
        messages.extend(self.tso.drain(..cut));

        FlushResult {
            messages,
            grant_time: max_time,
        }
    }

    pub fn len(&self) -> usize {
        self.ro.len() + self.tso.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ro.is_empty() && self.tso.is_empty()
    }

    pub fn ro_len(&self) -> usize {
        self.ro.len()
    }

    pub fn tso_len(&self) -> usize {
        self.tso.len()
    }

    /// Queued messages, RO partition first
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.ro.iter().chain(self.tso.iter())
    }
}

/// Timestamp order with grants after every other message at the same time
fn tso_order(a: &Message, b: &Message) -> Ordering {
    let time_a = a.timestamp().unwrap_or(f64::NEG_INFINITY);
    let time_b = b.timestamp().unwrap_or(f64::NEG_INFINITY);
    time_a
        .total_cmp(&time_b)
        .then_with(|| a.is_time_advance().cmp(&b.is_time_advance()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Payload;

    fn interaction(source: u32, time: f64) -> Message {
        Message::timestamped(
            Some(source),
            time,
            Payload::Interaction {
                class: 1,
                data: Vec::new(),
            },
        )
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let mut queue = EventQueue::new();
        queue.set_constrained(true);
        queue.offer(interaction(1, 4.0));
        queue.offer(interaction(2, 4.0));
        queue.offer(interaction(3, 2.0));

        let sources: Vec<_> = queue.iter().map(|m| m.source).collect();
        assert_eq!(sources, vec![Some(3), Some(1), Some(2)]);
    }

    #[test]
    fn test_grant_sorts_behind_same_timestamp() {
        let mut queue = EventQueue::new();
        queue.set_constrained(true);
        queue.offer(Message::time_advance_grant(4.0));
        queue.offer(interaction(1, 4.0));

        let kinds: Vec<_> = queue.iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["Interaction", "TimeAdvanceGrant"]);
        assert_eq!(queue.peek_next_tso_timestamp(), Some(4.0));
    }

    #[test]
    fn test_unconstrained_queue_stores_everything_ro() {
        let mut queue = EventQueue::new();
        queue.offer(interaction(1, 9.0));
        assert_eq!(queue.ro_len(), 1);
        assert_eq!(queue.tso_len(), 0);
        assert_eq!(queue.peek_next_tso_timestamp(), None);
    }

    #[test]
    fn test_next_event_after_skips_past_events() {
        let mut queue = EventQueue::new();
        queue.set_constrained(true);
        queue.offer(interaction(1, 2.0));
        queue.offer(interaction(1, 6.0));
        assert_eq!(queue.next_event_after(2.0), Some(6.0));
        assert_eq!(queue.next_event_after(6.0), None);
    }
}
