//! Ordered queues of outgoing messages.
//!
//! The scheduler keeps two of these: the outbox of messages with frames
//! left to send, and the icebox of messages paused while they wait for an
//! acknowledgement. Insertion implements the urgency interleave: an urgent
//! message queues after the last urgent message already present, leaving
//! one regular message between them when possible, so urgent traffic can
//! overtake without starving the rest.

use std::collections::VecDeque;

use crate::{outbound::MessageOut, protocol::MessageNo};

#[derive(Debug, Default)]
pub(crate) struct MessageQueue {
    messages: VecDeque<MessageOut>,
}

impl MessageQueue {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity),
        }
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize { self.messages.len() }

    /// Take the message at the head of the queue.
    pub(crate) fn pop(&mut self) -> Option<MessageOut> { self.messages.pop_front() }

    /// The message next in line, if any.
    #[must_use]
    pub(crate) fn front(&self) -> Option<&MessageOut> { self.messages.front() }

    /// Append without regard to urgency. Used for the icebox, where order
    /// only preserves arrival.
    pub(crate) fn push_back(&mut self, message: MessageOut) { self.messages.push_back(message); }

    /// Insert `message` according to the urgency interleave.
    ///
    /// Regular messages append at the back. An urgent message scans from
    /// the back for the last urgent message already queued and lands just
    /// past the one regular message that follows it, if there is one.
    /// Exception: while neither the new message nor the queued one it is
    /// compared against has sent any bytes, chronological order wins, so
    /// the first frames of messages are never reordered.
    pub(crate) fn insert(&mut self, message: MessageOut) {
        let mut i = self.messages.len();
        if message.is_urgent() && !self.messages.is_empty() {
            loop {
                i -= 1;
                let queued = &self.messages[i];
                if queued.is_urgent() {
                    if i + 1 != self.messages.len() {
                        i += 1;
                    }
                    break;
                }
                if message.bytes_sent() == 0 && queued.bytes_sent() == 0 {
                    break;
                }
                if i == 0 {
                    break;
                }
            }
            i += 1;
        }
        self.messages.insert(i, message);
    }

    /// Find the message with `number` in the given direction. Replies and
    /// requests are numbered independently, so both keys are needed.
    pub(crate) fn find_mut(
        &mut self,
        number: MessageNo,
        is_reply: bool,
    ) -> Option<&mut MessageOut> {
        self.messages
            .iter_mut()
            .find(|m| m.number() == number && m.is_reply() == is_reply)
    }

    /// Remove and return the message with `number` in the given direction.
    pub(crate) fn remove(&mut self, number: MessageNo, is_reply: bool) -> Option<MessageOut> {
        let index = self
            .messages
            .iter()
            .position(|m| m.number() == number && m.is_reply() == is_reply)?;
        self.messages.remove(index)
    }

    /// Drop every queued message.
    pub(crate) fn clear(&mut self) { self.messages.clear(); }
}
