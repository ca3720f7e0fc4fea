//! Sent-message and reply buffers
//!
//! The sent buffer remembers every buffered request until its reply has
//! been processed or a fresh nymbox proves the notary never saw it. The
//! reply buffer is a FIFO shared by everyone waiting on a reply; a waiter
//! takes only the reply addressed to its own exchange.

use notary_core::{Message, NotaryId, NymId, RequestNumber};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};

type SentKey = (NotaryId, NymId, RequestNumber);

/// Outgoing messages by (notary, nym, request number)
#[derive(Debug, Default)]
pub struct SentMessages {
    messages: Mutex<BTreeMap<SentKey, Message>>,
}

impl SentMessages {
    /// Empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a sent request; a resend under the same number replaces it
    pub fn add(&self, message: Message) {
        let key = (message.notary_id, message.nym_id, message.request_number);
        if self.messages.lock().insert(key, message).is_some() {
            tracing::debug!(request_number = key.2, "Replaced buffered message");
        }
    }

    /// Copy of a sent request
    pub fn get(&self, request_number: RequestNumber, notary_id: &NotaryId, nym_id: &NymId) -> Option<Message> {
        self.messages
            .lock()
            .get(&(*notary_id, *nym_id, request_number))
            .cloned()
    }

    /// Whether a request is still awaiting its reply
    pub fn contains(&self, request_number: RequestNumber, notary_id: &NotaryId, nym_id: &NymId) -> bool {
        self.messages
            .lock()
            .contains_key(&(*notary_id, *nym_id, request_number))
    }

    /// Forget a sent request
    pub fn remove(&self, request_number: RequestNumber, notary_id: &NotaryId, nym_id: &NymId) -> Option<Message> {
        self.messages
            .lock()
            .remove(&(*notary_id, *nym_id, request_number))
    }

    /// Requests of one (notary, nym) pair in request-number order
    pub fn pending(&self, notary_id: &NotaryId, nym_id: &NymId) -> Vec<Message> {
        self.messages
            .lock()
            .range((*notary_id, *nym_id, RequestNumber::MIN)..=(*notary_id, *nym_id, RequestNumber::MAX))
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Number of buffered requests
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

/// Received replies in arrival order
#[derive(Debug, Default)]
pub struct ReceivedReplies {
    replies: Mutex<VecDeque<Message>>,
}

impl ReceivedReplies {
    /// Empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply
    pub fn push(&self, reply: Message) {
        self.replies.lock().push_back(reply);
    }

    /// Take the oldest reply to the given exchange, leaving all others queued
    pub fn pop(&self, request_number: RequestNumber, notary_id: &NotaryId, nym_id: &NymId) -> Option<Message> {
        let mut replies = self.replies.lock();
        let index = replies
            .iter()
            .position(|reply| reply.matches(request_number, notary_id, nym_id))?;
        replies.remove(index)
    }

    /// Drop every queued reply
    pub fn flush(&self) -> usize {
        let mut replies = self.replies.lock();
        let count = replies.len();
        replies.clear();
        count
    }

    /// Number of queued replies
    pub fn len(&self) -> usize {
        self.replies.lock().len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.replies.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notary_core::MessageType;

    fn message(notary: &NotaryId, nym: &NymId, request_number: RequestNumber) -> Message {
        Message::request(MessageType::GetNymbox, *notary, *nym, request_number)
    }

    #[test]
    fn test_sent_messages_by_pair() {
        let notary = NotaryId::digest(b"notary");
        let alice = NymId::digest(b"alice");
        let bob = NymId::digest(b"bob");
        let sent = SentMessages::new();

        sent.add(message(&notary, &alice, 3));
        sent.add(message(&notary, &alice, 1));
        sent.add(message(&notary, &bob, 2));

        let pending: Vec<_> = sent.pending(&notary, &alice).iter().map(|m| m.request_number).collect();
        assert_eq!(pending, vec![1, 3]);
        assert!(sent.get(2, &notary, &alice).is_none());
        assert!(sent.remove(2, &notary, &bob).is_some());
        assert_eq!(sent.len(), 2);
    }

    #[test]
    fn test_pop_leaves_other_replies() {
        let notary = NotaryId::digest(b"notary");
        let alice = NymId::digest(b"alice");
        let bob = NymId::digest(b"bob");
        let replies = ReceivedReplies::new();

        replies.push(message(&notary, &bob, 7));
        replies.push(message(&notary, &alice, 7));
        replies.push(message(&notary, &alice, 8));

        let popped = replies.pop(7, &notary, &alice).unwrap();
        assert_eq!(popped.nym_id, alice);
        assert_eq!(replies.len(), 2);
        assert!(replies.pop(9, &notary, &alice).is_none());
        assert_eq!(replies.len(), 2);

        // Bob's reply is still first in line
        assert_eq!(replies.pop(7, &notary, &bob).unwrap().nym_id, bob);
        assert_eq!(replies.flush(), 1);
        assert!(replies.is_empty());
    }
}
