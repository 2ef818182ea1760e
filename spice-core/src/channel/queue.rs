//! Outgoing message queue.
//!
//! Engine control replies travel in their own lane ahead of
//! application messages and ignore the ack window; application
//! messages leave strictly in enqueue order and only while the window
//! has room.

use std::collections::VecDeque;

use crate::message::OutMessage;

use super::ack::AckWindow;

#[derive(Debug, Default)]
pub struct OutgoingQueue {
    control: VecDeque<OutMessage>,
    app: VecDeque<OutMessage>,
}

impl OutgoingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: OutMessage) {
        if msg.is_control() {
            self.control.push_back(msg);
        } else {
            self.app.push_back(msg);
        }
    }

    /// Queue on the control lane whatever the message type.
    pub fn push_control(&mut self, msg: OutMessage) {
        self.control.push_back(msg);
    }

    pub fn extend(&mut self, msgs: impl IntoIterator<Item = OutMessage>) {
        for m in msgs {
            self.push(m);
        }
    }

    /// Whether [`pop_sendable`](Self::pop_sendable) would yield a message.
    pub fn has_sendable(&self, ack: &AckWindow) -> bool {
        !self.control.is_empty() || (!self.app.is_empty() && ack.can_send())
    }

    /// Next message allowed on the wire, charging the window for
    /// application messages.
    pub fn pop_sendable(&mut self, ack: &mut AckWindow) -> Option<OutMessage> {
        if let Some(m) = self.control.pop_front() {
            return Some(m);
        }
        if self.app.is_empty() || !ack.on_send() {
            return None;
        }
        self.app.pop_front()
    }

    /// Take everything regardless of the window, control lane first.
    pub fn drain_all(&mut self) -> Vec<OutMessage> {
        self.control.drain(..).chain(self.app.drain(..)).collect()
    }

    /// Take only the control lane; held application messages stay.
    pub fn drain_control(&mut self) -> Vec<OutMessage> {
        self.control.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.control.len() + self.app.len()
    }

    pub fn is_empty(&self) -> bool {
        self.control.is_empty() && self.app.is_empty()
    }

    /// Application messages held back by the window.
    pub fn pending_app(&self) -> usize {
        self.app.len()
    }

    pub fn clear(&mut self) {
        self.control.clear();
        self.app.clear();
    }
}
