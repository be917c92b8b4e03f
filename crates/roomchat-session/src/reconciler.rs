//! Merges the one-shot history snapshot with live messages into a single
//! ordered sequence in which every message id appears once.

use std::collections::HashSet;

use roomchat_core::{Message, MessageId};

#[derive(Clone, Debug, Default)]
pub struct MessageTimeline {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
    /// Live messages accepted since the last snapshot, in arrival order.
    live_since_snapshot: Vec<MessageId>,
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the sequence with a server snapshot.
    ///
    /// Live messages received since the previous snapshot that the new one
    /// lacks are kept after it, in arrival order. Repeated ids inside the
    /// snapshot keep their first occurrence.
    pub fn apply_history_snapshot(&mut self, snapshot: Vec<Message>) {
        let mut previous: Vec<Option<Message>> =
            std::mem::take(&mut self.messages).into_iter().map(Some).collect();
        let live = std::mem::take(&mut self.live_since_snapshot);
        self.ids.clear();

        for message in snapshot {
            if self.ids.insert(message.id.clone()) {
                self.messages.push(message);
            }
        }

        for id in live {
            if self.ids.contains(&id) {
                continue;
            }
            let found = previous
                .iter_mut()
                .find(|slot| slot.as_ref().is_some_and(|m| m.id == id))
                .and_then(Option::take);
            if let Some(message) = found {
                let _ = self.ids.insert(id);
                self.messages.push(message);
            }
        }
    }

    /// Append a live message unless its id is already present.
    /// Returns whether it was appended.
    pub fn apply_incoming(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        self.live_since_snapshot.push(message.id.clone());
        self.messages.push(message);
        true
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
        self.live_since_snapshot.clear();
    }
}
