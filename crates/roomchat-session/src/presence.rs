//! Who is online in the room and who is typing, plus the local side that
//! announces our own typing with a trailing `stopTyping`.

use std::sync::Arc;

use roomchat_client::Connection;
use roomchat_core::events::TypingNotice;
use roomchat_core::{ClientEvent, OnlineUser, RoomId, SessionIdentity};
use tracing::trace;

use crate::debounce::DebounceTimer;

/// Online roster and typing set for one room session.
#[derive(Clone, Debug)]
pub struct PresenceTracker {
    me: OnlineUser,
    joined: bool,
    roster: Vec<OnlineUser>,
    typing: Vec<String>,
}

impl PresenceTracker {
    pub fn new(identity: &SessionIdentity) -> Self {
        Self {
            me: OnlineUser {
                user_id: identity.user_id.clone(),
                username: identity.username.clone(),
            },
            joined: false,
            roster: Vec::new(),
            typing: Vec::new(),
        }
    }

    /// While joined, the local user is always reported online.
    pub fn set_joined(&mut self, joined: bool) {
        self.joined = joined;
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    /// Replace the roster wholesale.
    pub fn apply_roster(&mut self, users: Vec<OnlineUser>) {
        self.roster = users;
    }

    /// Returns whether the typing set changed.
    pub fn user_typing(&mut self, notice: &TypingNotice) -> bool {
        if self.typing.iter().any(|u| u == &notice.username) {
            return false;
        }
        self.typing.push(notice.username.clone());
        true
    }

    /// Returns whether the typing set changed.
    pub fn user_stopped_typing(&mut self, notice: &TypingNotice) -> bool {
        let before = self.typing.len();
        self.typing.retain(|u| u != &notice.username);
        self.typing.len() != before
    }

    pub fn online_users(&self) -> Vec<OnlineUser> {
        let mut users = self.roster.clone();
        if self.joined && !users.iter().any(|u| u.user_id == self.me.user_id) {
            users.push(self.me.clone());
        }
        users
    }

    pub fn typing_users(&self) -> &[String] {
        &self.typing
    }

    /// `"alice is typing..."`, `"alice, bob are typing..."`, or `None`.
    pub fn typing_summary(&self) -> Option<String> {
        match self.typing.len() {
            0 => None,
            1 => Some(format!("{} is typing...", self.typing[0])),
            _ => Some(format!("{} are typing...", self.typing.join(", "))),
        }
    }

    /// Forget everything received from the server.
    pub fn reset(&mut self) {
        self.joined = false;
        self.roster.clear();
        self.typing.clear();
    }
}

/// Emits `typing` on every input change and a single trailing `stopTyping`
/// once input has been quiet for the debounce delay.
pub struct TypingEmitter {
    connection: Connection,
    room_id: RoomId,
    identity: Arc<SessionIdentity>,
    timer: DebounceTimer,
}

impl TypingEmitter {
    pub fn new(
        connection: Connection,
        room_id: RoomId,
        identity: Arc<SessionIdentity>,
        timer: DebounceTimer,
    ) -> Self {
        Self {
            connection,
            room_id,
            identity,
            timer,
        }
    }

    fn stop_event(room_id: &RoomId, identity: &SessionIdentity) -> ClientEvent {
        ClientEvent::StopTyping {
            room_id: room_id.clone(),
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
        }
    }

    pub fn input_changed(&self) {
        let _ = self.connection.emit(ClientEvent::Typing {
            room_id: self.room_id.clone(),
            user_id: self.identity.user_id.clone(),
            username: self.identity.username.clone(),
        });

        let connection = self.connection.clone();
        let stop = Self::stop_event(&self.room_id, &self.identity);
        self.timer.arm(move || {
            trace!(room_id = %stop.room_id(), "typing went quiet");
            let _ = connection.emit(stop);
        });
    }

    /// Emit `stopTyping` now and drop the pending one.
    pub fn stop_now(&self) {
        let _ = self.timer.cancel();
        let _ = self
            .connection
            .emit(Self::stop_event(&self.room_id, &self.identity));
    }

    /// Drop the pending `stopTyping` without sending it.
    pub fn cancel(&self) -> bool {
        self.timer.cancel()
    }

    /// Send the pending `stopTyping` right away, if there is one.
    pub fn flush(&self) -> bool {
        self.timer.flush()
    }

    pub fn is_pending(&self) -> bool {
        self.timer.is_pending()
    }
}
