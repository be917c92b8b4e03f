//! Room session lifecycle: membership gate, join, live room state, leave.
//!
//! ```text
//! Unchecked -> Authorizing -> Authorized -> Joined -> Left
//!                  |                           |
//!                  v                           v (connection lost)
//!             Unauthorized                 Unchecked
//! ```
//!
//! A supervising task waits for the shared connection, checks membership
//! through the room API, then opens the room-scoped subscriptions and
//! announces the join. When the connection drops or reconnects the room
//! scope is released and the whole sequence runs again on the new link.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use roomchat_client::{Connection, RoomApi, Subscription};
use roomchat_core::{
    ChatError, ClientEvent, EventKind, Message, OnlineUser, Room, RoomId, ServerEvent,
    SessionIdentity,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::debounce::DebounceTimer;
use crate::presence::{PresenceTracker, TypingEmitter};
use crate::reconciler::MessageTimeline;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Unchecked,
    Authorizing,
    Authorized,
    Joined,
    Left,
    Unauthorized,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Left | Self::Unauthorized)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// Membership check failed; the caller should navigate away.
    Unauthorized,
    Stopped,
}

/// Read-only snapshot of a room session for rendering.
#[derive(Clone, Debug, PartialEq)]
pub struct RoomView {
    pub phase: SessionPhase,
    pub room: Option<Room>,
    pub messages: Vec<Message>,
    pub online_users: Vec<OnlineUser>,
    pub typing_users: Vec<String>,
    pub typing_summary: Option<String>,
}

impl RoomView {
    fn initial() -> Self {
        Self {
            phase: SessionPhase::Unchecked,
            room: None,
            messages: Vec::new(),
            online_users: Vec::new(),
            typing_users: Vec::new(),
            typing_summary: None,
        }
    }

    pub fn is_loading(&self) -> bool {
        !matches!(self.phase, SessionPhase::Joined)
    }
}

struct SessionState {
    phase: SessionPhase,
    room: Option<Room>,
    timeline: MessageTimeline,
    presence: PresenceTracker,
}

struct Inner {
    room_id: RoomId,
    identity: Arc<SessionIdentity>,
    connection: Connection,
    api: Arc<dyn RoomApi>,
    state: Mutex<SessionState>,
    view: watch::Sender<RoomView>,
    typing: TypingEmitter,
    subscriptions: Mutex<Vec<Subscription>>,
    exit: Mutex<Option<ExitReason>>,
    shutdown: CancellationToken,
    torn_down: AtomicBool,
}

impl Inner {
    fn publish(&self, state: &SessionState) {
        let presence = &state.presence;
        let view = RoomView {
            phase: state.phase,
            room: state.room.clone(),
            messages: state.timeline.messages().to_vec(),
            online_users: presence.online_users(),
            typing_users: presence.typing_users().to_vec(),
            typing_summary: presence.typing_summary(),
        };
        self.view.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });
    }

    fn update(&self, f: impl FnOnce(&mut SessionState)) {
        let mut state = self.state.lock();
        f(&mut state);
        self.publish(&state);
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.update(|s| s.phase = phase);
        debug!(room_id = %self.room_id, phase = ?phase, "session phase");
    }

    fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    fn on_event(&self, event: &ServerEvent) {
        match event {
            ServerEvent::ChatMessage(live) => {
                if live.room_id != self.room_id {
                    return;
                }
                let message = Message::from(live.clone());
                self.update(|s| {
                    if !s.timeline.apply_incoming(message) {
                        debug!(room_id = %self.room_id, msg_id = %live.msg_id, "duplicate message ignored");
                    }
                });
            }
            ServerEvent::RoomHistory { messages } => {
                let count = messages.len();
                self.update(|s| s.timeline.apply_history_snapshot(messages.clone()));
                debug!(room_id = %self.room_id, count = count, "history applied");
            }
            ServerEvent::RoomUsers(users) => {
                self.update(|s| s.presence.apply_roster(users.clone()));
            }
            ServerEvent::UserTyping(notice) => {
                self.update(|s| {
                    let _ = s.presence.user_typing(notice);
                });
            }
            ServerEvent::UserStoppedTyping(notice) => {
                self.update(|s| {
                    let _ = s.presence.user_stopped_typing(notice);
                });
            }
            ServerEvent::NewRoomCreated(_) => {}
        }
    }

    fn open_room_scope(self: &Arc<Self>) {
        const ROOM_EVENTS: [EventKind; 5] = [
            EventKind::ChatMessage,
            EventKind::RoomHistory,
            EventKind::RoomUsers,
            EventKind::UserTyping,
            EventKind::UserStoppedTyping,
        ];
        let mut subs = self.subscriptions.lock();
        for kind in ROOM_EVENTS {
            let weak: Weak<Inner> = Arc::downgrade(self);
            subs.push(self.connection.subscribe(kind, move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_event(event);
                }
            }));
        }
    }

    /// Drop everything tied to the current join. Returns to `Unchecked`.
    fn release_room_scope(&self) {
        self.subscriptions.lock().clear();
        let _ = self.typing.cancel();
        self.update(|s| {
            s.presence.reset();
            s.phase = SessionPhase::Unchecked;
        });
    }

    fn join(&self, room: Room) {
        self.update(|s| {
            s.room = Some(room);
            s.phase = SessionPhase::Authorized;
        });
        let _ = self.connection.emit(ClientEvent::JoinRoom {
            room_id: self.room_id.clone(),
            user_id: self.identity.user_id.clone(),
            username: self.identity.username.clone(),
        });
        let _ = self.connection.emit(ClientEvent::ViewRoom {
            room_id: self.room_id.clone(),
        });
        self.update(|s| {
            s.presence.set_joined(true);
            s.phase = SessionPhase::Joined;
        });
        info!(room_id = %self.room_id, user_id = %self.identity.user_id, "joined room");
    }

    /// Runs once, on whichever exit path gets here first.
    fn teardown(&self, reason: ExitReason) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let reason = *self.exit.lock().get_or_insert(reason);

        let _ = self.typing.flush();
        self.subscriptions.lock().clear();
        let _ = self.connection.emit(ClientEvent::LeaveRoom {
            room_id: self.room_id.clone(),
        });
        self.update(|s| {
            s.presence.reset();
            s.phase = match reason {
                ExitReason::Unauthorized => SessionPhase::Unauthorized,
                ExitReason::Stopped => SessionPhase::Left,
            };
        });
        info!(room_id = %self.room_id, reason = ?reason, "left room");
    }

    fn reject(&self, error: Option<&ChatError>) {
        match error {
            Some(e) => warn!(
                room_id = %self.room_id,
                error_kind = e.error_kind(),
                error = %e,
                "membership check failed"
            ),
            None => warn!(
                room_id = %self.room_id,
                user_id = %self.identity.user_id,
                "not a member of room"
            ),
        }
        let _ = self.exit.lock().get_or_insert(ExitReason::Unauthorized);
        self.set_phase(SessionPhase::Unauthorized);
    }
}

async fn run(inner: Arc<Inner>) {
    let mut status_rx = inner.connection.watch_status();

    let reason = loop {
        let status = tokio::select! {
            _ = inner.shutdown.cancelled() => break ExitReason::Stopped,
            status = status_rx.wait_for(|s| s.is_connected()) => match status {
                Ok(status) => *status,
                Err(_) => break ExitReason::Stopped,
            },
        };
        let epoch = status.epoch;

        inner.set_phase(SessionPhase::Authorizing);
        let checked = tokio::select! {
            _ = inner.shutdown.cancelled() => break ExitReason::Stopped,
            checked = inner.api.get_room(&inner.room_id) => checked,
        };
        let room = match checked {
            Ok(room) if room.has_member(&inner.identity.user_id) => room,
            Ok(_) => {
                inner.reject(None);
                break ExitReason::Unauthorized;
            }
            Err(e) => {
                inner.reject(Some(&e));
                break ExitReason::Unauthorized;
            }
        };

        if inner.connection.status().epoch != epoch || !inner.connection.is_connected() {
            debug!(room_id = %inner.room_id, "connection changed during membership check, retrying");
            inner.set_phase(SessionPhase::Unchecked);
            continue;
        }
        inner.open_room_scope();
        inner.join(room);

        tokio::select! {
            _ = inner.shutdown.cancelled() => break ExitReason::Stopped,
            _ = status_rx.wait_for(|s| !s.is_connected() || s.epoch != epoch) => {}
        }
        warn!(room_id = %inner.room_id, epoch = epoch, "connection lost while joined, will rejoin");
        inner.release_room_scope();
    };

    inner.teardown(reason);
}

/// Drives one room session on a shared connection.
///
/// Call [`start`](Self::start) once, then [`stop`](Self::stop) when leaving.
/// Dropping the controller without stopping it still tears the session down
/// in the background.
pub struct RoomSessionController {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl RoomSessionController {
    pub fn new(
        room_id: RoomId,
        identity: Arc<SessionIdentity>,
        connection: Connection,
        api: Arc<dyn RoomApi>,
        typing_debounce: Duration,
    ) -> Self {
        let typing = TypingEmitter::new(
            connection.clone(),
            room_id.clone(),
            Arc::clone(&identity),
            DebounceTimer::new(typing_debounce),
        );
        let (view, _) = watch::channel(RoomView::initial());
        let inner = Arc::new(Inner {
            state: Mutex::new(SessionState {
                phase: SessionPhase::Unchecked,
                room: None,
                timeline: MessageTimeline::new(),
                presence: PresenceTracker::new(&identity),
            }),
            room_id,
            identity,
            connection,
            api,
            view,
            typing,
            subscriptions: Mutex::new(Vec::new()),
            exit: Mutex::new(None),
            shutdown: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
        });
        Self {
            inner,
            task: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the supervising task. Later calls are ignored.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(room_id = %self.inner.room_id, "starting room session");
        let handle = tokio::spawn(run(Arc::clone(&self.inner)));
        *self.task.lock() = Some(handle);
    }

    /// Leave the room and wait for the supervising task to finish.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(room_id = %self.inner.room_id, error = %e, "room session task failed");
            }
        }
        self.inner.teardown(ExitReason::Stopped);
    }

    /// Send a chat message. Whitespace-only text is ignored.
    /// Returns whether the message was handed to the connection.
    pub fn send_message(&self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() || self.inner.phase() != SessionPhase::Joined {
            return false;
        }
        let sent = self.inner.connection.emit(ClientEvent::SendMessage {
            room_id: self.inner.room_id.clone(),
            user_id: self.inner.identity.user_id.clone(),
            message: text.to_string(),
            username: self.inner.identity.username.clone(),
        });
        self.inner.typing.stop_now();
        sent
    }

    /// Call on every edit of the message input.
    pub fn input_changed(&self) {
        if self.inner.phase() == SessionPhase::Joined {
            self.inner.typing.input_changed();
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.inner.room_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.phase()
    }

    pub fn view(&self) -> RoomView {
        self.inner.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<RoomView> {
        self.inner.view.subscribe()
    }

    /// Set once the session has ended.
    pub fn exit_reason(&self) -> Option<ExitReason> {
        *self.inner.exit.lock()
    }

    /// Wait until the session reaches a terminal phase.
    pub async fn closed(&self) -> ExitReason {
        let mut rx = self.watch();
        let _ = rx.wait_for(|v| v.phase.is_terminal()).await;
        self.exit_reason().unwrap_or(ExitReason::Stopped)
    }
}

impl Drop for RoomSessionController {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        if !self.started.load(Ordering::Acquire) {
            self.inner.teardown(ExitReason::Stopped);
        }
    }
}
