use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ChatError;
use crate::ids::{MessageId, RoomId, UserId};
use crate::models::{Author, Message, OnlineUser, Room};

/// Events the client sends over the socket.
///
/// Wire form is one JSON text frame per event: `{"event": "<name>", "data": <payload>}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "joinRoom", rename_all = "camelCase")]
    JoinRoom {
        room_id: RoomId,
        user_id: UserId,
        username: String,
    },

    #[serde(rename = "leaveRoom", rename_all = "camelCase")]
    LeaveRoom { room_id: RoomId },

    #[serde(rename = "viewRoom", rename_all = "camelCase")]
    ViewRoom { room_id: RoomId },

    #[serde(rename = "sendMessage", rename_all = "camelCase")]
    SendMessage {
        room_id: RoomId,
        user_id: UserId,
        message: String,
        username: String,
    },

    #[serde(rename = "typing", rename_all = "camelCase")]
    Typing {
        room_id: RoomId,
        user_id: UserId,
        username: String,
    },

    #[serde(rename = "stopTyping", rename_all = "camelCase")]
    StopTyping {
        room_id: RoomId,
        user_id: UserId,
        username: String,
    },

    #[serde(rename = "createRoom")]
    CreateRoom(Room),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "joinRoom",
            Self::LeaveRoom { .. } => "leaveRoom",
            Self::ViewRoom { .. } => "viewRoom",
            Self::SendMessage { .. } => "sendMessage",
            Self::Typing { .. } => "typing",
            Self::StopTyping { .. } => "stopTyping",
            Self::CreateRoom(_) => "createRoom",
        }
    }

    pub fn room_id(&self) -> &RoomId {
        match self {
            Self::JoinRoom { room_id, .. }
            | Self::LeaveRoom { room_id }
            | Self::ViewRoom { room_id }
            | Self::SendMessage { room_id, .. }
            | Self::Typing { room_id, .. }
            | Self::StopTyping { room_id, .. } => room_id,
            Self::CreateRoom(room) => &room.id,
        }
    }

    pub fn to_frame(&self) -> Result<String, ChatError> {
        serde_json::to_string(self).map_err(|e| ChatError::InvalidPayload(e.to_string()))
    }

    pub fn from_frame(frame: &str) -> Result<Self, ChatError> {
        serde_json::from_str(frame).map_err(|e| ChatError::InvalidPayload(e.to_string()))
    }
}

/// Live message as broadcast by the server on `chatMessage`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub msg_id: MessageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub username: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl From<ChatMessage> for Message {
    fn from(live: ChatMessage) -> Self {
        Message {
            id: live.msg_id,
            room_id: live.room_id,
            author: Author {
                id: live.user_id,
                username: live.username,
            },
            text: live.message,
            timestamp: live.timestamp,
        }
    }
}

/// Payload of `userTyping` / `userStoppedTyping`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub user_id: UserId,
    pub username: String,
}

/// Events the server pushes to the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "chatMessage")]
    ChatMessage(ChatMessage),

    #[serde(rename = "roomHistory")]
    RoomHistory { messages: Vec<Message> },

    #[serde(rename = "roomUsers")]
    RoomUsers(Vec<OnlineUser>),

    #[serde(rename = "userTyping")]
    UserTyping(TypingNotice),

    #[serde(rename = "userStoppedTyping")]
    UserStoppedTyping(TypingNotice),

    #[serde(rename = "newRoomCreated")]
    NewRoomCreated(Room),
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ChatMessage(_) => EventKind::ChatMessage,
            Self::RoomHistory { .. } => EventKind::RoomHistory,
            Self::RoomUsers(_) => EventKind::RoomUsers,
            Self::UserTyping(_) => EventKind::UserTyping,
            Self::UserStoppedTyping(_) => EventKind::UserStoppedTyping,
            Self::NewRoomCreated(_) => EventKind::NewRoomCreated,
        }
    }

    pub fn to_frame(&self) -> Result<String, ChatError> {
        serde_json::to_string(self).map_err(|e| ChatError::InvalidPayload(e.to_string()))
    }

    pub fn from_frame(frame: &str) -> Result<Self, ChatError> {
        serde_json::from_str(frame).map_err(|e| ChatError::InvalidPayload(e.to_string()))
    }
}

/// Subscription key: one per inbound event name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChatMessage,
    RoomHistory,
    RoomUsers,
    UserTyping,
    UserStoppedTyping,
    NewRoomCreated,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        Self::ChatMessage,
        Self::RoomHistory,
        Self::RoomUsers,
        Self::UserTyping,
        Self::UserStoppedTyping,
        Self::NewRoomCreated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatMessage => "chatMessage",
            Self::RoomHistory => "roomHistory",
            Self::RoomUsers => "roomUsers",
            Self::UserTyping => "userTyping",
            Self::UserStoppedTyping => "userStoppedTyping",
            Self::NewRoomCreated => "newRoomCreated",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
