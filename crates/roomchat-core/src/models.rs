use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::ids::{MessageId, RoomId, UserId};

/// A chat room as the backend stores it.
///
/// Fields the client does not model are kept in `extra` so a room received
/// from the REST API can be re-broadcast unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Room {
    #[serde(rename = "_id")]
    pub id: RoomId,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub users: Vec<UserId>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Room {
    pub fn new(id: impl Into<String>, name: impl Into<String>, users: Vec<UserId>) -> Self {
        Self {
            id: RoomId::from_raw(id),
            name: name.into(),
            users,
            extra: serde_json::Map::new(),
        }
    }

    pub fn has_member(&self, user_id: &UserId) -> bool {
        self.users.iter().any(|u| u == user_id)
    }

    /// Add a member unless already present. Returns whether the list changed.
    pub fn add_member(&mut self, user_id: UserId) -> bool {
        if self.has_member(&user_id) {
            return false;
        }
        self.users.push(user_id);
        true
    }

    /// Name for display; the backend allows empty names.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "Unnamed Room"
        } else {
            &self.name
        }
    }
}

/// Message author as embedded in history records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub username: String,
}

/// One chat message. Immutable once created; identity is `id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: MessageId,
    #[serde(rename = "room")]
    pub room_id: RoomId,
    #[serde(rename = "user")]
    pub author: Author,
    #[serde(rename = "message")]
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn is_from(&self, user_id: &UserId) -> bool {
        &self.author.id == user_id
    }
}

/// An entry of a room's online roster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub user_id: UserId,
    pub username: String,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
