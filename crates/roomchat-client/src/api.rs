//! Room REST API: fetch one room, list rooms, create a room.
//!
//! Every request carries the session token in the `Authorization` header,
//! unprefixed.

use std::time::Duration;

use async_trait::async_trait;
use roomchat_core::{ChatError, Room, RoomId, SessionIdentity};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

/// The room operations the session layer needs from the backend.
#[async_trait]
pub trait RoomApi: Send + Sync {
    async fn get_room(&self, room_id: &RoomId) -> Result<Room, ChatError>;

    async fn list_rooms(&self) -> Result<Vec<Room>, ChatError>;

    /// Create a room owned by the session user.
    async fn create_room(&self, name: &str) -> Result<Room, ChatError>;
}

#[derive(Deserialize)]
struct RoomEnvelope {
    room: Room,
}

#[derive(Deserialize)]
struct RoomsEnvelope {
    #[serde(default)]
    rooms: Value,
}

/// `createRoom` answers with either the room or a one-element array of it.
#[derive(Deserialize)]
#[serde(untagged)]
enum CreatedRoom {
    One(Room),
    Many(Vec<Room>),
}

pub struct HttpRoomApi {
    client: reqwest::Client,
    base_url: String,
    identity: SessionIdentity,
}

impl HttpRoomApi {
    pub fn new(
        base_url: impl Into<String>,
        identity: SessionIdentity,
        timeout: Duration,
    ) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::Network(e.to_string()))?;
        Ok(Self::with_client(client, base_url, identity))
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        identity: SessionIdentity,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            identity,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/room/{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ChatError> {
        let response = request
            .header("Authorization", self.identity.authorization())
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), body = %body, "room api request failed");
        Err(ChatError::from_status(status.as_u16(), body))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> ChatError {
    if e.is_decode() {
        ChatError::InvalidPayload(e.to_string())
    } else {
        ChatError::Network(e.to_string())
    }
}

/// Keep the well-formed entries of a `rooms` value; anything but an array is empty.
fn rooms_from_value(value: Value) -> Vec<Room> {
    let Value::Array(items) = value else {
        if !value.is_null() {
            warn!("rooms payload is not an array, treating as empty");
        }
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<Room>(item) {
            Ok(room) => Some(room),
            Err(e) => {
                warn!(error = %e, "skipping malformed room entry");
                None
            }
        })
        .collect()
}

#[async_trait]
impl RoomApi for HttpRoomApi {
    #[instrument(skip_all, fields(room_id = %room_id))]
    async fn get_room(&self, room_id: &RoomId) -> Result<Room, ChatError> {
        let response = self
            .send(self.client.get(self.url(room_id.as_str())))
            .await?;
        let envelope: RoomEnvelope = response.json().await.map_err(map_reqwest_error)?;
        Ok(envelope.room)
    }

    #[instrument(skip(self))]
    async fn list_rooms(&self) -> Result<Vec<Room>, ChatError> {
        let response = self.send(self.client.get(self.url("getRooms"))).await?;
        let envelope: RoomsEnvelope = response.json().await.map_err(map_reqwest_error)?;
        let rooms = rooms_from_value(envelope.rooms);
        debug!(count = rooms.len(), "fetched rooms");
        Ok(rooms)
    }

    #[instrument(skip(self))]
    async fn create_room(&self, name: &str) -> Result<Room, ChatError> {
        let body = serde_json::json!({
            "name": name,
            "users": self.identity.user_id.as_str(),
        });
        let response = self
            .send(self.client.post(self.url("createRoom")).json(&body))
            .await?;
        let created: CreatedRoom = response.json().await.map_err(map_reqwest_error)?;
        match created {
            CreatedRoom::One(room) => Ok(room),
            CreatedRoom::Many(rooms) => rooms
                .into_iter()
                .next()
                .ok_or_else(|| ChatError::InvalidPayload("createRoom returned no room".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn identity() -> SessionIdentity {
        SessionIdentity::new("u1", "alice", SecretString::from("tok-123"))
    }

    fn api(server: &MockServer) -> HttpRoomApi {
        HttpRoomApi::new(server.uri(), identity(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn get_room_sends_raw_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/room/r1"))
            .and(header("Authorization", "tok-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "room": {"_id": "r1", "name": "general", "users": ["u1", "u2"]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let room = api(&server).get_room(&RoomId::from("r1")).await.unwrap();
        assert_eq!(room.name, "general");
        assert!(room.has_member(&"u2".into()));
    }

    #[tokio::test]
    async fn get_room_maps_status_codes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/room/gone"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such room"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/room/boom"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let api = api(&server);
        let err = api.get_room(&"gone".into()).await.unwrap_err();
        assert!(err.is_authorization_failure());
        let err = api.get_room(&"boom".into()).await.unwrap_err();
        assert_eq!(err.error_kind(), "server_error");
        assert!(!err.is_authorization_failure());
    }

    #[tokio::test]
    async fn get_room_rejects_garbage_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/room/r1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = api(&server).get_room(&"r1".into()).await.unwrap_err();
        assert_eq!(err.error_kind(), "invalid_payload");
    }

    #[tokio::test]
    async fn list_rooms_skips_bad_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/room/getRooms"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "rooms": [
                    {"_id": "r1", "name": "one", "users": []},
                    {"name": "no id"},
                    {"_id": "r2", "name": "two", "users": null}
                ]
            })))
            .mount(&server)
            .await;

        let rooms = api(&server).list_rooms().await.unwrap();
        let ids: Vec<_> = rooms.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
        assert!(rooms[1].users.is_empty());
    }

    #[tokio::test]
    async fn list_rooms_non_array_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/room/getRooms"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"rooms": "nope"})),
            )
            .mount(&server)
            .await;

        assert!(api(&server).list_rooms().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_room_posts_name_and_owner() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/room/createRoom"))
            .and(header("Authorization", "tok-123"))
            .and(body_json(serde_json::json!({"name": "lobby", "users": "u1"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!([
                {"_id": "r9", "name": "lobby", "users": ["u1"], "createdAt": "2024-01-01"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let room = api(&server).create_room("lobby").await.unwrap();
        assert_eq!(room.id.as_str(), "r9");
        assert_eq!(room.extra["createdAt"], "2024-01-01");
    }

    #[tokio::test]
    async fn create_room_accepts_object_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/room/createRoom"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!(
                {"_id": "r3", "name": "x", "users": ["u1"]}
            )))
            .mount(&server)
            .await;

        let room = api(&server).create_room("x").await.unwrap();
        assert_eq!(room.id.as_str(), "r3");
    }

    #[tokio::test]
    async fn create_room_empty_array_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/room/createRoom"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let err = api(&server).create_room("x").await.unwrap_err();
        assert_eq!(err.error_kind(), "invalid_payload");
    }

    #[tokio::test]
    async fn unreachable_backend_is_network_error() {
        let api = HttpRoomApi::new("http://127.0.0.1:1", identity(), Duration::from_secs(2)).unwrap();
        let err = api.list_rooms().await.unwrap_err();
        assert_eq!(err.error_kind(), "network_error");
    }
}
