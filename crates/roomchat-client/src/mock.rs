use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use roomchat_core::{ChatError, Room, RoomId, UserId};

use crate::api::RoomApi;

/// In-memory room backend for deterministic tests without HTTP.
///
/// Rooms live in a shared list; `create_room` appends to it with the
/// configured owner as the only member. Failures and latency can be
/// injected per operation.
pub struct MockRoomApi {
    owner: UserId,
    rooms: Mutex<Vec<Room>>,
    fail_get: Mutex<Option<ChatError>>,
    fail_list: Mutex<Option<ChatError>>,
    fail_create: Mutex<Option<ChatError>>,
    delay: Mutex<Duration>,
    get_calls: AtomicUsize,
    list_calls: AtomicUsize,
    create_calls: AtomicUsize,
}

impl MockRoomApi {
    pub fn new(owner: impl Into<String>, rooms: Vec<Room>) -> Self {
        Self {
            owner: UserId::from_raw(owner),
            rooms: Mutex::new(rooms),
            fail_get: Mutex::new(None),
            fail_list: Mutex::new(None),
            fail_create: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            get_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
        }
    }

    /// Every call sleeps this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn fail_get(&self, error: Option<ChatError>) {
        *self.fail_get.lock() = error;
    }

    pub fn fail_list(&self, error: Option<ChatError>) {
        *self.fail_list.lock() = error;
    }

    pub fn fail_create(&self, error: Option<ChatError>) {
        *self.fail_create.lock() = error;
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.rooms.lock().clone()
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::Relaxed)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::Relaxed)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::Relaxed)
    }

    async fn latency(&self) {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl RoomApi for MockRoomApi {
    async fn get_room(&self, room_id: &RoomId) -> Result<Room, ChatError> {
        let _ = self.get_calls.fetch_add(1, Ordering::Relaxed);
        self.latency().await;
        if let Some(e) = self.fail_get.lock().clone() {
            return Err(e);
        }
        self.rooms
            .lock()
            .iter()
            .find(|r| &r.id == room_id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(format!("room {room_id}")))
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, ChatError> {
        let _ = self.list_calls.fetch_add(1, Ordering::Relaxed);
        self.latency().await;
        if let Some(e) = self.fail_list.lock().clone() {
            return Err(e);
        }
        Ok(self.rooms.lock().clone())
    }

    async fn create_room(&self, name: &str) -> Result<Room, ChatError> {
        let n = self.create_calls.fetch_add(1, Ordering::Relaxed) + 1;
        self.latency().await;
        if let Some(e) = self.fail_create.lock().clone() {
            return Err(e);
        }
        let room = Room::new(format!("created-{n}"), name, vec![self.owner.clone()]);
        self.rooms.lock().push(room.clone());
        Ok(room)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api() -> MockRoomApi {
        MockRoomApi::new("u1", vec![Room::new("r1", "general", vec!["u1".into()])])
    }

    #[tokio::test]
    async fn serves_known_rooms() {
        let api = api();
        assert_eq!(api.get_room(&"r1".into()).await.unwrap().name, "general");
        assert!(api.get_room(&"nope".into()).await.unwrap_err().is_authorization_failure());
        assert_eq!(api.get_calls(), 2);
    }

    #[tokio::test]
    async fn created_rooms_are_listed() {
        let api = api();
        let room = api.create_room("lobby").await.unwrap();
        assert_eq!(room.users, vec![UserId::from("u1")]);
        let rooms = api.list_rooms().await.unwrap();
        assert_eq!(rooms.len(), 2);
        assert_eq!(rooms[1].id, room.id);
    }

    #[tokio::test]
    async fn injected_failures() {
        let api = api();
        api.fail_list(Some(ChatError::Network("down".into())));
        assert_eq!(api.list_rooms().await.unwrap_err().error_kind(), "network_error");
        api.fail_list(None);
        assert!(api.list_rooms().await.is_ok());
        assert_eq!(api.list_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_applies() {
        let api = api();
        api.set_delay(Duration::from_millis(200));
        let start = tokio::time::Instant::now();
        api.list_rooms().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
