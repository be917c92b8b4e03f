//! The list of rooms: one REST fetch per activation plus live
//! `newRoomCreated` broadcasts, with optimistic membership on join.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use roomchat_client::{Connection, RoomApi, Subscription};
use roomchat_core::{ChatError, ClientEvent, EventKind, Room, RoomId, ServerEvent, SessionIdentity};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const FETCH_FAILED: &str = "Failed to fetch rooms";
pub const EMPTY_NAME: &str = "Room name cannot be empty";
pub const CREATE_FAILED: &str = "Failed to create room";

#[derive(Clone, Debug, PartialEq)]
pub struct RosterState {
    pub rooms: Vec<Room>,
    pub loading: bool,
    pub error: Option<String>,
    pub is_creating: bool,
}

impl Default for RosterState {
    fn default() -> Self {
        Self {
            rooms: Vec::new(),
            loading: true,
            error: None,
            is_creating: false,
        }
    }
}

fn append_absent(rooms: &mut Vec<Room>, room: Room) -> bool {
    if rooms.iter().any(|r| r.id == room.id) {
        return false;
    }
    rooms.push(room);
    true
}

struct RosterInner {
    identity: Arc<SessionIdentity>,
    connection: Connection,
    api: Arc<dyn RoomApi>,
    state: watch::Sender<RosterState>,
    /// Bumped on every fetch and on deactivate; a fetch applies only if unchanged.
    /// Written and compared only while holding the `state` lock.
    generation: AtomicU64,
    subscription: Mutex<Option<Subscription>>,
    /// Broadcast rooms seen while a fetch is in flight. Locked inside `state`.
    early: Mutex<Vec<Room>>,
}

impl RosterInner {
    fn on_room_created(&self, room: &Room) {
        let mut appended = false;
        self.state.send_if_modified(|s| {
            if s.loading {
                let _ = append_absent(&mut self.early.lock(), room.clone());
            }
            appended = append_absent(&mut s.rooms, room.clone());
            appended
        });
        debug!(room_id = %room.id, appended = appended, "room broadcast");
    }

    async fn fetch(self: Arc<Self>, generation: u64) {
        let result = self.api.list_rooms().await;

        // Same lock as `on_room_created`: a broadcast lands wholly before or after this.
        let mut outcome = None;
        let _ = self.state.send_if_modified(|s| {
            if self.generation.load(Ordering::Acquire) != generation {
                return false;
            }
            let early = std::mem::take(&mut *self.early.lock());
            match &result {
                Ok(fetched) => {
                    let mut rooms = fetched.clone();
                    for room in early {
                        let _ = append_absent(&mut rooms, room);
                    }
                    s.rooms = rooms;
                }
                Err(_) => {
                    s.rooms.clear();
                    s.error = Some(FETCH_FAILED.to_string());
                }
            }
            s.loading = false;
            outcome = Some(s.rooms.len());
            true
        });

        match (outcome, result) {
            (None, _) => debug!("discarding stale room fetch"),
            (Some(count), Ok(_)) => info!(count = count, "rooms loaded"),
            (Some(_), Err(e)) => {
                warn!(error_kind = e.error_kind(), error = %e, "room fetch failed");
            }
        }
    }

    fn start_fetch(self: &Arc<Self>) -> JoinHandle<()> {
        let mut generation = 0;
        self.state.send_modify(|s| {
            generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            self.early.lock().clear();
            s.loading = true;
        });
        tokio::spawn(Arc::clone(self).fetch(generation))
    }

    fn invalidate(&self) {
        let _ = self.state.send_if_modified(|_| {
            let _ = self.generation.fetch_add(1, Ordering::AcqRel);
            self.early.lock().clear();
            false
        });
    }
}

/// Room list synchronizer for the rooms screen.
pub struct RoomRoster {
    inner: Arc<RosterInner>,
}

impl RoomRoster {
    pub fn new(identity: Arc<SessionIdentity>, connection: Connection, api: Arc<dyn RoomApi>) -> Self {
        let (state, _) = watch::channel(RosterState::default());
        Self {
            inner: Arc::new(RosterInner {
                identity,
                connection,
                api,
                state,
                generation: AtomicU64::new(0),
                subscription: Mutex::new(None),
                early: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Subscribe to room broadcasts and start the initial fetch.
    ///
    /// The returned handle completes when the fetch has been applied or discarded.
    pub fn activate(&self) -> JoinHandle<()> {
        let mut slot = self.inner.subscription.lock();
        if slot.is_none() {
            let weak: Weak<RosterInner> = Arc::downgrade(&self.inner);
            *slot = Some(self.inner.connection.subscribe(EventKind::NewRoomCreated, move |event| {
                if let (Some(inner), ServerEvent::NewRoomCreated(room)) = (weak.upgrade(), event) {
                    inner.on_room_created(room);
                }
            }));
        }
        drop(slot);
        self.inner.start_fetch()
    }

    /// Re-run the full fetch. Its result replaces the list.
    pub fn refresh(&self) -> JoinHandle<()> {
        self.inner.start_fetch()
    }

    /// Stop listening for broadcasts; any fetch still in flight is discarded.
    pub fn deactivate(&self) {
        self.inner.invalidate();
        let _ = self.inner.subscription.lock().take();
    }

    /// Persist a room, then announce it with `createRoom`.
    ///
    /// The room is not added locally; it arrives through the broadcast.
    pub async fn create_room(&self, name: &str) -> Result<Room, ChatError> {
        let name = name.trim();
        if name.is_empty() {
            self.inner
                .state
                .send_modify(|s| s.error = Some(EMPTY_NAME.to_string()));
            return Err(ChatError::InvalidInput(EMPTY_NAME.to_string()));
        }

        self.inner.state.send_modify(|s| s.is_creating = true);
        let result = self.inner.api.create_room(name).await;
        match &result {
            Ok(room) => {
                let _ = self.inner.connection.emit(ClientEvent::CreateRoom(room.clone()));
                info!(room_id = %room.id, "room created");
                self.inner.state.send_modify(|s| {
                    s.error = None;
                    s.is_creating = false;
                });
            }
            Err(e) => {
                warn!(error_kind = e.error_kind(), error = %e, "room creation failed");
                self.inner.state.send_modify(|s| {
                    s.error = Some(CREATE_FAILED.to_string());
                    s.is_creating = false;
                });
            }
        }
        result
    }

    /// Announce a join and add ourselves to the room's member list right away.
    /// Returns false, doing nothing, while disconnected.
    pub fn join_room(&self, room_id: &RoomId) -> bool {
        if room_id.as_str().is_empty() || !self.inner.connection.is_connected() {
            return false;
        }
        let identity = &self.inner.identity;
        let emitted = self.inner.connection.emit(ClientEvent::JoinRoom {
            room_id: room_id.clone(),
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
        });
        self.inner.state.send_if_modified(|s| {
            s.rooms
                .iter_mut()
                .find(|r| &r.id == room_id)
                .is_some_and(|r| r.add_member(identity.user_id.clone()))
        });
        emitted
    }

    pub fn is_member(&self, room_id: &RoomId) -> bool {
        self.inner
            .state
            .borrow()
            .rooms
            .iter()
            .any(|r| &r.id == room_id && r.has_member(&self.inner.identity.user_id))
    }

    pub fn state(&self) -> RosterState {
        self.inner.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<RosterState> {
        self.inner.state.subscribe()
    }
}

impl Drop for RoomRoster {
    fn drop(&mut self) {
        self.deactivate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomchat_client::{ConnectionSupervisor, MemoryConnector, MockRoomApi, SupervisorSettings};
    use secrecy::SecretString;
    use std::time::Duration;

    fn room(id: &str, users: &[&str]) -> Room {
        Room::new(id, format!("room {id}"), users.iter().map(|u| (*u).into()).collect())
    }

    async fn roster(rooms: Vec<Room>) -> (MemoryConnector, Arc<MockRoomApi>, RoomRoster) {
        let connector = MemoryConnector::new();
        let sup = ConnectionSupervisor::new(Arc::new(connector.clone()), SupervisorSettings::default());
        let connection = sup.connect("mem://chat");
        connection.wait_connected().await.unwrap();
        let api = Arc::new(MockRoomApi::new("u1", rooms));
        let identity = Arc::new(SessionIdentity::new("u1", "alice", SecretString::from("tok")));
        let roster = RoomRoster::new(identity, connection, api.clone());
        (connector, api, roster)
    }

    fn ids(state: &RosterState) -> Vec<&str> {
        state.rooms.iter().map(|r| r.id.as_str()).collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_then_broadcasts_dedupe() {
        let (connector, _api, roster) = roster(vec![room("r1", &[])]).await;
        assert!(roster.state().loading);
        roster.activate().await.unwrap();
        assert_eq!(ids(&roster.state()), vec!["r1"]);
        assert!(!roster.state().loading);

        connector.push(&ServerEvent::NewRoomCreated(room("r2", &[])));
        connector.push(&ServerEvent::NewRoomCreated(room("r2", &[])));
        settle().await;
        assert_eq!(ids(&roster.state()), vec!["r1", "r2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_during_fetch_is_kept() {
        let (connector, api, roster) = roster(vec![room("r1", &[])]).await;
        api.set_delay(Duration::from_millis(500));
        let fetch = roster.activate();
        settle().await;

        connector.push(&ServerEvent::NewRoomCreated(room("r9", &[])));
        connector.push(&ServerEvent::NewRoomCreated(room("r1", &[])));
        settle().await;
        fetch.await.unwrap();

        assert_eq!(ids(&roster.state()), vec!["r1", "r9"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn broadcasts_racing_fetch_completion_are_kept() {
        for round in 0..50 {
            let (connector, _api, roster) = roster(vec![room("r0", &[])]).await;
            let fetch = roster.activate();
            let pusher = {
                let connector = connector.clone();
                tokio::spawn(async move {
                    for i in 1..=20 {
                        connector.push(&ServerEvent::NewRoomCreated(room(&format!("b{i}"), &[])));
                        tokio::task::yield_now().await;
                    }
                })
            };
            fetch.await.unwrap();
            pusher.await.unwrap();

            let mut rx = roster.watch();
            tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.rooms.len() == 21))
                .await
                .unwrap_or_else(|_| panic!("round {round}: rooms {:?}", ids(&roster.state())))
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_sets_error() {
        let (_connector, api, roster) = roster(vec![room("r1", &[])]).await;
        api.fail_list(Some(ChatError::Network("down".into())));
        roster.activate().await.unwrap();

        let state = roster.state();
        assert!(state.rooms.is_empty());
        assert!(!state.loading);
        assert_eq!(state.error.as_deref(), Some(FETCH_FAILED));
    }

    #[tokio::test(start_paused = true)]
    async fn deactivate_discards_inflight_fetch() {
        let (connector, api, roster) = roster(vec![room("r1", &[])]).await;
        api.set_delay(Duration::from_millis(500));
        let fetch = roster.activate();
        settle().await;
        roster.deactivate();
        fetch.await.unwrap();

        assert!(roster.state().rooms.is_empty());
        connector.push(&ServerEvent::NewRoomCreated(room("r2", &[])));
        settle().await;
        assert!(roster.state().rooms.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn create_room_emits_but_does_not_insert() {
        let (connector, api, roster) = roster(vec![]).await;
        roster.activate().await.unwrap();

        let created = roster.create_room("  lobby ").await.unwrap();
        assert_eq!(created.name, "lobby");
        assert_eq!(api.create_calls(), 1);
        assert_eq!(
            connector.sent_named("createRoom"),
            vec![ClientEvent::CreateRoom(created.clone())]
        );
        assert!(roster.state().rooms.is_empty());
        assert!(!roster.state().is_creating);

        connector.push(&ServerEvent::NewRoomCreated(created));
        settle().await;
        assert_eq!(roster.state().rooms.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn create_room_validation_and_failure() {
        let (connector, api, roster) = roster(vec![]).await;
        roster.activate().await.unwrap();

        let err = roster.create_room("   ").await.unwrap_err();
        assert_eq!(err.error_kind(), "invalid_input");
        assert_eq!(roster.state().error.as_deref(), Some(EMPTY_NAME));
        assert_eq!(api.create_calls(), 0);

        api.fail_create(Some(ChatError::ServerError {
            status: 500,
            body: String::new(),
        }));
        assert!(roster.create_room("x").await.is_err());
        assert_eq!(roster.state().error.as_deref(), Some(CREATE_FAILED));
        assert!(connector.sent_named("createRoom").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn is_creating_while_in_flight() {
        let (_connector, api, roster) = roster(vec![]).await;
        api.set_delay(Duration::from_millis(200));
        let mut rx = roster.watch();
        let roster = Arc::new(roster);
        let creating = {
            let roster = Arc::clone(&roster);
            tokio::spawn(async move { roster.create_room("x").await })
        };
        rx.wait_for(|s| s.is_creating).await.unwrap();
        creating.await.unwrap().unwrap();
        assert!(!roster.state().is_creating);
    }

    #[tokio::test(start_paused = true)]
    async fn join_is_optimistic_and_idempotent() {
        let (connector, _api, roster) = roster(vec![room("r1", &["u2"])]).await;
        roster.activate().await.unwrap();
        assert!(!roster.is_member(&"r1".into()));

        assert!(roster.join_room(&"r1".into()));
        assert!(roster.is_member(&"r1".into()));
        assert!(roster.join_room(&"r1".into()));
        assert_eq!(roster.state().rooms[0].users.len(), 2);
        assert_eq!(connector.sent_named("joinRoom").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn join_while_disconnected_is_noop() {
        let (connector, _api, roster) = roster(vec![room("r1", &[])]).await;
        roster.activate().await.unwrap();
        connector.set_refusing(true);
        connector.drop_link();
        settle().await;

        assert!(!roster.join_room(&"r1".into()));
        assert!(!roster.is_member(&"r1".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_corrects_optimistic_state() {
        let (_connector, _api, roster) = roster(vec![room("r1", &[])]).await;
        roster.activate().await.unwrap();
        roster.join_room(&"r1".into());
        assert!(roster.is_member(&"r1".into()));

        roster.refresh().await.unwrap();
        assert!(!roster.is_member(&"r1".into()));
    }
}
