//! Transport and backend plumbing: settings, the supervised socket
//! connection, the room REST API and login.

pub mod api;
pub mod auth;
pub mod config;
pub mod connection;
pub mod memory;
pub mod mock;
pub mod transport;
pub mod ws;

pub use api::{HttpRoomApi, RoomApi};
pub use auth::{load_session, save_session, session_path, AuthApi, HttpAuthApi};
pub use config::{load_settings, ClientSettings, LoadedSettings, ReconnectSettings, SettingsError};
pub use connection::{
    Connection, ConnectionState, ConnectionStatus, ConnectionSupervisor, Subscription,
    SupervisorSettings,
};
pub use memory::MemoryConnector;
pub use mock::MockRoomApi;
pub use transport::{Connector, FrameStream, Link};
pub use ws::WsConnector;
