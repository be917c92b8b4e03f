pub mod errors;
pub mod events;
pub mod identity;
pub mod ids;
pub mod models;

pub use errors::ChatError;
pub use events::{ClientEvent, EventKind, ServerEvent};
pub use identity::SessionIdentity;
pub use ids::{ConnectionId, MessageId, RoomId, UserId};
pub use models::{Author, Message, OnlineUser, Room};
