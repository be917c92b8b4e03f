use crate::ids::RoomId;

/// Typed error hierarchy for the chat client.
///
/// None of these are fatal to the process. Callers classify them with
/// [`ChatError::is_authorization_failure`] to decide between redirecting away
/// from a room and showing a generic error state.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ChatError {
    // Access
    #[error("user is not a member of room {room_id}")]
    NotAMember { room_id: RoomId },
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),
    #[error("not found: {0}")]
    NotFound(String),

    // Backend
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    // Transport
    #[error("transport unavailable")]
    TransportUnavailable,
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    // Local
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("session was torn down")]
    Stale,
}

impl ChatError {
    /// Errors that make a room inaccessible. The caller should navigate away.
    pub fn is_authorization_failure(&self) -> bool {
        matches!(
            self,
            Self::NotAMember { .. } | Self::AuthenticationRejected(_) | Self::NotFound(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotAMember { .. } => "not_a_member",
            Self::AuthenticationRejected(_) => "authentication_rejected",
            Self::NotFound(_) => "not_found",
            Self::ServerError { .. } => "server_error",
            Self::UnexpectedStatus { .. } => "unexpected_status",
            Self::Network(_) => "network_error",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::TransportUnavailable => "transport_unavailable",
            Self::ConnectFailed(_) => "connect_failed",
            Self::InvalidInput(_) => "invalid_input",
            Self::Stale => "stale",
        }
    }

    /// Classify a non-success HTTP status code.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationRejected(body),
            404 => Self::NotFound(body),
            500..=599 => Self::ServerError { status, body },
            _ => Self::UnexpectedStatus { status, body },
        }
    }
}
