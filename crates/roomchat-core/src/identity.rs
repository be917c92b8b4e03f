use secrecy::{ExposeSecret, SecretString};

use crate::ids::UserId;

/// Who this client session is. Supplied once at session start and shared
/// read-only by every component; it stamps every outgoing event.
#[derive(Clone)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub username: String,
    token: SecretString,
}

impl SessionIdentity {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>, token: SecretString) -> Self {
        Self {
            user_id: UserId::from_raw(user_id),
            username: username.into(),
            token,
        }
    }

    /// Value for the `Authorization` header. The backend expects the raw token.
    pub fn authorization(&self) -> &str {
        self.token.expose_secret()
    }
}

impl std::fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIdentity")
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_token() {
        let identity = SessionIdentity::new("u1", "alice", SecretString::from("tok-123"));
        let rendered = format!("{identity:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("tok-123"));
    }

    #[test]
    fn authorization_is_raw_token() {
        let identity = SessionIdentity::new("u1", "alice", SecretString::from("tok-123"));
        assert_eq!(identity.authorization(), "tok-123");
    }
}
