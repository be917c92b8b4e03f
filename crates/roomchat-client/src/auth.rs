//! Login and registration against the backend, and the stored session.
//!
//! A successful login or registration yields a [`SessionIdentity`]. The CLI
//! keeps it in `~/.roomchat/session.json` (mode 0o600) so later commands can
//! pick it up without passing the token again.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use roomchat_core::{ChatError, SessionIdentity};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::{roomchat_dir, SettingsError};

const SESSION_FILE_NAME: &str = "session.json";

/// Exchanges a username and password for a session.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, username: &str, password: &SecretString)
        -> Result<SessionIdentity, ChatError>;

    async fn register(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<SessionIdentity, ChatError>;
}

/// What both auth endpoints answer with, and what the session file holds.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    token: String,
    user_id: String,
    username: String,
}

impl SessionRecord {
    fn from_identity(identity: &SessionIdentity) -> Self {
        Self {
            token: identity.authorization().to_string(),
            user_id: identity.user_id.to_string(),
            username: identity.username.clone(),
        }
    }

    fn into_identity(self) -> SessionIdentity {
        SessionIdentity::new(self.user_id, self.username, SecretString::from(self.token))
    }
}

pub struct HttpAuthApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuthApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post(
        &self,
        action: &str,
        username: &str,
        password: &SecretString,
    ) -> Result<SessionIdentity, ChatError> {
        let body = serde_json::json!({
            "username": username,
            "password": password.expose_secret(),
        });
        let response = self
            .client
            .post(format!("{}/api/auth/{action}", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), action = action, "auth request failed");
            return Err(ChatError::from_status(status.as_u16(), body));
        }
        let record: SessionRecord = response
            .json()
            .await
            .map_err(|e| ChatError::InvalidPayload(e.to_string()))?;
        if record.token.is_empty() || record.user_id.is_empty() {
            return Err(ChatError::InvalidPayload(format!("{action} response has no session")));
        }
        info!(user_id = %record.user_id, action = action, "authenticated");
        Ok(record.into_identity())
    }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    #[instrument(skip_all, fields(username = %username))]
    async fn login(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<SessionIdentity, ChatError> {
        self.post("login", username, password).await
    }

    #[instrument(skip_all, fields(username = %username))]
    async fn register(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<SessionIdentity, ChatError> {
        self.post("register", username, password).await
    }
}

/// `~/.roomchat/session.json`.
pub fn session_path() -> PathBuf {
    roomchat_dir().join(SESSION_FILE_NAME)
}

/// Read a stored session. Missing or unreadable files yield `None`.
pub fn load_session(path: &Path) -> Option<SessionIdentity> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(?path, error = %e, "failed to read session file");
            return None;
        }
    };
    match serde_json::from_str::<SessionRecord>(&data) {
        Ok(record) => Some(record.into_identity()),
        Err(e) => {
            warn!(?path, error = %e, "failed to parse session file");
            None
        }
    }
}

/// Write the session, creating parent directories. The file is owner-only.
pub fn save_session(path: &Path, identity: &SessionIdentity) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(&SessionRecord::from_identity(identity))?;
    std::fs::write(path, json)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    Ok(())
}
