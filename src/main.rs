//! # roomchat
//!
//! Terminal shell for the room session core: log in, list, create and join
//! rooms, and chat in a room from stdin.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use roomchat_client::{
    config, load_session, save_session, session_path, AuthApi, ClientSettings, Connection,
    ConnectionSupervisor, HttpAuthApi, HttpRoomApi, LoadedSettings, RoomApi, SupervisorSettings,
    WsConnector,
};
use roomchat_core::{Message, MessageId, RoomId, SessionIdentity};
use roomchat_session::{ExitReason, RoomRoster, RoomSessionController, RoomView};
use roomchat_telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, BufReader};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Realtime chat rooms from the terminal.
#[derive(Parser, Debug)]
#[command(name = "roomchat", about = "Realtime chat rooms from the terminal")]
struct Cli {
    /// Session token. Defaults to the one stored by `roomchat login`.
    #[arg(long, global = true, env = "ROOMCHAT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, global = true, env = "ROOMCHAT_USER_ID")]
    user_id: Option<String>,

    #[arg(long, global = true, env = "ROOMCHAT_USERNAME")]
    username: Option<String>,

    /// Settings file (defaults to ~/.roomchat/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Overrides `backendUrl` from settings.
    #[arg(long, global = true)]
    backend_url: Option<String>,

    /// Overrides `socketUrl` from settings.
    #[arg(long, global = true)]
    socket_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and store the session in ~/.roomchat/session.json.
    Login(Credentials),
    /// Create an account and store its session.
    Register(Credentials),
    /// Work with the room list.
    Rooms {
        #[command(subcommand)]
        action: RoomsAction,
    },
    /// Enter a room and chat. Each stdin line is sent as a message; `/quit` leaves.
    Chat { room_id: String },
}

#[derive(Args, Debug)]
struct Credentials {
    #[arg(value_name = "USERNAME")]
    name: String,

    /// Read from stdin when not given.
    #[arg(long, env = "ROOMCHAT_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[derive(Subcommand, Debug)]
enum RoomsAction {
    List,
    Create { name: String },
    Join { room_id: String },
}

struct App {
    settings: ClientSettings,
    identity: Arc<SessionIdentity>,
    supervisor: ConnectionSupervisor,
    api: Arc<dyn RoomApi>,
}

impl App {
    fn new(settings: ClientSettings, identity: SessionIdentity) -> Result<Self> {
        let api = HttpRoomApi::new(
            settings.backend_url.clone(),
            identity.clone(),
            settings.request_timeout(),
        )
        .context("Failed to build HTTP client")?;
        let supervisor =
            ConnectionSupervisor::new(Arc::new(WsConnector), SupervisorSettings::from(&settings));

        Ok(Self {
            settings,
            identity: Arc::new(identity),
            supervisor,
            api: Arc::new(api),
        })
    }

    fn for_session(cli: &Cli, settings: ClientSettings) -> Result<Self> {
        let identity = resolve_identity(cli, load_session(&session_path()))?;
        let app = Self::new(settings, identity)?;
        tracing::debug!(user_id = %app.identity.user_id, "starting roomchat");
        Ok(app)
    }

    /// Emits are only queued; wait for them to be written before the runtime goes away.
    async fn close(&self) {
        self.supervisor.close().await;
    }

    fn connect(&self) -> Connection {
        self.supervisor.connect(&self.settings.socket_url)
    }

    async fn connected(&self) -> Result<Connection> {
        let connection = self.connect();
        match tokio::time::timeout(CONNECT_TIMEOUT, connection.wait_connected()).await {
            Ok(Some(_)) => Ok(connection),
            _ => bail!("Could not connect to {}", self.settings.socket_url),
        }
    }

    fn roster(&self, connection: Connection) -> RoomRoster {
        RoomRoster::new(Arc::clone(&self.identity), connection, Arc::clone(&self.api))
    }
}

fn load_settings(cli: &Cli) -> Result<LoadedSettings> {
    let mut loaded = match &cli.settings {
        Some(path) => config::load_settings_from_path(path),
        None => config::load_settings(),
    }
    .context("Failed to load settings")?;
    if let Some(url) = &cli.backend_url {
        loaded.settings.backend_url = url.clone();
    }
    if let Some(url) = &cli.socket_url {
        loaded.settings.socket_url = url.clone();
    }
    Ok(loaded)
}

fn telemetry(settings: &ClientSettings) -> TelemetryConfig {
    TelemetryConfig {
        log_level: TelemetryConfig::level_from_str(&settings.log_level),
        module_levels: Vec::new(),
        format: if settings.log_json {
            LogFormat::Json
        } else {
            LogFormat::Compact
        },
    }
}

/// Flags and env vars win field by field; the stored session fills the rest.
fn resolve_identity(cli: &Cli, stored: Option<SessionIdentity>) -> Result<SessionIdentity> {
    let token = cli
        .token
        .clone()
        .or_else(|| stored.as_ref().map(|s| s.authorization().to_string()));
    let user_id = cli
        .user_id
        .clone()
        .or_else(|| stored.as_ref().map(|s| s.user_id.to_string()));
    let username = cli
        .username
        .clone()
        .or_else(|| stored.as_ref().map(|s| s.username.clone()));

    match (token, user_id, username) {
        (Some(token), Some(user_id), Some(username)) => {
            Ok(SessionIdentity::new(user_id, username, SecretString::from(token)))
        }
        _ => bail!(
            "Not logged in: run `roomchat login <username>`, or set ROOMCHAT_TOKEN, \
             ROOMCHAT_USER_ID and ROOMCHAT_USERNAME"
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let loaded = load_settings(&cli)?;
    let _ = init_telemetry(&telemetry(&loaded.settings));
    loaded.log_rejected();
    let settings = loaded.settings;

    match &cli.command {
        Command::Login(credentials) => authenticate(&settings, credentials, false).await,
        Command::Register(credentials) => authenticate(&settings, credentials, true).await,
        Command::Rooms { action } => {
            let app = App::for_session(&cli, settings)?;
            let result = rooms(&app, action).await;
            app.close().await;
            result
        }
        Command::Chat { room_id } => {
            let app = App::for_session(&cli, settings)?;
            let result = chat(&app, RoomId::from(room_id.as_str())).await;
            app.close().await;
            result
        }
    }
}

async fn authenticate(settings: &ClientSettings, credentials: &Credentials, register: bool) -> Result<()> {
    let password = match &credentials.password {
        Some(password) => SecretString::from(password.clone()),
        None => prompt_password().await?,
    };
    let api = HttpAuthApi::new(settings.backend_url.clone(), settings.request_timeout())
        .context("Failed to build HTTP client")?;
    let identity = if register {
        api.register(&credentials.name, &password)
            .await
            .context("Registration failed")?
    } else {
        api.login(&credentials.name, &password)
            .await
            .context("Login failed")?
    };

    let path = session_path();
    save_session(&path, &identity)
        .with_context(|| format!("Failed to save session to {}", path.display()))?;
    println!("Logged in as {} ({}).", identity.username, identity.user_id);
    Ok(())
}

async fn prompt_password() -> Result<SecretString> {
    eprint!("Password: ");
    let mut line = String::new();
    let read = BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read password")?;
    if read == 0 {
        bail!("No password given");
    }
    Ok(SecretString::from(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn rooms(app: &App, action: &RoomsAction) -> Result<()> {
    match action {
        RoomsAction::List => {
            let roster = app.roster(app.connect());
            roster.activate().await.context("Room fetch task failed")?;
            let state = roster.state();
            if let Some(error) = &state.error {
                bail!("{error}");
            }
            if state.rooms.is_empty() {
                println!("No rooms yet.");
            }
            for room in &state.rooms {
                let marker = if room.has_member(&app.identity.user_id) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{marker} {}  {}  ({} members)",
                    room.id,
                    room.display_name(),
                    room.users.len()
                );
            }
        }
        RoomsAction::Create { name } => {
            let roster = app.roster(app.connected().await?);
            let room = match roster.create_room(name).await {
                Ok(room) => room,
                Err(_) => bail!("{}", roster.state().error.unwrap_or_default()),
            };
            println!("Created {} ({})", room.display_name(), room.id);
        }
        RoomsAction::Join { room_id } => {
            let roster = app.roster(app.connected().await?);
            roster.activate().await.context("Room fetch task failed")?;
            let room_id = RoomId::from(room_id.as_str());
            if roster.is_member(&room_id) {
                println!("Already a member of {room_id}.");
            } else if roster.join_room(&room_id) {
                println!("Joined {room_id}.");
            } else {
                bail!("Not connected; could not join {room_id}");
            }
        }
    }
    Ok(())
}

/// One stdin line counts as typing followed by a send. Returns whether a
/// message went out.
fn submit_line(controller: &RoomSessionController, line: &str) -> bool {
    if line.trim().is_empty() {
        return false;
    }
    controller.input_changed();
    controller.send_message(line)
}

async fn chat(app: &App, room_id: RoomId) -> Result<()> {
    let controller = RoomSessionController::new(
        room_id,
        Arc::clone(&app.identity),
        app.connect(),
        Arc::clone(&app.api),
        app.settings.typing_debounce(),
    );
    controller.start();

    let printer = tokio::spawn(print_views(
        controller.watch(),
        app.identity.user_id.to_string(),
    ));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let exit = loop {
        tokio::select! {
            reason = controller.closed() => break Some(reason),
            _ = tokio::signal::ctrl_c() => break None,
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) if line.trim() == "/quit" => break None,
                Some(line) => {
                    if !submit_line(&controller, &line) && !line.trim().is_empty() {
                        println!("(not in the room yet, message not sent)");
                    }
                }
                None => break None,
            },
        }
    };

    controller.stop().await;
    printer.abort();
    if exit == Some(ExitReason::Unauthorized) {
        bail!("You are not a member of room {}", controller.room_id());
    }
    Ok(())
}

fn print_message(message: &Message, me: &str) {
    let who = if message.author.id.as_str() == me {
        "you"
    } else {
        message.author.username.as_str()
    };
    println!(
        "[{}] {}: {}",
        message.timestamp.format("%H:%M:%S"),
        who,
        message.text
    );
}

/// Split `messages` against what is already on screen. When `printed` is
/// still a prefix, only the tail is new; otherwise everything is reprinted.
fn unprinted<'a>(printed: &[MessageId], messages: &'a [Message]) -> (bool, &'a [Message]) {
    let prefix_kept = printed.len() <= messages.len()
        && printed.iter().zip(messages).all(|(id, m)| *id == m.id);
    if prefix_kept {
        (false, &messages[printed.len()..])
    } else {
        (true, messages)
    }
}

async fn print_views(mut rx: tokio::sync::watch::Receiver<RoomView>, me: String) {
    let mut printed: Vec<MessageId> = Vec::new();
    let mut last_typing: Option<String> = None;
    let mut last_online = 0usize;
    let mut announced = false;

    loop {
        let view = rx.borrow_and_update().clone();

        if !view.is_loading() && !announced {
            let name = view.room.as_ref().map(|r| r.display_name()).unwrap_or("room");
            println!("== {name} ==");
            announced = true;
        }
        let (reprint, fresh) = unprinted(&printed, &view.messages);
        if reprint {
            println!("-- history --");
            printed.clear();
        }
        for message in fresh {
            print_message(message, &me);
            printed.push(message.id.clone());
        }

        if view.online_users.len() != last_online {
            last_online = view.online_users.len();
            println!("({last_online} online)");
        }
        if view.typing_summary != last_typing {
            if let Some(summary) = &view.typing_summary {
                println!("({summary})");
            }
            last_typing = view.typing_summary;
        }

        if rx.changed().await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use roomchat_client::{MemoryConnector, MockRoomApi};
    use roomchat_core::{Author, ClientEvent, Room};
    use roomchat_session::SessionPhase;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    fn message(id: &str) -> Message {
        Message {
            id: id.into(),
            room_id: "r1".into(),
            author: Author {
                id: "u2".into(),
                username: "bob".into(),
            },
            text: id.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn stored_session_fills_missing_identity() {
        let stored = SessionIdentity::new("u1", "alice", SecretString::from("tok-1"));
        let cli = cli(&["roomchat", "--username", "al", "rooms", "list"]);
        let identity = resolve_identity(&cli, Some(stored)).unwrap();
        assert_eq!(identity.user_id.as_str(), "u1");
        assert_eq!(identity.username, "al");
        assert_eq!(identity.authorization(), "tok-1");
    }

    #[test]
    fn missing_identity_is_an_error() {
        let cli = cli(&["roomchat", "--token", "t", "chat", "r1"]);
        let err = resolve_identity(&cli, None).unwrap_err();
        assert!(err.to_string().contains("roomchat login"));
    }

    #[test]
    fn login_takes_username_and_optional_password() {
        let cli = cli(&["roomchat", "login", "alice", "--password", "pw"]);
        let Command::Login(credentials) = cli.command else {
            panic!("expected login");
        };
        assert_eq!(credentials.name, "alice");
        assert_eq!(credentials.password.as_deref(), Some("pw"));
    }

    #[test]
    fn appended_messages_print_only_the_tail() {
        let printed: Vec<MessageId> = vec!["m1".into()];
        let messages = vec![message("m1"), message("m2")];
        let (reprint, fresh) = unprinted(&printed, &messages);
        assert!(!reprint);
        assert_eq!(ids(fresh), vec!["m2"]);
    }

    #[test]
    fn history_merged_before_live_reprints_everything() {
        // Live m3 was shown first; the snapshot then puts m1 and m2 ahead of it.
        let printed: Vec<MessageId> = vec!["m3".into()];
        let messages = vec![message("m1"), message("m2"), message("m3")];
        let (reprint, fresh) = unprinted(&printed, &messages);
        assert!(reprint);
        assert_eq!(ids(fresh), vec!["m1", "m2", "m3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn submitted_line_signals_typing_then_sends() {
        let connector = MemoryConnector::new();
        let supervisor =
            ConnectionSupervisor::new(Arc::new(connector.clone()), SupervisorSettings::default());
        let identity = Arc::new(SessionIdentity::new("u1", "alice", SecretString::from("tok")));
        let api = Arc::new(MockRoomApi::new(
            "u1",
            vec![Room::new("r1", "general", vec!["u1".into()])],
        ));
        let controller = RoomSessionController::new(
            "r1".into(),
            identity,
            supervisor.connect("mem://chat"),
            api,
            Duration::from_millis(1000),
        );
        controller.start();
        let mut rx = controller.watch();
        rx.wait_for(|v| v.phase == SessionPhase::Joined).await.unwrap();
        connector.clear_sent();

        assert!(!submit_line(&controller, "   "));
        assert!(submit_line(&controller, "hi"));
        let names: Vec<_> = connector.sent().iter().map(ClientEvent::name).collect();
        assert_eq!(names, vec!["typing", "sendMessage", "stopTyping"]);

        controller.stop().await;
        supervisor.close().await;
    }
}
