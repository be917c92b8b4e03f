//! Connection supervision: one transport connection per endpoint, shared by
//! every caller that acquires it, with typed emit/subscribe on top.
//!
//! Each connection is driven by a single task that (re)connects with
//! exponential backoff, decodes inbound frames into [`ServerEvent`]s and runs
//! the subscribed handlers in delivery order. Subscriptions live on the
//! connection, not on the link, so they survive reconnects; anything a caller
//! has to re-announce to the server after a reconnect is up to the caller,
//! which can watch [`ConnectionStatus::epoch`] for that.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use roomchat_core::{ChatError, ClientEvent, ConnectionId, EventKind, ServerEvent};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{ClientSettings, ReconnectSettings};
use crate::transport::{Connector, FrameStream, Link};

/// Upper bound on waiting for a closing link to write out its queue.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Observable connection status. `epoch` increments on every successful
/// connect, so a changed epoch while `Connected` means "this is a new link".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub epoch: u64,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Settings the supervisor needs from [`ClientSettings`].
#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    pub reconnect: ReconnectSettings,
    pub send_queue_capacity: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

impl From<&ClientSettings> for SupervisorSettings {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            reconnect: settings.reconnect.clone(),
            send_queue_capacity: settings.send_queue_capacity,
        }
    }
}

type HandlerFn = Box<dyn Fn(&ServerEvent) + Send + Sync>;

struct HandlerEntry {
    id: u64,
    active: AtomicBool,
    handler: HandlerFn,
}

/// State shared between the driver task and every [`Connection`] handle.
struct Shared {
    id: ConnectionId,
    endpoint: String,
    handlers: DashMap<EventKind, Vec<Arc<HandlerEntry>>>,
    next_handler_id: AtomicU64,
    outbound: RwLock<Option<mpsc::Sender<String>>>,
    status: watch::Sender<ConnectionStatus>,
    shutdown: CancellationToken,
}

impl Shared {
    fn new(endpoint: &str) -> Self {
        let (status, _) = watch::channel(ConnectionStatus {
            state: ConnectionState::Disconnected,
            epoch: 0,
        });
        Self {
            id: ConnectionId::new(),
            endpoint: endpoint.to_string(),
            handlers: DashMap::new(),
            next_handler_id: AtomicU64::new(1),
            outbound: RwLock::new(None),
            status,
            shutdown: CancellationToken::new(),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_if_modified(|s| {
            let changed = s.state != state;
            s.state = state;
            changed
        });
    }

    fn mark_connected(&self, outbound: mpsc::Sender<String>) -> u64 {
        *self.outbound.write() = Some(outbound);
        let mut epoch = 0;
        self.status.send_modify(|s| {
            s.state = ConnectionState::Connected;
            s.epoch += 1;
            epoch = s.epoch;
        });
        epoch
    }

    fn mark_disconnected(&self) {
        let _ = self.outbound.write().take();
        self.set_state(ConnectionState::Disconnected);
    }

    fn dispatch(&self, event: &ServerEvent) {
        let kind = event.kind();
        // Snapshot so handlers can subscribe/unsubscribe without holding the shard lock.
        let entries = match self.handlers.get(&kind) {
            Some(list) => list.clone(),
            None => {
                trace!(conn = %self.id, event = %kind, "no subscribers");
                return;
            }
        };
        for entry in entries {
            if entry.active.load(Ordering::Acquire) {
                (entry.handler)(event);
            }
        }
    }

    fn remove_handler(&self, kind: EventKind, id: u64) {
        if let Some(mut list) = self.handlers.get_mut(&kind) {
            list.retain(|e| e.id != id);
        }
    }
}

struct Lease {
    shared: Arc<Shared>,
    refs: usize,
}

struct SupervisorInner {
    connector: Arc<dyn Connector>,
    settings: SupervisorSettings,
    leases: Mutex<HashMap<String, Lease>>,
    drivers: Mutex<Vec<JoinHandle<()>>>,
}

/// Hands out shared [`Connection`]s, one per endpoint.
///
/// The first `connect` for an endpoint opens the transport; dropping the
/// last handle for it closes the transport.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ConnectionSupervisor {
    pub fn new(connector: Arc<dyn Connector>, settings: SupervisorSettings) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                connector,
                settings,
                leases: Mutex::new(HashMap::new()),
                drivers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Acquire the connection for `endpoint`, opening it on first use.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self, endpoint: &str) -> Connection {
        let mut leases = self.inner.leases.lock();
        if let Some(lease) = leases.get_mut(endpoint) {
            lease.refs += 1;
            debug!(conn = %lease.shared.id, refs = lease.refs, "reusing connection");
            return Connection {
                shared: Arc::clone(&lease.shared),
                supervisor: Arc::clone(&self.inner),
            };
        }

        let shared = Arc::new(Shared::new(endpoint));
        info!(
            conn = %shared.id,
            endpoint = endpoint,
            transport = self.inner.connector.name(),
            "opening connection"
        );
        let driver = tokio::spawn(drive(
            Arc::clone(&shared),
            Arc::clone(&self.inner.connector),
            self.inner.settings.clone(),
        ));
        let mut drivers = self.inner.drivers.lock();
        drivers.retain(|d| !d.is_finished());
        drivers.push(driver);
        drop(drivers);
        leases.insert(
            endpoint.to_string(),
            Lease {
                shared: Arc::clone(&shared),
                refs: 1,
            },
        );
        Connection {
            shared,
            supervisor: Arc::clone(&self.inner),
        }
    }

    /// Number of endpoints with at least one live handle.
    pub fn open_connections(&self) -> usize {
        self.inner.leases.lock().len()
    }

    /// Close every connection regardless of outstanding handles.
    ///
    /// Frames already queued may still be in flight when this returns; use
    /// [`close`](Self::close) to wait for them.
    pub fn shutdown(&self) {
        let mut leases = self.inner.leases.lock();
        for (_, lease) in leases.drain() {
            lease.shared.shutdown.cancel();
        }
    }

    /// Close every connection and wait until each driver has finished,
    /// including connections whose last handle was already dropped. Frames
    /// queued by `emit` before this call are written out first.
    pub async fn close(&self) {
        self.shutdown();
        let drivers = std::mem::take(&mut *self.inner.drivers.lock());
        for driver in drivers {
            if let Err(e) = driver.await {
                warn!(error = %e, "connection driver failed");
            }
        }
    }
}

/// A reference-counted handle to one supervised connection.
///
/// `emit` is fire-and-forget and a no-op (logged at warn) while the
/// connection is not `Connected`.
pub struct Connection {
    shared: Arc<Shared>,
    supervisor: Arc<SupervisorInner>,
}

impl Connection {
    pub fn id(&self) -> &ConnectionId {
        &self.shared.id
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Wait until the connection is `Connected`. Returns `None` if it was shut down.
    pub async fn wait_connected(&self) -> Option<ConnectionStatus> {
        let mut rx = self.watch_status();
        tokio::select! {
            _ = self.shared.shutdown.cancelled() => None,
            status = rx.wait_for(ConnectionStatus::is_connected) => status.ok().map(|s| *s),
        }
    }

    /// Send an event. Returns whether it was queued on a live link.
    pub fn emit(&self, event: ClientEvent) -> bool {
        let outbound = self.shared.outbound.read();
        let Some(tx) = outbound.as_ref() else {
            warn!(conn = %self.shared.id, event = event.name(), "not connected, dropping emit");
            return false;
        };
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(conn = %self.shared.id, event = event.name(), error = %e, "failed to encode event");
                return false;
            }
        };
        match tx.try_send(frame) {
            Ok(()) => {
                trace!(conn = %self.shared.id, event = event.name(), "emitted");
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn = %self.shared.id, event = event.name(), "send queue full, dropping emit");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(conn = %self.shared.id, event = event.name(), "link closed, dropping emit");
                false
            }
        }
    }

    /// Register `handler` for inbound events of `kind`.
    ///
    /// The handler runs on the connection's driver task and must not block.
    /// It stops receiving events as soon as the returned [`Subscription`] is
    /// unsubscribed or dropped.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let entry = Arc::new(HandlerEntry {
            id: self.shared.next_handler_id.fetch_add(1, Ordering::Relaxed),
            active: AtomicBool::new(true),
            handler: Box::new(handler),
        });
        self.shared
            .handlers
            .entry(kind)
            .or_default()
            .push(Arc::clone(&entry));
        debug!(conn = %self.shared.id, event = %kind, handler = entry.id, "subscribed");
        Subscription {
            kind,
            entry,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Number of live handlers for `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.shared.handlers.get(&kind).map(|l| l.len()).unwrap_or(0)
    }
}

impl Clone for Connection {
    fn clone(&self) -> Self {
        if let Some(lease) = self.supervisor.leases.lock().get_mut(&self.shared.endpoint) {
            if Arc::ptr_eq(&lease.shared, &self.shared) {
                lease.refs += 1;
            }
        }
        Self {
            shared: Arc::clone(&self.shared),
            supervisor: Arc::clone(&self.supervisor),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let mut leases = self.supervisor.leases.lock();
        let Some(lease) = leases.get_mut(&self.shared.endpoint) else {
            return;
        };
        if !Arc::ptr_eq(&lease.shared, &self.shared) {
            return;
        }
        lease.refs -= 1;
        if lease.refs == 0 {
            leases.remove(&self.shared.endpoint);
            info!(conn = %self.shared.id, "last handle released, closing connection");
            self.shared.shutdown.cancel();
        }
    }
}

/// Capability to remove one handler. Dropping it unsubscribes.
pub struct Subscription {
    kind: EventKind,
    entry: Arc<HandlerEntry>,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.entry.active.store(false, Ordering::Release);
        if let Some(shared) = self.shared.upgrade() {
            shared.remove_handler(self.kind, self.entry.id);
            debug!(conn = %shared.id, event = %self.kind, handler = self.entry.id, "unsubscribed");
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("handler", &self.entry.id)
            .finish()
    }
}

/// Exponential backoff with jitter: `base * 2^attempt`, capped at `max`.
pub fn backoff_delay(settings: &ReconnectSettings, attempt: u32) -> Duration {
    let exp_delay = settings.base_delay_ms as f64 * 2.0_f64.powi(attempt.min(20) as i32);
    let capped = exp_delay.min(settings.max_delay_ms as f64);

    let jitter_range = capped * settings.jitter_factor.clamp(0.0, 1.0);
    let jitter = if jitter_range > 0.0 {
        rand::thread_rng().gen_range(-jitter_range..=jitter_range)
    } else {
        0.0
    };

    Duration::from_millis((capped + jitter).max(10.0) as u64)
}

/// Driver task: connect, pump inbound frames, reconnect on loss, until shut down.
async fn drive(shared: Arc<Shared>, connector: Arc<dyn Connector>, settings: SupervisorSettings) {
    let mut attempt: u32 = 0;

    loop {
        shared.set_state(ConnectionState::Connecting);
        let result = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            result = connector.connect(&shared.endpoint, settings.send_queue_capacity) => result,
        };

        match result {
            Ok(Link {
                outbound,
                inbound,
                writer,
            }) => {
                attempt = 0;
                let epoch = shared.mark_connected(outbound);
                info!(conn = %shared.id, epoch = epoch, "connected");

                let reason = pump(&shared, inbound).await;
                // Drops the last sender, so the writer drains and exits.
                shared.mark_disconnected();
                if shared.shutdown.is_cancelled() {
                    flush(&shared, writer).await;
                    break;
                }
                match reason {
                    Some(e) => warn!(conn = %shared.id, error = %e, "connection lost, reconnecting"),
                    None => warn!(conn = %shared.id, "connection closed by peer, reconnecting"),
                }
            }
            Err(e) => {
                shared.set_state(ConnectionState::Disconnected);
                warn!(conn = %shared.id, attempt = attempt, error = %e, "connect failed");
            }
        }

        let delay = backoff_delay(&settings.reconnect, attempt);
        attempt = attempt.saturating_add(1);
        debug!(conn = %shared.id, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.mark_disconnected();
    info!(conn = %shared.id, "connection closed");
}

async fn flush(shared: &Shared, writer: Option<JoinHandle<()>>) {
    let Some(writer) = writer else {
        return;
    };
    match tokio::time::timeout(FLUSH_TIMEOUT, writer).await {
        Ok(_) => debug!(conn = %shared.id, "outbound queue flushed"),
        Err(_) => warn!(conn = %shared.id, "timed out flushing outbound queue"),
    }
}

/// Read frames until the link ends or the connection is shut down.
/// Returns the transport error that ended the link, if any.
async fn pump(shared: &Shared, mut inbound: FrameStream) -> Option<ChatError> {
    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => return None,
            frame = inbound.next() => frame,
        };
        match frame {
            Some(Ok(text)) => match ServerEvent::from_frame(&text) {
                Ok(event) => shared.dispatch(&event),
                Err(e) => warn!(conn = %shared.id, error = %e, "skipping undecodable frame"),
            },
            Some(Err(e)) => return Some(e),
            None => return None,
        }
    }
}
