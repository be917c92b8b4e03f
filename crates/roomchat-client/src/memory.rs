//! In-process connector: the "server" side is driven directly by the caller.
//!
//! Used by tests and by the CLI's offline mode. Every link opened through the
//! connector shares one outbound log, so emitted events can be inspected
//! across reconnects.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use roomchat_core::{ChatError, ClientEvent, ServerEvent};
use tokio::sync::mpsc;

use crate::transport::{Connector, Link};

#[derive(Default)]
struct MemoryInner {
    sent: Mutex<Vec<ClientEvent>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Result<String, ChatError>>>>,
    refusing: AtomicBool,
    connects: AtomicUsize,
}

impl MemoryInner {
    /// Move everything queued on the current link into the sent log.
    fn drain_outbound(&self) {
        let mut rx_slot = self.outbound_rx.lock();
        let Some(rx) = rx_slot.as_mut() else {
            return;
        };
        let mut sent = self.sent.lock();
        while let Ok(frame) = rx.try_recv() {
            match ClientEvent::from_frame(&frame) {
                Ok(event) => sent.push(event),
                Err(e) => tracing::warn!(error = %e, "memory transport got undecodable frame"),
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryConnector {
    inner: Arc<MemoryInner>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a server event on the live link. Returns false if no link is open.
    pub fn push(&self, event: &ServerEvent) -> bool {
        match event.to_frame() {
            Ok(frame) => self.push_raw(frame),
            Err(_) => false,
        }
    }

    /// Deliver an arbitrary text frame, valid or not.
    pub fn push_raw(&self, frame: impl Into<String>) -> bool {
        self.inner
            .inbound_tx
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(frame.into())).is_ok())
    }

    /// Close the live link from the server side, as a network drop would.
    pub fn drop_link(&self) {
        self.inner.drain_outbound();
        let _ = self.inner.inbound_tx.lock().take();
    }

    /// While refusing, every connect attempt fails.
    pub fn set_refusing(&self, refusing: bool) {
        self.inner.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn is_linked(&self) -> bool {
        self.inner
            .inbound_tx
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Every event the client has emitted, in order.
    pub fn sent(&self) -> Vec<ClientEvent> {
        self.inner.drain_outbound();
        self.inner.sent.lock().clone()
    }

    /// Emitted events with the given wire name.
    pub fn sent_named(&self, name: &str) -> Vec<ClientEvent> {
        self.sent().into_iter().filter(|e| e.name() == name).collect()
    }

    pub fn clear_sent(&self) {
        self.inner.drain_outbound();
        self.inner.sent.lock().clear();
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self, endpoint: &str, queue_capacity: usize) -> Result<Link, ChatError> {
        if self.inner.refusing.load(Ordering::SeqCst) {
            return Err(ChatError::ConnectFailed(format!("{endpoint}: connection refused")));
        }

        // Keep whatever the previous link still had queued.
        self.inner.drain_outbound();

        let (out_tx, out_rx) = mpsc::channel(queue_capacity.max(1));
        let (in_tx, mut in_rx) = mpsc::unbounded_channel();
        *self.inner.outbound_rx.lock() = Some(out_rx);
        *self.inner.inbound_tx.lock() = Some(in_tx);
        self.inner.connects.fetch_add(1, Ordering::SeqCst);

        let inbound = futures::stream::poll_fn(move |cx| in_rx.poll_recv(cx)).boxed();
        Ok(Link {
            outbound: out_tx,
            inbound,
            writer: None,
        })
    }
}
