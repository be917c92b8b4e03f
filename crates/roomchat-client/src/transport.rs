use async_trait::async_trait;
use futures::stream::BoxStream;
use roomchat_core::ChatError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Inbound text frames. The stream ends when the peer closes the link.
pub type FrameStream = BoxStream<'static, Result<String, ChatError>>;

/// One established transport link.
///
/// Dropping `outbound` closes the write side; dropping `inbound` stops reading.
/// `writer`, when the transport writes from its own task, finishes once every
/// frame queued before `outbound` was dropped has been written.
pub struct Link {
    pub outbound: mpsc::Sender<String>,
    pub inbound: FrameStream,
    pub writer: Option<JoinHandle<()>>,
}

/// Opens transport links. The supervisor calls this again after every drop.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn connect(&self, endpoint: &str, queue_capacity: usize) -> Result<Link, ChatError>;
}
