//! WebSocket connector over `tokio-tungstenite`.

use async_trait::async_trait;
use futures::{future, SinkExt, StreamExt};
use roomchat_core::ChatError;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::transport::{Connector, Link};

/// Connects to the event server over WebSocket, one JSON text frame per event.
#[derive(Clone, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn connect(&self, endpoint: &str, queue_capacity: usize) -> Result<Link, ChatError> {
        let (ws, _response) = connect_async(endpoint)
            .await
            .map_err(|e| ChatError::ConnectFailed(e.to_string()))?;
        let (mut ws_tx, ws_rx) = ws.split();

        // Writer task: forward queued frames until the supervisor drops the sender.
        let (tx, mut rx) = mpsc::channel::<String>(queue_capacity.max(1));
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = ws_tx.send(Message::Text(frame.into())).await {
                    tracing::debug!(error = %e, "websocket write failed");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let inbound = ws_rx
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                    Ok(Message::Binary(bytes)) => Some(
                        String::from_utf8(bytes.to_vec())
                            .map_err(|e| ChatError::InvalidPayload(e.to_string())),
                    ),
                    Ok(_) => None,
                    Err(e) => Some(Err(ChatError::Network(e.to_string()))),
                })
            })
            .boxed();

        Ok(Link {
            outbound: tx,
            inbound,
            writer: Some(writer),
        })
    }
}
