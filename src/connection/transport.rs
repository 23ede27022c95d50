// Channel Transport
//
// Seam between the connection manager and the actual network. The session
// only ever talks to `Connector`/`Channel`; `WsConnector` is the production
// implementation over tokio-tungstenite.

use crate::error::TransportError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Something received on an open channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// Protocol-level ping from the server
    Ping,
    /// Protocol-level pong from the server
    Pong,
    /// Peer closed the channel
    Closed,
}

/// Opens channels to the availability service
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Channel>, TransportError>;
}

/// One open bidirectional channel
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound item. Must be cancel-safe.
    async fn recv(&mut self) -> Result<Inbound, TransportError>;

    async fn close(&mut self);
}

/// WebSocket connector
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Channel>, TransportError> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        debug!(status = %response.status(), "WebSocket handshake complete");
        Ok(Box::new(WsChannel { stream }))
    }
}

pub struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Channel for WsChannel {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Inbound, TransportError> {
        loop {
            return match self.stream.next().await {
                Some(Ok(Message::Text(text))) => Ok(Inbound::Text(text.to_string())),
                Some(Ok(Message::Binary(bytes))) => match binary_text(bytes.to_vec()) {
                    Some(text) => Ok(Inbound::Text(text)),
                    None => continue,
                },
                Some(Ok(Message::Ping(_))) => Ok(Inbound::Ping),
                Some(Ok(Message::Pong(_))) => Ok(Inbound::Pong),
                Some(Ok(Message::Close(_))) | None => Ok(Inbound::Closed),
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => Err(TransportError::Receive(e.to_string())),
            };
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "WebSocket close handshake failed");
        }
    }
}

/// Binary frames carry the same JSON as text frames; anything that is not
/// valid UTF-8 is dropped rather than patched up
fn binary_text(bytes: Vec<u8>) -> Option<String> {
    match String::from_utf8(bytes) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(error = %e, len = e.as_bytes().len(), "Dropping binary frame with invalid UTF-8");
            None
        }
    }
}
