//! Socket abstraction under the connection manager.
//!
//! [`Connector`] dials, [`Transport`] moves text frames. The production pair
//! is backed by `tokio-tungstenite`; tests substitute scripted fakes.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{CollabError, Result};

/// A live, bidirectional text-frame channel.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<()>;

    /// Next text frame. `None` means the peer closed the connection;
    /// `Some(Err(..))` is a transport error that does not by itself end it.
    async fn recv(&mut self) -> Option<Result<String>>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens transports to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>>;
}

// ---------------------------------------------------------------------------
// tokio-tungstenite
// ---------------------------------------------------------------------------

/// Dials with `tokio_tungstenite::connect_async`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>> {
        let (stream, response) = tokio_tungstenite::connect_async(url).await?;
        debug!(url, status = %response.status(), "websocket handshake complete");
        Ok(Box::new(TungsteniteTransport {
            stream,
            failed: false,
        }))
    }
}

pub struct TungsteniteTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Set after a read error; tungstenite read errors are terminal.
    failed: bool,
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        if self.failed {
            return None;
        }
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text)),
                Ok(WsMessage::Binary(bytes)) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Ok(WsMessage::Close(frame)) => {
                    debug!(?frame, "close frame received");
                    return None;
                }
                // Ping / pong are answered by tungstenite itself.
                Ok(_) => continue,
                Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
                | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(CollabError::WebSocket(e)));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.stream.close(None).await {
            Ok(())
            | Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
