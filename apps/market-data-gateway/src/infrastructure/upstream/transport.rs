//! WebSocket Transport
//!
//! `tokio-tungstenite` adapter for [`StreamConnector`]. Exposes only text
//! frames to the connection manager; protocol-level ping/pong is answered
//! by tungstenite itself and binary frames are ignored.

use async_trait::async_trait;
use futures::future;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::application::ports::{FrameSink, FrameStream, StreamConnector, TransportError};

/// Default upstream streaming endpoint.
pub const DEFAULT_STREAM_URL: &str = "wss://socket.polygon.io/stocks";

/// Connects to the upstream feed over TLS WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    /// Create a connector for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Endpoint this connector dials.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl StreamConnector for WebSocketConnector {
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError> {
        tracing::info!(url = %self.url, "Connecting to upstream stream");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| TransportError::Io(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text.into()))));

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(frame)) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    tracing::info!(reason = %reason, "Upstream sent close frame");
                    Some(Err(TransportError::Closed(reason)))
                }
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::Io(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
