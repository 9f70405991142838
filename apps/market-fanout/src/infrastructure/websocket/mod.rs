//! WebSocket Feed Adapter
//!
//! Implements the transport port over `tokio-tungstenite`. Each connect
//! opens a fresh WebSocket, optionally sends a subscribe message, and then
//! yields records decoded from text and binary frames.
//!
//! Pings are answered inline. A close frame or the end of the socket is
//! reported as a clean end of stream. Frames that fail to decode are
//! logged and skipped; the connection stays up.

mod codec;

use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

pub use codec::{CodecError, DecodedFrame, FrameDecoder};

use crate::application::ports::{Connection, Transport};
use crate::domain::error::TransportError;
use crate::domain::streaming::RawRecord;
use crate::infrastructure::config::{FeedSettings, FeedToken};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport that dials a WebSocket feed.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
    decoder: FrameDecoder,
    subscribe_message: Option<String>,
    token: Option<FeedToken>,
}

impl WebSocketTransport {
    /// Create a transport from feed settings.
    #[must_use]
    pub fn new(settings: &FeedSettings) -> Self {
        Self {
            url: settings.url.clone(),
            decoder: FrameDecoder::new(settings.codec),
            subscribe_message: settings.subscribe_message.clone(),
            token: settings.token.clone(),
        }
    }

    /// Feed URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        info!(url = %self.url, "Connecting to feed");

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.expose()))
                .map_err(|e| TransportError::ConnectFailed(format!("invalid feed token: {e}")))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }

        let (mut socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        if let Some(message) = &self.subscribe_message {
            socket
                .send(Message::Text(message.clone().into()))
                .await
                .map_err(|e| TransportError::ConnectFailed(format!("subscribe failed: {e}")))?;
            debug!("Subscribe message sent");
        }

        Ok(Box::new(WebSocketConnection::new(socket, self.decoder)))
    }
}

/// An open feed socket.
pub struct WebSocketConnection<S = Socket> {
    socket: S,
    decoder: FrameDecoder,
    pending: VecDeque<RawRecord>,
}

impl<S> WebSocketConnection<S> {
    /// Wrap an established socket.
    pub fn new(socket: S, decoder: FrameDecoder) -> Self {
        Self {
            socket,
            decoder,
            pending: VecDeque::new(),
        }
    }

    fn buffer(&mut self, frame: Result<DecodedFrame, CodecError>, kind: &'static str) {
        match frame {
            Ok(frame) => {
                if frame.ignored > 0 {
                    debug!(ignored = frame.ignored, "Skipped non-record elements");
                }
                self.pending.extend(frame.records);
            }
            Err(e) => warn!(frame = kind, error = %e, "Dropping undecodable frame"),
        }
    }
}

#[async_trait]
impl<S> Connection for WebSocketConnection<S>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin
        + Send,
{
    async fn next_record(&mut self) -> Result<Option<RawRecord>, TransportError> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Ok(Some(record));
            }

            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame = self.decoder.decode_text(text.as_str());
                    self.buffer(frame, "text");
                }
                Some(Ok(Message::Binary(data))) => {
                    let frame = self.decoder.decode_binary(&data);
                    self.buffer(frame, "binary");
                }
                Some(Ok(Message::Ping(data))) => {
                    self.socket
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| TransportError::StreamFailed(e.to_string()))?;
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Feed sent close frame");
                    return Ok(None);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::StreamFailed(e.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.socket.close().await {
            debug!(error = %e, "Error closing feed socket");
        }
    }
}

impl<S> std::fmt::Debug for WebSocketConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("decoder", &self.decoder)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
