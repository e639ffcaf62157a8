use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::SinkExt;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::config::Credentials;
use crate::types::{ChatMessage, Platform};

pub mod mixer;
pub mod twitch;
pub mod youtube;

// Type aliases for cleaner code
pub(crate) type WebSocket = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub(crate) type WebSocketWriter = futures_util::stream::SplitSink<WebSocket, Message>;

/// Typed failures raised by platform transports
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("{0} API returned {1}: {2}")]
    Api(Platform, u16, String),
    #[error("connection closed")]
    Closed,
}

/// Why a single raw event could not be turned into a [`ChatMessage`]
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// The account a transport authenticated as
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub display_name: String,
}

/// What a live session pushes to its connection manager
#[derive(Debug)]
pub enum TransportEvent<E> {
    /// A raw platform event, to be translated and dispatched
    Event(E),
    /// The session is gone; the reason is logged
    Closed(Option<String>),
}

pub type EventSender<E> = mpsc::UnboundedSender<TransportEvent<E>>;
pub type EventReceiver<E> = mpsc::UnboundedReceiver<TransportEvent<E>>;

/// Handle to one open realtime session
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Send a chat line to the joined channel
    async fn send(&self, text: &str) -> Result<()>;

    /// Close the session. Must be safe to call more than once.
    async fn close(&self) -> Result<()>;
}

/// A freshly opened session plus the stream of its raw events
pub struct OpenedSession<E> {
    pub session: Box<dyn TransportSession>,
    pub events: EventReceiver<E>,
}

/// Interface every platform adapter implements.
///
/// The connection manager drives these steps in order on every (re)connect:
/// `authenticate`, `resolve_channel`, `open`. Raw events coming out of the
/// session go through `translate` one at a time.
#[async_trait]
pub trait ChatTransport: Send + Sync + 'static {
    /// Raw event type produced by this platform's session
    type Event: Send + 'static;

    fn platform(&self) -> Platform;

    /// Verify the credentials and find out who we are
    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity>;

    /// Turn the configured channel into the identifier `open` needs
    async fn resolve_channel(&self, identity: &Identity, credentials: &Credentials) -> Result<String>;

    /// Open the realtime session for `channel`
    async fn open(&self, identity: &Identity, channel: &str, credentials: &Credentials) -> Result<OpenedSession<Self::Event>>;

    /// Convert one raw event. `Ok(None)` means the event has no chat meaning.
    fn translate(&self, channel: &str, event: Self::Event) -> Result<Option<ChatMessage>, TranslateError>;
}

/// Write half of a websocket shared between a session and its reader task
pub(crate) struct SocketWriter {
    label: &'static str,
    writer: Mutex<WebSocketWriter>,
    closed: AtomicBool,
}

impl SocketWriter {
    pub(crate) fn new(label: &'static str, writer: WebSocketWriter) -> Self {
        Self {
            label,
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) async fn send(&self, message: Message) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed.into());
        }
        self.writer
            .lock()
            .await
            .send(message)
            .await
            .with_context(|| format!("Failed to write to {} socket", self.label))
    }

    pub(crate) async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Message::Text(text.into())).await
    }

    /// Send a close frame once; later calls do nothing
    pub(crate) async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.writer.lock().await.close().await {
            // The peer may already be gone
            debug!("{} socket close: {}", self.label, e);
        }
        Ok(())
    }
}

/// Whole-request limit for every REST call the adapters make
pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .connect_timeout(HTTP_CONNECT_TIMEOUT)
        .build()
        .unwrap_or_else(|e| {
            warn!("Could not build HTTP client with timeouts, using defaults: {}", e);
            reqwest::Client::new()
        })
}

/// Open a websocket, giving up after `limit`
pub(crate) async fn connect_websocket(url: Url, limit: Duration) -> Result<WebSocket> {
    let host = url.host_str().unwrap_or_default().to_string();
    match tokio::time::timeout(limit, connect_async(url)).await {
        Ok(result) => {
            let (ws_stream, _) = result.with_context(|| format!("websocket connect to {} failed", host))?;
            Ok(ws_stream)
        }
        Err(_) => Err(TransportError::Protocol(format!("websocket connect to {} timed out after {:?}", host, limit)).into()),
    }
}

/// Turn a non-2xx response into [`TransportError::Api`]
pub(crate) async fn check_status(platform: Platform, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
    Err(TransportError::Api(platform, status.as_u16(), body).into())
}

/// HTTP status of a failed API call, if that is what `error` is
pub(crate) fn api_status(error: &anyhow::Error) -> Option<u16> {
    match error.downcast_ref::<TransportError>() {
        Some(TransportError::Api(_, status, _)) => Some(*status),
        _ => None,
    }
}
