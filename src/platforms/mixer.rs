// src/platforms/mixer.rs - Mixer REST discovery and JSON websocket chat protocol

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::config::Credentials;
use crate::platforms::{
    api_status, check_status, connect_websocket, http_client, ChatTransport, EventSender, Identity, OpenedSession, SocketWriter, TransportError, TransportEvent,
    TransportSession, TranslateError, WebSocket,
};
use crate::types::{assemble_fragments, ChatMessage, ChatUser, MessageType, MixerMessage, MixerUser, Platform, PlatformMessage, PlatformUser};

pub const DEFAULT_API_BASE: &str = "https://mixer.com/api/v1";

/// Request id of the `auth` method call
const AUTH_REQUEST_ID: u64 = 0;

#[derive(Debug, Clone)]
pub struct MixerConfig {
    pub api_base: String,
    pub handshake_timeout: Duration,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

// =================================================================
// WIRE MODEL
// =================================================================

/// One piece of a chat message: text, emoticon, link, tag...
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageFragment {
    #[serde(rename = "type", default)]
    pub fragment_type: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default)]
    pub message: Vec<MessageFragment>,
    /// Flags such as `me` or `whisper`
    #[serde(default)]
    pub meta: Value,
}

/// Payload of the `ChatMessage` socket event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessageEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub channel: u64,
    #[serde(default)]
    pub user_id: u64,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_roles: Vec<String>,
    #[serde(default)]
    pub user_level: u32,
    #[serde(default)]
    pub user_avatar: Option<String>,
    #[serde(default)]
    pub message: MessageContent,
    /// Set on whispers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Payload of `UserJoin` / `UserLeave`
#[derive(Debug, Deserialize)]
struct UserPresence {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    username: String,
    #[serde(default)]
    roles: Vec<String>,
}

/// A raw `{"type": "event"}` frame from the chat socket
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MixerEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Frame {
    Event(MixerEvent),
    Reply {
        id: u64,
        #[serde(default)]
        error: Value,
        #[serde(default)]
        data: Value,
    },
}

#[derive(Debug, Deserialize)]
struct CurrentUser {
    id: u64,
    username: String,
    channel: ChannelInfo,
}

#[derive(Debug, Deserialize)]
struct ChannelInfo {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct ChatDetails {
    endpoints: Vec<String>,
    #[serde(default)]
    authkey: String,
}

fn method_call(id: u64, method: &str, arguments: Value) -> String {
    json!({ "type": "method", "method": method, "arguments": arguments, "id": id }).to_string()
}

// =================================================================
// TRANSPORT
// =================================================================

pub struct MixerTransport {
    config: MixerConfig,
    http: reqwest::Client,
}

impl MixerTransport {
    pub fn new(config: MixerConfig) -> Self {
        Self {
            config,
            http: http_client(),
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str, token: &str) -> Result<T> {
        let url = format!("{}/{}", self.config.api_base.trim_end_matches('/'), path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("Failed to reach Mixer API: {}", path))?;
        check_status(Platform::Mixer, response)
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to parse Mixer response for {}", path))
    }

    /// Send `auth` and wait for its reply
    async fn authenticate_socket(
        read: &mut SplitStream<WebSocket>,
        writer: &SocketWriter,
        channel_id: &str,
        identity: &Identity,
        authkey: &str,
    ) -> Result<()> {
        let user_id: u64 = identity.user_id.parse().unwrap_or_default();
        let channel_id: u64 = channel_id
            .parse()
            .map_err(|_| TransportError::ChannelNotFound(channel_id.to_string()))?;
        writer
            .send_text(method_call(AUTH_REQUEST_ID, "auth", json!([channel_id, user_id, authkey])))
            .await
            .context("Failed to send Mixer auth method")?;

        while let Some(frame) = read.next().await {
            let text = match frame.context("Mixer socket failed during auth")? {
                Message::Text(text) => text,
                Message::Close(frame) => {
                    return Err(TransportError::Protocol(format!("closed during auth: {:?}", frame)).into());
                }
                _ => continue,
            };

            match serde_json::from_str::<Frame>(&text) {
                Ok(Frame::Reply { id, error, data }) if id == AUTH_REQUEST_ID => {
                    if !error.is_null() {
                        return Err(TransportError::Authentication(error.to_string()).into());
                    }
                    if data.get("authenticated").and_then(Value::as_bool) != Some(true) {
                        return Err(TransportError::Authentication("chat auth was not accepted".to_string()).into());
                    }
                    return Ok(());
                }
                Ok(_) => debug!("Ignoring Mixer frame before auth reply"),
                Err(e) => debug!("Unparseable Mixer frame: {}", e),
            }
        }
        Err(TransportError::Closed.into())
    }

    async fn read_loop(mut read: SplitStream<WebSocket>, writer: Arc<SocketWriter>, events: EventSender<MixerEvent>) {
        info!("Mixer message reader started");

        let reason = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(&text) {
                    Ok(Frame::Event(event)) => {
                        if events.send(TransportEvent::Event(event)).is_err() {
                            return;
                        }
                    }
                    Ok(Frame::Reply { id, error, .. }) => {
                        if error.is_null() {
                            debug!("Mixer reply {} ok", id);
                        } else {
                            warn!("Mixer method {} failed: {}", id, error);
                        }
                    }
                    Err(e) => debug!("Unparseable Mixer frame: {}", e),
                },
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = writer.send(Message::Pong(payload)).await {
                        error!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Close(close_frame))) => {
                    info!("Mixer socket closed: {:?}", close_frame);
                    break Some(format!("closed by server: {:?}", close_frame));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("Mixer socket error: {}", e);
                    break Some(e.to_string());
                }
                None => break Some("stream ended".to_string()),
            }
        };

        let _ = events.send(TransportEvent::Closed(reason));
    }

    fn presence(channel: &str, message_type: MessageType, event: MixerEvent) -> Result<ChatMessage, TranslateError> {
        let presence: UserPresence = serde_json::from_value(event.data.clone())?;
        let user = ChatUser::new(presence.id.to_string(), presence.username).with_platform(PlatformUser::Mixer(MixerUser {
            avatar: String::new(),
            roles: presence.roles,
        }));
        Ok(ChatMessage::new(message_type, "", user)
            .with_channel(channel)
            .with_platform(Self::passthrough(event)))
    }

    fn moderation(channel: &str, event: MixerEvent) -> ChatMessage {
        let moderator = event.data.get("moderator").cloned().unwrap_or(Value::Null);
        let roles = moderator
            .get("user_roles")
            .and_then(|roles| serde_json::from_value::<Vec<String>>(roles.clone()).ok())
            .unwrap_or_default();
        let user = ChatUser::new(
            match moderator.get("user_id") {
                Some(Value::String(id)) => id.clone(),
                Some(Value::Number(id)) => id.to_string(),
                _ => String::new(),
            },
            moderator.get("user_name").and_then(Value::as_str).unwrap_or_default(),
        )
        .with_platform(PlatformUser::Mixer(MixerUser {
            avatar: String::new(),
            roles,
        }));
        let target = event.data.get("id").and_then(Value::as_str).unwrap_or_default().to_string();

        ChatMessage::new(MessageType::Moderation, event.event.clone(), user)
            .with_id(target)
            .with_channel(channel)
            .with_platform(Self::passthrough(event))
    }

    /// Payload for events that have no typed model
    fn passthrough(event: MixerEvent) -> PlatformMessage {
        PlatformMessage::Mixer(MixerMessage {
            event_name: event.event,
            event: ChatMessageEvent::default(),
            data: event.data,
        })
    }
}

impl Default for MixerTransport {
    fn default() -> Self {
        Self::new(MixerConfig::default())
    }
}

#[async_trait]
impl ChatTransport for MixerTransport {
    type Event = MixerEvent;

    fn platform(&self) -> Platform {
        Platform::Mixer
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity> {
        if credentials.token.is_empty() {
            return Err(TransportError::Authentication("Mixer requires an OAuth token".to_string()).into());
        }
        let user: CurrentUser = self.get("users/current", &credentials.token).await?;
        debug!("Mixer token belongs to {} (channel {})", user.username, user.channel.id);
        Ok(Identity {
            user_id: user.id.to_string(),
            display_name: user.username.clone(),
            username: user.username,
        })
    }

    /// Resolves to the numeric channel id
    async fn resolve_channel(&self, identity: &Identity, credentials: &Credentials) -> Result<String> {
        let name = if credentials.channel.is_empty() {
            identity.username.as_str()
        } else {
            credentials.channel.as_str()
        };
        let channel: ChannelInfo = self
            .get(&format!("channels/{}", name), &credentials.token)
            .await
            .map_err(|e| match api_status(&e) {
                Some(404) => anyhow::Error::from(TransportError::ChannelNotFound(name.to_string())),
                _ => e,
            })?;
        Ok(channel.id.to_string())
    }

    async fn open(&self, identity: &Identity, channel: &str, credentials: &Credentials) -> Result<OpenedSession<MixerEvent>> {
        let details: ChatDetails = self.get(&format!("chats/{}", channel), &credentials.token).await?;

        let mut last_error = None;
        for endpoint in &details.endpoints {
            let url = match Url::parse(endpoint) {
                Ok(url) => url,
                Err(e) => {
                    warn!("Skipping invalid Mixer chat endpoint {}: {}", endpoint, e);
                    continue;
                }
            };
            match connect_websocket(url, self.config.handshake_timeout).await {
                Ok(ws_stream) => {
                    let (write, mut read) = ws_stream.split();
                    let writer = Arc::new(SocketWriter::new("Mixer", write));

                    let handshake = Self::authenticate_socket(&mut read, &writer, channel, identity, &details.authkey);
                    match tokio::time::timeout(self.config.handshake_timeout, handshake).await {
                        Ok(result) => result?,
                        Err(_) => return Err(TransportError::Protocol("timed out waiting for Mixer auth".to_string()).into()),
                    }

                    let (events_tx, events_rx) = mpsc::unbounded_channel();
                    let reader = tokio::spawn(Self::read_loop(read, Arc::clone(&writer), events_tx));
                    info!("Mixer chat authenticated on {}", endpoint);

                    return Ok(OpenedSession {
                        session: Box::new(MixerSession {
                            writer,
                            reader,
                            next_id: AtomicU64::new(AUTH_REQUEST_ID + 1),
                        }),
                        events: events_rx,
                    });
                }
                Err(e) => {
                    warn!("Mixer chat endpoint {} unreachable: {:#}", endpoint, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e).context("No Mixer chat endpoint accepted the connection"),
            None => Err(TransportError::Protocol("Mixer returned no chat endpoints".to_string()).into()),
        }
    }

    fn translate(&self, channel: &str, event: MixerEvent) -> Result<Option<ChatMessage>, TranslateError> {
        let message = match event.event.as_str() {
            "ChatMessage" => {
                let chat: ChatMessageEvent = serde_json::from_value(event.data.clone())?;
                if chat.user_name.is_empty() {
                    return Err(TranslateError::MissingField("user_name"));
                }
                let body = assemble_fragments(chat.message.message.iter().map(|f| f.text.as_str()));
                // Mixer role colors are not mapped
                let user = ChatUser::new(chat.user_id.to_string(), chat.user_name.clone()).with_platform(PlatformUser::Mixer(
                    MixerUser {
                        avatar: chat.user_avatar.clone().unwrap_or_default(),
                        roles: chat.user_roles.clone(),
                    },
                ));
                ChatMessage::new(MessageType::Message, body, user)
                    .with_id(chat.id.clone())
                    .with_channel(channel)
                    .with_platform(PlatformMessage::Mixer(MixerMessage {
                        event_name: event.event,
                        event: chat,
                        data: event.data,
                    }))
            }
            "UserJoin" => Self::presence(channel, MessageType::Join, event)?,
            "UserLeave" => Self::presence(channel, MessageType::Part, event)?,
            "DeleteMessage" | "PurgeMessage" | "ClearMessages" | "UserTimeout" => Self::moderation(channel, event),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

/// Live Mixer chat socket
struct MixerSession {
    writer: Arc<SocketWriter>,
    reader: JoinHandle<()>,
    next_id: AtomicU64,
}

#[async_trait]
impl TransportSession for MixerSession {
    async fn send(&self, text: &str) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.writer.send_text(method_call(id, "msg", json!([text]))).await?;
        debug!("Sent Mixer message {}: {}", id, text);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.reader.abort();
        self.writer.close().await
    }
}
