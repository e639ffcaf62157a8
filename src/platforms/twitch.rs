use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::config::Credentials;
use crate::platforms::{
    check_status, connect_websocket, http_client, ChatTransport, EventSender, Identity, OpenedSession, SocketWriter, TransportError, TransportEvent,
    TransportSession, TranslateError, WebSocket,
};
use crate::types::{ChatMessage, ChatUser, MessageType, Platform, PlatformMessage, PlatformUser, TwitchMessage, TwitchUser};

pub const DEFAULT_SERVER_URL: &str = "wss://irc-ws.chat.twitch.tv:443";
pub const DEFAULT_VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";
const SERVER_HOST: &str = "tmi.twitch.tv";

/// Configuration for Twitch connection
#[derive(Debug, Clone)]
pub struct TwitchConfig {
    pub server_url: String,
    pub validate_url: String,
    /// How long to wait for the server welcome after logging in
    pub handshake_timeout: Duration,
}

impl Default for TwitchConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            validate_url: DEFAULT_VALIDATE_URL.to_string(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

// =================================================================
// IRC LINE PARSING
// =================================================================

/// One IRCv3 line: `@tags :prefix COMMAND params :trailing`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IrcMessage {
    pub tags: HashMap<String, String>,
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
    pub raw: String,
}

impl IrcMessage {
    pub fn parse(line: &str) -> Option<Self> {
        let raw = line.trim_end_matches(['\r', '\n']);
        let mut rest = raw.trim_start();
        let mut tags = HashMap::new();

        if let Some(tagged) = rest.strip_prefix('@') {
            let (tag_part, remainder) = tagged.split_once(' ')?;
            for tag in tag_part.split(';').filter(|t| !t.is_empty()) {
                let (key, value) = tag.split_once('=').unwrap_or((tag, ""));
                tags.insert(key.to_string(), unescape_tag_value(value));
            }
            rest = remainder.trim_start();
        }

        let mut prefix = None;
        if let Some(prefixed) = rest.strip_prefix(':') {
            let (source, remainder) = prefixed.split_once(' ')?;
            prefix = Some(source.to_string());
            rest = remainder.trim_start();
        }

        let (command, mut rest) = rest.split_once(' ').unwrap_or((rest, ""));
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start();
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((middle, remainder)) => {
                    params.push(middle.to_string());
                    rest = remainder;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Some(Self {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
            raw: raw.to_string(),
        })
    }

    /// Nick part of `nick!user@host`
    pub fn nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        let nick = prefix.split('!').next().unwrap_or(prefix);
        (!nick.is_empty()).then_some(nick)
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }
}

/// Reverse IRCv3 tag escaping
fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn badge_names(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .filter_map(|b| b.split('/').next())
        .filter(|b| !b.is_empty())
        .map(String::from)
        .collect()
}

fn strip_action(text: &str) -> &str {
    text.strip_prefix("\u{1}ACTION ")
        .map(|t| t.strip_suffix('\u{1}').unwrap_or(t))
        .unwrap_or(text)
}

// =================================================================
// TRANSPORT
// =================================================================

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    login: String,
    user_id: String,
}

/// Twitch IRC-over-websocket transport.
///
/// Without a token the session logs in anonymously as `justinfanNNNNN`,
/// which can read chat but not send.
pub struct TwitchTransport {
    config: TwitchConfig,
    http: reqwest::Client,
}

impl TwitchTransport {
    pub fn new(config: TwitchConfig) -> Self {
        Self {
            config,
            http: http_client(),
        }
    }

    fn anonymous_identity() -> Identity {
        let suffix = 10_000 + (uuid::Uuid::new_v4().as_u128() % 80_000) as u32;
        let username = format!("justinfan{}", suffix);
        Identity {
            user_id: String::new(),
            username: username.clone(),
            display_name: username,
        }
    }

    fn is_anonymous(identity: &Identity) -> bool {
        identity.user_id.is_empty() && identity.username.starts_with("justinfan")
    }

    /// Read until the server welcomes us or rejects the login
    async fn await_welcome(read: &mut SplitStream<WebSocket>, writer: &SocketWriter) -> Result<()> {
        while let Some(frame) = read.next().await {
            let text = match frame.context("Twitch socket failed during login")? {
                Message::Text(text) => text,
                Message::Close(frame) => {
                    return Err(TransportError::Protocol(format!("closed during login: {:?}", frame)).into());
                }
                _ => continue,
            };

            for message in text.lines().filter_map(IrcMessage::parse) {
                match message.command.as_str() {
                    "001" => return Ok(()),
                    "PING" => {
                        writer.send_text(format!("PONG :{}", message.param(0).unwrap_or_default())).await?;
                    }
                    "NOTICE" => {
                        let notice = message.params.last().cloned().unwrap_or_default();
                        if notice.contains("authentication failed") || notice.contains("Improperly formatted auth") {
                            return Err(TransportError::Authentication(notice).into());
                        }
                    }
                    _ => {}
                }
            }
        }
        Err(TransportError::Closed.into())
    }

    async fn read_loop(mut read: SplitStream<WebSocket>, writer: Arc<SocketWriter>, events: EventSender<IrcMessage>) {
        info!("Twitch message reader started");

        let reason = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let mut receiver_gone = false;
                    // One frame may carry several lines
                    for line in text.lines().filter(|l| !l.trim().is_empty()) {
                        let Some(message) = IrcMessage::parse(line) else {
                            debug!("Unparseable IRC line: {}", line);
                            continue;
                        };

                        match message.command.as_str() {
                            "PING" => {
                                debug!("Responding to PING");
                                let pong = format!("PONG :{}", message.param(0).unwrap_or("tmi.twitch.tv"));
                                if let Err(e) = writer.send_text(pong).await {
                                    error!("Failed to send PONG: {}", e);
                                }
                            }
                            "RECONNECT" => {
                                warn!("Twitch requested a reconnect");
                                let _ = events.send(TransportEvent::Closed(Some("server requested reconnect".into())));
                                return;
                            }
                            _ => {
                                if events.send(TransportEvent::Event(message)).is_err() {
                                    receiver_gone = true;
                                    break;
                                }
                            }
                        }
                    }
                    if receiver_gone {
                        return;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = writer.send(Message::Pong(payload)).await {
                        error!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Close(close_frame))) => {
                    info!("WebSocket connection closed: {:?}", close_frame);
                    break Some(format!("closed by server: {:?}", close_frame));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    break Some(e.to_string());
                }
                None => break Some("stream ended".to_string()),
            }
        };

        let _ = events.send(TransportEvent::Closed(reason));
        warn!("Twitch connection handler exited");
    }

    /// The server itself, as the author of notices and room-wide moderation
    fn server_user(message: &IrcMessage) -> ChatUser {
        let host = message.nick().unwrap_or(SERVER_HOST);
        ChatUser::new(host, host).with_platform(PlatformUser::Twitch(TwitchUser {
            login: host.to_string(),
            badges: Vec::new(),
        }))
    }

    fn chat_user(message: &IrcMessage, login: &str) -> ChatUser {
        let display_name = message.tag("display-name").unwrap_or(login);
        let id = message.tag("user-id").unwrap_or(login);
        ChatUser::new(id, display_name)
            .with_color(message.tag("color").unwrap_or_default())
            .with_platform(PlatformUser::Twitch(TwitchUser {
                login: login.to_string(),
                badges: badge_names(message.tag("badges")),
            }))
    }
}

impl Default for TwitchTransport {
    fn default() -> Self {
        Self::new(TwitchConfig::default())
    }
}

#[async_trait]
impl ChatTransport for TwitchTransport {
    type Event = IrcMessage;

    fn platform(&self) -> Platform {
        Platform::Twitch
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity> {
        if credentials.token.is_empty() {
            let identity = Self::anonymous_identity();
            info!("No Twitch token configured, joining anonymously as {}", identity.username);
            return Ok(identity);
        }

        let response = self
            .http
            .get(&self.config.validate_url)
            .header("Authorization", format!("OAuth {}", credentials.bare_token()))
            .send()
            .await
            .context("Failed to reach the Twitch token endpoint")?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TransportError::Authentication("Twitch rejected the OAuth token".to_string()).into());
        }
        let validated: ValidateResponse = check_status(Platform::Twitch, response)
            .await?
            .json()
            .await
            .context("Failed to parse Twitch token validation")?;

        if !credentials.username.is_empty() && !credentials.username.eq_ignore_ascii_case(&validated.login) {
            warn!(
                "TWITCH_USERNAME '{}' does not match the token owner '{}', using the token owner",
                credentials.username, validated.login
            );
        }

        Ok(Identity {
            user_id: validated.user_id,
            display_name: validated.login.clone(),
            username: validated.login,
        })
    }

    async fn resolve_channel(&self, identity: &Identity, credentials: &Credentials) -> Result<String> {
        let channel = if credentials.channel.is_empty() {
            identity.username.to_lowercase()
        } else {
            credentials.channel.trim_start_matches('#').to_lowercase()
        };
        if channel.is_empty() || channel.starts_with("justinfan") {
            return Err(TransportError::ChannelNotFound("no Twitch channel configured".to_string()).into());
        }
        Ok(channel)
    }

    async fn open(&self, identity: &Identity, channel: &str, credentials: &Credentials) -> Result<OpenedSession<IrcMessage>> {
        let url = Url::parse(&self.config.server_url).context("Failed to parse Twitch WebSocket URL")?;
        let ws_stream = connect_websocket(url, self.config.handshake_timeout)
            .await
            .context("Failed to connect to Twitch WebSocket")?;
        let (write, mut read) = ws_stream.split();
        let writer = Arc::new(SocketWriter::new("Twitch", write));

        let anonymous = Self::is_anonymous(identity);
        if !anonymous {
            let token = format!("oauth:{}", credentials.bare_token());
            writer.send_text(format!("PASS {}", token)).await.context("Failed to send PASS command")?;
        }
        writer
            .send_text(format!("NICK {}", identity.username))
            .await
            .context("Failed to send NICK command")?;
        writer
            .send_text("CAP REQ :twitch.tv/tags twitch.tv/commands")
            .await
            .context("Failed to request capabilities")?;

        match tokio::time::timeout(self.config.handshake_timeout, Self::await_welcome(&mut read, &writer)).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Protocol("timed out waiting for the Twitch welcome".to_string()).into()),
        }

        writer
            .send_text(format!("JOIN #{}", channel))
            .await
            .with_context(|| format!("Failed to join channel: {}", channel))?;
        info!("Joined channel: #{}", channel);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(Self::read_loop(read, Arc::clone(&writer), events_tx));

        Ok(OpenedSession {
            session: Box::new(TwitchSession {
                writer,
                reader,
                channel: channel.to_string(),
                read_only: anonymous,
            }),
            events: events_rx,
        })
    }

    fn translate(&self, channel: &str, event: IrcMessage) -> Result<Option<ChatMessage>, TranslateError> {
        let target_channel = event
            .param(0)
            .map(|c| c.trim_start_matches('#').to_string())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| channel.to_string());

        let (message_type, body, user) = match event.command.as_str() {
            "PRIVMSG" => {
                let text = event.param(1).ok_or(TranslateError::MissingField("message"))?;
                let login = event.nick().ok_or(TranslateError::MissingField("prefix"))?;
                (MessageType::Message, strip_action(text).to_string(), Self::chat_user(&event, login))
            }
            "JOIN" | "PART" => {
                let login = event.nick().ok_or(TranslateError::MissingField("prefix"))?;
                let message_type = if event.command == "JOIN" { MessageType::Join } else { MessageType::Part };
                (message_type, String::new(), Self::chat_user(&event, login))
            }
            "CLEARCHAT" => {
                // No target means the whole chat was cleared
                let user = match event.param(1).filter(|login| !login.is_empty()) {
                    Some(login) => ChatUser::new(event.tag("target-user-id").unwrap_or(login), login).with_platform(
                        PlatformUser::Twitch(TwitchUser {
                            login: login.to_string(),
                            badges: Vec::new(),
                        }),
                    ),
                    None => Self::server_user(&event),
                };
                (MessageType::Moderation, String::new(), user)
            }
            "CLEARMSG" => {
                let login = event.tag("login").unwrap_or_default();
                let user = ChatUser::new(login, login).with_platform(PlatformUser::Twitch(TwitchUser {
                    login: login.to_string(),
                    badges: Vec::new(),
                }));
                (MessageType::Moderation, event.param(1).unwrap_or_default().to_string(), user)
            }
            "NOTICE" => {
                let text = event.params.last().ok_or(TranslateError::MissingField("message"))?;
                (MessageType::Notice, text.clone(), Self::server_user(&event))
            }
            "USERNOTICE" => {
                let body = event
                    .param(1)
                    .or_else(|| event.tag("system-msg"))
                    .unwrap_or_default()
                    .to_string();
                let login = event.tag("login").unwrap_or_default().to_string();
                (MessageType::Notice, body, Self::chat_user(&event, &login))
            }
            _ => return Ok(None),
        };

        let id = match event.command.as_str() {
            "CLEARMSG" => event.tag("target-msg-id"),
            _ => event.tag("id"),
        }
        .unwrap_or_default()
        .to_string();

        let message = ChatMessage::new(message_type, body, user)
            .with_id(id)
            .with_channel(target_channel)
            .with_platform(PlatformMessage::Twitch(TwitchMessage {
                tags: event.tags,
                raw: event.raw,
            }));
        Ok(Some(message))
    }
}

/// Live Twitch IRC session
struct TwitchSession {
    writer: Arc<SocketWriter>,
    reader: JoinHandle<()>,
    channel: String,
    read_only: bool,
}

#[async_trait]
impl TransportSession for TwitchSession {
    async fn send(&self, text: &str) -> Result<()> {
        if self.read_only {
            return Err(TransportError::Authentication("anonymous Twitch sessions cannot send".to_string()).into());
        }
        // A newline would end the IRC line early
        let line = text.replace(['\r', '\n'], " ");
        self.writer.send_text(format!("PRIVMSG #{} :{}", self.channel, line)).await?;
        debug!("Sent message to #{}: {}", self.channel, line);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.reader.abort();
        self.writer.close().await
    }
}
