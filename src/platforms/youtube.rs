use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::config::Credentials;
use crate::platforms::{
    api_status, check_status, http_client, ChatTransport, EventSender, Identity, OpenedSession, TransportError, TransportEvent,
    TransportSession, TranslateError,
};
use crate::types::{ChatMessage, ChatUser, MessageType, Platform, PlatformMessage, PlatformUser, YouTubeMessage, YouTubeUser};

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/youtube/v3";

pub const OWNER_COLOR: &str = "#FFD600";
pub const MODERATOR_COLOR: &str = "#5E84F1";
pub const SPONSOR_COLOR: &str = "#2BA640";

/// YouTube API response structures
#[derive(Debug, Deserialize)]
struct YouTubeResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "pollingIntervalMillis")]
    polling_interval_millis: Option<u64>,
    #[serde(rename = "offlineAt")]
    offline_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LiveChatMessage {
    #[serde(default)]
    id: String,
    snippet: LiveChatMessageSnippet,
    #[serde(rename = "authorDetails")]
    author_details: AuthorDetails,
}

#[derive(Debug, Deserialize)]
struct LiveChatMessageSnippet {
    #[serde(rename = "type")]
    message_type: String,
    #[serde(rename = "displayMessage")]
    display_message: Option<String>,
    #[serde(rename = "textMessageDetails")]
    text_message_details: Option<TextMessageDetails>,
}

#[derive(Debug, Deserialize)]
struct AuthorDetails {
    #[serde(rename = "channelId")]
    channel_id: String,
    #[serde(rename = "displayName")]
    display_name: String,
    #[serde(rename = "isChatModerator", default)]
    is_chat_moderator: bool,
    #[serde(rename = "isChatOwner", default)]
    is_chat_owner: bool,
    #[serde(rename = "isChatSponsor", default)]
    is_chat_sponsor: bool,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest {
    snippet: SendMessageSnippet,
}

#[derive(Debug, Serialize)]
struct SendMessageSnippet {
    #[serde(rename = "liveChatId")]
    live_chat_id: String,
    #[serde(rename = "textMessageDetails")]
    text_message_details: TextMessageDetails,
    #[serde(rename = "type")]
    message_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct TextMessageDetails {
    #[serde(rename = "messageText")]
    message_text: String,
}

/// Configuration for YouTube Live Chat polling
#[derive(Debug, Clone)]
pub struct YouTubeConfig {
    pub api_base: String,
    /// Optional API key sent alongside the bearer token
    pub api_key: Option<String>,
    /// Used when the API does not suggest an interval
    pub polling_interval_ms: u64,
    /// Ceiling of the error backoff
    pub max_backoff: Duration,
}

impl Default for YouTubeConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            polling_interval_ms: 5000,
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl YouTubeConfig {
    /// Load YouTube configuration from environment variables
    pub fn from_env() -> Self {
        let api_key = env::var("YOUTUBE_API_KEY").ok().filter(|k| !k.trim().is_empty());
        let polling_interval_ms = env::var("YOUTUBE_POLLING_INTERVAL")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(5000);

        Self {
            api_key,
            polling_interval_ms,
            ..Self::default()
        }
    }

    fn poll_interval(&self, suggested: Option<u64>) -> Duration {
        // Never poll faster than the API asks
        Duration::from_millis(suggested.unwrap_or(0).max(self.polling_interval_ms))
    }
}

/// Thin client over the Data API endpoints the transport uses
#[derive(Clone)]
struct YouTubeApi {
    config: YouTubeConfig,
    http: reqwest::Client,
}

impl YouTubeApi {
    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str, query: &[(&str, &str)], token: &str) -> Result<T> {
        let url = format!("{}/{}", self.config.api_base.trim_end_matches('/'), path);
        let mut request = self.http.get(&url).bearer_auth(token).query(query);
        if let Some(key) = &self.config.api_key {
            request = request.query(&[("key", key.as_str())]);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach YouTube API: {}", path))?;
        check_status(Platform::YouTube, response)
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to parse YouTube response for {}", path))
    }

    async fn poll(&self, live_chat_id: &str, page_token: Option<&str>, token: &str) -> Result<YouTubeResponse<Value>> {
        let mut query = vec![("liveChatId", live_chat_id), ("part", "snippet,authorDetails")];
        if let Some(page) = page_token {
            query.push(("pageToken", page));
        }
        self.get("liveChat/messages", &query, token).await
    }

    async fn send(&self, live_chat_id: &str, text: &str, token: &str) -> Result<()> {
        let request = SendMessageRequest {
            snippet: SendMessageSnippet {
                live_chat_id: live_chat_id.to_string(),
                text_message_details: TextMessageDetails {
                    message_text: text.to_string(),
                },
                message_type: "textMessageEvent".to_string(),
            },
        };

        let url = format!("{}/liveChat/messages", self.config.api_base.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .query(&[("part", "snippet")])
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
            .context("Failed to send YouTube Live Chat message")?;
        check_status(Platform::YouTube, response).await?;
        debug!("Sent YouTube message: {}", text);
        Ok(())
    }
}

/// Whether a poll failure means the chat is gone for good
fn is_terminal(error: &anyhow::Error) -> bool {
    match api_status(error) {
        Some(401) | Some(403) | Some(404) => true,
        Some(_) => false,
        None => matches!(error.downcast_ref::<TransportError>(), Some(TransportError::Closed)),
    }
}

/// Data API v3 live chat transport. Reads by polling, sends with a POST.
pub struct YouTubeTransport {
    api: YouTubeApi,
}

impl YouTubeTransport {
    pub fn new(config: YouTubeConfig) -> Self {
        Self {
            api: YouTubeApi {
                config,
                http: http_client(),
            },
        }
    }

    async fn poll_loop(
        api: YouTubeApi,
        live_chat_id: String,
        token: String,
        mut page_token: Option<String>,
        mut interval: Duration,
        events: EventSender<Value>,
    ) {
        info!("YouTube Live Chat message poller started");
        let base_interval = Duration::from_millis(api.config.polling_interval_ms);

        let reason = loop {
            sleep(interval).await;

            match api.poll(&live_chat_id, page_token.as_deref(), &token).await {
                Ok(page) => {
                    debug!("Polled {} new YouTube messages", page.items.len());
                    for item in page.items {
                        if events.send(TransportEvent::Event(item)).is_err() {
                            return;
                        }
                    }
                    if page.offline_at.is_some() {
                        break "live chat ended".to_string();
                    }
                    page_token = page.next_page_token.or(page_token);
                    interval = api.config.poll_interval(page.polling_interval_millis);
                }
                Err(e) if is_terminal(&e) => {
                    error!("YouTube live chat is no longer readable: {:#}", e);
                    break format!("{:#}", e);
                }
                Err(e) => {
                    error!("Failed to poll YouTube messages: {:#}", e);
                    interval = std::cmp::min(interval.max(base_interval) * 2, api.config.max_backoff);
                    warn!("Backing off polling interval to {:?}", interval);
                }
            }
        };

        let _ = events.send(TransportEvent::Closed(Some(reason)));
        warn!("YouTube Live Chat message poller stopped");
    }

    fn role_color(author: &AuthorDetails) -> &'static str {
        if author.is_chat_owner {
            OWNER_COLOR
        } else if author.is_chat_moderator {
            MODERATOR_COLOR
        } else if author.is_chat_sponsor {
            SPONSOR_COLOR
        } else {
            ""
        }
    }

    fn message_type(kind: &str) -> Option<MessageType> {
        let message_type = match kind {
            "textMessageEvent" | "superChatEvent" | "superStickerEvent" => MessageType::Message,
            "messageDeletedEvent" | "userBannedEvent" => MessageType::Moderation,
            "newSponsorEvent" | "memberMilestoneChatEvent" | "membershipGiftingEvent" | "giftMembershipReceivedEvent"
            | "chatEndedEvent" | "sponsorOnlyModeStartedEvent" | "sponsorOnlyModeEndedEvent" => MessageType::Notice,
            "tombstone" => return None,
            other => MessageType::Other(other.to_string()),
        };
        Some(message_type)
    }
}

impl Default for YouTubeTransport {
    fn default() -> Self {
        Self::new(YouTubeConfig::default())
    }
}

#[async_trait]
impl ChatTransport for YouTubeTransport {
    type Event = Value;

    fn platform(&self) -> Platform {
        Platform::YouTube
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity> {
        if credentials.token.is_empty() {
            return Err(TransportError::Authentication("YouTube requires an OAuth token".to_string()).into());
        }

        let response: YouTubeResponse<Value> = self
            .api
            .get("channels", &[("part", "snippet"), ("mine", "true")], &credentials.token)
            .await?;
        let channel = response
            .items
            .first()
            .ok_or_else(|| TransportError::Authentication("token has no YouTube channel".to_string()))?;

        let user_id = channel.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
        let title = channel
            .pointer("/snippet/title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Identity {
            user_id,
            username: title.clone(),
            display_name: title,
        })
    }

    /// Resolves to the live chat id of the configured video, or of the active broadcast
    async fn resolve_channel(&self, _identity: &Identity, credentials: &Credentials) -> Result<String> {
        let live_chat_id = if credentials.channel.is_empty() {
            let response: YouTubeResponse<Value> = self
                .api
                .get(
                    "liveBroadcasts",
                    &[("part", "snippet"), ("broadcastStatus", "active"), ("broadcastType", "all")],
                    &credentials.token,
                )
                .await?;
            response
                .items
                .iter()
                .find_map(|b| b.pointer("/snippet/liveChatId").and_then(Value::as_str))
                .map(String::from)
        } else {
            let response: YouTubeResponse<Value> = self
                .api
                .get(
                    "videos",
                    &[("part", "liveStreamingDetails"), ("id", credentials.channel.as_str())],
                    &credentials.token,
                )
                .await?;
            response
                .items
                .first()
                .and_then(|v| v.pointer("/liveStreamingDetails/activeLiveChatId"))
                .and_then(Value::as_str)
                .map(String::from)
        };

        let live_chat_id = live_chat_id.ok_or_else(|| {
            let target = if credentials.channel.is_empty() {
                "active broadcast".to_string()
            } else {
                format!("video {}", credentials.channel)
            };
            TransportError::ChannelNotFound(format!("no active live chat for {}", target))
        })?;
        info!("Auto-discovered live chat ID: {}", live_chat_id);
        Ok(live_chat_id)
    }

    async fn open(&self, _identity: &Identity, channel: &str, credentials: &Credentials) -> Result<OpenedSession<Value>> {
        // The first page is backlog from before we joined
        let first = self
            .api
            .poll(channel, None, &credentials.token)
            .await
            .context("Failed to connect to YouTube Live Chat API")?;
        debug!("Skipping {} backlog YouTube messages", first.items.len());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let poller = tokio::spawn(Self::poll_loop(
            self.api.clone(),
            channel.to_string(),
            credentials.token.clone(),
            first.next_page_token,
            self.api.config.poll_interval(first.polling_interval_millis),
            events_tx,
        ));

        Ok(OpenedSession {
            session: Box::new(YouTubeSession {
                api: self.api.clone(),
                live_chat_id: channel.to_string(),
                token: credentials.token.clone(),
                poller,
            }),
            events: events_rx,
        })
    }

    fn translate(&self, channel: &str, event: Value) -> Result<Option<ChatMessage>, TranslateError> {
        let parsed: LiveChatMessage = serde_json::from_value(event.clone())?;
        let Some(message_type) = Self::message_type(&parsed.snippet.message_type) else {
            return Ok(None);
        };

        let body = parsed
            .snippet
            .display_message
            .or(parsed.snippet.text_message_details.map(|d| d.message_text))
            .unwrap_or_default();

        let author = event.get("authorDetails").cloned().unwrap_or(Value::Null);
        let user = ChatUser::new(parsed.author_details.channel_id.clone(), parsed.author_details.display_name.clone())
            .with_color(Self::role_color(&parsed.author_details))
            .with_platform(PlatformUser::YouTube(YouTubeUser { author_details: author }));

        let message = ChatMessage::new(message_type, body, user)
            .with_id(parsed.id)
            .with_channel(channel)
            .with_platform(PlatformMessage::YouTube(YouTubeMessage { live_chat_message: event }));
        Ok(Some(message))
    }
}

/// Live polling session
struct YouTubeSession {
    api: YouTubeApi,
    live_chat_id: String,
    token: String,
    poller: JoinHandle<()>,
}

#[async_trait]
impl TransportSession for YouTubeSession {
    async fn send(&self, text: &str) -> Result<()> {
        self.api.send(&self.live_chat_id, text, &self.token).await
    }

    async fn close(&self) -> Result<()> {
        self.poller.abort();
        Ok(())
    }
}

// A dropped session must not leave its poller running
impl Drop for YouTubeSession {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chat_item(kind: &str, owner: bool, moderator: bool, sponsor: bool) -> Value {
        json!({
            "kind": "youtube#liveChatMessage",
            "id": "LCC.abc",
            "snippet": {
                "type": kind,
                "liveChatId": "chat-1",
                "publishedAt": "2020-05-01T12:00:00Z",
                "displayMessage": "hello stream",
                "textMessageDetails": { "messageText": "hello stream" }
            },
            "authorDetails": {
                "channelId": "UC123",
                "displayName": "Viewer",
                "profileImageUrl": "https://example.com/p.jpg",
                "isChatOwner": owner,
                "isChatModerator": moderator,
                "isChatSponsor": sponsor
            }
        })
    }

    fn translate(item: Value) -> Result<Option<ChatMessage>, TranslateError> {
        YouTubeTransport::default().translate("chat-1", item)
    }

    #[test]
    fn test_translate_text_message() {
        let message = translate(chat_item("textMessageEvent", false, false, false)).unwrap().unwrap();

        assert_eq!(message.message_type, MessageType::Message);
        assert_eq!(message.message, "hello stream");
        assert_eq!(message.id, "LCC.abc");
        assert_eq!(message.channel, "chat-1");
        assert_eq!(message.user.id, "UC123");
        assert_eq!(message.user.display_name, "Viewer");
        assert_eq!(message.user.color, "");
        assert_eq!(message.user.youtube().profile_image_url(), Some("https://example.com/p.jpg"));
        assert_eq!(message.youtube().live_chat_message["snippet"]["liveChatId"], "chat-1");
    }

    #[test]
    fn test_role_colors_follow_priority() {
        let color = |owner, moderator, sponsor| {
            translate(chat_item("textMessageEvent", owner, moderator, sponsor))
                .unwrap()
                .unwrap()
                .user
                .color
        };
        assert_eq!(color(true, true, true), OWNER_COLOR);
        assert_eq!(color(false, true, true), MODERATOR_COLOR);
        assert_eq!(color(false, false, true), SPONSOR_COLOR);
        assert_eq!(color(false, false, false), "");

        let owner = translate(chat_item("textMessageEvent", true, false, false)).unwrap().unwrap();
        assert!(owner.user.youtube().is_owner());
    }

    #[test]
    fn test_event_type_mapping() {
        let kind = |k: &str| translate(chat_item(k, false, false, false)).unwrap().map(|m| m.message_type);
        assert_eq!(kind("superChatEvent"), Some(MessageType::Message));
        assert_eq!(kind("userBannedEvent"), Some(MessageType::Moderation));
        assert_eq!(kind("newSponsorEvent"), Some(MessageType::Notice));
        assert_eq!(kind("pollEvent"), Some(MessageType::Other("pollEvent".to_string())));
        assert_eq!(kind("tombstone"), None);
    }

    #[test]
    fn test_malformed_items_are_rejected() {
        assert!(translate(json!({ "id": "x" })).is_err());
        assert!(translate(json!({ "snippet": { "type": "textMessageEvent" } })).is_err());
    }

    #[test]
    fn test_poll_interval_respects_api_hint() {
        let config = YouTubeConfig::default();
        assert_eq!(config.poll_interval(None), Duration::from_millis(5000));
        assert_eq!(config.poll_interval(Some(8000)), Duration::from_millis(8000));
        assert_eq!(config.poll_interval(Some(100)), Duration::from_millis(5000));
    }

    #[test]
    fn test_terminal_poll_errors() {
        let forbidden = anyhow::Error::from(TransportError::Api(Platform::YouTube, 403, "forbidden".into()));
        let throttled = anyhow::Error::from(TransportError::Api(Platform::YouTube, 503, "busy".into()));
        assert!(is_terminal(&forbidden.context("poll failed")));
        assert!(!is_terminal(&throttled));
        assert!(!is_terminal(&anyhow::anyhow!("connection reset")));
    }

    #[tokio::test]
    async fn test_authenticate_requires_token() {
        let error = YouTubeTransport::default()
            .authenticate(&Credentials::default())
            .await
            .unwrap_err();
        assert!(matches!(error.downcast_ref::<TransportError>(), Some(TransportError::Authentication(_))));
    }
}
