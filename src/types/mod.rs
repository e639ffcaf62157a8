// src/types/mod.rs - Platform-neutral chat model shared by every connection

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use crate::platforms::mixer::ChatMessageEvent;

/// Streaming platforms with a connection adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitch,
    YouTube,
    Mixer,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Twitch => "twitch",
            Platform::YouTube => "youtube",
            Platform::Mixer => "mixer",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag used to route an inbound message to the handlers registered for it.
///
/// Serialized as its plain tag string, e.g. `"Join"` or `"Raid"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Regular chat line
    Message,
    /// A user joined the channel
    Join,
    /// A user left the channel
    Part,
    /// Timeouts, bans, message deletions
    Moderation,
    /// Server or system notices (subscriptions, raids, chat ended, ...)
    Notice,
    /// Anything the adapters pass through without a dedicated tag
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Message => "Message",
            MessageType::Join => "Join",
            MessageType::Part => "Part",
            MessageType::Moderation => "Moderation",
            MessageType::Notice => "Notice",
            MessageType::Other(tag) => tag,
        }
    }
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::Message
    }
}

impl From<&str> for MessageType {
    fn from(tag: &str) -> Self {
        match tag {
            "Message" => MessageType::Message,
            "Join" => MessageType::Join,
            "Part" => MessageType::Part,
            "Moderation" => MessageType::Moderation,
            "Notice" => MessageType::Notice,
            other => MessageType::Other(other.to_string()),
        }
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        match MessageType::from(tag.as_str()) {
            MessageType::Other(_) => MessageType::Other(tag),
            known => known,
        }
    }
}

impl From<MessageType> for String {
    fn from(message_type: MessageType) -> Self {
        match message_type {
            MessageType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =================================================================
// PLATFORM PAYLOADS
// =================================================================

/// Raw IRC data behind a Twitch message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwitchMessage {
    /// IRCv3 tags, already unescaped
    pub tags: HashMap<String, String>,
    /// The line as received from the server
    pub raw: String,
}

impl TwitchMessage {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwitchUser {
    pub login: String,
    /// Badge names without their version suffix, e.g. `moderator`, `subscriber`
    pub badges: Vec<String>,
}

impl TwitchUser {
    pub fn has_badge(&self, badge: &str) -> bool {
        self.badges.iter().any(|b| b == badge)
    }

    pub fn is_moderator(&self) -> bool {
        self.has_badge("moderator") || self.is_broadcaster()
    }

    pub fn is_broadcaster(&self) -> bool {
        self.has_badge("broadcaster")
    }

    pub fn is_subscriber(&self) -> bool {
        self.has_badge("subscriber") || self.has_badge("founder")
    }
}

/// Raw `liveChatMessage` resource from the YouTube Data API
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct YouTubeMessage {
    pub live_chat_message: serde_json::Value,
}

/// Raw `authorDetails` object from the YouTube Data API
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct YouTubeUser {
    pub author_details: serde_json::Value,
}

impl YouTubeUser {
    fn flag(&self, name: &str) -> bool {
        self.author_details
            .get(name)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_owner(&self) -> bool {
        self.flag("isChatOwner")
    }

    pub fn is_moderator(&self) -> bool {
        self.flag("isChatModerator")
    }

    pub fn is_sponsor(&self) -> bool {
        self.flag("isChatSponsor")
    }

    pub fn profile_image_url(&self) -> Option<&str> {
        self.author_details
            .get("profileImageUrl")
            .and_then(serde_json::Value::as_str)
    }
}

/// Raw event from the Mixer chat socket
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MixerMessage {
    /// Socket event name, e.g. `ChatMessage`, `UserJoin` or `DeleteMessage`
    pub event_name: String,
    /// Decoded `ChatMessage` payload; default for every other event
    pub event: ChatMessageEvent,
    /// The event's `data` object as received
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MixerUser {
    pub avatar: String,
    pub roles: Vec<String>,
}

/// Platform-specific half of a [`ChatMessage`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlatformMessage {
    /// Synthesized locally, e.g. the echo of an outbound message
    Generic,
    Twitch(TwitchMessage),
    YouTube(YouTubeMessage),
    Mixer(MixerMessage),
}

impl Default for PlatformMessage {
    fn default() -> Self {
        PlatformMessage::Generic
    }
}

/// Platform-specific half of a [`ChatUser`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlatformUser {
    Generic,
    Twitch(TwitchUser),
    YouTube(YouTubeUser),
    Mixer(MixerUser),
}

impl Default for PlatformUser {
    fn default() -> Self {
        PlatformUser::Generic
    }
}

// =================================================================
// GENERIC MODEL
// =================================================================

/// The sender of a chat message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatUser {
    /// Platform-assigned stable identifier
    pub id: String,
    pub display_name: String,
    /// UI color hint (`#RRGGBB`), empty when the platform gave none
    pub color: String,
    pub platform: PlatformUser,
}

impl ChatUser {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            ..Default::default()
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    pub fn with_platform(mut self, platform: PlatformUser) -> Self {
        self.platform = platform;
        self
    }

    /// Platform this user was seen on, `None` for locally synthesized users
    pub fn platform(&self) -> Option<Platform> {
        match self.platform {
            PlatformUser::Generic => None,
            PlatformUser::Twitch(_) => Some(Platform::Twitch),
            PlatformUser::YouTube(_) => Some(Platform::YouTube),
            PlatformUser::Mixer(_) => Some(Platform::Mixer),
        }
    }

    pub fn as_twitch(&self) -> Option<&TwitchUser> {
        match &self.platform {
            PlatformUser::Twitch(user) => Some(user),
            _ => None,
        }
    }

    pub fn as_youtube(&self) -> Option<&YouTubeUser> {
        match &self.platform {
            PlatformUser::YouTube(user) => Some(user),
            _ => None,
        }
    }

    pub fn as_mixer(&self) -> Option<&MixerUser> {
        match &self.platform {
            PlatformUser::Mixer(user) => Some(user),
            _ => None,
        }
    }

    /// Twitch view of this user, or an empty placeholder when the user is not from Twitch.
    ///
    /// The placeholder carries no data; use [`ChatUser::as_twitch`] when the
    /// difference between "wrong platform" and "field absent" matters.
    pub fn twitch(&self) -> Cow<'_, TwitchUser> {
        self.as_twitch()
            .map(Cow::Borrowed)
            .unwrap_or_else(|| Cow::Owned(TwitchUser::default()))
    }

    pub fn youtube(&self) -> Cow<'_, YouTubeUser> {
        self.as_youtube()
            .map(Cow::Borrowed)
            .unwrap_or_else(|| Cow::Owned(YouTubeUser::default()))
    }

    pub fn mixer(&self) -> Cow<'_, MixerUser> {
        self.as_mixer()
            .map(Cow::Borrowed)
            .unwrap_or_else(|| Cow::Owned(MixerUser::default()))
    }
}

/// A normalized inbound (or echoed outbound) chat event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Event identifier; a random UUID when the platform supplies none
    pub id: String,
    /// Plain-text body
    pub message: String,
    pub message_type: MessageType,
    /// Channel (or live chat) the event arrived on
    pub channel: String,
    pub received_at: chrono::DateTime<chrono::Utc>,
    /// Snapshot of the sender at the time of the event
    pub user: ChatUser,
    pub platform: PlatformMessage,
}

impl Default for ChatMessage {
    fn default() -> Self {
        Self {
            id: String::new(),
            message: String::new(),
            message_type: MessageType::default(),
            channel: String::new(),
            received_at: chrono::Utc::now(),
            user: ChatUser::default(),
            platform: PlatformMessage::default(),
        }
    }
}

impl ChatMessage {
    pub fn new(message_type: MessageType, message: impl Into<String>, user: ChatUser) -> Self {
        Self {
            id: synthetic_id(),
            message: message.into(),
            message_type,
            user,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !id.is_empty() {
            self.id = id;
        }
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_platform(mut self, platform: PlatformMessage) -> Self {
        self.platform = platform;
        self
    }

    pub fn platform(&self) -> Option<Platform> {
        match self.platform {
            PlatformMessage::Generic => None,
            PlatformMessage::Twitch(_) => Some(Platform::Twitch),
            PlatformMessage::YouTube(_) => Some(Platform::YouTube),
            PlatformMessage::Mixer(_) => Some(Platform::Mixer),
        }
    }

    pub fn as_twitch(&self) -> Option<&TwitchMessage> {
        match &self.platform {
            PlatformMessage::Twitch(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn as_youtube(&self) -> Option<&YouTubeMessage> {
        match &self.platform {
            PlatformMessage::YouTube(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn as_mixer(&self) -> Option<&MixerMessage> {
        match &self.platform {
            PlatformMessage::Mixer(msg) => Some(msg),
            _ => None,
        }
    }

    /// Twitch view of this message, or an empty placeholder for other platforms
    pub fn twitch(&self) -> Cow<'_, TwitchMessage> {
        self.as_twitch()
            .map(Cow::Borrowed)
            .unwrap_or_else(|| Cow::Owned(TwitchMessage::default()))
    }

    pub fn youtube(&self) -> Cow<'_, YouTubeMessage> {
        self.as_youtube()
            .map(Cow::Borrowed)
            .unwrap_or_else(|| Cow::Owned(YouTubeMessage::default()))
    }

    pub fn mixer(&self) -> Cow<'_, MixerMessage> {
        self.as_mixer()
            .map(Cow::Borrowed)
            .unwrap_or_else(|| Cow::Owned(MixerMessage::default()))
    }
}

/// Join message fragments into one body, preserving their order
pub fn assemble_fragments<I, S>(fragments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    fragments.into_iter().fold(String::new(), |mut body, fragment| {
        body.push_str(fragment.as_ref());
        body
    })
}

/// Identifier for events the platform did not label
pub fn synthetic_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn twitch_message() -> ChatMessage {
        let mut tags = HashMap::new();
        tags.insert("color".to_string(), "#FF0000".to_string());
        let user = ChatUser::new("1234", "Viewer")
            .with_color("#FF0000")
            .with_platform(PlatformUser::Twitch(TwitchUser {
                login: "viewer".to_string(),
                badges: vec!["moderator".to_string()],
            }));
        ChatMessage::new(MessageType::Message, "hi", user).with_platform(PlatformMessage::Twitch(TwitchMessage {
            tags,
            raw: "@color=#FF0000 :viewer PRIVMSG #chan :hi".to_string(),
        }))
    }

    #[test]
    fn test_defaults_are_empty() {
        let user = ChatUser::default();
        assert!(user.id.is_empty());
        assert!(user.display_name.is_empty());
        assert!(user.color.is_empty());
        assert_eq!(user.platform(), None);

        let message = ChatMessage::default();
        assert!(message.id.is_empty());
        assert!(message.message.is_empty());
        assert_eq!(message.message_type, MessageType::Message);
        assert_eq!(message.platform(), None);
    }

    #[test]
    fn test_matching_accessor_returns_payload() {
        let message = twitch_message();
        assert_eq!(message.platform(), Some(Platform::Twitch));
        assert_eq!(message.as_twitch().and_then(|t| t.tag("color")), Some("#FF0000"));
        assert_eq!(message.twitch().tag("color"), Some("#FF0000"));
        assert!(message.user.twitch().is_moderator());
        assert!(matches!(message.twitch(), Cow::Borrowed(_)));
    }

    #[test]
    fn test_mismatched_accessor_returns_placeholder() {
        let message = twitch_message();

        assert!(message.as_youtube().is_none());
        assert!(message.as_mixer().is_none());
        assert_eq!(*message.youtube(), YouTubeMessage::default());
        assert_eq!(*message.mixer(), MixerMessage::default());
        assert!(message.mixer().event.message.message.is_empty());

        assert!(message.user.as_mixer().is_none());
        assert!(message.user.mixer().avatar.is_empty());
        assert!(!message.user.youtube().is_moderator());
    }

    #[test]
    fn test_generic_message_has_no_platform_view() {
        let message = ChatMessage::new(MessageType::Message, "echo", ChatUser::new("1", "me"));
        assert!(message.as_twitch().is_none());
        assert!(message.twitch().tags.is_empty());
        assert!(message.twitch().raw.is_empty());
    }

    #[test]
    fn test_assemble_fragments_preserves_order() {
        assert_eq!(assemble_fragments(["hello ", "world"]), "hello world");
        assert_eq!(assemble_fragments(Vec::<String>::new()), "");
        assert_eq!(assemble_fragments(vec!["a".to_string(), "b".to_string(), "c".to_string()]), "abc");
    }

    #[test]
    fn test_message_type_tags() {
        assert_eq!(MessageType::from("Message"), MessageType::Message);
        assert_eq!(MessageType::from("Moderation"), MessageType::Moderation);
        assert_eq!(MessageType::from("Raid"), MessageType::Other("Raid".to_string()));
        assert_eq!(MessageType::Other("Raid".to_string()).as_str(), "Raid");
        assert_eq!(MessageType::Join.to_string(), "Join");
    }

    #[test]
    fn test_message_type_serializes_as_plain_string() {
        assert_eq!(serde_json::to_string(&MessageType::Message).unwrap(), r#""Message""#);
        assert_eq!(serde_json::to_string(&MessageType::Other("Raid".to_string())).unwrap(), r#""Raid""#);
        assert_eq!(serde_json::from_str::<MessageType>(r#""Join""#).unwrap(), MessageType::Join);
        assert_eq!(
            serde_json::from_str::<MessageType>(r#""Raid""#).unwrap(),
            MessageType::Other("Raid".to_string())
        );

        let notice = ChatMessage::new(MessageType::Notice, "chat ended", ChatUser::default());
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["message_type"], "Notice");
    }

    #[test]
    fn test_synthetic_ids_are_unique() {
        let a = ChatMessage::new(MessageType::Message, "x", ChatUser::default());
        let b = ChatMessage::new(MessageType::Message, "x", ChatUser::default());
        assert!(!a.id.is_empty());
        assert_ne!(a.id, b.id);
        assert_eq!(a.clone().with_id("").id, a.id);
        assert_eq!(a.with_id("abc").id, "abc");
    }
}
