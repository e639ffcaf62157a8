//! # StreamCore
//!
//! Connection core for live-stream chat. Twitch, YouTube and Mixer chats sit
//! behind one message/user model, one handler registry and one outbound queue
//! per platform.
//!
//! ## Features
//!
//! - **Uniform model**: every platform event becomes a [`ChatMessage`](types::ChatMessage)
//!   with its raw platform payload attached
//! - **Caller-scoped handlers**: each consumer owns one slot per message type
//!   and never hears the echo of its own sends
//! - **Paced sending**: one outbound message per platform per tick
//! - **Self-healing connections**: unexpected drops are retried until they succeed
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use streamcore::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let shutdown = ShutdownSignal::new();
//!     let credentials = Credentials::from_env(Platform::Twitch)?;
//!     let twitch = ConnectionManager::new(TwitchTransport::default(), credentials, ManagerSettings::default(), shutdown.clone());
//!
//!     let client = twitch.client("greeter");
//!     let replies = client.clone();
//!     client.on_message(move |msg| {
//!         if msg.message == "!hello" {
//!             replies.send_message(&format!("Hello {}!", msg.user.display_name));
//!         }
//!         Ok(())
//!     });
//!
//!     twitch.initialize();
//!     shutdown.listen_for_os_signals();
//!     shutdown.cancelled().await;
//!     twitch.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod hub;
pub mod platforms;
pub mod queue;
pub mod shutdown;
pub mod types;

// Re-export commonly used items
pub mod prelude {
    pub use crate::config::{CredentialSource, Credentials, ManagerSettings, SharedCredentials, StreamCoreConfig};
    pub use crate::connection::{ChatClient, ConnectionManager, ConnectionState};
    pub use crate::dispatch::{CallerId, HandlerRegistry, HandlerResult, HandlerToken};
    pub use crate::hub::{ChatHub, HubClient, PlatformManager};
    pub use crate::platforms::{
        mixer::MixerTransport,
        twitch::TwitchTransport,
        youtube::{YouTubeConfig, YouTubeTransport},
        ChatTransport, TransportError, TranslateError,
    };
    pub use crate::queue::QueueStats;
    pub use crate::shutdown::ShutdownSignal;
    pub use crate::types::{ChatMessage, ChatUser, MessageType, Platform, PlatformMessage, PlatformUser};
    pub use anyhow::Result;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
