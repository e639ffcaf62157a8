// src/config/mod.rs - Credentials and engine settings

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::fs;

use crate::types::Platform;

/// The channel/account and token a connection authenticates with
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Channel to join. Twitch channel name, YouTube video id, Mixer channel name.
    /// Empty means "the authenticated user's own channel".
    pub channel: String,
    pub username: String,
    /// OAuth token. Twitch accepts it with or without the `oauth:` prefix.
    pub token: String,
}

impl Credentials {
    pub fn new(channel: impl Into<String>, username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            username: username.into(),
            token: token.into(),
        }
    }

    /// Read whatever the environment has for `platform`, without validation
    pub fn env(platform: Platform) -> Self {
        let var = |name: &str| env::var(name).map(|v| v.trim().to_string()).unwrap_or_default();
        match platform {
            Platform::Twitch => Self::new(var("TWITCH_CHANNEL"), var("TWITCH_USERNAME"), var("TWITCH_OAUTH_TOKEN")),
            Platform::YouTube => Self::new(var("YOUTUBE_VIDEO_ID"), String::new(), var("YOUTUBE_OAUTH_TOKEN")),
            Platform::Mixer => Self::new(var("MIXER_CHANNEL"), String::new(), var("MIXER_OAUTH_TOKEN")),
        }
    }

    /// Load credentials for `platform` from environment variables
    pub fn from_env(platform: Platform) -> Result<Self> {
        let credentials = Self::env(platform).normalized(platform);
        credentials.validate(platform)?;
        info!("Loaded {} credentials from environment", platform);
        Ok(credentials)
    }

    /// Check that the values needed to authenticate are present
    pub fn validate(&self, platform: Platform) -> Result<()> {
        match platform {
            Platform::Twitch => {
                if self.channel.is_empty() && self.username.is_empty() {
                    return Err(anyhow::anyhow!("No Twitch channel specified in TWITCH_CHANNEL"));
                }
            }
            Platform::YouTube | Platform::Mixer => {
                if self.token.is_empty() {
                    return Err(anyhow::anyhow!("{} requires an OAuth token", platform));
                }
            }
        }
        Ok(())
    }

    /// Apply the platform's input conventions
    pub fn normalized(mut self, platform: Platform) -> Self {
        if platform != Platform::Twitch {
            return self;
        }

        if !self.token.is_empty() && !self.token.starts_with("oauth:") {
            self.token = format!("oauth:{}", self.token);
        }

        if self.channel.contains('/') {
            // Pasted channel URL, keep the last path segment
            let name = self.channel.trim_end_matches('/').rsplit('/').next().unwrap_or_default().to_string();
            debug!("Changing Twitch channel to {}", name);
            self.channel = name;
        }
        self.channel = self.channel.to_lowercase().replace(' ', "");
        self.username = self.username.to_lowercase();
        self
    }

    /// Bare token, without the `oauth:` prefix Twitch IRC expects
    pub fn bare_token(&self) -> &str {
        self.token.strip_prefix("oauth:").unwrap_or(&self.token)
    }
}

/// Supplies the current credentials; consulted again on every (re)connect
pub trait CredentialSource: Send + Sync {
    fn current(&self) -> Credentials;
}

impl CredentialSource for Credentials {
    fn current(&self) -> Credentials {
        self.clone()
    }
}

/// Credentials an external config layer can swap at runtime.
///
/// Updates take effect on the next connect attempt.
#[derive(Clone, Default)]
pub struct SharedCredentials {
    inner: Arc<RwLock<Credentials>>,
}

impl SharedCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            inner: Arc::new(RwLock::new(credentials)),
        }
    }

    pub fn update(&self, credentials: Credentials) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = credentials;
    }
}

impl CredentialSource for SharedCredentials {
    fn current(&self) -> Credentials {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Timing and behavior knobs of a connection manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// Delay before the first connect after `initialize()`
    pub initial_connect_delay_ms: u64,
    /// Sender loop period; at most one outbound message per period
    pub send_interval_ms: u64,
    /// Wait after an unexpected disconnect before the first reconnect attempt
    pub reconnect_delay_ms: u64,
    /// Wait between failed reconnect attempts
    pub retry_delay_ms: u64,
    /// Dispatch sent messages back to the other registered callers
    pub echo_outbound: bool,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            initial_connect_delay_ms: 1000,
            send_interval_ms: 250,
            reconnect_delay_ms: 2000,
            retry_delay_ms: 2500,
            echo_outbound: true,
        }
    }
}

impl ManagerSettings {
    pub fn initial_connect_delay(&self) -> Duration {
        Duration::from_millis(self.initial_connect_delay_ms)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Per-platform section of the config file. Empty fields fall back to env vars.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformSettings {
    pub enabled: bool,
    pub channel: Option<String>,
    pub username: Option<String>,
    pub token: Option<String>,
}

/// Top-level YAML configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamCoreConfig {
    pub settings: ManagerSettings,
    pub twitch: PlatformSettings,
    pub youtube: PlatformSettings,
    pub mixer: PlatformSettings,
}

impl StreamCoreConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_yaml_str(&content).with_context(|| format!("Invalid config file {}", path.display()))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Config with every platform enabled whose required env vars are set
    pub fn from_env() -> Self {
        let mut config = Self::default();
        for platform in [Platform::Twitch, Platform::YouTube, Platform::Mixer] {
            config.platform_mut(platform).enabled = Credentials::env(platform).normalized(platform).validate(platform).is_ok();
        }
        config
    }

    pub fn platform(&self, platform: Platform) -> &PlatformSettings {
        match platform {
            Platform::Twitch => &self.twitch,
            Platform::YouTube => &self.youtube,
            Platform::Mixer => &self.mixer,
        }
    }

    fn platform_mut(&mut self, platform: Platform) -> &mut PlatformSettings {
        match platform {
            Platform::Twitch => &mut self.twitch,
            Platform::YouTube => &mut self.youtube,
            Platform::Mixer => &mut self.mixer,
        }
    }

    pub fn enabled_platforms(&self) -> Vec<Platform> {
        [Platform::Twitch, Platform::YouTube, Platform::Mixer]
            .into_iter()
            .filter(|p| self.platform(*p).enabled)
            .collect()
    }

    /// Credentials for `platform`: file values first, env vars for anything unset
    pub fn credentials(&self, platform: Platform) -> Result<Credentials> {
        let section = self.platform(platform);
        let from_env = Credentials::env(platform);
        let pick = |file: &Option<String>, env: String| match file {
            Some(value) if !value.is_empty() => value.clone(),
            _ => env,
        };

        let credentials = Credentials {
            channel: pick(&section.channel, from_env.channel),
            username: pick(&section.username, from_env.username),
            token: pick(&section.token, from_env.token),
        }
        .normalized(platform);

        credentials.validate(platform)?;
        Ok(credentials)
    }
}
