// src/hub.rs - All platform connections of one host application

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::{Credentials, StreamCoreConfig};
use crate::connection::{ChatClient, ConnectionManager, ConnectionState};
use crate::dispatch::{CallerId, HandlerResult, HandlerToken};
use crate::platforms::mixer::MixerTransport;
use crate::platforms::twitch::TwitchTransport;
use crate::platforms::youtube::{YouTubeConfig, YouTubeTransport};
use crate::platforms::ChatTransport;
use crate::queue::QueueStats;
use crate::shutdown::ShutdownSignal;
use crate::types::{ChatMessage, MessageType, Platform};

/// Transport-erased view of a [`ConnectionManager`]
#[async_trait]
pub trait PlatformManager: Send + Sync {
    fn platform(&self) -> Platform;
    fn initialize(&self);
    fn state(&self) -> ConnectionState;
    fn is_connected(&self) -> bool;
    fn client_for(&self, caller: CallerId) -> ChatClient;
    fn queue_stats(&self) -> QueueStats;
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self);
    async fn shutdown(&self);
}

#[async_trait]
impl<T: ChatTransport> PlatformManager for ConnectionManager<T> {
    fn platform(&self) -> Platform {
        ConnectionManager::platform(self)
    }

    fn initialize(&self) {
        ConnectionManager::initialize(self)
    }

    fn state(&self) -> ConnectionState {
        ConnectionManager::state(self)
    }

    fn is_connected(&self) -> bool {
        ConnectionManager::is_connected(self)
    }

    fn client_for(&self, caller: CallerId) -> ChatClient {
        ConnectionManager::client_for(self, caller)
    }

    fn queue_stats(&self) -> QueueStats {
        ConnectionManager::queue_stats(self)
    }

    async fn connect(&self) -> Result<()> {
        ConnectionManager::connect(self).await
    }

    async fn disconnect(&self) {
        ConnectionManager::disconnect(self).await
    }

    async fn shutdown(&self) {
        ConnectionManager::shutdown(self).await
    }
}

/// Owns one connection manager per platform and the shared shutdown signal
pub struct ChatHub {
    shutdown: ShutdownSignal,
    managers: RwLock<HashMap<Platform, Arc<dyn PlatformManager>>>,
}

impl ChatHub {
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self {
            shutdown,
            managers: RwLock::new(HashMap::new()),
        }
    }

    /// Build managers for every enabled platform in `config`.
    ///
    /// A platform whose credentials are incomplete is skipped with a warning.
    pub fn from_config(config: &StreamCoreConfig, shutdown: ShutdownSignal) -> Self {
        let hub = Self::new(shutdown);
        for platform in config.enabled_platforms() {
            match config.credentials(platform) {
                Ok(credentials) => hub.add_platform(platform, credentials, config),
                Err(e) => warn!("Skipping {}: {:#}", platform, e),
            }
        }
        hub
    }

    fn add_platform(&self, platform: Platform, credentials: Credentials, config: &StreamCoreConfig) {
        let settings = config.settings.clone();
        let shutdown = self.shutdown.clone();
        match platform {
            Platform::Twitch => self.add(ConnectionManager::new(TwitchTransport::default(), credentials, settings, shutdown)),
            Platform::YouTube => self.add(ConnectionManager::new(
                YouTubeTransport::new(YouTubeConfig::from_env()),
                credentials,
                settings,
                shutdown,
            )),
            Platform::Mixer => self.add(ConnectionManager::new(MixerTransport::default(), credentials, settings, shutdown)),
        }
    }

    /// Register a manager, replacing any previous one for its platform
    pub fn add<M: PlatformManager + 'static>(&self, manager: M) {
        let platform = manager.platform();
        info!("Added {} connection", platform);
        let previous = self
            .managers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(platform, Arc::new(manager));
        if previous.is_some() {
            warn!("Replaced existing {} connection", platform);
        }
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PlatformManager>> {
        self.managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&platform)
            .cloned()
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self
            .managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        platforms.sort_by_key(|p| p.as_str());
        platforms
    }

    fn snapshot(&self) -> Vec<Arc<dyn PlatformManager>> {
        self.managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn initialize_all(&self) {
        for manager in self.snapshot() {
            manager.initialize();
        }
    }

    /// Connection state of every platform
    pub fn health_check(&self) -> HashMap<Platform, ConnectionState> {
        let mut status = HashMap::new();
        for manager in self.snapshot() {
            let state = manager.state();
            if state != ConnectionState::Connected {
                warn!("{} connection is {}", manager.platform(), state);
            }
            status.insert(manager.platform(), state);
        }
        status
    }

    /// A consumer handle spanning every platform currently in the hub
    pub fn client(&self, name: impl Into<String>) -> HubClient {
        let caller = CallerId::new(name);
        let clients = self
            .snapshot()
            .into_iter()
            .map(|manager| manager.client_for(caller.clone()))
            .collect();
        HubClient { caller, clients }
    }

    /// Stop every background loop and close all sessions
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        for manager in self.snapshot() {
            manager.shutdown().await;
        }
        info!("All connections closed");
    }
}

/// One caller identity registered on several platforms at once
#[derive(Clone)]
pub struct HubClient {
    caller: CallerId,
    clients: Vec<ChatClient>,
}

impl HubClient {
    pub fn caller(&self) -> &CallerId {
        &self.caller
    }

    pub fn platform(&self, platform: Platform) -> Option<&ChatClient> {
        self.clients.iter().find(|c| c.platform() == platform)
    }

    /// Register `handler` for `message_type` on every platform
    pub fn on<F>(&self, message_type: MessageType, handler: F) -> Vec<HandlerToken>
    where
        F: Fn(&ChatMessage) -> HandlerResult + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.clients
            .iter()
            .map(|client| {
                let handler = Arc::clone(&handler);
                client.on(message_type.clone(), move |message| handler(message))
            })
            .collect()
    }

    pub fn on_message<F>(&self, handler: F) -> Vec<HandlerToken>
    where
        F: Fn(&ChatMessage) -> HandlerResult + Send + Sync + 'static,
    {
        self.on(MessageType::Message, handler)
    }

    /// Queue `text` on one platform; false if the platform is unknown or refused it
    pub fn send_message(&self, platform: Platform, text: &str) -> bool {
        self.platform(platform).map_or(false, |client| client.send_message(text))
    }

    /// Queue `text` on every platform. Returns how many accepted it.
    pub fn broadcast(&self, text: &str) -> usize {
        self.clients.iter().filter(|client| client.send_message(text)).count()
    }

    pub fn unregister_all(&self) -> usize {
        self.clients.iter().map(ChatClient::unregister_all).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerSettings;
    use crate::platforms::{
        EventSender, Identity, OpenedSession, TransportEvent, TransportSession, TranslateError,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Transport that connects instantly and lets the test inject chat lines
    struct StubTransport {
        platform: Platform,
        sent: Arc<Mutex<Vec<String>>>,
        live: Arc<Mutex<Option<EventSender<String>>>>,
    }

    impl StubTransport {
        fn new(platform: Platform) -> Self {
            Self {
                platform,
                sent: Arc::default(),
                live: Arc::default(),
            }
        }
    }

    struct StubSession {
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TransportSession for StubSession {
        async fn send(&self, text: &str) -> Result<()> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ChatTransport for StubTransport {
        type Event = String;

        fn platform(&self) -> Platform {
            self.platform
        }

        async fn authenticate(&self, _credentials: &Credentials) -> Result<Identity> {
            Ok(Identity::default())
        }

        async fn resolve_channel(&self, _identity: &Identity, _credentials: &Credentials) -> Result<String> {
            Ok("room".to_string())
        }

        async fn open(&self, _identity: &Identity, _channel: &str, _credentials: &Credentials) -> Result<OpenedSession<String>> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.live.lock().unwrap() = Some(tx);
            Ok(OpenedSession {
                session: Box::new(StubSession {
                    sent: Arc::clone(&self.sent),
                }),
                events: rx,
            })
        }

        fn translate(&self, channel: &str, event: String) -> Result<Option<ChatMessage>, TranslateError> {
            Ok(Some(
                ChatMessage::new(MessageType::Message, event, crate::types::ChatUser::new("u", "u")).with_channel(channel),
            ))
        }
    }

    fn settings() -> ManagerSettings {
        ManagerSettings {
            initial_connect_delay_ms: 5,
            send_interval_ms: 10,
            reconnect_delay_ms: 10,
            retry_delay_ms: 10,
            echo_outbound: false,
        }
    }

    fn hub_with(platforms: &[Platform]) -> (ChatHub, Vec<(Arc<Mutex<Vec<String>>>, Arc<Mutex<Option<EventSender<String>>>>)>) {
        let hub = ChatHub::new(ShutdownSignal::new());
        let mut handles = Vec::new();
        for platform in platforms {
            let transport = StubTransport::new(*platform);
            handles.push((Arc::clone(&transport.sent), Arc::clone(&transport.live)));
            hub.add(ConnectionManager::new(
                transport,
                Credentials::default(),
                settings(),
                hub.shutdown_signal().clone(),
            ));
        }
        (hub, handles)
    }

    async fn wait_connected(hub: &ChatHub) {
        for _ in 0..200 {
            if hub.health_check().values().all(|s| *s == ConnectionState::Connected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("platforms did not connect: {:?}", hub.health_check());
    }

    #[tokio::test]
    async fn test_client_spans_platforms() {
        let (hub, handles) = hub_with(&[Platform::Twitch, Platform::Mixer]);
        assert_eq!(hub.platforms(), vec![Platform::Mixer, Platform::Twitch]);

        let client = hub.client("overlay");
        let received = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&received);
        let tokens = client.on_message(move |_msg| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(tokens.len(), 2);
        assert!(tokens.iter().all(|t| t.caller() == client.caller()));

        hub.initialize_all();
        wait_connected(&hub).await;

        for (_, live) in &handles {
            let events = live.lock().unwrap().clone().unwrap();
            events.send(TransportEvent::Event("hi".to_string())).unwrap();
        }
        for _ in 0..100 {
            if received.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(received.load(Ordering::SeqCst), 2);

        assert!(client.send_message(Platform::Twitch, "only twitch"));
        assert!(!client.send_message(Platform::YouTube, "no such platform"));
        assert_eq!(client.broadcast("everyone"), 2);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let twitch_sent = handles[0].0.lock().unwrap().clone();
        let mixer_sent = handles[1].0.lock().unwrap().clone();
        assert_eq!(twitch_sent, vec!["only twitch", "everyone"]);
        assert_eq!(mixer_sent, vec!["everyone"]);

        assert_eq!(client.unregister_all(), 2);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_everything() {
        let (hub, _handles) = hub_with(&[Platform::Twitch, Platform::YouTube]);
        hub.initialize_all();
        wait_connected(&hub).await;

        hub.shutdown().await;
        assert!(hub.shutdown_signal().is_shutting_down());
        for platform in hub.platforms() {
            let manager = hub.get(platform).unwrap();
            assert!(!manager.is_connected());
            assert_eq!(manager.state(), ConnectionState::Disconnected);
        }
    }

    #[test]
    fn test_from_config_skips_incomplete_platforms() {
        let config = StreamCoreConfig::from_yaml_str(
            "twitch:\n  enabled: true\n  channel: somechannel\nmixer:\n  enabled: false\n",
        )
        .unwrap();
        let hub = ChatHub::from_config(&config, ShutdownSignal::new());
        assert_eq!(hub.platforms(), vec![Platform::Twitch]);
        assert_eq!(hub.get(Platform::Twitch).unwrap().state(), ConnectionState::Uninitialized);
    }
}
