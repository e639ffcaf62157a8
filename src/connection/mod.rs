// src/connection/mod.rs - Per-platform connection lifecycle manager
//
// One `ConnectionManager` owns one platform's transport session. It drives
// authenticate → resolve channel → open, feeds raw events through the
// adapter's translator into the handler registry, runs the outbound sender
// loop, and reconnects on unexpected loss until shutdown.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{CredentialSource, Credentials, ManagerSettings};
use crate::dispatch::{panic_message, CallerId, HandlerRegistry};
use crate::platforms::{ChatTransport, EventReceiver, Identity, OpenedSession, TransportError, TransportEvent, TransportSession};
use crate::queue::{run_sender_loop, OutboundMessage, OutboundSink, QueueStats, SendQueue};
use crate::shutdown::ShutdownSignal;
use crate::types::{ChatMessage, ChatUser, MessageType, Platform};

pub mod client;
mod state;

pub use client::ChatClient;
pub use state::{ConnectionState, Notification};

use client::MessageSender;
use state::Notifier;

/// Upper bound on a polite close before the session is simply dropped
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// The live transport session and what is needed to retire it
struct ActiveSession {
    generation: u64,
    /// Reconnect epoch at the time this session was opened
    epoch: u64,
    session: Arc<dyn TransportSession>,
    /// Cleared before a deliberate close so the loss does not trigger a reconnect
    reconnect_armed: Arc<AtomicBool>,
    receiver: JoinHandle<()>,
}

struct ManagerInner<T: ChatTransport> {
    label: String,
    transport: T,
    credentials: Arc<dyn CredentialSource>,
    settings: ManagerSettings,
    registry: Arc<HandlerRegistry>,
    queue: Arc<SendQueue>,
    shutdown: ShutdownSignal,
    notifier: Notifier,
    initialized: AtomicBool,
    connected: AtomicBool,
    /// Epoch of the reconnect loop currently running, if any
    reconnect_owner: StdMutex<Option<u64>>,
    /// Numbers connect attempts; the winning attempt's number becomes the session generation
    generation: AtomicU64,
    /// Bumped by `connect()` and `disconnect()`. Attempts and reconnect loops started
    /// under an older epoch give up.
    reconnect_epoch: watch::Sender<u64>,
    session: Mutex<Option<ActiveSession>>,
    state: watch::Sender<ConnectionState>,
    connection_time: RwLock<Option<DateTime<Utc>>>,
    identity: RwLock<Option<Identity>>,
    channel: RwLock<Option<String>>,
}

/// Connection lifecycle manager for one platform.
///
/// Cheap to clone; clones share the same session. Must be used from within
/// a Tokio runtime.
pub struct ConnectionManager<T: ChatTransport> {
    inner: Arc<ManagerInner<T>>,
}

impl<T: ChatTransport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ChatTransport> ConnectionManager<T> {
    pub fn new<C>(transport: T, credentials: C, settings: ManagerSettings, shutdown: ShutdownSignal) -> Self
    where
        C: CredentialSource + 'static,
    {
        let label = transport.platform().to_string();
        let (state, _) = watch::channel(ConnectionState::Uninitialized);
        let (reconnect_epoch, _) = watch::channel(0);

        Self {
            inner: Arc::new(ManagerInner {
                registry: Arc::new(HandlerRegistry::new(label.clone())),
                label,
                transport,
                credentials: Arc::new(credentials),
                settings,
                queue: Arc::new(SendQueue::new()),
                shutdown,
                notifier: Notifier::default(),
                initialized: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                reconnect_owner: StdMutex::new(None),
                generation: AtomicU64::new(0),
                reconnect_epoch,
                session: Mutex::new(None),
                state,
                connection_time: RwLock::new(None),
                identity: RwLock::new(None),
                channel: RwLock::new(None),
            }),
        }
    }

    pub fn platform(&self) -> Platform {
        self.inner.transport.platform()
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    /// A new consumer handle with its own caller identity
    pub fn client(&self, name: impl Into<String>) -> ChatClient {
        self.client_for(CallerId::new(name))
    }

    /// A consumer handle for an existing caller identity
    pub fn client_for(&self, caller: CallerId) -> ChatClient {
        let sender: Arc<dyn MessageSender> = self.inner.clone();
        ChatClient::new(caller, Arc::clone(&self.inner.registry), sender)
    }

    /// Called after every successful (re)connect, on a background task
    pub fn on_connected<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.notifier.on_connected(Arc::new(callback));
    }

    /// Called whenever a live session ends, deliberately or not, on a background task
    pub fn on_disconnected<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.notifier.on_disconnected(Arc::new(callback));
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// When the last successful handshake completed
    pub fn connection_time(&self) -> Option<DateTime<Utc>> {
        *self.inner.connection_time.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// The account of the most recent successful connect
    pub fn identity(&self) -> Option<Identity> {
        self.inner.identity.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// The resolved channel of the most recent successful connect
    pub fn channel(&self) -> Option<String> {
        self.inner.channel.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    /// Wait until the manager reaches `target`; false on timeout
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut receiver = self.inner.state.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, receiver.wait_for(|state| *state == target)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Start the sender loop and schedule the first connect. Later calls do nothing.
    pub fn initialize(&self) {
        let inner = &self.inner;
        if inner.initialized.swap(true, Ordering::SeqCst) {
            debug!("[{}] Already initialized", inner.label);
            return;
        }

        info!("Initializing {} connection manager", inner.label);

        tokio::spawn(run_sender_loop(
            inner.label.clone(),
            Arc::clone(&inner.queue),
            Arc::clone(inner),
            inner.settings.send_interval(),
            inner.shutdown.clone(),
        ));

        let connector = Arc::clone(inner);
        tokio::spawn(async move {
            if !connector.shutdown.sleep(connector.settings.initial_connect_delay()).await {
                return;
            }
            if connector.connect().await.is_err() {
                info!("[{}] Staying disconnected until the next connect()", connector.label);
            }
        });
    }

    /// Replace any current session with a fresh one, cancelling a pending reconnect.
    ///
    /// Failures are logged, leave the manager disconnected and are returned.
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    /// Close the session without reconnecting. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    /// Final teardown at application exit
    pub async fn shutdown(&self) {
        info!("Shutdown {}", self.inner.label);
        self.inner.disconnect().await;
    }

    /// Queue `text` on behalf of `caller`; see [`ChatClient::send_message`]
    pub fn send_message(&self, caller: &CallerId, text: &str) -> bool {
        self.inner.submit(caller, text)
    }
}

impl<T: ChatTransport> ManagerInner<T> {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("[{}] {} -> {}", self.label, previous, state);
        }
    }

    fn current_epoch(&self) -> u64 {
        *self.reconnect_epoch.borrow()
    }

    /// Start a new epoch and return it
    fn advance_epoch(&self) -> u64 {
        let mut next = 0;
        self.reconnect_epoch.send_modify(|epoch| {
            *epoch += 1;
            next = *epoch;
        });
        next
    }

    fn reconnect_cancelled(&self, epoch: u64) -> bool {
        self.shutdown.is_shutting_down() || self.current_epoch() != epoch
    }

    /// Resolves once shutdown starts or `epoch` is replaced by a newer one
    async fn superseded(&self, epoch: u64) {
        let mut epochs = self.reconnect_epoch.subscribe();
        tokio::select! {
            _ = epochs.wait_for(|current| *current != epoch) => {}
            _ = self.shutdown.cancelled() => {}
        };
    }

    /// Sleep unless `epoch` is superseded first. True when the full time elapsed.
    async fn pause(&self, duration: Duration, epoch: u64) -> bool {
        let elapsed = tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.superseded(epoch) => false,
        };
        elapsed && !self.reconnect_cancelled(epoch)
    }

    async fn close_session(&self, session: &dyn TransportSession) {
        match tokio::time::timeout(CLOSE_TIMEOUT, session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[{}] Error while closing session: {:#}", self.label, e),
            Err(_) => warn!("[{}] Session did not close within {:?}", self.label, CLOSE_TIMEOUT),
        }
    }

    async fn establish(&self, credentials: &Credentials) -> Result<(Identity, String, OpenedSession<T::Event>)> {
        let identity = self
            .transport
            .authenticate(credentials)
            .await
            .with_context(|| format!("{} authentication failed", self.label))?;
        let channel = self
            .transport
            .resolve_channel(&identity, credentials)
            .await
            .with_context(|| format!("Failed to resolve {} channel", self.label))?;
        let opened = self
            .transport
            .open(&identity, &channel, credentials)
            .await
            .with_context(|| format!("Failed to open {} chat session", self.label))?;
        Ok((identity, channel, opened))
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        let epoch = self.advance_epoch();
        self.connect_session(epoch, false).await
    }

    /// One connect attempt under `epoch`.
    ///
    /// The session lock is only held to retire the old session and to install
    /// the new one, never across network I/O, so `disconnect()` and shutdown
    /// cut a pending attempt short instead of waiting for it.
    async fn connect_session(self: &Arc<Self>, epoch: u64, from_reconnect: bool) -> Result<()> {
        let generation = {
            let mut slot = self.session.lock().await;
            if self.reconnect_cancelled(epoch) {
                return Err(anyhow::anyhow!("connect to {} cancelled", self.label));
            }

            info!("Connecting to {}...", self.label);
            self.teardown(&mut slot).await;
            self.set_state(ConnectionState::Connecting);
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        let credentials = self.credentials.current();
        let established = tokio::select! {
            result = self.establish(&credentials) => Some(result),
            _ = self.superseded(epoch) => None,
        };

        let (identity, channel, opened) = match established {
            Some(Ok(parts)) => parts,
            Some(Err(e)) => {
                self.abandon_attempt(generation).await;
                error!("Failed to connect to {}: {:#}", self.label, e);
                return Err(e);
            }
            None => {
                self.abandon_attempt(generation).await;
                info!("Connect to {} abandoned", self.label);
                return Err(anyhow::anyhow!("connect to {} cancelled", self.label));
            }
        };

        let mut slot = self.session.lock().await;
        if self.reconnect_cancelled(epoch) {
            drop(slot);
            self.close_session(&*opened.session).await;
            self.abandon_attempt(generation).await;
            return Err(anyhow::anyhow!("connect to {} cancelled", self.label));
        }

        let reconnect_armed = Arc::new(AtomicBool::new(true));
        let receiver = tokio::spawn(Arc::clone(self).receive_loop(
            generation,
            Arc::clone(&reconnect_armed),
            channel.clone(),
            opened.events,
        ));

        *slot = Some(ActiveSession {
            generation,
            epoch,
            session: Arc::from(opened.session),
            reconnect_armed,
            receiver,
        });

        info!("Connected to {} chat as '{}' in '{}'", self.label, identity.username, channel);
        *self.identity.write().unwrap_or_else(PoisonError::into_inner) = Some(identity);
        *self.channel.write().unwrap_or_else(PoisonError::into_inner) = Some(channel);
        *self.connection_time.write().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        self.connected.store(true, Ordering::SeqCst);
        self.queue.open();
        self.set_state(ConnectionState::Connected);
        if from_reconnect {
            // Released under the session lock so a loss right after this connect can start a new loop
            self.release_reconnect(epoch);
        }
        drop(slot);

        self.notifier.fire_connected(&self.label);
        Ok(())
    }

    /// Settle the state after a failed or cancelled attempt, unless a newer attempt took over
    async fn abandon_attempt(&self, generation: u64) {
        let slot = self.session.lock().await;
        if slot.is_none() && self.generation.load(Ordering::SeqCst) == generation {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Retire the current session, if any. Returns whether there was one.
    async fn teardown(&self, slot: &mut Option<ActiveSession>) -> bool {
        let Some(active) = slot.take() else {
            return false;
        };

        active.reconnect_armed.store(false, Ordering::SeqCst);
        active.receiver.abort();
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.queue.close();

        self.close_session(&*active.session).await;
        self.set_state(ConnectionState::Disconnected);

        if was_connected {
            info!("Disconnected from {}", self.label);
            self.notifier.fire_disconnected(&self.label);
        }
        true
    }

    async fn disconnect(&self) {
        self.advance_epoch();
        let mut slot = self.session.lock().await;
        if !self.teardown(&mut slot).await {
            debug!("[{}] Disconnect requested while not connected", self.label);
            let connecting = *self.state.borrow() == ConnectionState::Connecting;
            if connecting {
                // The pending attempt sees the new epoch and gives up
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    async fn receive_loop(
        self: Arc<Self>,
        generation: u64,
        reconnect_armed: Arc<AtomicBool>,
        channel: String,
        mut events: EventReceiver<T::Event>,
    ) {
        debug!("[{}] Receive loop started for session {}", self.label, generation);
        let reason = loop {
            match events.recv().await {
                Some(TransportEvent::Event(raw)) => self.handle_event(&channel, raw),
                Some(TransportEvent::Closed(reason)) => break reason,
                None => break None,
            }
        };
        self.handle_transport_lost(generation, &reconnect_armed, reason).await;
    }

    fn handle_event(&self, channel: &str, raw: T::Event) {
        let translated = catch_unwind(AssertUnwindSafe(|| self.transport.translate(channel, raw)));
        match translated {
            Ok(Ok(Some(message))) => {
                let message_type = message.message_type.clone();
                let report = self.registry.dispatch(&message_type, &message, None);
                if report.failed > 0 {
                    debug!(
                        "[{}] {} of {} {} handlers failed",
                        self.label, report.failed, report.invoked, message_type
                    );
                }
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!("[{}] Skipping malformed event: {}", self.label, e),
            Err(panic) => error!("[{}] Translator panicked: {}", self.label, panic_message(panic.as_ref())),
        }
    }

    async fn handle_transport_lost(self: &Arc<Self>, generation: u64, reconnect_armed: &AtomicBool, reason: Option<String>) {
        let epoch = {
            let mut slot = self.session.lock().await;
            let is_current = slot.as_ref().map_or(false, |active| active.generation == generation);
            if !is_current {
                return;
            }
            let Some(active) = slot.take() else {
                return;
            };

            self.connected.store(false, Ordering::SeqCst);
            self.queue.close();
            self.set_state(ConnectionState::Disconnected);
            warn!(
                "Disconnected from {}: {}",
                self.label,
                reason.as_deref().unwrap_or("event stream ended")
            );
            self.notifier.fire_disconnected(&self.label);

            self.close_session(&*active.session).await;
            active.epoch
        };

        if reconnect_armed.load(Ordering::SeqCst) && !self.reconnect_cancelled(epoch) {
            self.spawn_reconnect(epoch);
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, epoch: u64) {
        {
            let mut owner = self.reconnect_owner.lock().unwrap_or_else(PoisonError::into_inner);
            if *owner == Some(epoch) {
                debug!("[{}] Reconnect already in progress", self.label);
                return;
            }
            // A loop from an older epoch is on its way out and must not block this one
            *owner = Some(epoch);
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.reconnect_loop(epoch).await;
        });
    }

    fn release_reconnect(&self, epoch: u64) {
        let mut owner = self.reconnect_owner.lock().unwrap_or_else(PoisonError::into_inner);
        if *owner == Some(epoch) {
            *owner = None;
        }
    }

    async fn reconnect_loop(self: &Arc<Self>, epoch: u64) {
        info!("Reconnecting to {} in {:?}", self.label, self.settings.reconnect_delay());

        if self.pause(self.settings.reconnect_delay(), epoch).await {
            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                match self.connect_session(epoch, true).await {
                    Ok(()) => {
                        info!("Reconnected to {} after {} attempt(s)", self.label, attempt);
                        // Ownership was released by connect_session
                        return;
                    }
                    Err(e) => {
                        if self.reconnect_cancelled(epoch) {
                            debug!("[{}] {:#}", self.label, e);
                            break;
                        }
                        info!(
                            "Reconnect attempt {} to {} failed, retrying in {:?}",
                            attempt,
                            self.label,
                            self.settings.retry_delay()
                        );
                    }
                }

                if !self.pause(self.settings.retry_delay(), epoch).await {
                    break;
                }
            }
        }

        info!("Reconnect to {} stopped", self.label);
        self.release_reconnect(epoch);
    }

    fn echo(&self, message: &OutboundMessage) {
        let identity = self
            .identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default();
        let channel = self
            .channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default();

        let display_name = if identity.display_name.is_empty() {
            identity.username.clone()
        } else {
            identity.display_name.clone()
        };
        let user = ChatUser::new(identity.user_id, display_name);
        let echo = ChatMessage::new(MessageType::Message, message.text.clone(), user).with_channel(channel);
        self.registry.dispatch(&MessageType::Message, &echo, Some(&message.caller));
    }
}

impl<T: ChatTransport> MessageSender for ManagerInner<T> {
    fn platform(&self) -> Platform {
        self.transport.platform()
    }

    fn submit(&self, caller: &CallerId, text: &str) -> bool {
        self.queue.enqueue(caller, text)
    }
}

#[async_trait]
impl<T: ChatTransport> OutboundSink for ManagerInner<T> {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn transmit(&self, message: &OutboundMessage) -> Result<()> {
        let session = {
            let slot = self.session.lock().await;
            slot.as_ref().map(|active| Arc::clone(&active.session))
        };
        let session = session.ok_or(TransportError::Closed)?;

        session.send(&message.text).await?;
        if self.settings.echo_outbound {
            self.echo(message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
