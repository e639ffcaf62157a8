use super::*;
use crate::platforms::{EventSender, TranslateError};
use crate::types::assemble_fragments;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Mutex as StdMutex;
use tokio::sync::mpsc;
use tokio::time::sleep;

enum MockEvent {
    Chat { user: &'static str, fragments: Vec<&'static str> },
    Malformed,
}

/// In-memory transport whose connect outcomes are scripted by the test
#[derive(Default)]
struct MockTransport {
    /// Outcome of upcoming `open` calls; empty means success
    script: StdMutex<VecDeque<bool>>,
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
    sent: Arc<StdMutex<Vec<String>>>,
    live: StdMutex<Option<EventSender<MockEvent>>>,
    /// Makes `authenticate` wait forever, like a server that never answers
    hang_auth: AtomicBool,
}

impl MockTransport {
    fn fail_next(&self, times: usize) {
        let mut script = self.script.lock().unwrap();
        for _ in 0..times {
            script.push_back(false);
        }
    }

    fn succeed_from_now(&self) {
        self.script.lock().unwrap().clear();
    }

    fn push(&self, event: MockEvent) {
        if let Some(events) = self.live.lock().unwrap().as_ref() {
            let _ = events.send(TransportEvent::Event(event));
        }
    }

    fn drop_connection(&self) {
        if let Some(events) = self.live.lock().unwrap().take() {
            let _ = events.send(TransportEvent::Closed(Some("socket reset".to_string())));
        }
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

struct MockSession {
    closes: Arc<AtomicUsize>,
    sent: Arc<StdMutex<Vec<String>>>,
}

#[async_trait]
impl TransportSession for MockSession {
    async fn send(&self, text: &str) -> Result<()> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for Arc<MockTransport> {
    type Event = MockEvent;

    fn platform(&self) -> Platform {
        Platform::Mixer
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity> {
        if self.hang_auth.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(Identity {
            user_id: "1".to_string(),
            username: credentials.username.clone(),
            display_name: "Bot".to_string(),
        })
    }

    async fn resolve_channel(&self, _identity: &Identity, credentials: &Credentials) -> Result<String> {
        Ok(credentials.channel.clone())
    }

    async fn open(&self, _identity: &Identity, _channel: &str, _credentials: &Credentials) -> Result<OpenedSession<MockEvent>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let succeed = self.script.lock().unwrap().pop_front().unwrap_or(true);
        if !succeed {
            return Err(TransportError::Protocol("handshake refused".to_string()).into());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.live.lock().unwrap() = Some(tx);
        Ok(OpenedSession {
            session: Box::new(MockSession {
                closes: Arc::clone(&self.closes),
                sent: Arc::clone(&self.sent),
            }),
            events: rx,
        })
    }

    fn translate(&self, channel: &str, event: MockEvent) -> Result<Option<ChatMessage>, TranslateError> {
        match event {
            MockEvent::Chat { user, fragments } => Ok(Some(
                ChatMessage::new(MessageType::Message, assemble_fragments(fragments), ChatUser::new(user, user))
                    .with_channel(channel),
            )),
            MockEvent::Malformed => Err(TranslateError::MissingField("message")),
        }
    }
}

fn fast_settings() -> ManagerSettings {
    ManagerSettings {
        initial_connect_delay_ms: 10,
        send_interval_ms: 20,
        reconnect_delay_ms: 20,
        retry_delay_ms: 20,
        echo_outbound: true,
    }
}

fn manager(transport: &Arc<MockTransport>) -> (ConnectionManager<Arc<MockTransport>>, ShutdownSignal) {
    manager_with(transport, fast_settings())
}

fn manager_with(
    transport: &Arc<MockTransport>,
    settings: ManagerSettings,
) -> (ConnectionManager<Arc<MockTransport>>, ShutdownSignal) {
    let shutdown = ShutdownSignal::new();
    let manager = ConnectionManager::new(
        Arc::clone(transport),
        Credentials::new("chan", "bot", "token"),
        settings,
        shutdown.clone(),
    );
    (manager, shutdown)
}

/// Quick first reconnect, slow retries
fn slow_retry_settings() -> ManagerSettings {
    ManagerSettings {
        retry_delay_ms: 400,
        ..fast_settings()
    }
}

fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let handle = Arc::clone(&count);
    (count, move || {
        handle.fetch_add(1, Ordering::SeqCst);
    })
}

async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[test_log::test(tokio::test)]
async fn test_initialize_is_idempotent_and_connects() {
    let transport = Arc::new(MockTransport::default());
    let (manager, shutdown) = manager(&transport);
    let (connected, on_connected) = counter();
    manager.on_connected(on_connected);

    assert_eq!(manager.state(), ConnectionState::Uninitialized);
    manager.initialize();
    manager.initialize();
    assert!(manager.is_initialized());

    assert!(manager.wait_for_state(ConnectionState::Connected, Duration::from_secs(2)).await);
    assert!(manager.is_connected());
    assert!(manager.connection_time().is_some());
    assert_eq!(manager.channel().as_deref(), Some("chan"));
    assert_eq!(manager.identity().map(|i| i.username), Some("bot".to_string()));

    sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
    assert_eq!(connected.load(Ordering::SeqCst), 1);
    shutdown.trigger();
}

#[tokio::test]
async fn test_inbound_events_are_translated_and_dispatched() {
    let transport = Arc::new(MockTransport::default());
    let (manager, shutdown) = manager(&transport);
    let received = Arc::new(StdMutex::new(Vec::new()));

    let sink = Arc::clone(&received);
    manager.client("overlay").on_message(move |msg| {
        sink.lock().unwrap().push((msg.user.id.clone(), msg.message.clone(), msg.channel.clone()));
        Ok(())
    });
    manager.client("faulty").on_message(|_msg| Err(anyhow::anyhow!("consumer bug")));

    manager.connect().await.unwrap();
    transport.push(MockEvent::Chat {
        user: "alice",
        fragments: vec!["hello ", "world"],
    });
    transport.push(MockEvent::Malformed);
    transport.push(MockEvent::Chat {
        user: "bob",
        fragments: vec!["second"],
    });

    assert!(wait_until(|| received.lock().unwrap().len() == 2).await);
    let received = received.lock().unwrap();
    assert_eq!(received[0], ("alice".to_string(), "hello world".to_string(), "chan".to_string()));
    assert_eq!(received[1].1, "second");
    assert!(manager.is_connected());
    shutdown.trigger();
}

#[tokio::test]
async fn test_outbound_order_and_echo_filtering() {
    let transport = Arc::new(MockTransport::default());
    let (manager, shutdown) = manager(&transport);
    let sender = manager.client("sender");
    let listener = manager.client("listener");

    let (sender_echoes, sender_handler) = counter();
    sender.on_message(move |_msg| {
        sender_handler();
        Ok(())
    });
    let echoed = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&echoed);
    listener.on_message(move |msg| {
        sink.lock().unwrap().push(msg.message.clone());
        Ok(())
    });

    manager.initialize();
    assert!(manager.wait_for_state(ConnectionState::Connected, Duration::from_secs(2)).await);

    assert!(sender.send_message("a"));
    assert!(sender.send_message("b"));
    assert!(sender.send_message("c"));
    assert!(!sender.send_message(""));

    assert!(wait_until(|| transport.sent().len() == 3).await);
    sleep(Duration::from_millis(60)).await;
    assert_eq!(transport.sent(), vec!["a", "b", "c"]);
    assert_eq!(*echoed.lock().unwrap(), vec!["a", "b", "c"]);
    assert_eq!(sender_echoes.load(Ordering::SeqCst), 0);

    let stats = manager.queue_stats();
    assert_eq!(stats.sent, 3);
    assert_eq!(stats.pending, 0);
    shutdown.trigger();
}

#[tokio::test]
async fn test_send_while_disconnected_is_dropped() {
    let transport = Arc::new(MockTransport::default());
    let (manager, shutdown) = manager(&transport);
    let client = manager.client("plugin");

    assert!(!client.send_message("nobody hears this"));
    let stats = manager.queue_stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.dropped, 1);

    manager.connect().await.unwrap();
    manager.disconnect().await;
    assert!(!client.send_message("still nobody"));
    sleep(Duration::from_millis(50)).await;

    assert!(transport.sent().is_empty());
    assert_eq!(manager.queue_stats().pending, 0);
    assert_eq!(manager.queue_stats().dropped, 2);
    shutdown.trigger();
}

#[tokio::test]
async fn test_double_disconnect_is_safe() {
    let transport = Arc::new(MockTransport::default());
    let (manager, shutdown) = manager(&transport);
    let (disconnected, on_disconnected) = counter();
    manager.on_disconnected(on_disconnected);

    // Disconnecting a manager that never connected is a no-op
    manager.disconnect().await;
    assert_eq!(disconnected.load(Ordering::SeqCst), 0);

    manager.connect().await.unwrap();
    manager.disconnect().await;
    manager.disconnect().await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!manager.is_connected());
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    assert_eq!(transport.closes.load(Ordering::SeqCst), 1);

    // A deliberate disconnect never reconnects
    sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
    shutdown.trigger();
}

#[test_log::test(tokio::test)]
async fn test_reconnects_after_unexpected_loss() {
    let transport = Arc::new(MockTransport::default());
    let (manager, shutdown) = manager(&transport);
    let (connected, on_connected) = counter();
    let (disconnected, on_disconnected) = counter();
    manager.on_connected(on_connected);
    manager.on_disconnected(on_disconnected);

    manager.connect().await.unwrap();
    assert_eq!(connected.load(Ordering::SeqCst), 1);

    transport.fail_next(2);
    transport.drop_connection();

    assert!(wait_until(|| connected.load(Ordering::SeqCst) == 2).await);
    assert!(manager.is_connected());
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    // initial + two refused + one accepted
    assert_eq!(transport.opens.load(Ordering::SeqCst), 4);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(connected.load(Ordering::SeqCst), 2);
    assert_eq!(transport.opens.load(Ordering::SeqCst), 4);

    // The new session delivers events
    let (messages, on_message) = counter();
    manager.client("late").on_message(move |_msg| {
        on_message();
        Ok(())
    });
    transport.push(MockEvent::Chat {
        user: "carol",
        fragments: vec!["back"],
    });
    assert!(wait_until(|| messages.load(Ordering::SeqCst) == 1).await);
    shutdown.trigger();
}

#[tokio::test]
async fn test_disconnect_cancels_pending_reconnect() {
    let transport = Arc::new(MockTransport::default());
    let (manager, shutdown) = manager(&transport);

    manager.connect().await.unwrap();
    transport.fail_next(1000);
    transport.drop_connection();

    assert!(wait_until(|| transport.opens.load(Ordering::SeqCst) >= 3).await);
    manager.disconnect().await;
    sleep(Duration::from_millis(60)).await;
    let attempts = transport.opens.load(Ordering::SeqCst);

    sleep(Duration::from_millis(150)).await;
    assert_eq!(transport.opens.load(Ordering::SeqCst), attempts);
    assert!(!manager.is_connected());
    shutdown.trigger();
}

#[tokio::test]
async fn test_shutdown_stops_reconnect_loop() {
    let transport = Arc::new(MockTransport::default());
    let (manager, shutdown) = manager(&transport);

    manager.connect().await.unwrap();
    transport.fail_next(1000);
    transport.drop_connection();
    assert!(wait_until(|| transport.opens.load(Ordering::SeqCst) >= 2).await);

    shutdown.trigger();
    sleep(Duration::from_millis(60)).await;
    let attempts = transport.opens.load(Ordering::SeqCst);
    sleep(Duration::from_millis(150)).await;
    assert_eq!(transport.opens.load(Ordering::SeqCst), attempts);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_failed_connect_leaves_manager_disconnected() {
    let transport = Arc::new(MockTransport::default());
    let (manager, shutdown) = manager(&transport);
    let (connected, on_connected) = counter();
    manager.on_connected(on_connected);

    transport.fail_next(1);
    let result = manager.connect().await;
    assert!(result.is_err());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!manager.is_connected());
    assert_eq!(connected.load(Ordering::SeqCst), 0);

    // No automatic retry for a failed explicit connect
    sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.opens.load(Ordering::SeqCst), 1);

    manager.connect().await.unwrap();
    assert_eq!(connected.load(Ordering::SeqCst), 1);
    shutdown.trigger();
}

#[tokio::test]
async fn test_connect_replaces_existing_session() {
    let transport = Arc::new(MockTransport::default());
    let (manager, shutdown) = manager(&transport);
    let (connected, on_connected) = counter();
    let (disconnected, on_disconnected) = counter();
    manager.on_connected(on_connected);
    manager.on_disconnected(on_disconnected);

    manager.connect().await.unwrap();
    manager.connect().await.unwrap();

    assert_eq!(connected.load(Ordering::SeqCst), 2);
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    assert_eq!(transport.closes.load(Ordering::SeqCst), 1);

    // The retired session's close must not look like a loss
    sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.opens.load(Ordering::SeqCst), 2);
    assert!(manager.is_connected());
    shutdown.trigger();
}

#[test_log::test(tokio::test)]
async fn test_loss_after_reconnect_was_cancelled_still_reconnects() {
    let transport = Arc::new(MockTransport::default());
    let (manager, shutdown) = manager_with(&transport, slow_retry_settings());
    let (connected, on_connected) = counter();
    manager.on_connected(on_connected);

    manager.connect().await.unwrap();
    transport.fail_next(1000);
    transport.drop_connection();
    assert!(wait_until(|| transport.opens.load(Ordering::SeqCst) >= 2).await);

    // The old loop is now waiting out its retry delay
    manager.disconnect().await;
    transport.succeed_from_now();
    manager.connect().await.unwrap();
    assert_eq!(connected.load(Ordering::SeqCst), 2);

    transport.drop_connection();
    assert!(wait_until(|| connected.load(Ordering::SeqCst) == 3).await);
    assert!(manager.is_connected());
    assert_eq!(manager.state(), ConnectionState::Connected);
    shutdown.trigger();
}

#[tokio::test]
async fn test_manual_connect_supersedes_reconnect_loop() {
    let transport = Arc::new(MockTransport::default());
    let (manager, shutdown) = manager_with(&transport, slow_retry_settings());
    let (connected, on_connected) = counter();
    let (disconnected, on_disconnected) = counter();
    manager.on_connected(on_connected);
    manager.on_disconnected(on_disconnected);

    manager.connect().await.unwrap();
    transport.fail_next(1);
    transport.drop_connection();
    assert!(wait_until(|| transport.opens.load(Ordering::SeqCst) == 2).await);

    manager.connect().await.unwrap();
    assert!(manager.is_connected());

    // Past the loop's retry delay: it must leave the new session alone
    sleep(Duration::from_millis(600)).await;
    assert_eq!(transport.opens.load(Ordering::SeqCst), 3);
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    assert_eq!(connected.load(Ordering::SeqCst), 2);
    assert!(manager.is_connected());
    shutdown.trigger();
}

#[tokio::test]
async fn test_shutdown_interrupts_hung_connect() {
    let transport = Arc::new(MockTransport::default());
    let (manager, shutdown) = manager(&transport);
    transport.hang_auth.store(true, Ordering::SeqCst);

    manager.initialize();
    assert!(manager.wait_for_state(ConnectionState::Connecting, Duration::from_secs(2)).await);

    shutdown.trigger();
    let finished = tokio::time::timeout(Duration::from_secs(3), manager.shutdown()).await;
    assert!(finished.is_ok(), "shutdown waited on a hung connect");
    assert!(manager.wait_for_state(ConnectionState::Disconnected, Duration::from_secs(1)).await);
    assert_eq!(transport.opens.load(Ordering::SeqCst), 0);
    assert!(!manager.is_connected());
}

#[tokio::test]
async fn test_disconnect_abandons_pending_connect() {
    let transport = Arc::new(MockTransport::default());
    let (manager, shutdown) = manager(&transport);
    let (connected, on_connected) = counter();
    manager.on_connected(on_connected);
    transport.hang_auth.store(true, Ordering::SeqCst);

    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect().await })
    };
    assert!(manager.wait_for_state(ConnectionState::Connecting, Duration::from_secs(2)).await);

    let finished = tokio::time::timeout(Duration::from_secs(1), manager.disconnect()).await;
    assert!(finished.is_ok(), "disconnect waited on a hung connect");
    let attempt = tokio::time::timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
    assert!(attempt.is_err());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(connected.load(Ordering::SeqCst), 0);

    // The manager is still usable afterwards
    transport.hang_auth.store(false, Ordering::SeqCst);
    manager.connect().await.unwrap();
    assert!(manager.is_connected());
    shutdown.trigger();
}
