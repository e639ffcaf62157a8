// src/connection/client.rs - Per-consumer handle onto a connection manager

use std::sync::Arc;

use crate::dispatch::{CallerId, HandlerRegistry, HandlerResult, HandlerToken};
use crate::types::{ChatMessage, MessageType, Platform};

/// Outbound half of a connection manager, independent of its transport type
pub(crate) trait MessageSender: Send + Sync {
    fn platform(&self) -> Platform;

    fn submit(&self, caller: &CallerId, text: &str) -> bool;
}

/// A consumer's view of one platform connection.
///
/// Handlers registered and messages sent through the same client share one
/// [`CallerId`]: re-registering a message type replaces the client's earlier
/// handler, and the client does not receive the echo of its own sends.
#[derive(Clone)]
pub struct ChatClient {
    caller: CallerId,
    registry: Arc<HandlerRegistry>,
    sender: Arc<dyn MessageSender>,
}

impl ChatClient {
    pub(crate) fn new(caller: CallerId, registry: Arc<HandlerRegistry>, sender: Arc<dyn MessageSender>) -> Self {
        Self { caller, registry, sender }
    }

    pub fn caller(&self) -> &CallerId {
        &self.caller
    }

    pub fn platform(&self) -> Platform {
        self.sender.platform()
    }

    /// Handle `message_type` events. Runs on the connection's receive task.
    pub fn on<F>(&self, message_type: MessageType, handler: F) -> HandlerToken
    where
        F: Fn(&ChatMessage) -> HandlerResult + Send + Sync + 'static,
    {
        self.registry.register(message_type, &self.caller, handler)
    }

    pub fn on_message<F>(&self, handler: F) -> HandlerToken
    where
        F: Fn(&ChatMessage) -> HandlerResult + Send + Sync + 'static,
    {
        self.on(MessageType::Message, handler)
    }

    pub fn unregister(&self, token: &HandlerToken) -> bool {
        self.registry.unregister(token)
    }

    /// Drop every handler this client registered
    pub fn unregister_all(&self) -> usize {
        self.registry.unregister_caller(&self.caller)
    }

    /// Fire-and-forget send.
    ///
    /// Returns false when the message was refused: empty text, or the
    /// connection is down. Refused messages are dropped, not buffered.
    pub fn send_message(&self, text: &str) -> bool {
        self.sender.submit(&self.caller, text)
    }
}
