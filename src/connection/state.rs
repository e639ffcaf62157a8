// src/connection/state.rs - Connection state machine and lifecycle notifications

use log::error;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use crate::dispatch::panic_message;

/// Lifecycle of one platform connection
///
/// `Uninitialized → Connecting → Connected → Disconnected → Connecting → …`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

pub type Notification = Arc<dyn Fn() + Send + Sync>;

/// Zero-argument callbacks fired on connect and disconnect.
///
/// Callbacks run on background tasks; a panicking callback is logged and
/// does not affect the others.
#[derive(Default)]
pub(crate) struct Notifier {
    connected: RwLock<Vec<Notification>>,
    disconnected: RwLock<Vec<Notification>>,
}

impl Notifier {
    pub(crate) fn on_connected(&self, callback: Notification) {
        self.connected.write().unwrap_or_else(PoisonError::into_inner).push(callback);
    }

    pub(crate) fn on_disconnected(&self, callback: Notification) {
        self.disconnected.write().unwrap_or_else(PoisonError::into_inner).push(callback);
    }

    pub(crate) fn fire_connected(&self, label: &str) {
        Self::fire(label, "on_connected", &self.connected);
    }

    pub(crate) fn fire_disconnected(&self, label: &str) {
        Self::fire(label, "on_disconnected", &self.disconnected);
    }

    fn fire(label: &str, name: &str, list: &RwLock<Vec<Notification>>) {
        let callbacks: Vec<Notification> = list.read().unwrap_or_else(PoisonError::into_inner).clone();
        for callback in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback())) {
                error!("[{}] {} callback panicked: {}", label, name, panic_message(panic.as_ref()));
            }
        }
    }
}
