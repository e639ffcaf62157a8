// src/dispatch/mod.rs - Caller-scoped handler registry with failure containment

use log::{debug, error, warn};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::types::{ChatMessage, MessageType};

/// What a handler returns; an `Err` is logged and counted, never propagated
pub type HandlerResult = anyhow::Result<()>;

pub type Handler = Arc<dyn Fn(&ChatMessage) -> HandlerResult + Send + Sync>;

static NEXT_CALLER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one independent consumer of the chat core.
///
/// Every consumer gets its own callback slot per message type, so two
/// modules can both listen for `Message` without replacing each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerId {
    id: u64,
    name: Arc<str>,
}

impl CallerId {
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self {
            id: NEXT_CALLER_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(name),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Returned by [`HandlerRegistry::register`]; removes exactly that slot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerToken {
    message_type: MessageType,
    caller: CallerId,
}

impl HandlerToken {
    pub fn message_type(&self) -> &MessageType {
        &self.message_type
    }

    pub fn caller(&self) -> &CallerId {
        &self.caller
    }
}

/// Outcome of one dispatch pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that were called, including the ones that failed
    pub invoked: usize,
    /// Handlers that returned an error or panicked
    pub failed: usize,
    /// Whether the originating caller's handler was skipped
    pub skipped_origin: bool,
}

/// Per-message-type table of caller-scoped callbacks.
///
/// Registration happens on host tasks, dispatch on a connection's receive
/// task; callbacks are invoked outside the table lock, on the receive task,
/// so anything needing a particular thread must marshal itself.
pub struct HandlerRegistry {
    label: String,
    handlers: RwLock<HashMap<MessageType, Vec<(CallerId, Handler)>>>,
}

impl HandlerRegistry {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Install `handler` for (`message_type`, `caller`), replacing any previous one
    pub fn register<F>(&self, message_type: MessageType, caller: &CallerId, handler: F) -> HandlerToken
    where
        F: Fn(&ChatMessage) -> HandlerResult + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let mut table = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let slots = table.entry(message_type.clone()).or_default();

        match slots.iter_mut().find(|(owner, _)| owner == caller) {
            Some(slot) => {
                slot.1 = handler;
                debug!("[{}] Replaced {} handler for {}", self.label, message_type, caller);
            }
            None => {
                slots.push((caller.clone(), handler));
                debug!("[{}] Registered {} handler for {}", self.label, message_type, caller);
            }
        }

        HandlerToken {
            message_type,
            caller: caller.clone(),
        }
    }

    /// Remove the slot behind `token`; returns false if it was already gone
    pub fn unregister(&self, token: &HandlerToken) -> bool {
        let mut table = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(slots) = table.get_mut(&token.message_type) else {
            return false;
        };
        let before = slots.len();
        slots.retain(|(owner, _)| owner != &token.caller);
        let removed = slots.len() != before;
        if slots.is_empty() {
            table.remove(&token.message_type);
        }
        removed
    }

    /// Remove every slot owned by `caller`, returning how many were dropped
    pub fn unregister_caller(&self, caller: &CallerId) -> usize {
        let mut table = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        table.retain(|_, slots| {
            let before = slots.len();
            slots.retain(|(owner, _)| owner != caller);
            removed += before - slots.len();
            !slots.is_empty()
        });
        removed
    }

    pub fn handler_count(&self, message_type: &MessageType) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(message_type)
            .map_or(0, Vec::len)
    }

    pub fn is_registered(&self, message_type: &MessageType, caller: &CallerId) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(message_type)
            .map_or(false, |slots| slots.iter().any(|(owner, _)| owner == caller))
    }

    /// Invoke every handler for `message_type`, skipping the one owned by `origin`.
    ///
    /// A handler that errors or panics is logged and counted; the rest still run.
    pub fn dispatch(&self, message_type: &MessageType, message: &ChatMessage, origin: Option<&CallerId>) -> DispatchReport {
        let snapshot: Vec<(CallerId, Handler)> = {
            let table = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            match table.get(message_type) {
                Some(slots) => slots.clone(),
                None => return DispatchReport::default(),
            }
        };

        let mut report = DispatchReport::default();
        for (caller, handler) in snapshot {
            if origin == Some(&caller) {
                report.skipped_origin = true;
                continue;
            }

            report.invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!("[{}] {} handler of {} failed: {:#}", self.label, message_type, caller, e);
                }
                Err(panic) => {
                    report.failed += 1;
                    error!(
                        "[{}] {} handler of {} panicked: {}",
                        self.label,
                        message_type,
                        caller,
                        panic_message(panic.as_ref())
                    );
                }
            }
        }

        report
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
