// src/queue/mod.rs - Outbound send queue and the fixed-interval sender loop

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};

use crate::dispatch::CallerId;
use crate::shutdown::ShutdownSignal;

/// One submitted chat line waiting for the sender loop
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub caller: CallerId,
    pub text: String,
    pub queued_at: Instant,
}

/// Counters for monitoring the outbound path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub sent: u64,
    /// Submitted or pending while the connection was down
    pub dropped: u64,
    /// Dequeued but rejected by the transport
    pub failed: u64,
    pub pending: usize,
}

#[derive(Default)]
struct Pending {
    entries: VecDeque<OutboundMessage>,
    /// Set while a session is live
    open: bool,
}

/// Unbounded FIFO of outbound messages.
///
/// Any task may enqueue; only the sender loop dequeues. Messages are never
/// buffered across a disconnect: the queue starts closed, submissions while
/// closed are refused, and closing discards whatever is still pending. The
/// open check and the push happen under one lock, so nothing accepted for
/// one session survives into the next.
#[derive(Default)]
pub struct SendQueue {
    pending: Mutex<Pending>,
    enqueued: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `text` for `caller`. Returns false when the message was not queued.
    pub fn enqueue(&self, caller: &CallerId, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }

        let mut pending = self.lock();
        if !pending.open {
            drop(pending);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping message from {} while disconnected", caller);
            return false;
        }

        pending.entries.push_back(OutboundMessage {
            caller: caller.clone(),
            text: text.to_string(),
            queued_at: Instant::now(),
        });
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Start accepting submissions for a new session
    pub fn open(&self) {
        self.lock().open = true;
    }

    /// Stop accepting submissions and discard what is pending. Returns the number discarded.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut pending = self.lock();
            pending.open = false;
            std::mem::take(&mut pending.entries).len()
        };
        self.count_dropped(discarded)
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn pop(&self) -> Option<OutboundMessage> {
        self.lock().entries.pop_front()
    }

    /// Throw away everything pending, counting it as dropped
    pub fn discard_pending(&self) -> usize {
        let discarded = std::mem::take(&mut self.lock().entries).len();
        self.count_dropped(discarded)
    }

    fn count_dropped(&self, discarded: usize) -> usize {
        if discarded > 0 {
            self.dropped.fetch_add(discarded as u64, Ordering::Relaxed);
        }
        discarded
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            pending: self.len(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Where the sender loop hands dequeued messages
#[async_trait]
pub trait OutboundSink: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn transmit(&self, message: &OutboundMessage) -> Result<()>;
}

/// Drain `queue` into `sink`, at most one message per `period`, until shutdown.
pub async fn run_sender_loop<S>(label: String, queue: Arc<SendQueue>, sink: Arc<S>, period: Duration, shutdown: ShutdownSignal)
where
    S: OutboundSink + ?Sized,
{
    info!("[{}] Sender loop started ({:?} interval)", label, period);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        if shutdown.is_shutting_down() {
            break;
        }

        if !sink.is_connected() {
            let discarded = queue.discard_pending();
            if discarded > 0 {
                warn!("[{}] Discarded {} pending message(s) while disconnected", label, discarded);
            }
            continue;
        }

        let Some(message) = queue.pop() else {
            continue;
        };

        match sink.transmit(&message).await {
            Ok(()) => {
                queue.record_sent();
                debug!("[{}] Sent message from {}: {}", label, message.caller, message.text);
            }
            Err(e) => {
                queue.record_failed();
                warn!("[{}] Failed to send message from {}: {:#}", label, message.caller, e);
            }
        }
    }

    info!("[{}] Sender loop stopped", label);
}
