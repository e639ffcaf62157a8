// src/shutdown.rs - Process-wide "application is exiting" signal

use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::sleep;

/// Shared shutdown flag observed by every background loop.
///
/// Cloning is cheap; all clones observe the same flag. Once triggered it
/// stays triggered.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn trigger(&self) {
        if !self.sender.send_replace(true) {
            info!("Shutdown requested");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown has been triggered
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration` unless shutdown comes first. Returns true if the full sleep elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = sleep(duration) => !self.is_shutting_down(),
            _ = self.cancelled() => false,
        }
    }

    /// Trigger this signal on Ctrl+C or SIGTERM
    pub fn listen_for_os_signals(&self) {
        let on_ctrl_c = self.clone();
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C signal, initiating shutdown...");
                    on_ctrl_c.trigger();
                }
                Err(err) => {
                    error!("Failed to listen for Ctrl+C signal: {}", err);
                }
            }
        });

        // systemd, docker stop, etc.
        #[cfg(unix)]
        {
            let on_sigterm = self.clone();
            tokio::spawn(async move {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        info!("Received SIGTERM signal, initiating shutdown...");
                        on_sigterm.trigger();
                    }
                    Err(err) => {
                        error!("Failed to register SIGTERM handler: {}", err);
                    }
                }
            });
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
