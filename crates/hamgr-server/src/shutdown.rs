//! Graceful shutdown
//!
//! Leaving the cluster is a two step affair: stop the HA manager so the lock
//! is released, then keep answering requests while the provider's lock-delay
//! runs out and another node takes over.

use std::time::Duration;

use hamgr_core::HighAvailability;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Shutdown signal sender and receiver
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(());
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the node is stepping down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Signal,
    ReleaseDelay,
}

/// Trigger `signal` on Ctrl+C or SIGTERM
pub fn listen_for_os_signals(signal: ShutdownSignal) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("fail to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("fail to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received Ctrl+C, stepping down"),
            _ = terminate => info!("received SIGTERM, stepping down"),
        }

        signal.shutdown();
    });
}

/// Wait for a shutdown signal, or for `release_delay` when one is configured
pub async fn wait_for_release(
    signal: &ShutdownSignal,
    release_delay: Option<Duration>,
) -> ShutdownTrigger {
    let mut receiver = signal.subscribe();
    match release_delay {
        Some(delay) => {
            info!("releasing leadership in {:?}", delay);
            tokio::select! {
                _ = receiver.recv() => ShutdownTrigger::Signal,
                _ = tokio::time::sleep(delay) => ShutdownTrigger::ReleaseDelay,
            }
        }
        None => {
            let _ = receiver.recv().await;
            ShutdownTrigger::Signal
        }
    }
}

/// Stop the HA manager, then keep serving for `grace`
pub async fn step_down<H: HighAvailability + ?Sized>(ha: &H, grace: Duration) {
    ha.stop().await;
    info!("keep serving for {:?} while the lock delay runs out", grace);
    tokio::time::sleep(grace).await;
}
