//! Process-wide shutdown and reconfigure intents.
//!
//! Signal handlers (and the `Shutdown`/`Reconfigure` RPCs) only flip flags and
//! wake the accept loop; the loop acts on them between accepts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::info;

#[derive(Debug, Default)]
pub struct Intents {
    shutdown: AtomicBool,
    reconfigure: AtomicBool,
    wake: Notify,
}

impl Intents {
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn request_reconfigure(&self) {
        self.reconfigure.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Consume a pending reconfigure request.
    pub fn take_reconfigure(&self) -> bool {
        self.reconfigure.swap(false, Ordering::SeqCst)
    }

    /// Resolves once an intent has been raised since the last wake.
    pub async fn woken(&self) {
        self.wake.notified().await;
    }
}

/// SIGTERM and SIGINT request shutdown, SIGHUP requests reconfigure.
pub fn spawn_signal_handlers(intents: Arc<Intents>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(()) = sigterm.recv() => {
                    info!("received SIGTERM; shutting down");
                    intents.request_shutdown();
                }
                Some(()) = sigint.recv() => {
                    info!("received SIGINT; shutting down");
                    intents.request_shutdown();
                }
                Some(()) = sighup.recv() => {
                    info!("received SIGHUP; reconfiguring");
                    intents.request_reconfigure();
                }
                else => break,
            }
        }
    });
    Ok(())
}
