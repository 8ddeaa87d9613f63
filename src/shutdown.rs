//! Shutdown Module
//!
//! Process termination and the idle-shutdown timer. Shutdown is immediate: the upload
//! staging directory is cleared and every listener is told to stop, without waiting for
//! in-flight requests or uploads.

use crate::upload_staging::UploadStaging;
use crate::{ProxyError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

/// Shutdown coordinator shared by the server, the idle watcher and the signal listener
pub struct ShutdownCoordinator {
    staging: UploadStaging,
    shutdown_sender: broadcast::Sender<()>,
    requested: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(staging: UploadStaging) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);

        Self {
            staging,
            shutdown_sender,
            requested: AtomicBool::new(false),
        }
    }

    /// Get a shutdown signal for a component that must stop on shutdown
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.shutdown_sender.subscribe(),
            shutdown_requested: self.is_shutdown_requested(),
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Log `reason`, clear the staging directory and notify every subscriber.
    ///
    /// Only the first request has any effect.
    pub fn request_shutdown(&self, reason: &str) {
        if self.requested.swap(true, Ordering::AcqRel) {
            debug!("Shutdown already requested; ignoring: {}", reason);
            return;
        }

        info!("{}", reason);
        self.staging.clear();

        if let Err(e) = self.shutdown_sender.send(()) {
            // No component is listening, which is normal in tests
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }
    }

    /// Wait for SIGINT or SIGTERM, then request shutdown
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => self.request_shutdown("Received SIGINT; terminating"),
            _ = sigterm.recv() => self.request_shutdown("Received SIGTERM; terminating"),
        }

        Ok(())
    }
}

/// Shutdown signal wrapper for components
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
    shutdown_requested: bool,
}

impl ShutdownSignal {
    /// Check if shutdown has been requested (non-blocking)
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Wait for shutdown signal
    pub async fn wait_for_shutdown(&mut self) {
        if self.shutdown_requested {
            return;
        }
        // Closed and lagged channels both mean the coordinator has moved on
        let _ = self.receiver.recv().await;
        self.shutdown_requested = true;
    }
}

/// Deadline that moves forward on every request
#[derive(Debug)]
pub struct IdleTimer {
    idle_timeout: Option<Duration>,
    last_activity: Mutex<Instant>,
}

impl IdleTimer {
    /// `None` disables idle shutdown
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self {
            idle_timeout,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Record activity, pushing the idle deadline out
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn deadline(&self, idle_timeout: Duration) -> Instant {
        *self.last_activity.lock().unwrap() + idle_timeout
    }

    /// Resolve once no activity has been recorded for the idle timeout.
    ///
    /// Never resolves when idle shutdown is disabled.
    pub async fn wait_until_idle(&self) {
        let idle_timeout = match self.idle_timeout {
            Some(idle_timeout) => idle_timeout,
            None => return std::future::pending().await,
        };

        loop {
            let deadline = self.deadline(idle_timeout);
            tokio::time::sleep_until(deadline).await;
            if self.deadline(idle_timeout) <= Instant::now() {
                return;
            }
        }
    }
}
