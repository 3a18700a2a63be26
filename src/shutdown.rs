use std::future::Future;
use std::sync::Arc;

use log::{info, warn};

use crate::error::Result;
use crate::tally::{Accumulator, Snapshot};
use crate::tasks::flusher::FlushHandle;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Stopping,
    Stopped,
}

/// Termination signals the process reacts to: SIGINT, SIGTERM and SIGHUP.
pub struct TerminationSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
}

impl TerminationSignals {
    #[cfg(unix)]
    pub fn register() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    #[cfg(not(unix))]
    pub fn register() -> Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    pub async fn recv(self) {
        let Self { mut interrupt, mut terminate, mut hangup } = self;
        tokio::select! {
            _ = interrupt.recv() => info!("Received SIGINT"),
            _ = terminate.recv() => info!("Received SIGTERM"),
            _ = hangup.recv() => info!("Received SIGHUP"),
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received ctrl-c");
    }
}

/// Sequences the stop: a termination request stops the flush timer and asks
/// the transport to stop; the process may exit once the transport reports it
/// has stopped.
pub struct ShutdownCoordinator {
    flusher: FlushHandle,
    transport: Arc<dyn Transport>,
    accumulator: Arc<Accumulator>,
    state: ShutdownState,
}

impl ShutdownCoordinator {
    pub fn new(flusher: FlushHandle, transport: Arc<dyn Transport>, accumulator: Arc<Accumulator>) -> Self {
        Self {
            flusher,
            transport,
            accumulator,
            state: ShutdownState::Running,
        }
    }

    /// Drives the shutdown state machine until `Stopped`. Returns whatever
    /// votes were still pending after the last flush cycle finished.
    pub async fn run<F>(mut self, termination: F) -> Snapshot
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(termination);
        let transport = Arc::clone(&self.transport);

        loop {
            match self.state {
                ShutdownState::Running => {
                    tokio::select! {
                        _ = &mut termination => {
                            info!("Shutting down...");
                            self.flusher.stop();
                            transport.stop();
                            self.state = ShutdownState::Stopping;
                        }
                        _ = transport.stopped() => {
                            warn!("Vote consumer stopped unexpectedly");
                            self.flusher.stop();
                            self.state = ShutdownState::Stopped;
                        }
                    }
                }
                ShutdownState::Stopping => {
                    transport.stopped().await;
                    self.state = ShutdownState::Stopped;
                }
                ShutdownState::Stopped => break,
            }
        }

        self.flusher.stopped().await;

        let pending = self.accumulator.drain();
        if !pending.is_empty() {
            let votes: u64 = pending.values().sum();
            warn!(
                "Exiting with {} vote(s) not written to the database: {}",
                votes,
                serde_json::to_string(&pending).unwrap_or_else(|_| format!("{:?}", pending))
            );
        }
        info!("Shutdown complete");
        pending
    }
}
