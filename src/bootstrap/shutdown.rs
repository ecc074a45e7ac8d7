use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Shutdown state machine
///
/// States:
/// 1. Running - normal operation
/// 2. Draining - receiver stops accepting, queues drain in pipeline order
/// 3. Terminated - hard stop, every worker returns immediately
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Terminated,
}

/// Shared cancellation context for the pipeline
#[derive(Debug)]
pub struct ShutdownManager {
    /// Current state
    state: watch::Sender<ShutdownState>,

    /// How long draining may take before the hard stop
    drain_period: Duration,
}

impl ShutdownManager {
    pub fn new(drain_period: Duration) -> Arc<Self> {
        let (state, _) = watch::channel(ShutdownState::Running);

        Arc::new(Self {
            state,
            drain_period,
        })
    }

    /// Get current state
    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Start draining (signal received or a worker failed).
    ///
    /// Returns false if shutdown was already under way.
    pub fn start_drain(&self) -> bool {
        let started = self.state.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::Draining;
                true
            } else {
                false
            }
        });

        if started {
            info!(
                drain_period_secs = self.drain_period.as_secs(),
                "starting graceful shutdown drain"
            );
        }
        started
    }

    /// Hard stop
    pub fn terminate(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ShutdownState::Terminated {
                false
            } else {
                *state = ShutdownState::Terminated;
                true
            }
        });

        if changed {
            info!("shutdown complete");
        }
    }

    /// Check if accepting new connections
    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Terminate once the drain period has elapsed.
    ///
    /// Returns as soon as the state reaches `Terminated` by other means.
    pub async fn enforce_drain_deadline(self: Arc<Self>) {
        let mut rx = self.subscribe();
        draining(&mut rx).await;

        tokio::select! {
            _ = terminated(&mut rx) => {}
            _ = tokio::time::sleep(self.drain_period) => {
                warn!(
                    drain_period_secs = self.drain_period.as_secs(),
                    "drain timeout reached, forcing shutdown"
                );
                self.terminate();
            }
        }
    }
}

/// Resolve once the state leaves `Running`.
pub async fn draining(rx: &mut watch::Receiver<ShutdownState>) {
    let _ = rx.wait_for(|state| *state != ShutdownState::Running).await;
}

/// Resolve once the state reaches `Terminated`.
pub async fn terminated(rx: &mut watch::Receiver<ShutdownState>) {
    let _ = rx.wait_for(|state| *state == ShutdownState::Terminated).await;
}
