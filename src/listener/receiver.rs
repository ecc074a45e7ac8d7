//! TCP receiver for PBX CDR streams.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{error, info, info_span, Instrument};

use crate::bootstrap::{draining, ShutdownManager};
use crate::pipeline::PipelineError;
use crate::telemetry::CdrMetrics;

use super::connection::{Connection, ConnectionId};
use super::{bind_tcp, LineMessage};

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does
/// not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Receiver lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Listening,
    Draining,
    Closed,
}

/// Accepts PBX connections and feeds inputQ.
pub struct Receiver {
    listener: TcpListener,
    local_addr: SocketAddr,
    max_line_length: usize,
    overflow_warning: Duration,
    next_connection_id: u64,
    metrics: Arc<CdrMetrics>,
    shutdown: Arc<ShutdownManager>,
    state: watch::Sender<ReceiverState>,
}

impl Receiver {
    /// Bind the ingest socket. A bind failure is fatal for the caller.
    pub async fn bind(
        address: &str,
        max_line_length: usize,
        overflow_warning: Duration,
        metrics: Arc<CdrMetrics>,
        shutdown: Arc<ShutdownManager>,
    ) -> io::Result<Self> {
        let listener = bind_tcp(address).await?;
        let local_addr = listener.local_addr()?;
        let (state, _) = watch::channel(ReceiverState::Listening);

        info!(address = %local_addr, "started CDR listener");

        Ok(Self {
            listener,
            local_addr,
            max_line_length,
            overflow_warning,
            next_connection_id: 1,
            metrics,
            shutdown,
            state,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Subscribe to lifecycle changes.
    pub fn state(&self) -> watch::Receiver<ReceiverState> {
        self.state.subscribe()
    }

    /// Accept until shutdown starts, then wait for every connection
    /// handler to return.
    ///
    /// `input` and every clone handed to a handler are dropped before this
    /// returns, so inputQ closes once the receiver is done. Always returns
    /// [`PipelineError::Cancelled`].
    pub async fn run(self, input: flume::Sender<LineMessage>) -> Result<(), PipelineError> {
        let Receiver {
            listener,
            local_addr,
            max_line_length,
            overflow_warning,
            mut next_connection_id,
            metrics,
            shutdown,
            state,
        } = self;
        let tracker = TaskTracker::new();
        let mut shutdown_rx = shutdown.subscribe();

        loop {
            let accepted = tokio::select! {
                biased;

                _ = draining(&mut shutdown_rx) => break,

                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let id = ConnectionId(next_connection_id);
                    next_connection_id += 1;

                    let connection = Connection::new(
                        id,
                        peer_addr,
                        max_line_length,
                        overflow_warning,
                        input.clone(),
                        metrics.clone(),
                        shutdown.clone(),
                    );
                    let span = info_span!("conn", id = %id, peer = %peer_addr);
                    tracker.spawn(connection.run(stream).instrument(span));
                }
                Err(e) => {
                    error!(address = %local_addr, error = %e, "failed to accept CDR connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        state.send_replace(ReceiverState::Draining);
        info!(
            address = %local_addr,
            connections = tracker.len(),
            "CDR listener draining"
        );

        drop(listener);
        tracker.close();
        tracker.wait().await;
        drop(input);

        state.send_replace(ReceiverState::Closed);
        info!(address = %local_addr, "stopped CDR listener");

        Err(PipelineError::Cancelled)
    }
}
