//! Per-connection handler for PBX CDR streams.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, info, warn};

use crate::bootstrap::{draining, ShutdownManager, ShutdownState};
use crate::pipeline::{send_with_warning, PipelineError, INPUT_QUEUE};
use crate::telemetry::CdrMetrics;

use super::codec::CdrLineCodec;
use super::LineMessage;

/// Unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reads one PBX stream and publishes its lines to inputQ.
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    /// Host part of the peer address; IPv4-mapped peers in plain form
    source: String,
    max_line_length: usize,
    overflow_warning: Duration,
    input: flume::Sender<LineMessage>,
    metrics: Arc<CdrMetrics>,
    shutdown: Arc<ShutdownManager>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        max_line_length: usize,
        overflow_warning: Duration,
        input: flume::Sender<LineMessage>,
        metrics: Arc<CdrMetrics>,
        shutdown: Arc<ShutdownManager>,
    ) -> Self {
        Self {
            id,
            peer_addr,
            source: peer_addr.ip().to_canonical().to_string(),
            max_line_length,
            overflow_warning,
            input,
            metrics,
            shutdown,
        }
    }

    /// Serve the stream until EOF, a framing error or shutdown.
    ///
    /// On drain the handler stops reading, publishes the complete lines it
    /// has already buffered and closes the socket.
    pub async fn run(self, stream: TcpStream) {
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        info!(id = %self.id, peer = %self.peer_addr, local = %local, "new CDR connection");
        self.metrics.connection_opened(&self.source);

        let mut frames = FramedRead::new(stream, CdrLineCodec::new(self.max_line_length));
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut lines: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;

                _ = draining(&mut shutdown_rx) => {
                    let buffered = frames.read_buffer().clone();
                    lines += self.flush_buffered(buffered, &mut shutdown_rx).await;
                    debug!(peer = %self.peer_addr, "closing connection for shutdown");
                    break;
                }

                next = frames.next() => next,
            };

            match next {
                Some(Ok(line)) => {
                    if self.publish(line, &mut shutdown_rx).await.is_err() {
                        break;
                    }
                    lines += 1;
                }
                Some(Err(e)) => {
                    warn!(peer = %self.peer_addr, error = %e, "error handling CDR connection");
                    break;
                }
                None => break,
            }
        }

        self.metrics.connection_closed();
        info!(id = %self.id, peer = %self.peer_addr, lines, "closing CDR connection");
    }

    async fn publish(
        &self,
        payload: String,
        shutdown_rx: &mut watch::Receiver<ShutdownState>,
    ) -> Result<(), PipelineError> {
        let message = LineMessage::new(&self.source, payload);
        let result = send_with_warning(
            &self.input,
            message,
            INPUT_QUEUE,
            self.overflow_warning,
            shutdown_rx,
        )
        .await;

        if let Err(e) = &result {
            debug!(peer = %self.peer_addr, error = %e, "line not published");
        }
        result
    }

    async fn flush_buffered(
        &self,
        mut buffered: bytes::BytesMut,
        shutdown_rx: &mut watch::Receiver<ShutdownState>,
    ) -> u64 {
        let mut codec = CdrLineCodec::new(self.max_line_length);
        let mut published = 0;

        while let Ok(Some(line)) = codec.decode(&mut buffered) {
            if self.publish(line, shutdown_rx).await.is_err() {
                break;
            }
            published += 1;
        }
        published
    }
}
