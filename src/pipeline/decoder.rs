//! Decoder worker - turns raw lines into CDRs.
//!
//! Consumes: inputQ
//! Produces: saveQ, metricsQ (via [`FanOut`])

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::bootstrap::{terminated, ShutdownManager, ShutdownState};
use crate::cdr::{LineDecoder, SpillFile};
use crate::listener::LineMessage;
use crate::telemetry::CdrMetrics;

use super::{FanOut, PipelineError};

/// One member of the decoder pool.
pub struct DecoderWorker {
    id: usize,
    decoder: LineDecoder,
    input: flume::Receiver<LineMessage>,
    output: FanOut,
    metrics: Arc<CdrMetrics>,
    spill: Option<Arc<SpillFile>>,
    shutdown: Arc<ShutdownManager>,
}

impl DecoderWorker {
    pub fn new(
        id: usize,
        decoder: LineDecoder,
        input: flume::Receiver<LineMessage>,
        output: FanOut,
        metrics: Arc<CdrMetrics>,
        shutdown: Arc<ShutdownManager>,
    ) -> Self {
        Self {
            id,
            decoder,
            input,
            output,
            metrics,
            spill: None,
            shutdown,
        }
    }

    /// Also append rejected lines to `spill`.
    pub fn with_spill(mut self, spill: Option<Arc<SpillFile>>) -> Self {
        self.spill = spill;
        self
    }

    /// Drain inputQ until it closes.
    ///
    /// Dropping `self` on return releases this worker's saveQ and metricsQ
    /// senders.
    pub async fn run(self) -> Result<(), PipelineError> {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            let message = tokio::select! {
                biased;

                _ = terminated(&mut shutdown_rx) => return Err(PipelineError::Cancelled),

                message = self.input.recv_async() => match message {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };

            self.process(message, &mut shutdown_rx).await?;
        }

        debug!(worker = self.id, "decoder worker stopped");
        Ok(())
    }

    async fn process(
        &self,
        message: LineMessage,
        shutdown_rx: &mut watch::Receiver<ShutdownState>,
    ) -> Result<(), PipelineError> {
        match self.decoder.decode(&message.source, &message.payload) {
            Ok(cdr) => self.output.send(Arc::new(cdr), shutdown_rx).await,
            Err(e) => {
                self.metrics.decode_error(&message.source);
                warn!(
                    worker = self.id,
                    source = %message.source,
                    error = %e,
                    line = %message.payload,
                    "failed to decode CDR"
                );

                if let Some(spill) = &self.spill {
                    if let Err(spill_err) = spill.append(&message.source, &message.payload, &e).await {
                        error!(error = %spill_err, "failed to write failed CDR file");
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::FixedOffset;

    use crate::cdr::{CallZone, Cdr};
    use crate::pipeline::{bounded, Queue};

    fn line() -> String {
        let ts = chrono::DateTime::parse_from_rfc3339("2024-01-01T09:29:00+03:00").unwrap();
        Cdr::new("ignored", ts, 60)
            .with_flags('A', 'N')
            .with_trunks("5678", "T100")
            .with_vdn("V0001")
            .to_line()
    }

    struct Harness {
        input: flume::Sender<LineMessage>,
        save: flume::Receiver<Arc<Cdr>>,
        metrics_rx: flume::Receiver<Arc<Cdr>>,
        metrics: Arc<CdrMetrics>,
        worker: DecoderWorker,
    }

    fn harness() -> Harness {
        let shutdown = ShutdownManager::new(Duration::from_secs(30));
        let metrics = Arc::new(CdrMetrics::new().unwrap());
        let input = bounded::<LineMessage>(5);
        let Queue { tx: save_tx, rx: save } = bounded(5);
        let Queue { tx: metrics_tx, rx: metrics_rx } = bounded(5);

        let zone = CallZone::Fixed(FixedOffset::east_opt(3 * 3600).unwrap());
        let worker = DecoderWorker::new(
            0,
            LineDecoder::new(zone),
            input.rx,
            FanOut::new(save_tx, metrics_tx, Duration::from_secs(1)),
            metrics.clone(),
            shutdown,
        );

        Harness {
            input: input.tx,
            save,
            metrics_rx,
            metrics,
            worker,
        }
    }

    #[tokio::test]
    async fn test_good_line_reaches_both_queues() {
        let h = harness();
        h.input
            .send_async(LineMessage::new("10.0.0.5", line()))
            .await
            .unwrap();
        drop(h.input);

        h.worker.run().await.unwrap();

        let saved = h.save.recv_async().await.unwrap();
        assert_eq!(saved.source, "10.0.0.5");
        assert_eq!(saved.vdn, "V0001");
        assert_eq!(h.metrics_rx.recv_async().await.unwrap(), saved);

        // Worker gone: both output queues are closed
        assert!(h.save.recv_async().await.is_err());
        assert!(h.metrics_rx.recv_async().await.is_err());
    }

    #[tokio::test]
    async fn test_bad_line_counts_error() {
        let h = harness();
        let mut short = line();
        short.pop();
        h.input
            .send_async(LineMessage::new("10.0.0.5", short))
            .await
            .unwrap();
        drop(h.input);

        h.worker.run().await.unwrap();

        assert!(h.save.try_recv().is_err());
        assert!(h.metrics_rx.try_recv().is_err());
        assert_eq!(
            h.metrics.sample("yaacc_cdr_err_count", &[("source", "10.0.0.5")]),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_bad_line_is_spilled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.jsonl");
        let spill = Arc::new(SpillFile::open(&path).await.unwrap());

        let h = harness();
        let worker = h.worker.with_spill(Some(spill.clone()));
        h.input
            .send_async(LineMessage::new("10.0.0.5", "garbage".to_string()))
            .await
            .unwrap();
        drop(h.input);

        worker.run().await.unwrap();

        assert_eq!(spill.records(), 1);
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.contains("\"line\":\"garbage\""));
    }

    #[tokio::test]
    async fn test_source_comes_from_message() {
        let h = harness();
        h.input
            .send_async(LineMessage::new("192.168.1.10", line()))
            .await
            .unwrap();
        drop(h.input);

        h.worker.run().await.unwrap();
        assert_eq!(h.save.recv_async().await.unwrap().source, "192.168.1.10");
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_spilling_worker_runs_on_spawned_task() {
        let dir = tempfile::tempdir().unwrap();
        let spill = Arc::new(SpillFile::open(dir.path().join("failed.jsonl")).await.unwrap());

        let h = harness();
        let run = h.worker.with_spill(Some(spill.clone())).run();
        assert_send(&run);

        h.input
            .send_async(LineMessage::new("10.0.0.5", "garbage".to_string()))
            .await
            .unwrap();
        drop(h.input);

        tokio::spawn(run).await.unwrap().unwrap();
        assert_eq!(spill.records(), 1);
    }
}
