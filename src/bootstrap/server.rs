use anyhow::{anyhow, Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

use crate::cdr::{Cdr, LineDecoder, SpillFile};
use crate::config::Config;
use crate::listener::{LineMessage, Receiver};
use crate::pipeline::{
    bounded, DecoderWorker, FanOut, MetricsCollector, PipelineError, Queue, StorageWorker,
};
use crate::store::{create_store, SharedStore};
use crate::telemetry::{CdrMetrics, MetricsServer};

use super::shutdown::{draining, terminated, ShutdownManager};

type TaskResult = (String, Result<(), PipelineError>);

/// Main yaacc supervisor
///
/// Components:
/// - Receiver: TCP accept loop, one handler task per PBX connection
/// - Decoder pool: inputQ -> saveQ + metricsQ
/// - Storage pool: saveQ -> store
/// - Metrics collector: metricsQ -> Prometheus counters
/// - Metrics server: Prometheus endpoint on the metrics port
/// - Shutdown manager: graceful drain bounded by `pipeline.drain_timeout`
pub struct Server {
    config: Arc<Config>,

    store: SharedStore,

    metrics: Arc<CdrMetrics>,

    shutdown: Arc<ShutdownManager>,

    /// Ingest address once bound
    ingest: watch::Sender<Option<SocketAddr>>,
}

impl Server {
    /// Connect the configured store and create its table.
    pub async fn new(config: Config) -> Result<Self> {
        let store = create_store(&config.database)
            .await
            .context("failed to initialise storage")?;

        Self::with_store(config, store).await
    }

    /// Use an already constructed store. The table is still created here.
    pub async fn with_store(config: Config, store: SharedStore) -> Result<Self> {
        store
            .create_table()
            .await
            .with_context(|| format!("failed to create table in {} store", store.name()))?;

        let metrics = CdrMetrics::new().context("failed to register metrics")?;
        let shutdown = ShutdownManager::new(config.pipeline.drain_timeout);
        let (ingest, _) = watch::channel(None);

        Ok(Self {
            config: Arc::new(config),
            store,
            metrics: Arc::new(metrics),
            shutdown,
            ingest,
        })
    }

    /// Get shutdown manager
    pub fn shutdown_manager(&self) -> Arc<ShutdownManager> {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> Arc<CdrMetrics> {
        self.metrics.clone()
    }

    /// Resolves to the bound ingest address once `run` has bound it.
    pub fn ingest_address(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.ingest.subscribe()
    }

    /// Run the pipeline until a signal or a worker failure, then drain.
    ///
    /// Returns the first worker failure, if any. Cancellation is not a
    /// failure.
    pub async fn run(self) -> Result<()> {
        let Server {
            config,
            store,
            metrics,
            shutdown,
            ingest,
        } = self;

        let span = info_span!("yaacc", version = env!("CARGO_PKG_VERSION"));
        let pipeline = &config.pipeline;
        let workers = pipeline.worker_count();

        let receiver = Receiver::bind(
            config.cdr_address.as_str(),
            pipeline.max_line_length,
            pipeline.overflow_warning,
            metrics.clone(),
            shutdown.clone(),
        )
        .instrument(span.clone())
        .await
        .with_context(|| format!("failed to bind CDR listener on {}", config.cdr_address))?;
        ingest.send_replace(Some(receiver.local_addr()));

        let zone = config
            .decoder
            .zone()
            .context("invalid decoder.utc_offset")?;

        let spill = match &config.failcdr {
            Some(path) => {
                let spill = SpillFile::open(path)
                    .await
                    .with_context(|| format!("failed to open failed CDR file {}", path.display()))?;
                Some(Arc::new(spill))
            }
            None => None,
        };

        let Queue {
            tx: input_tx,
            rx: input_rx,
        } = bounded::<LineMessage>(pipeline.queue_capacity);
        let Queue {
            tx: save_tx,
            rx: save_rx,
        } = bounded::<Arc<Cdr>>(pipeline.queue_capacity);
        let Queue {
            tx: metrics_tx,
            rx: metrics_rx,
        } = bounded::<Arc<Cdr>>(pipeline.queue_capacity);

        let mut tasks: JoinSet<TaskResult> = JoinSet::new();

        for id in 0..workers {
            let worker = StorageWorker::new(
                id,
                save_rx.clone(),
                store.clone(),
                pipeline.on_store_error,
                metrics.clone(),
                shutdown.clone(),
            );
            spawn_worker(&mut tasks, format!("storage-{id}"), worker.run(), &span);
        }
        drop(save_rx);

        let collector = MetricsCollector::new(metrics_rx, metrics.clone(), shutdown.clone());
        spawn_worker(&mut tasks, "collector".to_string(), collector.run(), &span);

        for id in 0..workers {
            let output = FanOut::new(save_tx.clone(), metrics_tx.clone(), pipeline.overflow_warning);
            let worker = DecoderWorker::new(
                id,
                LineDecoder::new(zone),
                input_rx.clone(),
                output,
                metrics.clone(),
                shutdown.clone(),
            )
            .with_spill(spill.clone());
            spawn_worker(&mut tasks, format!("decoder-{id}"), worker.run(), &span);
        }
        // Decoders own the only saveQ/metricsQ senders from here on
        drop(save_tx);
        drop(metrics_tx);
        drop(input_rx);

        spawn_worker(&mut tasks, "receiver".to_string(), receiver.run(input_tx), &span);

        let metrics_server = MetricsServer::new(
            config.metrics_address.as_str(),
            metrics.clone(),
            config.metrics.shutdown_timeout,
        );
        let metrics_handle = tokio::spawn(metrics_server.run(shutdown.clone()).instrument(span.clone()));
        let signals = tokio::spawn(watch_signals(shutdown.clone()));
        let watchdog = tokio::spawn(shutdown.clone().enforce_drain_deadline());

        info!(
            parent: &span,
            cdr_address = %config.cdr_address,
            metrics_address = %config.metrics_address,
            store = store.name(),
            workers,
            queue_capacity = pipeline.queue_capacity,
            failcdr = ?config.failcdr,
            drain_timeout_secs = pipeline.drain_timeout.as_secs(),
            "yaacc started"
        );

        let mut failure: Option<anyhow::Error> = None;
        while let Some(joined) = tasks.join_next().await {
            let error = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((_, Err(e))) if e.is_cancelled() => continue,
                Ok((name, Err(e))) => anyhow::Error::new(e).context(format!("{name} failed")),
                Err(e) => anyhow!("worker panicked: {e}"),
            };

            if failure.is_none() {
                error!(parent: &span, error = %format!("{error:#}"), "worker failed, shutting down");
                failure = Some(error);
            } else {
                warn!(parent: &span, error = %format!("{error:#}"), "worker stopped during shutdown");
            }
            shutdown.start_drain();
        }

        shutdown.terminate();
        signals.abort();
        if let Err(e) = watchdog.await {
            warn!(parent: &span, error = %e, "drain watchdog task failed");
        }

        store.close().await;
        if let Err(e) = metrics_handle.await {
            warn!(parent: &span, error = %e, "metrics server task failed");
        }

        match failure {
            Some(error) => {
                error!(parent: &span, "yaacc stopped with failure");
                Err(error)
            }
            None => {
                info!(parent: &span, "yaacc stopped");
                Ok(())
            }
        }
    }
}

fn spawn_worker<F>(tasks: &mut JoinSet<TaskResult>, name: String, worker: F, span: &tracing::Span)
where
    F: Future<Output = Result<(), PipelineError>> + Send + 'static,
{
    tasks.spawn(async move { (name, worker.await) }.instrument(span.clone()));
}

/// First SIGINT/SIGTERM starts the drain, a second one forces the hard
/// stop. Returns once the pipeline is terminated.
async fn watch_signals(shutdown: Arc<ShutdownManager>) {
    let mut rx = shutdown.subscribe();

    tokio::select! {
        _ = draining(&mut rx) => {}
        signal = wait_for_signal() => {
            info!(signal, "shutdown signal received, starting graceful shutdown");
            shutdown.start_drain();
        }
    }

    tokio::select! {
        _ = terminated(&mut rx) => {}
        signal = wait_for_signal() => {
            warn!(signal, "second shutdown signal received, forcing shutdown");
            shutdown.terminate();
        }
    }
}

/// Wait for SIGINT or SIGTERM. A handler that cannot be installed never
/// fires.
async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
