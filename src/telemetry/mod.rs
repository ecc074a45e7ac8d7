mod metrics;
mod server;
mod tracing;

pub use self::metrics::CdrMetrics;
pub use self::server::MetricsServer;
pub use self::tracing::{init_tracing, shutdown_tracing, TracingConfig};
