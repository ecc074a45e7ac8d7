use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use yaacc::bootstrap::Server;
use yaacc::config::Config;
use yaacc::telemetry::{init_tracing, shutdown_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(name = "yaacc")]
#[command(author, version, about = "Avaya CDR collector")]
struct Args {
    /// Path to config file
    #[arg(short, long, value_name = "FILE", default_value = "./yaacc.yaml")]
    config: PathBuf,

    /// Append logs to a file (./yaacc.log when given without a path)
    #[arg(
        short,
        long,
        value_name = "PATH",
        num_args = 0..=1,
        default_missing_value = "./yaacc.log"
    )]
    logfile: Option<PathBuf>,

    /// Validate config and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (to get log settings)
    let config = Config::load(&args.config)?;

    let tracing_config = TracingConfig {
        service_name: "yaacc".to_string(),
        log_level: config.telemetry.log_level.clone(),
        json_logs: config.telemetry.json_logs,
        log_file: args.logfile.clone().or_else(|| config.logfile.clone()),
        otlp_endpoint: config.telemetry.otlp_endpoint.clone(),
        sample_rate: config.telemetry.trace_sample_rate,
    };

    init_tracing(&tracing_config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "starting yaacc"
    );

    // Validate only mode
    if args.validate {
        info!(database = ?config.database, "configuration is valid");
        return Ok(());
    }

    let result = match Server::new(config).await {
        Ok(server) => server.run().await,
        Err(e) => Err(e),
    };

    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "yaacc failed");
    }

    shutdown_tracing();
    result
}
