use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use federated_miner::config::load_config;
use federated_miner::shutdown::Shutdown;
use federated_miner::RunError;

#[derive(Debug, Parser)]
#[command(name = "federated-miner", version, about)]
struct Args {
    /// Path to the TOML configuration file. Environment variables with the
    /// MINER__ prefix override file values.
    #[arg(short, long, env = "MINER_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("invalid configuration: {error:#}");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to create runtime: {error}");
            return ExitCode::from(1);
        }
    };

    let result = runtime.block_on(async {
        let shutdown = Shutdown::spawn(
            config.app.shutdown_timeout,
            config.app.shutdown_delay,
        );
        federated_miner::run(config, shutdown).await
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error @ RunError::Init(_)) => {
            tracing::error!(?error, "fatal initialization error");
            ExitCode::from(1)
        }
        Err(error) => {
            tracing::error!(?error, "unrecoverable internal state");
            ExitCode::from(2)
        }
    }
}
