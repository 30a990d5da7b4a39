use clap::Parser;
use driver_io::server::DistributionServer;
use driver_io::{config, logging};
use std::path::PathBuf;
use std::process::ExitCode;

/// PLC driver bridge: mediates OPC UA / S7 devices and an MQTT control
/// plane.
#[derive(Parser, Debug)]
#[command(name = "driver-io", version)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load configuration from {}: {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.log_level);

    let log_level = config.log_level.clone();
    let server = match DistributionServer::bootstrap(config).await {
        Ok(s) => s,
        Err(e) => {
            log::error!("bootstrap failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    log::info!("[MAIN] driver-io started (log level {log_level})");

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("[MAIN] failed to listen for ctrl-c: {e}");
    }
    log::info!("[MAIN] shutdown signal received, stopping background tasks");
    server.shutdown();

    // Gives in-flight loop iterations a moment to observe the shutdown
    // broadcast before the process exits.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    ExitCode::SUCCESS
}
