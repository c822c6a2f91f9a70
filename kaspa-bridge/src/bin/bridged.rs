//! Main entry point for the kaspa-bridge daemon.

use std::path::Path;

use clap::Parser;
use kaspa_bridge::{
    config::{Args, BridgeConfig},
    daemon::Daemon,
    tracing::{self, LOG_FILE_NAME},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = BridgeConfig::load(&args)?;

    let log_file = config.log_to_file.then(|| Path::new(LOG_FILE_NAME));
    tracing::init_journald_or_stdout(log_file);

    let daemon = Daemon::new(config);
    daemon.run().await
}
