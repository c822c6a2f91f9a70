//! Command-line interface for kaspa-bridge.
//!
//! Queries a running bridge through its HTTP API.

use anyhow::Result;
use clap::{Parser, Subcommand};
use kaspa_bridge::api_client::{Client, DEFAULT_BASE_URL};

#[derive(Parser, Debug)]
#[command(author, version, about = "Query a running kaspa-bridge", long_about = None)]
struct Cli {
    /// Base URL of the bridge API
    #[arg(long, global = true, default_value = DEFAULT_BASE_URL)]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show share, block and outbox counters
    Stats,
    /// Show the upstream node's version and sync state
    Node,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::with_base_url(cli.url);

    match cli.command {
        Command::Stats => {
            let s = client.get_stats().await?;
            println!("sessions        {} live, {} authorized", s.sessions_live, s.sessions_authorized);
            println!("jobs issued     {}", s.jobs_issued);
            println!("shares accepted {}", s.shares_accepted);
            println!(
                "shares rejected {} stale, {} duplicate, {} low difficulty, {} invalid",
                s.shares_stale, s.shares_duplicate, s.shares_low_difficulty, s.shares_invalid
            );
            println!("blocks          {} submitted, {} accepted", s.blocks_submitted, s.blocks_accepted);
            println!(
                "outbox          {} pending, {} delivered, {} dead-lettered",
                s.outbox_pending, s.events_delivered, s.events_dead_lettered
            );
        }
        Command::Node => {
            let info = client.get_node().await?;
            println!("version {}", info.server_version);
            println!("synced  {}", info.is_synced);
            if let Some(tip) = info.tip_hash {
                println!("tip     {}", tip);
            }
        }
    }

    Ok(())
}
