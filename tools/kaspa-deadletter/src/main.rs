//! Inspect and replay kaspa-bridge dead-letter files.
//!
//! When the durable backend refuses an audit record, the bridge appends it to
//! an hourly `errdata_*.txt` file. `summary` shows what piled up; `replay`
//! sends the records to the backend again once it is healthy.

mod replay;
mod summary;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kaspa_bridge::outbox::{read_records, DeadLetterRecord, DeadLetterWriter, HttpBackend};

/// Dead-letter file tool for kaspa-bridge
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Count records per method and per error
    Summary {
        /// Dead-letter files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Deliver records to the backend again
    Replay {
        /// Dead-letter files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Base URL of the durable backend
        #[arg(long)]
        backend_url: String,

        /// Where records that fail again are written
        #[arg(short = 'o', long, default_value = ".")]
        out_dir: PathBuf,
    },
}

async fn load(files: &[PathBuf]) -> Result<Vec<DeadLetterRecord>> {
    let mut records = Vec::new();
    for path in files {
        let mut batch = read_records(path)
            .await
            .with_context(|| format!("Failed to read dead-letter file: {:?}", path))?;
        records.append(&mut batch);
    }
    Ok(records)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("kaspa_deadletter=debug".parse()?)
                    .add_directive("kaspa_bridge=debug".parse()?),
            )
            .init();
    }

    match args.command {
        Command::Summary { files } => {
            let records = load(&files).await?;
            print!("{}", summary::Summary::of(&records));
        }
        Command::Replay {
            files,
            backend_url,
            out_dir,
        } => {
            let records = load(&files).await?;
            let backend = HttpBackend::new(backend_url).context("Failed to create backend client")?;
            backend
                .health_check()
                .await
                .context("Backend health check failed")?;

            let writer = DeadLetterWriter::new(out_dir);
            let report = replay::replay(&records, &backend, &writer).await;
            println!(
                "replayed {}: {} delivered, {} failed again",
                records.len(),
                report.delivered,
                report.failed
            );
            for path in &report.written {
                println!("failures written to {}", path.display());
            }
            if report.failed > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
