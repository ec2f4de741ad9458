use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bookwright_pipeline::cli::Cli;
use bookwright_pipeline::config::{self, FileConfig};
use bookwright_pipeline::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    match run().await {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("error: {err:?}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    let output_dir = cli.output_dir.clone().unwrap_or_else(|| cli.book_path.clone());
    let file_config = FileConfig::load(&output_dir)?;
    let resolved = config::resolve(&cli, &file_config)?;

    let orchestrator = Orchestrator::new(cli, resolved);

    // Every completed chapter is durably recorded before the next one starts
    // (State Store + Atomic Writer), so there is nothing to flush here: a
    // Ctrl-C just stops scheduling new work and exits with the halted code.
    tokio::select! {
        result = orchestrator.run() => Ok(result?.code()),
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, state up to the last completed chapter is already durable");
            Ok(1)
        }
    }
}
