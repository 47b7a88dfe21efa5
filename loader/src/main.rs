//! `pgbq-loader` binary.
//!
//! `discover` describes the configured Postgres tables and persists the catalog. `load` reads
//! newline-delimited records from stdin (or `--input`) and upserts them into the configured
//! destination, writing error records for rejected rows to stdout.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use config::shared::LoaderConfig;
use telemetry::init_tracing;
use tracing::{error, info};

use crate::configuration::load_loader_config;
use crate::core::{discover, load};
use crate::error::{LoaderError, LoaderResult};

mod configuration;
mod core;
mod error;

#[derive(Debug, Parser)]
#[command(name = "pgbq-loader", version, about = "Loads Postgres rows into BigQuery")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Describes the configured source tables and writes the catalog.
    Discover,
    /// Loads newline-delimited records into the destination.
    Load {
        /// Reads records from this file instead of stdin.
        #[arg(long)]
        input: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprint!("{}", err.render_report());
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> LoaderResult<()> {
    // The BigQuery client and sqlx both rely on a process-wide rustls provider.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let loader_config = load_loader_config()?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME")).map_err(LoaderError::config)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli.command, loader_config))
}

async fn async_main(command: Command, loader_config: LoaderConfig) -> LoaderResult<()> {
    let result = match command {
        Command::Discover => discover(&loader_config).await,
        Command::Load { input } => load(&loader_config, input).await,
    };

    match &result {
        Ok(()) => info!("pgbq-loader completed"),
        Err(err) => error!(category = err.category(), "{err}"),
    }

    result
}
