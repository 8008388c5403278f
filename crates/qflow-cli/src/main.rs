//! qflow CLI - Resumable, checksum-verified chunked file transfer
//!
//! ## Quick Start
//!
//! ```bash
//! # Run a transfer server
//! qflow serve --port 8080
//!
//! # Upload a file (from another machine)
//! qflow --server http://host:8080 upload ./backup.tar
//!
//! # Download it again, resuming a previous partial attempt
//! qflow download --path backup.tar -o ./backup.tar --resume
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]
#![allow(clippy::struct_excessive_bools)]

use anyhow::Result;
use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);

    match cli.command {
        Command::Serve(args) => commands::serve::run(args, &cli.global).await,
        Command::Upload(args) => commands::upload::run(args, &cli.global).await,
        Command::Download(args) => commands::download::run(args, &cli.global).await,
        Command::Status(args) => commands::status::run(args, &cli.global).await,
        Command::Watch(args) => commands::watch::run(args, &cli.global).await,
        Command::Cancel(args) => commands::cancel::run(args, &cli.global).await,
        Command::Transfers(args) => commands::transfers::run(args, &cli.global).await,
        Command::Files(args) => commands::files::run(args, &cli.global).await,
        Command::Quota => commands::files::quota(&cli.global).await,
        Command::Config(args) => commands::config::run(args, &cli.global),
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose {
        "info,qflow=debug,qflow_core=debug"
    } else {
        "warn,qflow=info,qflow_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
