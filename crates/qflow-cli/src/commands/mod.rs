//! CLI command definitions and handlers.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};

use qflow_core::client::{ClientConfig, Credentials, TransferClient, DEFAULT_SERVER};
use qflow_core::transfer::{Direction, TaskState};
use serde::de::DeserializeOwned;

pub mod cancel;
pub mod config;
pub mod download;
pub mod files;
pub mod serve;
pub mod status;
pub mod transfers;
pub mod upload;
pub mod watch;

/// Load configuration with graceful fallback to defaults.
///
/// An explicit path must load; the default location falls back to defaults
/// when the file is missing or broken.
pub fn load_config(path: Option<&PathBuf>) -> Result<qflow_core::config::Config> {
    match path {
        Some(path) => qflow_core::config::Config::load_from(path)
            .with_context(|| format!("Failed to load {}", path.display())),
        None => Ok(qflow_core::config::Config::load().unwrap_or_default()),
    }
}

/// Build a client and credentials from the global options.
pub fn connect(global: &GlobalArgs, threads: Option<usize>) -> Result<(TransferClient, Credentials)> {
    let mut config = ClientConfig::new(&global.server);
    config.threads = threads;
    let client = TransferClient::new(config).context("Failed to create HTTP client")?;
    let credentials = global
        .token
        .as_ref()
        .map_or_else(Credentials::anonymous, Credentials::bearer);
    Ok((client, credentials))
}

/// qflow - Resumable, checksum-verified chunked file transfer
#[derive(Parser)]
#[command(name = "qflow")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Options shared by all commands
    #[command(flatten)]
    pub global: GlobalArgs,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by all commands
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Server address
    #[arg(long, global = true, env = "QFLOW_SERVER", default_value = DEFAULT_SERVER)]
    pub server: String,

    /// Bearer token sent with every request
    #[arg(long, global = true, env = "QFLOW_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Minimal output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl GlobalArgs {
    /// Whether human-readable output should be printed.
    pub const fn human(&self) -> bool {
        !self.quiet && !self.json
    }
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Run the transfer server
    Serve(ServeArgs),

    /// Upload a file
    Upload(UploadArgs),

    /// Download a file
    Download(DownloadArgs),

    /// Show the progress of transfers
    Status(StatusArgs),

    /// Follow the progress of a transfer
    Watch(WatchArgs),

    /// Cancel a transfer
    Cancel(CancelArgs),

    /// List transfers known to the server
    Transfers(TransfersArgs),

    /// List or delete files stored on the server
    Files(FilesArgs),

    /// Show the server's storage quota and limits
    Quota,

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the serve command
#[derive(Parser)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Only accept connections from this machine
    #[arg(long)]
    pub localhost_only: bool,

    /// Directory published files land in
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Configuration file to use instead of the default one
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// Arguments for the upload command
#[derive(Parser)]
pub struct UploadArgs {
    /// File to upload
    pub file: PathBuf,

    /// Name on the server
    #[arg(long)]
    pub name: Option<String>,

    /// Directory under the server's storage root
    #[arg(short, long)]
    pub dir: Option<String>,

    /// Replace an existing file on the server
    #[arg(long)]
    pub overwrite: bool,

    /// Concurrent chunk requests
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Skip whole-file verification on the server
    #[arg(long)]
    pub no_verify: bool,

    /// Finish an interrupted upload with this task id
    #[arg(long, value_name = "TASK_ID")]
    pub resume: Option<String>,
}

/// Arguments for the download command
#[derive(Parser)]
#[command(group(ArgGroup::new("source").required(true).args(["file_id", "path"])))]
pub struct DownloadArgs {
    /// Catalog id of the file
    #[arg(long)]
    pub file_id: Option<String>,

    /// Path of the file under the server's storage root
    #[arg(long)]
    pub path: Option<String>,

    /// Where to write the file
    #[arg(short, long)]
    pub output: PathBuf,

    /// Continue from a partial file left by an earlier attempt
    #[arg(long)]
    pub resume: bool,

    /// Replace an existing output file
    #[arg(long)]
    pub overwrite: bool,

    /// Concurrent range requests
    #[arg(short, long)]
    pub threads: Option<usize>,
}

/// Arguments for the status command
#[derive(Parser)]
pub struct StatusArgs {
    /// Task ids to look up
    #[arg(required = true)]
    pub task_ids: Vec<String>,

    /// Also show received and missing ranges
    #[arg(long)]
    pub ranges: bool,
}

/// Arguments for the watch command
#[derive(Parser)]
pub struct WatchArgs {
    /// Task id to follow
    pub task_id: String,
}

/// Arguments for the cancel command
#[derive(Parser)]
pub struct CancelArgs {
    /// Task id to cancel
    pub task_id: String,

    /// The task is a download
    #[arg(long)]
    pub download: bool,
}

/// Arguments for the transfers command
#[derive(Parser)]
pub struct TransfersArgs {
    /// Only uploads or only downloads
    #[arg(long = "type", value_name = "DIRECTION", value_parser = parse_lowercase::<Direction>)]
    pub direction: Option<Direction>,

    /// Only tasks in this state (active, paused, completed, failed, ...)
    #[arg(long, value_parser = parse_lowercase::<TaskState>)]
    pub status: Option<TaskState>,

    /// Show at most this many tasks
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Skip this many tasks
    #[arg(long)]
    pub offset: Option<usize>,
}

/// Arguments for the files command
#[derive(Parser)]
pub struct FilesArgs {
    /// Files subcommand
    #[command(subcommand)]
    pub action: FilesAction,
}

/// Files subcommands
#[derive(Subcommand)]
pub enum FilesAction {
    /// List stored files, newest first
    List {
        /// Only files under this directory of the storage root
        #[arg(short, long)]
        dir: Option<String>,

        /// Show at most this many files
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Delete a stored file
    Rm {
        /// Catalog id of the file
        file_id: String,
    },
}

/// Parse a lowercase wire name such as `upload` or `paused`.
fn parse_lowercase<T: DeserializeOwned>(value: &str) -> std::result::Result<T, String> {
    serde_json::from_value(serde_json::Value::String(value.to_ascii_lowercase()))
        .map_err(|_| format!("unknown value '{value}'"))
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show all configuration
    Show,

    /// Show the configuration file path
    Path,

    /// Write the default configuration file
    Init {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_download_requires_a_source() {
        assert!(Cli::try_parse_from(["qflow", "download", "-o", "out.bin"]).is_err());
        assert!(Cli::try_parse_from([
            "qflow", "download", "--file-id", "a", "--path", "b", "-o", "out.bin"
        ])
        .is_err());

        let cli = Cli::try_parse_from(["qflow", "download", "--path", "a.bin", "-o", "out.bin"])
            .unwrap();
        assert!(matches!(cli.command, Command::Download(ref args) if args.path.as_deref() == Some("a.bin")));
    }

    #[test]
    fn test_transfers_filters_parse_wire_names() {
        let cli = Cli::try_parse_from([
            "qflow", "transfers", "--type", "Upload", "--status", "paused", "-l", "5",
        ])
        .unwrap();
        let Command::Transfers(args) = cli.command else {
            panic!("expected transfers");
        };
        assert_eq!(args.direction, Some(Direction::Upload));
        assert_eq!(args.status, Some(TaskState::Paused));
        assert_eq!(args.limit, Some(5));

        assert!(Cli::try_parse_from(["qflow", "transfers", "--status", "sleeping"]).is_err());
    }

    #[test]
    fn test_files_subcommands() {
        let cli = Cli::try_parse_from(["qflow", "files", "rm", "abc"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Files(FilesArgs { action: FilesAction::Rm { ref file_id } }) if file_id == "abc"
        ));
        assert!(Cli::try_parse_from(["qflow", "files", "list", "--dir", "docs"]).is_ok());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "qflow",
            "status",
            "t1",
            "t2",
            "--json",
            "--server",
            "http://example:9000",
        ])
        .unwrap();
        assert!(cli.global.json);
        assert!(!cli.global.human());
        assert_eq!(cli.global.server, "http://example:9000");
        assert!(matches!(cli.command, Command::Status(ref args) if args.task_ids.len() == 2));
    }
}
