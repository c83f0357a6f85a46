//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use rehoster_core::auth::Role;

/// Clean and republish documents and media from shared drive links.
///
/// PDFs and images are de-watermarked, videos and other files are rehosted
/// as-is. Each original is processed once while its artifact stays live.
#[derive(Parser, Debug)]
#[command(name = "rehoster")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/rehoster/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags that override config file values.
#[derive(Args, Debug, Clone, Default)]
pub struct Overrides {
    /// Scratch directory for per-job files
    #[arg(long, global = true, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Ledger database file
    #[arg(long, global = true, value_name = "PATH")]
    pub database: Option<PathBuf>,

    /// Directory holding encrypted credentials
    #[arg(long, global = true, value_name = "DIR")]
    pub credentials_dir: Option<PathBuf>,

    /// Destination root folder id
    #[arg(long, global = true, value_name = "ID")]
    pub root_folder: Option<String>,

    /// Ghostscript executable
    #[arg(long, global = true, value_name = "PATH")]
    pub renderer: Option<PathBuf>,

    /// Chromium executable
    #[arg(long, global = true, value_name = "PATH")]
    pub chrome: Option<PathBuf>,

    /// Launch Chromium without its sandbox (needed as root in containers)
    #[arg(long, global = true)]
    pub no_sandbox: bool,

    /// Siblings processed at once during a folder walk (1-64)
    #[arg(long, global = true, value_parser = clap::value_parser!(u16).range(1..=64))]
    pub folder_concurrency: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Process one file (or folder with --folder) and print the result
    Process {
        /// Share link or resource id
        url: String,

        /// Treat the link as a folder and walk it
        #[arg(long)]
        folder: bool,

        /// Destination collection folder name
        #[arg(long, value_name = "NAME")]
        collection: Option<String>,
    },

    /// Walk a folder tree and print the per-child report as JSON
    Folder {
        /// Folder share link or id
        url: String,

        /// Destination collection folder name
        #[arg(long, value_name = "NAME")]
        collection: Option<String>,
    },

    /// Manage stored account credentials
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum AuthCommand {
    /// Store tokens for a role (refresh token read from stdin if omitted)
    Set {
        /// upload or download
        #[arg(long)]
        role: Role,

        /// OAuth refresh token
        #[arg(long, value_name = "TOKEN")]
        refresh_token: Option<String>,

        /// Current access token, if one is at hand
        #[arg(long, value_name = "TOKEN")]
        access_token: Option<String>,

        /// Seconds until the access token expires
        #[arg(long, value_name = "SECS")]
        expires_in: Option<i64>,
    },

    /// Show which roles have stored credentials
    Status,
}
