//! CLI entry point for the rehoster tool.

use std::io::{self, IsTerminal};

use anyhow::{Context, Result};
use clap::Parser;
use rehoster_core::RuntimeSettings;
use rehoster_core::config::{FileConfig, load_default_file_config, load_file_config};
use tracing::debug;

mod cli;
mod commands;

use cli::{AuthCommand, Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();

    let file_config = match &cli.config {
        Some(path) => Some(load_file_config(path).with_context(|| {
            format!("Failed to load config file '{}'", path.display())
        })?),
        None => {
            load_default_file_config()
                .context("Failed to load default config file")?
                .config
        }
    };
    let settings = resolve_settings(&cli, file_config.as_ref())?;

    init_tracing(&cli, &settings);
    debug!(?cli, "CLI arguments parsed");

    let show_spinner = !cli.quiet && io::stderr().is_terminal();
    match cli.command {
        Command::Process {
            url,
            folder,
            collection,
        } => {
            commands::process::run_process(
                &settings,
                &cli.overrides,
                &url,
                folder,
                collection,
                show_spinner,
            )
            .await
        }
        Command::Folder { url, collection } => {
            commands::process::run_folder(
                &settings,
                &cli.overrides,
                &url,
                collection,
                show_spinner,
            )
            .await
        }
        Command::Auth { command } => match command {
            AuthCommand::Set {
                role,
                refresh_token,
                access_token,
                expires_in,
            } => {
                commands::auth::run_auth_set(
                    &settings,
                    role,
                    refresh_token,
                    access_token,
                    expires_in,
                )
                .await
            }
            AuthCommand::Status => commands::auth::run_auth_status(&settings).await,
        },
    }
}

/// Built-in defaults, then the config file, then CLI flags.
fn resolve_settings(cli: &Cli, file: Option<&FileConfig>) -> Result<RuntimeSettings> {
    let mut settings = match file {
        Some(file) => RuntimeSettings::default()
            .with_file(file)
            .context("Invalid configuration")?,
        None => RuntimeSettings::default(),
    };

    let overrides = &cli.overrides;
    if let Some(dir) = &overrides.work_dir {
        settings.work_dir.clone_from(dir);
    }
    if let Some(path) = &overrides.database {
        settings.database_path.clone_from(path);
    }
    if let Some(dir) = &overrides.credentials_dir {
        settings.credentials_dir.clone_from(dir);
    }
    if let Some(root) = &overrides.root_folder {
        settings.root_folder_id.clone_from(root);
    }
    if overrides.renderer.is_some() {
        settings.renderer_path.clone_from(&overrides.renderer);
    }
    if overrides.chrome.is_some() {
        settings.chrome_path.clone_from(&overrides.chrome);
    }
    if let Some(n) = overrides.folder_concurrency {
        settings.folder_concurrency = usize::from(n);
    }
    Ok(settings)
}

/// Priority: RUST_LOG env var > quiet flag > verbose flag > config verbosity > info
fn init_tracing(cli: &Cli, settings: &RuntimeSettings) {
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => settings.verbosity.filter_directive(),
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}
