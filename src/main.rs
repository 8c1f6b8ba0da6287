//! BluOS Scrobbler
//!
//! Watches BluOS players on the local network and scrobbles what they play
//! to Last.fm.

use bluos_scrobbler::config::{self, Config, LogDestination};
use bluos_scrobbler::lastfm::LastFmClient;
use bluos_scrobbler::{app, session};

use anyhow::{Context, Result};
use std::process::ExitCode;
use std::sync::Mutex;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

enum Mode {
    Scrobbler,
    Login,
    Usage,
}

fn parse_mode(args: &[String]) -> Mode {
    match args.first().map(String::as_str) {
        None => Mode::Scrobbler,
        Some("login") => Mode::Login,
        Some(_) => Mode::Usage,
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = parse_mode(&args);
    if let Mode::Usage = mode {
        print_usage();
        return Ok(ExitCode::SUCCESS);
    }

    let config = config::load_config().context("loading configuration")?;
    config.validate()?;
    init_tracing(&config)?;

    tracing::info!(
        "Starting BluOS Scrobbler v{} ({})",
        env!("BLU_SCROBBLER_VERSION"),
        env!("BLU_SCROBBLER_GIT_SHA")
    );

    match mode {
        Mode::Login => {
            let client = LastFmClient::new(config.lastfm.credentials())?
                .with_base_url(config.lastfm.base_url.clone());
            let path = config.session.file_path();
            match session::login(&path, &client).await {
                Ok(true) => Ok(ExitCode::SUCCESS),
                Ok(false) => Ok(ExitCode::FAILURE),
                Err(e) => {
                    tracing::error!("Login failed: {:#}", e);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        _ => {
            if let Err(e) = app::run(&config, shutdown_signal()).await {
                tracing::error!("{:#}", e);
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_usage() {
    println!("Usage: bluos-scrobbler [login]");
    println!("  login: Login to Last.fm");
    println!("  (no arguments): Start scrobbler");
}

fn init_tracing(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log.level.as_str().into());

    let (stdout, file) = match config.log.destination() {
        LogDestination::Stdout => (Some(tracing_subscriber::fmt::layer()), None),
        LogDestination::File(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            (None, Some(layer))
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file)
        .init();
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
