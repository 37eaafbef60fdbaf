//! Amon relay daemon entry point.
//!
//! One relay runs per compute node. It opens a relay channel in the global
//! zone and, with `-Z`, in every customer zone as zwatch reports them
//! starting and stopping.

use std::sync::Arc;

use clap::{CommandFactory, Parser};
use log::{error, info};
use tokio_util::sync::CancellationToken;

mod bootstrap;
mod channel;
mod cli;
mod config;
mod discovery;
mod error;
mod inventory;
mod node;
mod registry;
mod relay;
mod types;
mod zones;
mod zwatch;

use channel::RelayChannelOpener;
use cli::Cli;
use config::Settings;
use error::BootstrapError;
use node::SysinfoCommand;
use zones::ZoneadmZones;

// The registry and every channel share one thread.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    // Initialize logging
    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = cli.log_level() {
        logger.filter_level(level);
    }
    logger.init();

    let settings = match Settings::load(&cli.overrides()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => info!("Received shutdown signal, shutting down..."),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        }
        signal_token.cancel();
    });

    let config = match bootstrap::bootstrap(settings, &SysinfoCommand::new(), &shutdown).await {
        Ok(config) => config,
        Err(e) if shutdown.is_cancelled() => {
            info!("Stopped during startup: {}", e);
            return Ok(());
        }
        Err(e @ BootstrapError::InvalidConfig(_)) => {
            eprintln!("ERROR: {}\n", e);
            let _ = Cli::command().print_help();
            std::process::exit(e.exit_code());
        }
        Err(e) => {
            error!("{}", e);
            eprintln!("ERROR: {}", e);
            std::process::exit(e.exit_code());
        }
    };
    let zones = Arc::new(ZoneadmZones::new());
    let opener = match RelayChannelOpener::new() {
        Ok(opener) => Arc::new(opener),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("ERROR: {:#}", e);
            std::process::exit(2);
        }
    };
    if let Err(e) = relay::run(config, zones, opener, shutdown).await {
        error!("amon-relay failed: {:#}", e);
        eprintln!("ERROR: {:#}", e);
        std::process::exit(2);
    }

    info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
