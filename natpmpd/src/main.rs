//! The NAT-PMP daemon.
//!
//! This handles only the CLI, config file loading and signals, the daemon lives in
//! [`natpmpd::server`].

use std::path::PathBuf;

use clap::Parser;
use n0_snafu::{Result, ResultExt};
use natpmpd::{config::Config, defaults::DEFAULT_CONFIG_PATH, server::Server};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, prelude::*};

/// A NAT-PMP port mapping daemon writing redirects into nftables.
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[clap(short = 'f', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Only check the configuration file, then exit.
    #[clap(short = 'n', long, default_value_t = false)]
    check: bool,
    /// Log at debug level.
    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .await
        .context("failed to load configuration")?;
    if cli.check {
        println!("configuration ok");
        return Ok(());
    }

    let directive = if cli.verbose || config.verbose {
        "natpmpd=debug"
    } else {
        "natpmpd=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    debug!("{config:#?}");

    let mut server = Server::spawn(&config)
        .await
        .context("failed to start the daemon")?;
    info!(interface = %config.interface, "natpmpd started");

    tokio::select! {
        biased;
        signal = termination() => {
            info!("exiting on {}", signal?);
        }
        res = server.task_handle() => {
            // the daemon only stops on its own when it crashed
            res.e()?;
            return Ok(());
        }
    }

    server.shutdown().await.e()?;
    Ok(())
}

/// Waits for a signal asking the daemon to exit.
#[cfg(unix)]
async fn termination() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt()).e()?;
    let mut terminate = signal(SignalKind::terminate()).e()?;
    let mut hangup = signal(SignalKind::hangup()).e()?;
    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn termination() -> Result<&'static str> {
    tokio::signal::ctrl_c().await.e()?;
    Ok("ctrl-c")
}
