//! Binary entry point: logging setup, the signal-to-cancellation bridge,
//! and exit-code handling around the selected subcommand.

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use komocli::cmd::{Cli, Command};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let verbose = cli.verbose || !std::env::var("DEBUG").unwrap_or_default().is_empty();
    setup_logging(verbose);

    // Downstream tooling reads the client version from the environment.
    std::env::set_var("KOMOCLI_VERSION", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    spawn_signal_watcher(cancel.clone());

    let result = match &cli.command {
        Command::PortForward(args) => args.run(cancel.clone()).await,
    };

    // Normal completion of the root command also cancels.
    cancel.cancel();

    if let Err(err) = result {
        error!("{:#}", err);
        std::process::exit(1);
    }
    info!("Done.");
}

fn setup_logging(verbose: bool) {
    let default_filter = if verbose { "komocli=debug" } else { "komocli=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .init();
    if verbose {
        debug!("Debug logging is enabled");
    }
    info!("Komodor CLI, version {}", env!("CARGO_PKG_VERSION"));
}

/// Cancels the token on `SIGINT`/`SIGTERM`, so every blocking operation
/// in the controller and its sessions unwinds cooperatively.
fn spawn_signal_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        warn!("Stopping on signal");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            warn!("Failed to install the SIGTERM handler: {}", err);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
