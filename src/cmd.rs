//! # Command-Line Surface
//!
//! Argument parsing for the `komocli` binary and the glue that resolves
//! flags and environment variables into a [`Controller`].

use std::env;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::controller::{Controller, RemoteSpec};
use crate::ws;

#[derive(Debug, Parser)]
#[command(name = "komocli", version, about = "Komodor command-line client")]
pub struct Cli {
    /// Show verbose debug information
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Starts the port forwarding client process
    #[command(name = "port-forward")]
    PortForward(PortForwardArgs),
}

#[derive(Debug, Args)]
pub struct PortForwardArgs {
    /// Name of the pod to forward to
    pub resource: String,

    /// Port specification: `remote`, `local:remote` or `:remote`
    /// (random local port)
    pub portspec: String,

    /// JWT authentication token
    #[arg(long, env = "KOMOCLI_JWT")]
    pub token: String,

    /// Agent identifier of the target cluster
    #[arg(long)]
    pub cluster: String,

    /// Namespace of the target pod
    #[arg(long, default_value = "default")]
    pub namespace: String,

    /// Local address to listen on
    #[arg(long)]
    pub address: Option<String>,

    /// How long a sent message may wait for its acknowledgement
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// Open the forwarded address in the default web browser
    #[arg(long)]
    pub browser: bool,
}

impl PortForwardArgs {
    /// Builds the controller from flags and environment and runs it until
    /// it finishes or the cancellation token fires.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let (local_port, remote_port) =
            parse_port_spec(&self.portspec).context("invalid port specification")?;

        let address = self
            .address
            .clone()
            .or_else(|| env::var("KOMOCLI_BIND").ok().filter(|v| !v.is_empty()))
            .unwrap_or_else(|| "localhost".to_string());

        let ws_url = env::var("KOMOCLI_WS_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| ws::DEFAULT_WS_URL.to_string());

        let controller = Controller {
            remote: RemoteSpec {
                agent_id: self.cluster.clone(),
                namespace: self.namespace.clone(),
                pod_name: self.resource.clone(),
                remote_port,
            },
            ws_url,
            address,
            local_port,
            token: self.token.clone(),
            ack_timeout: self.timeout,
        };

        let open_browser = self.browser;
        controller
            .run(cancel, move |addr| {
                if open_browser {
                    let url = format!("http://{addr}/");
                    info!("Opening {} in the default browser", url);
                    if let Err(err) = webbrowser::open(&url) {
                        warn!("Failed to open the browser: {}", err);
                    }
                }
            })
            .await
            .context("error while trying to forward port")
    }
}

/// Parses the kubectl-style port specification.
///
/// `"N"` forwards local N to remote N; `"L:R"` forwards local L to remote
/// R; `":R"` picks a random local port for remote R.
pub fn parse_port_spec(spec: &str) -> anyhow::Result<(u16, u16)> {
    match spec.split_once(':') {
        None => {
            let port = parse_port(spec)?;
            Ok((port, port))
        }
        Some(("", remote)) => Ok((0, parse_port(remote)?)),
        Some((local, remote)) => Ok((parse_port(local)?, parse_port(remote)?)),
    }
}

fn parse_port(value: &str) -> anyhow::Result<u16> {
    if value.is_empty() {
        bail!("missing port number");
    }
    value
        .parse::<u16>()
        .with_context(|| format!("invalid port number {value:?}"))
}
