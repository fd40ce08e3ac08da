//! # Tunnel Controller
//!
//! Supervises the port-forward: validates connectivity once with a probe
//! session, binds the local listener, and runs one full session per
//! accepted TCP connection. Shutdown is orderly — the controller does not
//! return until every spawned session has terminated.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::protocol::{Payload, PortForwardInitData};
use crate::session::{Session, SessionConfig};

/// Broker-side wording of an RBAC refusal; recognized so the user gets a
/// pointed hint instead of a generic failure.
const RBAC_SIGNATURE: &str = "you are missing permissions to perform the following action";

/// The remote endpoint of the tunnel, fixed for the whole invocation.
#[derive(Debug, Clone)]
pub struct RemoteSpec {
    pub agent_id: String,
    pub namespace: String,
    pub pod_name: String,
    pub remote_port: u16,
}

/// Port-forward supervisor for one remote target.
pub struct Controller {
    pub remote: RemoteSpec,
    pub ws_url: String,
    pub address: String,
    /// Local port to listen on; `0` lets the OS pick.
    pub local_port: u16,
    pub token: String,
    pub ack_timeout: Duration,
}

impl Controller {
    /// Probes connectivity, binds the listener, then accepts connections
    /// until cancellation. `after_init` receives the *bound* address once
    /// the listener is up (with port `0` this is the port the OS picked).
    pub async fn run(
        &self,
        cancel: CancellationToken,
        after_init: impl FnOnce(SocketAddr) + Send,
    ) -> anyhow::Result<()> {
        // Template for every session's first frame.
        let template = Payload::PortForwardInit(PortForwardInitData {
            namespace: self.remote.namespace.clone(),
            pod_name: self.remote.pod_name.clone(),
            port: self.remote.remote_port,
        });

        self.test_connection(&cancel, &template).await?;
        info!("Finished testing the connectivity, ready to accept connections");

        let listener = TcpListener::bind((self.address.as_str(), self.local_port))
            .await
            .with_context(|| format!("failed to bind {}:{}", self.address, self.local_port))?;
        let local_addr = listener
            .local_addr()
            .context("failed to read the bound address")?;
        info!("Started listening for incoming connections: {}", local_addr);
        after_init(local_addr);

        self.accept_incoming(&cancel, listener, &template).await;
        Ok(())
    }

    /// One probe session against the broker: init handshake only. A
    /// failure is returned without opening the listener; the RBAC refusal
    /// gets its own warning.
    async fn test_connection(
        &self,
        cancel: &CancellationToken,
        template: &Payload,
    ) -> anyhow::Result<()> {
        let probe = Arc::new(Session::new(
            cancel.clone(),
            None,
            self.session_config(template.clone(), true),
        ));
        let result = probe.clone().run().await;
        probe.stop().await;

        if let Err(err) = result {
            if err.to_string().contains(RBAC_SIGNATURE) {
                warn!("You have no RBAC permissions to do port forwarding on this resource");
            } else {
                warn!("Failed to test port-forward operability: {}", err);
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn session_config(&self, init: Payload, probe: bool) -> SessionConfig {
        SessionConfig {
            ws_url: self.ws_url.clone(),
            agent_id: self.remote.agent_id.clone(),
            token: self.token.clone(),
            probe,
            init,
            ack_timeout: self.ack_timeout,
        }
    }

    /// Accept loop plus drain. One session failing does not disturb the
    /// others; accepting continues until cancellation or a listener error.
    async fn accept_incoming(
        &self,
        cancel: &CancellationToken,
        listener: TcpListener,
        template: &Payload,
    ) {
        let mut sessions: Vec<Arc<Session>> = Vec::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Stopping to accept connections");
                    break;
                }
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((conn, peer)) => {
                    info!("Accepted connection: {}", peer);
                    let session = Arc::new(Session::new(
                        cancel.clone(),
                        Some(conn),
                        self.session_config(template.clone(), false),
                    ));
                    sessions.push(session.clone());
                    tasks.push(tokio::spawn(async move {
                        match session.clone().run().await {
                            Ok(()) => {}
                            Err(SessionError::Cancelled) => {
                                debug!("Session cancelled during shutdown");
                            }
                            Err(err) => warn!("Failed to run port-forwarding: {}", err),
                        }
                        session.stop().await;
                    }));
                }
                Err(err) => {
                    warn!("Failed to accept incoming connection: {}", err);
                    break;
                }
            }
        }
        info!("Stopped accepting incoming connections");

        for session in &sessions {
            session.stop().await;
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}
