//! Service bootstrap: TLS listener, routers and startup wiring.
//!
//! A [`Service`] is fully prepared (certificates issued, pools built,
//! router assembled) before anything binds.  [`Service::start`] then binds
//! the listener and returns a [`RunningService`] handle.

pub mod bootstrap;
pub mod listener;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::Handle;
use rustls::ServerConfig;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub use bootstrap::{APISERVER_CA, DATABASE_CA, IssuedClient, SERVER_LABEL, issue_client};
pub use listener::{PeerCertAcceptor, PeerCertificates, server_tls_config};

use crate::{Error, Result};

/// How long in-flight requests may finish after shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// A prepared, not yet listening service.
pub struct Service {
    name: &'static str,
    address: SocketAddr,
    tls: Arc<ServerConfig>,
    router: Router,
}

impl Service {
    fn new(name: &'static str, address: SocketAddr, tls: ServerConfig, router: Router) -> Self {
        Self {
            name,
            address,
            tls: Arc::new(tls),
            router,
        }
    }

    /// Service name, used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Configured listen address.
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Listen on `address` instead of the configured one.
    #[must_use]
    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    /// Bind the listener and start serving in the background.
    ///
    /// # Errors
    ///
    /// `Error::Io` if the address cannot be bound.
    pub async fn start(self) -> Result<RunningService> {
        let handle = Handle::new();
        let server = axum_server::bind(self.address)
            .acceptor(PeerCertAcceptor::new(self.tls))
            .handle(handle.clone())
            .serve(self.router.into_make_service());

        let name = self.name;
        let task = tokio::spawn(async move {
            let result = server.await;
            if let Err(e) = &result {
                error!(service = name, error = %e, "Server stopped with error");
            }
            result
        });

        let Some(local_addr) = handle.listening().await else {
            // The server task ended before binding; surface its error.
            return Err(match task.await {
                Ok(Err(e)) => Error::Io(e),
                Ok(Ok(())) => Error::Config(format!("{name}: listener closed before binding")),
                Err(e) => Error::Config(format!("{name}: server task failed: {e}")),
            });
        };

        info!(service = name, address = %local_addr, "Listening (mutual TLS)");

        Ok(RunningService {
            name,
            local_addr,
            handle,
            task,
        })
    }
}

/// A listening service.
pub struct RunningService {
    name: &'static str,
    local_addr: SocketAddr,
    handle: Handle<SocketAddr>,
    task: JoinHandle<std::io::Result<()>>,
}

impl RunningService {
    /// Address actually bound, useful with port 0.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, let in-flight requests finish, then return.
    ///
    /// # Errors
    ///
    /// Returns the server's I/O error, if it stopped with one.
    pub async fn shutdown(self) -> Result<()> {
        info!(service = self.name, "Shutting down");
        self.handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        self.join().await
    }

    /// Serve until Ctrl+C or SIGTERM, then shut down gracefully.
    ///
    /// # Errors
    ///
    /// Returns the server's I/O error, if it stopped with one.
    pub async fn run_until_signal(self) -> Result<()> {
        shutdown_signal().await;
        self.shutdown().await
    }

    async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result.map_err(Error::Io),
            Err(e) => Err(Error::Config(format!("{}: server task failed: {e}", self.name))),
        }
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certstore::{CertFs, MemFs};
    use crate::config::Config;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn start_binds_ephemeral_port_and_shuts_down() {
        let fs: Arc<dyn CertFs> = Arc::new(MemFs::new());
        let config = Config {
            cert_dir: "/certs".into(),
            ..Config::default()
        };

        let service = Service::database(&config, fs)
            .unwrap()
            .with_address((Ipv4Addr::LOCALHOST, 0).into());
        let running = service.start().await.unwrap();

        assert_ne!(running.local_addr().port(), 0);
        running.shutdown().await.unwrap();
    }
}
