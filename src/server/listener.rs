//! TCP listener with connection limits.
//!
//! The listening socket is bound synchronously by [`Server::bind`], so a bad
//! address or a busy port fails before the runtime starts serving. Each
//! accepted connection runs on its own task while holding a semaphore permit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{Semaphore, watch};

use crate::config::Config;
use crate::http::connection::Connection;
use crate::http::handler::Handler;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to create upload directory {path}: {source}")]
    UploadDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error("invalid listen address {0}")]
    Address(String),
    #[error("failed to create socket: {0}")]
    Socket(std::io::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("failed to listen: {0}")]
    Listen(std::io::Error),
    #[error("failed to accept: {0}")]
    Accept(std::io::Error),
}

/// A bound listener ready to serve.
pub struct Server {
    listener: TcpListener,
    config: Arc<Config>,
    connection_limit: Arc<Semaphore>,
    shutdown: Arc<watch::Sender<bool>>,
}

/// Stops the accept loop of a running [`Server`].
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Connections already accepted run to completion.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

impl Server {
    /// Prepares the upload directory and binds the listening socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(mut config: Config) -> Result<Self, ListenerError> {
        config.validate()?;
        std::fs::create_dir_all(&config.upload_dir).map_err(|source| {
            ListenerError::UploadDir {
                path: config.upload_dir.clone(),
                source,
            }
        })?;
        config.upload_dir = std::fs::canonicalize(&config.upload_dir).map_err(|source| {
            ListenerError::UploadDir {
                path: config.upload_dir.clone(),
                source,
            }
        })?;

        let addr: SocketAddr = config
            .listen_addr()
            .parse()
            .map_err(|_| ListenerError::Address(config.listen_addr()))?;

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(ListenerError::Socket)?;

        socket.set_reuseaddr(true).map_err(ListenerError::Socket)?;
        socket
            .bind(addr)
            .map_err(|source| ListenerError::Bind { addr, source })?;
        let listener = socket
            .listen(config.queue_limit)
            .map_err(ListenerError::Listen)?;

        let local_addr = listener.local_addr().map_err(ListenerError::Listen)?;
        tracing::info!(
            address = %local_addr,
            max_connections = config.max_connections,
            upload_dir = %config.upload_dir.display(),
            "Listening"
        );

        let (tx, _rx) = watch::channel(false);

        Ok(Self {
            listener,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            config: Arc::new(config),
            shutdown: Arc::new(tx),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown.clone(),
        }
    }

    /// Accepts connections until [`ShutdownHandle::stop`] is called.
    pub async fn run<H: Handler>(self, handler: H) -> Result<(), ListenerError> {
        let handler = Arc::new(handler);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let permit = tokio::select! {
                _ = shutdown.changed() => continue,
                permit = self.connection_limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                _ = shutdown.changed() => continue,
                accepted = self.listener.accept() => accepted,
            };

            let (socket, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    self.on_accept_error(e).await?;
                    continue;
                }
            };

            tracing::debug!(
                peer = %peer,
                available_permits = self.connection_limit.available_permits(),
                "Accepted connection"
            );

            let config = self.config.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let mut conn = Connection::new(socket, peer, config, handler);
                match conn.run().await {
                    Ok(()) => tracing::debug!(peer = %peer, "Connection closed"),
                    Err(e) => tracing::error!(peer = %peer, error = %e, "Connection error"),
                }
            });
        }

        tracing::info!("Server stopped");
        Ok(())
    }

    /// Stops the loop when `EXIT_ON_ACCEPT_ERROR` is set, otherwise backs off.
    async fn on_accept_error(&self, e: std::io::Error) -> Result<(), ListenerError> {
        if self.config.exit_on_accept_error {
            tracing::error!(error = %e, "Accept failed, stopping");
            return Err(ListenerError::Accept(e));
        }

        tracing::error!(error = %e, "Accept failed");
        tokio::time::sleep(ACCEPT_BACKOFF).await;
        Ok(())
    }
}
