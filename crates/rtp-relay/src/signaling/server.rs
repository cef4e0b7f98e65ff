//! WebSocket signaling server
//!
//! Accepts client connections and serves each one on its own task.

use super::connection::serve_connection;
use super::handler::SignalingHandler;
use crate::config::RelayConfig;
use crate::engine::MediaEngine;
use crate::lifecycle::LifecycleController;
use crate::session::SessionRegistry;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Bound, not yet running signaling server
pub struct SignalingServer {
    /// Listening socket
    listener: TcpListener,

    /// Shared message handler
    handler: Arc<SignalingHandler>,
}

impl SignalingServer {
    /// Bind the configured listen address
    pub async fn bind(config: RelayConfig, engine: Arc<dyn MediaEngine>) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(&config.listen_addr).await.map_err(|e| {
            Error::TransportError(format!("Failed to bind {}: {}", config.listen_addr, e))
        })?;

        let config = Arc::new(config);
        let registry = Arc::new(SessionRegistry::new(config.max_sessions));
        let lifecycle = Arc::new(LifecycleController::new(engine, Arc::clone(&config)));
        let handler = Arc::new(SignalingHandler::new(registry, lifecycle, config));

        Ok(Self { listener, handler })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Session registry
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(self.handler.registry())
    }

    /// Start accepting connections
    pub fn start(self) -> Result<SignalingServerHandle> {
        let local_addr = self.local_addr()?;
        let registry = self.registry();
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let connection_shutdown = shutdown_tx.clone();

        let Self { listener, handler } = self;

        info!("Signaling server listening on ws://{}", local_addr);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, peer)) => {
                            let conn_id = uuid::Uuid::new_v4().to_string();
                            debug!("Accepted connection {} from {}", conn_id, peer);

                            let handler = Arc::clone(&handler);
                            let shutdown = connection_shutdown.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    serve_connection(stream, peer, conn_id, handler, shutdown).await
                                {
                                    error!("Connection from {} failed: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => error!("Failed to accept connection: {}", e),
                    },
                    _ = shutdown_rx.recv() => {
                        info!("Signaling server received shutdown signal");
                        break;
                    }
                }
            }

            info!("Signaling server accept loop exited");
        });

        Ok(SignalingServerHandle {
            local_addr,
            shutdown_tx,
            task,
            registry,
        })
    }
}

/// Handle for a running signaling server
pub struct SignalingServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
    registry: Arc<SessionRegistry>,
}

impl SignalingServerHandle {
    /// Address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Stop accepting connections and close the open ones
    ///
    /// Open connections release their sessions on the way out.
    pub async fn shutdown(self) {
        info!("Sending shutdown signal to signaling server");
        let _ = self.shutdown_tx.send(());

        if let Err(e) = self.task.await {
            error!("Signaling server task failed: {}", e);
        }
    }
}
