//! TCP listener and connection handling.
//!
//! Connections are served one at a time: the accept loop awaits each
//! session before accepting the next.

use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use super::session::TransferSession;
use crate::config::ServerSettings;
use crate::modules::processor::{DurationProbe, MediaProcessor};
use crate::modules::secure_keys::ServerKeyPair;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),
}

pub struct TransferServer {
    settings: Arc<ServerSettings>,
    keypair: Arc<ServerKeyPair>,
    processor: Arc<dyn MediaProcessor>,
    probe: Arc<dyn DurationProbe>,
}

impl TransferServer {
    pub fn new(
        settings: Arc<ServerSettings>,
        keypair: Arc<ServerKeyPair>,
        processor: Arc<dyn MediaProcessor>,
        probe: Arc<dyn DurationProbe>,
    ) -> Self {
        TransferServer {
            settings,
            keypair,
            processor,
            probe,
        }
    }

    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.settings.bind_address();
        TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Run the server until `shutdown` fires.
    ///
    /// A session in progress is finished before the signal is observed.
    pub async fn run_with_shutdown(
        self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve_listener(listener, &mut shutdown).await;
        Ok(())
    }

    /// Serve an already bound listener until `shutdown` fires.
    pub async fn serve_listener(
        &self,
        listener: TcpListener,
        shutdown: &mut broadcast::Receiver<()>,
    ) {
        match listener.local_addr() {
            Ok(addr) => log::info!("Media server listening on {} (with graceful shutdown)", addr),
            Err(e) => log::warn!("Listening on unknown address: {}", e),
        }
        log::info!(
            "Chunk size {} bytes, upload limit {} bytes",
            self.settings.chunk_size,
            self.settings.max_upload_size
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            log::info!("Accepted connection from {}", addr);
                            self.serve(socket).await;
                        }
                        Err(e) => {
                            log::error!("{}", ServerError::Accept(e));
                        }
                    }
                }
                _ = shutdown.recv() => {
                    log::info!("Media server shutting down");
                    break;
                }
            }
        }
    }

    async fn serve(&self, socket: TcpStream) {
        if let Err(e) = socket.set_nodelay(true) {
            log::debug!("Could not set TCP_NODELAY: {}", e);
        }
        let mut session = TransferSession::new(
            self.keypair.clone(),
            self.processor.clone(),
            self.probe.clone(),
            self.settings.clone(),
        );
        session.handle_connection(socket).await;
    }
}
