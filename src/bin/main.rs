use std::sync::Arc;
use std::time::Instant;

use log::{error, info};
use tokio::sync::broadcast;

use mediaframe::config::{log_timing, ServerSettings};
use mediaframe::modules::processor::FfmpegProcessor;
use mediaframe::modules::secure_keys::ServerKeyPair;
use mediaframe::modules::transfer::storage::UploadStore;
use mediaframe::modules::transfer::TransferServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let settings = Arc::new(ServerSettings::from_env()?);

    // Make sure uploads have somewhere to go
    let store = UploadStore::new(settings.storage_dir.clone());
    store.ensure_dir().await?;
    info!("Storing uploads in {}", store.dir().display());

    // Generate the server RSA key pair
    let start = Instant::now();
    let keypair = tokio::task::spawn_blocking(ServerKeyPair::generate).await??;
    log_timing(&settings, "Server key generation", start.elapsed());
    info!("Server RSA key pair ready ({} bytes)", keypair.modulus_len());

    let processor = Arc::new(FfmpegProcessor::new(
        settings.ffmpeg_path.clone(),
        settings.ffprobe_path.clone(),
    ));
    let server = TransferServer::new(
        settings.clone(),
        Arc::new(keypair),
        processor.clone(),
        processor,
    );

    // Stop accepting on Ctrl-C
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        let _ = shutdown_tx.send(());
    });

    server.run_with_shutdown(shutdown_rx).await?;
    Ok(())
}
