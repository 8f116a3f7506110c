//! Camrelay daemon
//!
//! # Features
//!
//! - Negotiates per-session SRTP transport parameters for each camera
//! - Translates negotiated parameters into transcoder invocations
//! - Supervises one transcoder process per active session
//! - Serves still captures through the same subprocess contract
//! - Exposes the lifecycle operations over a JSON HTTP facade

use argh::FromArgs;
use camrelay::{run_http_server, AppState, Config, PortPool, StreamController};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(FromArgs)]
/// Camrelay daemon - bridges IP cameras to SRTP stream controllers
struct Args {
    /// path to the camera configuration file
    #[argh(option, short = 'c', default = "String::from(\"camrelay.yaml\")")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    let args: Args = argh::from_env();

    log::info!("Starting camrelay...");

    let config = Config::from_file(&args.config)?;

    // Create shutdown channel
    let (shutdown_tx, mut shutdown_rx) = watch::channel(());

    // Set up Ctrl+C handler
    ctrlc::set_handler({
        let shutdown_tx = shutdown_tx.clone();
        move || {
            log::info!("Received Ctrl+C, shutting down gracefully...");
            shutdown_tx.send(()).ok();
        }
    })?;

    // Port reservations are process-wide: every camera draws from one pool
    let ports = Arc::new(PortPool::new());

    let mut cameras = HashMap::new();
    for camera in config.cameras {
        let name = camera.name.clone();
        match camera.validated() {
            Ok(camera) => {
                log::info!("Registered camera '{}'", name);
                cameras.insert(
                    name,
                    Arc::new(StreamController::new(
                        camera,
                        config.transcoder_bin.clone(),
                        ports.clone(),
                    )),
                );
            }
            Err(e) => {
                log::error!("Skipping camera '{}': {}", name, e);
            }
        }
    }

    if cameras.is_empty() {
        anyhow::bail!("no valid cameras configured");
    }

    let state = AppState {
        cameras: Arc::new(cameras),
    };

    // Start the HTTP facade for the negotiation layer
    let server_state = state.clone();
    let listen = config.listen.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = run_http_server(server_state, &listen).await {
            log::error!("HTTP server error: {}", e);
        }
    });

    log::info!("Camrelay running. Press Ctrl+C to exit.");

    // Block until shutdown
    shutdown_rx.changed().await.ok();

    // Stop every active session before exiting
    for controller in state.cameras.values() {
        controller.shutdown().await;
    }

    server_task.abort();

    log::info!("Camrelay stopped.");

    Ok(())
}
