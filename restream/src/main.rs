use std::time::Duration;

use mimalloc::MiMalloc;
use tracing::{error, info, warn};

use restream::api::{ApiServer, ApiServerConfig, AppState};
use restream::config::ServiceConfig;
use restream::encoder::detect_version;
use restream::logging::init_logging;
use restream::signals::wait_for_shutdown_signal;
use restream::supervisor::{Supervisor, SupervisorSettings};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// How long the HTTP server may take to drain after shutdown is requested.
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = ServiceConfig::from_env_or_default();
    let (logging_config, _log_guard) = init_logging(&config.log_dir)?;

    info!(version = env!("CARGO_PKG_VERSION"), "restream starting");

    match detect_version(&config.ffmpeg_path).await {
        Some(version) => info!(path = %config.ffmpeg_path, %version, "Found ffmpeg"),
        None => warn!(
            path = %config.ffmpeg_path,
            "ffmpeg not found, streams cannot be started until it is installed"
        ),
    }

    let supervisor = Supervisor::spawn(SupervisorSettings::from(&config));

    let state = AppState::new(supervisor.clone()).with_logging_config(logging_config);
    let server = ApiServer::with_state(ApiServerConfig::from(&config), state);
    let cancel_token = server.cancel_token();

    let mut server_task = tokio::spawn(async move { server.run().await });

    tokio::select! {
        result = wait_for_shutdown_signal() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signals: {}", e);
            }
            info!("Shutdown signal received");
        }
        result = &mut server_task => {
            cancel_token.cancel();
            if let Err(e) = supervisor.shutdown().await {
                warn!("Supervisor shutdown failed: {}", e);
            }
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(e.into()),
            };
        }
    }

    cancel_token.cancel();

    // Stops a running encoder before the process exits.
    if let Err(e) = supervisor.shutdown().await {
        warn!("Supervisor shutdown failed: {}", e);
    }

    match tokio::time::timeout(SERVER_DRAIN_TIMEOUT, server_task).await {
        Ok(Ok(Err(e))) => error!("API server error: {}", e),
        Ok(Err(e)) => error!("API server task failed: {}", e),
        Err(_) => warn!("API server did not drain in time"),
        Ok(Ok(Ok(()))) => {}
    }

    info!("restream stopped");
    Ok(())
}
