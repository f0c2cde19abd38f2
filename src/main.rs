//! FireMesh adapter binary.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use firemesh::adapter::Adapter;
use firemesh::config::AdapterConfig;
use firemesh::logging;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is not an error.
    let dotenv = dotenvy::dotenv();

    let config = AdapterConfig::from_env().context("failed to load configuration")?;
    let _guard = logging::init(config.log_format)?;
    if let Ok(path) = dotenv {
        info!(path = %path.display(), "loaded environment file");
    }

    let adapter = Adapter::new(config).context("failed to initialise adapter")?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    adapter.start(cancel).await?;
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, waiting for SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received SIGINT");
    }

    token.cancel();
}
