//! Chorus room server binary
//!
//! Runs a standalone room server until interrupted. The port comes
//! from the first argument, falling back to [`chorus_net::DEFAULT_PORT`].

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let port = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(chorus_net::DEFAULT_PORT);

    match chorus_net::Server::start(port).await {
        Ok(server) => {
            tracing::info!(addr = %server.addr(), "Chorus server running");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to wait for shutdown signal");
            }
            server.shutdown();
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to start server");
            std::process::exit(1);
        }
    }
}
