pub mod auth;
pub mod config;
pub mod debug;
pub mod error;
pub mod home_assistant;
pub mod homescript;
pub mod live;
pub mod repository;
pub mod runner;
pub mod security;
pub mod server;

pub use error::{AppError, AppResult};

/// Starts the web server with the given configuration.
///
/// This function:
/// 1. Builds the Home Assistant REST client from `config.home_assistant`
/// 2. Applies the bootstrap section (UI session, debug access)
/// 3. Binds, spawns the server and the limiter sweeper
/// 4. Stops gracefully when `shutdown_rx` fires
///
/// Returns the bound port, which differs from the configured one when that is 0.
pub async fn start_server_with_config(
    config: config::Config,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<u16> {
    server::serve_with_config(config, shutdown_rx).await
}
