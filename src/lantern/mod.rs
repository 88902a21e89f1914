pub mod api;
pub mod app;
pub mod client;
pub mod config;
pub mod heartbeat;
pub mod logging;
pub mod net;
pub mod proto;
pub mod server;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
