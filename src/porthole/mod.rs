pub mod app;
pub mod config;
pub mod directory;
pub mod logging;
pub mod net;
pub mod tunnel;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
