use anyhow::Result;
use log::info;

use astm_interface::config::Config;
use astm_interface::Application;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());
    let config = Config::from_file(&config_path)?;

    info!(
        "Starting ASTM interface service with {} instrument(s)",
        config.instruments.len()
    );

    let application = Application::build(config).await?;
    application.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    application.stop().await;

    Ok(())
}
