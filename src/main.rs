use clap::Parser;
use leechrs::config::Config;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();

    if let Err(err) = leechrs::engine::run(config).await {
        tracing::error!(error = %err, "download failed");
        return Err(err.into());
    }

    Ok(())
}
