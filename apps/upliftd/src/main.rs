//! uplift daemon entry point.

mod app;
mod config;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting upliftd");

    let (config, path) = config::Config::load()?;
    tracing::info!(
        path = %path.display(),
        endpoint = %config.store.endpoint,
        control_port = config.control.port,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config, &path))?;

    tracing::info!("upliftd shut down cleanly");
    Ok(())
}
