use anyhow::Context;

use refsync_infra::config::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    refsync_observability::init();

    let settings = Settings::from_env().context("loading configuration")?;
    let app = refsync_worker::App::build(settings)
        .await
        .context("building refresh worker")?;
    let running = app.start().await.context("starting refresh worker")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");

    running.shutdown().await
}
