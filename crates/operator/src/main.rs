//! Entrypoint for the workspace operator.

use anyhow::Context as _;
use kube::Client;
use tracing::info;
use tracing_subscriber::EnvFilter;

use devplane_operator::{controller, OperatorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = OperatorConfig::from_env().context("load operator configuration")?;
    info!(
        image = %config.workspace_image,
        idle_timeout = ?config.idle_timeout,
        "Starting workspace operator"
    );

    let client = Client::try_default()
        .await
        .context("create kubernetes client")?;

    controller::run(client, config).await
}
