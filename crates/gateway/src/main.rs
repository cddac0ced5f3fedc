//! Entrypoint for the workspace gateway.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use kube::Client;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use devplane_gateway::auth::Validator;
use devplane_gateway::lifecycle::{LifecycleManager, WorkspaceDefaults};
use devplane_gateway::oidc::OidcClient;
use devplane_gateway::routes::{self, AppState};
use devplane_gateway::GatewayConfig;

/// Grace period for in-flight requests after a termination signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = GatewayConfig::from_env().context("load gateway configuration")?;

    let validator = Validator::new(&config.issuer_url, &config.client_id)
        .await
        .context("initialize OIDC validator")?;
    info!(issuer = %config.issuer_url, "OIDC validator ready");

    let oidc = OidcClient::discover(&config)
        .await
        .context("initialize OIDC login flow")?;

    let client = Client::try_default()
        .await
        .context("create kubernetes client")?;
    let lifecycle = LifecycleManager::new(
        client,
        WorkspaceDefaults {
            providers: config.default_providers.clone(),
            ..Default::default()
        },
    );

    let state = Arc::new(AppState {
        validator: Arc::new(validator),
        oidc: Arc::new(oidc),
        lifecycle: Arc::new(lifecycle),
        http: reqwest::Client::new(),
        namespace: config.namespace.clone(),
        cookie_secure: config.cookie_secure(),
    });
    let app = routes::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(addr = %addr, namespace = %config.namespace, "Gateway listening");

    // On signal the server stops accepting and drains; connections still
    // open after the drain window (long-lived WebSockets) are dropped.
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutting down gateway server");
        let _ = shutdown_tx.send(true);
    });
    let mut drain_rx = shutdown_rx.clone();

    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown_rx.changed().await;
    });

    tokio::select! {
        result = server => result.context("gateway server")?,
        _ = async {
            let _ = drain_rx.changed().await;
            tokio::time::sleep(DRAIN_TIMEOUT).await;
        } => {
            warn!("Drain window elapsed; closing remaining connections");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
