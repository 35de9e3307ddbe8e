use rootcause::prelude::Report;
use sqlx::postgres::PgPoolOptions;
use sso_relay_coordination::{CallbackOrchestrator, CoordinationStores, DownstreamLogin};
use sso_relay_core::{Clock, SystemClock};
use sso_relay_server::{
    app::router,
    auth::{AppState, OidcClient},
    config::ServerConfig,
    downstream::{AccountRepository, DownstreamClient, FormOnlyLogin},
    error::ServerError,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Report<ServerError>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = ServerConfig::from_env().map_err(|e| ServerError::Config {
        details: e.to_string(),
    })?;
    tracing::info!(debug = config.debug, "Loaded configuration");

    // Downstream account store
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.downstream.database_url)
        .await
        .map_err(|e| ServerError::Database {
            details: e.to_string(),
        })?;

    tracing::info!("Discovering OIDC provider...");
    let callback_url = config.oidc.redirect_uri().to_string();
    let oidc_client = Arc::new(OidcClient::discover(config.oidc).await.map_err(|e| {
        ServerError::Oidc {
            details: e.to_string(),
        }
    })?);

    let downstream_login: Arc<dyn DownstreamLogin> = if config.debug {
        tracing::info!("Debug mode: downstream login happens in the browser");
        Arc::new(FormOnlyLogin)
    } else {
        Arc::new(DownstreamClient::new(&config.downstream).map_err(|e| {
            ServerError::HttpClient {
                details: e.to_string(),
            }
        })?)
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let stores = CoordinationStores::from_config(&config.coordination, Arc::clone(&clock));
    let orchestrator = CallbackOrchestrator::new(
        &stores,
        oidc_client.clone(),
        Arc::new(AccountRepository::new(
            db_pool,
            config.downstream.global_role.clone(),
            config.downstream.project_role.clone(),
        )),
        downstream_login,
        config.coordination.admission_timeout(),
        Arc::clone(&clock),
    );

    let janitor = Arc::new(stores.janitor(&config.coordination, clock)).spawn();

    let app_state = Arc::new(AppState::new(
        orchestrator,
        oidc_client,
        callback_url,
        config.downstream,
        config.default_redirect_url,
    ));
    let app = router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|e| ServerError::Serve {
            details: format!("failed to bind to {}: {}", config.bind_addr, e),
        })?;

    tracing::info!("listening on http://{}", config.bind_addr);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    janitor.shutdown().await;

    served.map_err(|e| ServerError::Serve {
        details: e.to_string(),
    })?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
