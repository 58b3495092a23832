use axum::{extract::State, routing::get, Json, Router};
use event_consumer::{ManagerStatus, WorkerManager};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use notifications_rs::consumer_tasks::{build_broker, build_worker_manager};
use notifications_rs::email::LoggingEmailSender;
use notifications_rs::repositories::{InMemoryListRepository, InMemoryUserRepository};
use notifications_rs::{Config, NotificationHandler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().map_err(anyhow::Error::msg)?;

    let broker = build_broker(config.broker_type);

    let handler = Arc::new(NotificationHandler::new(
        Arc::new(InMemoryUserRepository::new()),
        Arc::new(InMemoryListRepository::new()),
        Arc::new(LoggingEmailSender::new()),
    ));

    let manager = Arc::new(build_worker_manager(&config, broker, handler)?);

    // Not awaited before serving: a connect can hang on an unreachable broker
    let starting = {
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.start().await {
                tracing::error!(error = %e, "Failed to start notification consumers");
            }
        })
    };

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/consumers/status", get(consumers_status))
        .with_state(manager.clone())
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Notifications module listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, stopping consumers");
    manager.stop().await;
    if let Err(e) = starting.await {
        tracing::warn!(error = %e, "Consumer start task panicked");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "module": "notifications",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn consumers_status(State(manager): State<Arc<WorkerManager>>) -> Json<ManagerStatus> {
    Json(manager.status().await)
}
