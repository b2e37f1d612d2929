// Main entry point for the automation server

use std::sync::Arc;

use anyhow::{Context, Result};
use automation_core::domains::auth::JwtService;
use automation_core::kernel::{
    BaseContentGenerator, NoopContentGenerator, OpenAiContentGenerator, PostgresStore,
    ServerDeps, ServerKernel, WordPressClient,
};
use automation_core::server::{build_app, HttpOptions};
use automation_core::{Config, LogFormat};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,automation_core=debug,sqlx=warn".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(config.log_format);
    tracing::info!("Starting WordPress automation server");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Collaborators
    let remote_client = Arc::new(WordPressClient::new(config.engine.remote_timeout)?);
    let content_generator: Arc<dyn BaseContentGenerator> = match &config.openai_api_key {
        Some(key) => Arc::new(OpenAiContentGenerator::new(
            key.clone(),
            config.openai_model.clone(),
            config.engine.remote_timeout,
        )?),
        None => {
            tracing::warn!("OPENAI_API_KEY not set, automation runs will fail generation");
            Arc::new(NoopContentGenerator)
        }
    };
    let deps = ServerDeps::new(
        Arc::new(PostgresStore::new(pool)),
        remote_client,
        content_generator,
    );

    // Engine
    let kernel = Arc::new(ServerKernel::new(deps, &config.engine).await?);
    kernel.start().await.context("Failed to start engine")?;

    // HTTP
    let jwt_service = Arc::new(JwtService::new(&config.jwt_secret, config.jwt_issuer.clone()));
    let app = build_app(
        kernel.clone(),
        jwt_service,
        &HttpOptions {
            allowed_origins: config.allowed_origins.clone(),
            rate_limit_enabled: config.rate_limit_enabled,
        },
    );

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    kernel.shutdown().await?;
    Ok(())
}
