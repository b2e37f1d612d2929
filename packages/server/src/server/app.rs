//! Application setup and server configuration.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method,
    },
    middleware,
    routing::{get, post},
    Router,
};
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::domains::auth::JwtService;
use crate::kernel::ServerKernel;
use crate::server::middleware::jwt_auth_middleware;
use crate::server::routes::{
    automation_schedules, bulk_operations, health_handler, scheduled_posts, sites,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<ServerKernel>,
    pub jwt_service: Arc<JwtService>,
}

/// HTTP-layer options that do not affect the engine.
#[derive(Debug, Clone, Default)]
pub struct HttpOptions {
    /// Empty means any origin.
    pub allowed_origins: Vec<String>,
    pub rate_limit_enabled: bool,
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(origins)
    }
}

fn api_routes() -> Router {
    Router::new()
        // Sites
        .route("/sites", post(sites::create_site).get(sites::list_sites_handler))
        .route("/sites/:id", get(sites::get_site))
        // Bulk operations. `:key` is an action on POST and an id on GET.
        .route("/bulk-operations", get(bulk_operations::list_bulk_operations))
        .route(
            "/bulk-operations/:key",
            post(bulk_operations::submit_bulk_operation).get(bulk_operations::get_bulk_operation),
        )
        // Scheduled posts
        .route(
            "/scheduled-posts",
            post(scheduled_posts::create_scheduled_post).get(scheduled_posts::list_scheduled_posts),
        )
        .route(
            "/scheduled-posts/:id",
            get(scheduled_posts::get_scheduled_post)
                .put(scheduled_posts::update_scheduled_post)
                .delete(scheduled_posts::delete_scheduled_post),
        )
        .route(
            "/scheduled-posts/:id/reschedule",
            post(scheduled_posts::reschedule_scheduled_post),
        )
        .route(
            "/scheduled-posts/:id/publish-now",
            post(scheduled_posts::publish_scheduled_post_now),
        )
        .route(
            "/scheduled-posts/:id/cancel",
            post(scheduled_posts::cancel_scheduled_post),
        )
        // Automation schedules
        .route(
            "/automation-schedules",
            post(automation_schedules::create_schedule).get(automation_schedules::list_schedules),
        )
        .route(
            "/automation-schedules/:id",
            get(automation_schedules::get_schedule)
                .put(automation_schedules::update_schedule)
                .delete(automation_schedules::delete_schedule),
        )
        .route(
            "/automation-schedules/:id/pause",
            post(automation_schedules::pause_schedule),
        )
        .route(
            "/automation-schedules/:id/resume",
            post(automation_schedules::resume_schedule),
        )
        .route(
            "/automation-schedules/:id/run-now",
            post(automation_schedules::run_schedule_now),
        )
        .route(
            "/automation-schedules/:id/executions",
            get(automation_schedules::list_schedule_executions),
        )
}

/// Build the Axum application router
pub fn build_app(
    kernel: Arc<ServerKernel>,
    jwt_service: Arc<JwtService>,
    options: &HttpOptions,
) -> Router {
    let app_state = AppState {
        kernel,
        jwt_service: jwt_service.clone(),
    };

    let mut api = api_routes();

    if options.rate_limit_enabled {
        // 10 requests per second per client IP, bursts up to 20
        match GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .use_headers()
            .finish()
        {
            Some(config) => {
                api = api.layer(GovernorLayer {
                    config: Arc::new(config),
                });
            }
            None => warn!("invalid rate limiter configuration, rate limiting disabled"),
        }
    }

    Router::new()
        // Health check (no auth, no rate limit)
        .route("/health", get(health_handler))
        .merge(api)
        // Middleware layers (applied in reverse order - last added runs first)
        .layer(middleware::from_fn(move |req, next| {
            jwt_auth_middleware(jwt_service.clone(), req, next)
        }))
        .layer(Extension(app_state))
        .layer(cors_layer(&options.allowed_origins))
        .layer(TraceLayer::new_for_http())
}
