// Web服务器模块

pub mod error;
pub mod handlers;
pub mod state;
pub mod websocket;

use axum::{
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub use error::{ApiError, ApiResult};
pub use state::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
    version: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "ota-updater".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// 构建完整路由
pub fn build_router(app_state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let api_routes = Router::new()
        .route("/status", get(handlers::get_status))
        .route("/updates", get(handlers::list_updates))
        .route("/updates/check", post(handlers::check_updates))
        .route("/updates/:id", get(handlers::get_update))
        .route("/updates/:id/actions/:action", post(handlers::perform_action))
        .route("/install/cancel", post(handlers::cancel_install))
        .route("/reboot", post(handlers::reboot))
        .route("/settings", get(handlers::get_settings))
        .route("/settings", put(handlers::update_settings))
        .route("/ws", get(websocket::handle_websocket))
        .with_state(app_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(middleware)
}
