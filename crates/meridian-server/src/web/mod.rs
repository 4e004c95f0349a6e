//! HTTP control surface and the probe WebSocket endpoint.

pub mod admin_routes;
pub mod error;
pub mod probe_routes;
pub mod result_routes;
pub mod task_routes;

pub use error::AppError;

use crate::config::ServerConfig;
use crate::db::DbPool;
use crate::geoip::GeoIpService;
use crate::hub::Hub;
use crate::scheduler::Scheduler;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

pub struct AppState {
    pub db: DbPool,
    pub hub: Arc<Hub>,
    pub scheduler: Arc<Scheduler>,
    pub geoip: Arc<GeoIpService>,
    pub config: Arc<ServerConfig>,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(crate::hub::connection::ws_handler))
        .nest("/api", api_router(state.clone()))
        .layer(cors)
        .with_state(state)
}

fn api_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(result_routes::health))
        .route(
            "/tasks",
            post(task_routes::create_task).get(task_routes::list_tasks),
        )
        .route(
            "/tasks/{id}",
            get(task_routes::get_task).delete(task_routes::cancel_task),
        )
        .route("/executions", get(task_routes::list_executions))
        .route("/probes", get(probe_routes::list_probes))
        .route("/probes/{id}", get(probe_routes::get_probe))
        .route("/results", get(result_routes::list_results))
        .route("/results/{id}", get(result_routes::get_result))
        .route("/geoip", get(result_routes::geoip_lookup))
        .nest("/admin", admin_routes::router(state))
}
