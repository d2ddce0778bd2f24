//! API route definitions.

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, HeaderValue, Method, header};
use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::auth::auth_middleware;
use super::state::AppState;
use super::{files, handlers, transfer, ws};

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    if state.auth_token.is_empty() {
        tracing::warn!("No auth token configured, the API is unauthenticated");
    }

    let cors = build_cors_layer(&state);
    let max_body_size = state.max_body_bytes;

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let protected_routes = Router::new()
        // Workloads
        .route(
            "/sandboxes",
            get(handlers::list_workloads).post(handlers::create_workload),
        )
        .route("/servers", get(handlers::list_workloads))
        .route(
            "/sandboxes/{id}",
            get(handlers::get_workload).delete(handlers::delete_workload),
        )
        .route("/sandboxes/{id}/start", post(handlers::start_workload))
        .route("/sandboxes/{id}/stop", post(handlers::stop_workload))
        .route("/sandboxes/{id}/kill", post(handlers::kill_workload))
        .route("/sandboxes/{id}/restart", post(handlers::restart_workload))
        .route("/sandboxes/{id}/install", post(handlers::install_workload))
        .route("/sandboxes/{id}/input", post(handlers::send_input))
        .route("/sandboxes/{id}/ws", get(ws::ws_handler))
        // Files
        .route("/sandboxes/{id}/files/list", get(files::list_files))
        .route(
            "/sandboxes/{id}/files/contents",
            get(files::read_file).put(files::write_file),
        )
        .route("/sandboxes/{id}/files/mkdir", post(files::create_dir))
        .route("/sandboxes/{id}/files/delete", post(files::delete_path))
        .route("/sandboxes/{id}/files/rename", post(files::rename_path))
        .route("/sandboxes/{id}/files/copy", post(files::copy_path))
        .route("/sandboxes/{id}/files/compress", post(files::compress))
        .route("/sandboxes/{id}/files/usage", get(files::disk_usage))
        .route(
            "/sandboxes/{id}/backups",
            get(files::list_backups).post(files::create_backup),
        )
        .route("/sandboxes/{id}/backups/{name}", delete(files::delete_backup))
        // Host
        .route("/stats", get(handlers::host_stats))
        // Transfers
        .route("/transfer/initiate", post(transfer::initiate))
        .route(
            "/transfer/receive",
            post(transfer::receive).layer(DefaultBodyLimit::disable()),
        )
        .route("/transfer/import", post(transfer::import))
        .route("/transfers", get(transfer::list_transfers))
        .route("/transfers/{id}", get(transfer::get_transfer))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let public_routes = Router::new().route("/health", get(handlers::health));

    Router::new()
        .merge(protected_routes)
        .merge(public_routes)
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(cors)
        .layer(trace_layer)
}

/// Build the CORS layer based on configuration.
fn build_cors_layer(state: &AppState) -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
    ];

    let headers = [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::ORIGIN,
        HeaderName::from_static("x-transfer-uuid"),
    ];

    if state.cors_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(AllowOrigin::any())
            .allow_methods(methods)
            .allow_headers(headers);
    }

    let origins: Vec<HeaderValue> = state
        .cors_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: Invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    if origins.is_empty() {
        tracing::error!("CORS: All configured origins are invalid!");
        CorsLayer::new().allow_origin(AllowOrigin::exact(HeaderValue::from_static("null")))
    } else {
        tracing::info!("CORS: Allowing {} origin(s)", origins.len());
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(headers)
    }
}
