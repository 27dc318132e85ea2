use super::{handler::PsgService, params};
use axum::{
    Json, Router,
    extract::{RawQuery, State},
    response::{IntoResponse, Response},
    routing::get,
};
use tower_http::trace::TraceLayer;

/// All routes of the gateway.
pub fn router(service: PsgService) -> Router {
    Router::new()
        .route("/ID/resolve", get(resolve))
        .route("/ID/get", get(get_by_seq_id))
        .route("/ID/getblob", get(get_blob))
        .route("/ID/get_tse_chunk", get(get_tse_chunk))
        .route("/ID/get_na", get(get_na))
        .route("/ID/get_acc_ver_history", get(get_acc_ver_history))
        .route("/health", get(health))
        .route("/ADMIN/config", get(admin_config))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn resolve(State(service): State<PsgService>, RawQuery(query): RawQuery) -> Response {
    service.serve(query, params::resolve).await
}

async fn get_by_seq_id(State(service): State<PsgService>, RawQuery(query): RawQuery) -> Response {
    service.serve(query, params::get).await
}

async fn get_blob(State(service): State<PsgService>, RawQuery(query): RawQuery) -> Response {
    service.serve(query, params::get_blob).await
}

async fn get_tse_chunk(State(service): State<PsgService>, RawQuery(query): RawQuery) -> Response {
    service.serve(query, params::get_tse_chunk).await
}

async fn get_na(State(service): State<PsgService>, RawQuery(query): RawQuery) -> Response {
    service.serve(query, params::get_na).await
}

async fn get_acc_ver_history(
    State(service): State<PsgService>,
    RawQuery(query): RawQuery,
) -> Response {
    service.serve(query, params::get_acc_ver_history).await
}

async fn health() -> &'static str {
    "OK"
}

async fn admin_config(State(service): State<PsgService>) -> Response {
    Json(service.config().clone()).into_response()
}
