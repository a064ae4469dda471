use axum::{
    Json, Router,
    http::{HeaderValue, Method},
    routing::{get, post},
};
use serde_json::json;
use tower_http::cors::CorsLayer;

use super::AppState;
use super::handlers::chat;

fn build_frontend_cors(frontend_origin: &str, api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        frontend_origin.to_string(),
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

async fn root_banner() -> Json<serde_json::Value> {
    Json(json!({
        "service": "clinq",
        "status": "ok",
    }))
}

pub fn build_api_router(state: AppState) -> Router {
    let cors = build_frontend_cors(&state.config.frontend_origin, state.config.api_port);

    Router::new()
        .route("/", get(root_banner))
        .route("/api/v1/chat/send", post(chat::send_message))
        .route("/api/v1/chat/audio/{filename}", get(chat::get_audio))
        .route("/api/v1/chat/transcribe", post(chat::transcribe_voice))
        .layer(cors)
        .with_state(state)
}
