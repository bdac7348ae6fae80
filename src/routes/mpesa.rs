use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;

use crate::handlers::mpesa_handlers;
use crate::state::AppState;

pub fn mpesa_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(mpesa_health))
        .route("/stk-push", post(mpesa_handlers::initiate_stk_push))
        .route("/callback", post(mpesa_handlers::mpesa_callback))
        .route("/status", get(mpesa_handlers::check_transaction_status))
}

async fn mpesa_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "mpesa",
        "environment": state.environment,
        "config": state.config_info,
        "timestamp": Utc::now().to_rfc3339(),
        "features": ["stk-push", "callback", "status"]
    }))
}
