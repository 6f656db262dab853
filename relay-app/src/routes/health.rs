use crate::server::RelayState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use relay_llm::Provider;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<RelayState>>) -> Json<serde_json::Value> {
    let configured = state.config.configured_providers();
    let providers: Vec<serde_json::Value> = Provider::ALL
        .into_iter()
        .map(|p| {
            serde_json::json!({
                "name": p,
                "configured": configured.contains(&p),
            })
        })
        .collect();

    Json(serde_json::json!({
        "status": "ok",
        "ready": !state.shutdown.is_cancelled(),
        "checked_at": Utc::now(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "default_model": state.config.general.model,
        "default_provider": state.config.default_provider(),
        "providers": providers,
    }))
}
