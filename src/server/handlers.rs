use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
};
use serde_json::json;
use tracing::warn;

use super::AppState;

/// Serve the entry page, or a 404 page if it is missing
pub async fn serve_root(State(state): State<AppState>) -> Response {
    match tokio::fs::read_to_string(&state.index_path).await {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            warn!("Index page {} unavailable: {}", state.index_path.display(), e);
            (
                StatusCode::NOT_FOUND,
                Html("<h1>index.html not found</h1>"),
            )
                .into_response()
        }
    }
}

pub async fn relay_stats(State(state): State<AppState>) -> impl IntoResponse {
    let peer_ids = state.registry.peer_ids().await;
    Json(json!({
        "peers": peer_ids.len(),
        "peer_ids": peer_ids,
    }))
}
