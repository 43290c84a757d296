//! Router assembly: HTTP endpoints, WebSocket upgrade, CORS, and HTTP tracing.

use std::sync::Arc;

use axum::{
  routing::{delete, get, post},
  Router,
};
use tower_http::{
  cors::{Any, CorsLayer},
  trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::state::AppState;

pub mod http;
pub mod ws;

/// Build the application router with:
/// - WebSocket at `/ws`
/// - learner messages at `/api/v1/message`
/// - operator session endpoints under `/api/v1/sessions`
/// - CORS (allow any origin/method/headers), adjust for production if needed
/// - HTTP trace layer (per-request spans w/ method, path, status, latency)
pub fn build_router(state: Arc<AppState>) -> Router {
  Router::new()
    .route("/ws", get(ws::ws_upgrade))
    .route("/api/v1/health", get(http::http_health))
    .route("/api/v1/message", post(http::http_post_message))
    .route("/api/v1/sessions", get(http::http_list_sessions))
    .route("/api/v1/sessions/:user_id", delete(http::http_reset_session))
    .route("/api/v1/sessions/:user_id/export", get(http::http_export_session))
    .route("/api/v1/sessions/:user_id/history", delete(http::http_clear_history))
    .with_state(state)
    .layer(
      CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any),
    )
    .layer(
      TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{AppConfig, TutorFileConfig};
  use axum::body::{to_bytes, Body};
  use axum::http::{Request, StatusCode};
  use serde_json::{json, Value};
  use tower::ServiceExt;

  async fn app(dir: &tempfile::TempDir) -> Router {
    let data_dir = dir.path().to_string_lossy().to_string();
    let config = AppConfig::from_lookup(TutorFileConfig::default(), |k| (k == "DATA_DIR").then(|| data_dir.clone()));
    let state = AppState::from_config(&config).await.unwrap();
    build_router(Arc::new(state))
  }

  async fn body_json(res: axum::response::Response) -> Value {
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
  }

  fn post_message(user: Value, text: &str) -> Request<Body> {
    Request::builder()
      .method("POST")
      .uri("/api/v1/message")
      .header("content-type", "application/json")
      .body(Body::from(json!({ "userId": user, "text": text }).to_string()))
      .unwrap()
  }

  #[tokio::test]
  async fn health_is_ok() {
    let dir = tempfile::tempdir().unwrap();
    let res = app(&dir)
      .await
      .oneshot(Request::builder().uri("/api/v1/health").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await, json!({ "ok": true }));
  }

  #[tokio::test]
  async fn message_without_backend_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let res = app(&dir).await.oneshot(post_message(json!(42), "こんにちは")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    let first = body["messages"][0].as_str().unwrap();
    assert!(first.starts_with("Error: configuration error"));
    assert!(body.get("audio").is_none());
  }

  #[tokio::test]
  async fn empty_message_produces_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let res = app(&dir).await.oneshot(post_message(json!("u1"), "   ")).await.unwrap();
    assert_eq!(body_json(res).await, json!({ "messages": [] }));
  }

  #[tokio::test]
  async fn sessions_can_be_listed_exported_and_reset() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir).await;

    // A failed turn still opens the learner's session.
    app.clone().oneshot(post_message(json!(42), "hi")).await.unwrap();

    let res = app
      .clone()
      .oneshot(Request::builder().uri("/api/v1/sessions?q=42").body(Body::empty()).unwrap())
      .await
      .unwrap();
    let body = body_json(res).await;
    assert_eq!(body["sessions"][0]["chat_id"], "42");

    let res = app
      .clone()
      .oneshot(Request::builder().uri("/api/v1/sessions/42/export").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let reset = || Request::builder().method("DELETE").uri("/api/v1/sessions/42").body(Body::empty()).unwrap();
    assert_eq!(app.clone().oneshot(reset()).await.unwrap().status(), StatusCode::OK);
    assert_eq!(app.clone().oneshot(reset()).await.unwrap().status(), StatusCode::NOT_FOUND);

    let res = app
      .oneshot(Request::builder().uri("/api/v1/sessions/42/export").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
  }
}
