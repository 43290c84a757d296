//! HTTP endpoint handlers. These are thin wrappers that forward to the tutor and the
//! session registry. Each handler is instrumented and logs basic result info.

use std::sync::Arc;
use axum::{
  extract::{Path, Query, State},
  http::{header, StatusCode},
  response::IntoResponse,
  Json,
};
use tracing::{info, instrument, error};

use crate::domain::UserId;
use crate::outbox::CollectingOutbox;
use crate::protocol::*;
use crate::state::AppState;

#[instrument(level = "info")]
pub async fn http_health() -> impl IntoResponse { Json(HealthOut { ok: true }) }

#[instrument(level = "info", skip(state, body), fields(user = %body.user_id, text_len = body.text.len()))]
pub async fn http_post_message(
  State(state): State<Arc<AppState>>,
  Json(body): Json<MessageIn>,
) -> impl IntoResponse {
  let mut outbox = CollectingOutbox::default();
  state.tutor.handle_message(&body.user_id, &body.text, &mut outbox).await;
  let out = MessageOut::from_events(outbox.events);
  info!(target: "sensei_backend", user = %body.user_id, messages = out.messages.len(), audio = out.audio.is_some(), "HTTP message handled");
  Json(out)
}

#[instrument(level = "info", skip(state))]
pub async fn http_list_sessions(
  State(state): State<Arc<AppState>>,
  Query(q): Query<SessionQuery>,
) -> impl IntoResponse {
  let sessions = match q.q.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
    Some(query) => state.tutor.sessions().search(query).await,
    None => state.tutor.sessions().list().await,
  };
  Json(SessionsOut { sessions })
}

#[instrument(level = "info", skip(state), fields(%user_id))]
pub async fn http_export_session(
  State(state): State<Arc<AppState>>,
  Path(user_id): Path<String>,
) -> impl IntoResponse {
  match state.tutor.sessions().export_text(&UserId::new(user_id)).await {
    Some(text) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response(),
    None => StatusCode::NOT_FOUND.into_response(),
  }
}

#[instrument(level = "info", skip(state), fields(%user_id))]
pub async fn http_reset_session(
  State(state): State<Arc<AppState>>,
  Path(user_id): Path<String>,
) -> impl IntoResponse {
  match state.tutor.sessions().reset(&UserId::new(user_id.clone())).await {
    Ok(true) => Json(SessionActionOut { ok: true }).into_response(),
    Ok(false) => StatusCode::NOT_FOUND.into_response(),
    Err(e) => {
      error!(target: "sensei_backend", %user_id, error = %e, "Session reset failed");
      (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
    }
  }
}

#[instrument(level = "info", skip(state), fields(%user_id))]
pub async fn http_clear_history(
  State(state): State<Arc<AppState>>,
  Path(user_id): Path<String>,
) -> impl IntoResponse {
  match state.tutor.sessions().clear_history(&UserId::new(user_id.clone())).await {
    Ok(true) => Json(SessionActionOut { ok: true }).into_response(),
    Ok(false) => StatusCode::NOT_FOUND.into_response(),
    Err(e) => {
      error!(target: "sensei_backend", %user_id, error = %e, "Clearing history failed");
      (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
    }
  }
}
