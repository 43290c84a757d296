//! Sensei · Japanese tutoring backend
//!
//! - Axum HTTP + WebSocket API in front of a structured-reply tutor
//! - OpenAI Responses API with per-learner file_search stores, plus text-to-speech
//! - File-backed learner progress and chat sessions under DATA_DIR
//!
//! Important env variables:
//!   PORT               : u16 (default 3000)
//!   OPENAI_API_KEY     : enables OpenAI integration if present
//!   OPENAI_BASE_URL    : default "https://api.openai.com/v1"
//!   OPENAI_TEXT_MODEL  : default "gpt-4.1-mini"
//!   OPENAI_TTS_MODEL   : default "gpt-4o-mini-tts"
//!   OPENAI_TTS_VOICE   : default "alloy"
//!   VECTOR_STORE_ID    : global knowledge-base store searched on every call
//!   DATA_DIR           : default "./data"
//!   TUTOR_CONFIG_PATH  : path to TOML config (prompts, speech, limits)
//!   LOG_LEVEL          : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT         : "pretty" (default) or "json"

mod backend;
mod config;
mod dialogue;
mod domain;
mod error;
mod extract;
mod inject;
mod openai;
mod outbox;
mod pipeline;
mod protocol;
mod render;
mod route;
mod routes;
mod session;
mod state;
mod store;
mod telemetry;
mod util;

use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::AppConfig;
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  let config = AppConfig::from_env();
  let state = Arc::new(AppState::from_config(&config).await?);
  let app = build_router(state);

  let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
  let listener = TcpListener::bind(addr).await?;
  info!(target: "sensei_backend", %addr, data_dir = %config.data_dir.display(), "HTTP server listening");
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::error!(target: "sensei_backend", error = %e, "Failed to listen for shutdown signal");
    std::future::pending::<()>().await;
  }
  info!(target: "sensei_backend", "Shutdown signal received");
}
