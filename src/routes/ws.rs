//! WebSocket upgrade + message loop. Each client message is parsed as JSON and handed to the
//! tutor; every text chunk and audio clip is forwarded to the socket as soon as it is produced.

use std::sync::Arc;
use async_trait::async_trait;
use axum::{
  extract::{
    ws::{Message, WebSocket},
    State, WebSocketUpgrade,
  },
  response::IntoResponse,
};
use tracing::{info, error, instrument, debug};

use crate::error::{Result, TutorError};
use crate::outbox::{AudioOut, Outbox};
use crate::protocol::{ClientWsMessage, ServerWsMessage};
use crate::render::RenderedAudio;
use crate::state::AppState;

#[instrument(level = "info", skip(state))]
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
  info!(target: "sensei_backend", "WebSocket upgrade requested");
  ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Outbox writing straight to the socket.
struct WsOutbox<'a> {
  socket: &'a mut WebSocket,
}

impl WsOutbox<'_> {
  async fn send(&mut self, msg: &ServerWsMessage) -> Result<()> {
    let out = serde_json::to_string(msg)?;
    self
      .socket
      .send(Message::Text(out))
      .await
      .map_err(|e| TutorError::Io(std::io::Error::other(e.to_string())))
  }
}

#[async_trait]
impl Outbox for WsOutbox<'_> {
  async fn send_text(&mut self, text: &str) -> Result<()> {
    self.send(&ServerWsMessage::Text { text: text.to_string() }).await
  }

  async fn send_audio(&mut self, audio: &RenderedAudio, title: &str) -> Result<()> {
    let bytes = tokio::fs::read(&audio.path).await?;
    self.send(&ServerWsMessage::Audio { audio: AudioOut::encode(title, audio.mime, &bytes) }).await
  }
}

#[instrument(level = "info", skip(socket, state))]
async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>) {
  info!(target: "sensei_backend", "WebSocket connected");
  while let Some(Ok(msg)) = socket.recv().await {
    match msg {
      Message::Text(txt) => {
        let reply = match serde_json::from_str::<ClientWsMessage>(&txt) {
          Ok(ClientWsMessage::Ping) => Some(ServerWsMessage::Pong),
          Ok(ClientWsMessage::Message { user_id, text }) => {
            debug!(target: "sensei_backend", user = %user_id, text_len = text.len(), "WS message received");
            let mut outbox = WsOutbox { socket: &mut socket };
            state.tutor.handle_message(&user_id, &text, &mut outbox).await;
            None
          }
          Err(e) => Some(ServerWsMessage::Error { message: format!("Invalid JSON: {}", e) }),
        };

        if let Some(reply) = reply {
          if let Err(e) = (WsOutbox { socket: &mut socket }).send(&reply).await {
            error!(target: "sensei_backend", error = %e, "WS send error");
            break;
          }
        }
      }
      Message::Ping(payload) => { let _ = socket.send(Message::Pong(payload)).await; }
      Message::Close(_) => break,
      _ => {}
    }
  }
  info!(target: "sensei_backend", "WebSocket disconnected");
}
