//! Outbound side of one turn: text chunks and at most one audio attachment per record.
//!
//! The pipeline writes to an [`Outbox`]; transports decide how events reach the client.
//! HTTP collects them into one response body, the WebSocket forwards each as it comes.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::render::RenderedAudio;
use crate::util::chunk_text;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundEvent {
  Text(String),
  Audio { title: String, mime: String, bytes: Vec<u8> },
}

/// Audio as sent over JSON transports.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct AudioOut {
  pub title: String,
  pub mime: String,
  pub base64: String,
}

impl AudioOut {
  pub fn encode(title: &str, mime: &str, bytes: &[u8]) -> Self {
    use base64::Engine as _;
    Self {
      title: title.to_string(),
      mime: mime.to_string(),
      base64: base64::engine::general_purpose::STANDARD.encode(bytes),
    }
  }
}

#[async_trait]
pub trait Outbox: Send {
  async fn send_text(&mut self, text: &str) -> Result<()>;

  /// Deliver a rendered file. The file is read here; deleting it is the caller's job.
  async fn send_audio(&mut self, audio: &RenderedAudio, title: &str) -> Result<()>;
}

/// Send `text` as one or more messages no longer than `max_chars` each.
pub async fn send_chunked(outbox: &mut dyn Outbox, text: &str, max_chars: usize) -> Result<()> {
  for chunk in chunk_text(text, max_chars) {
    outbox.send_text(&chunk).await?;
  }
  Ok(())
}

/// Keeps every event in order; used by the HTTP transport and tests.
#[derive(Debug, Default)]
pub struct CollectingOutbox {
  pub events: Vec<OutboundEvent>,
}

#[cfg(test)]
impl CollectingOutbox {
  pub fn texts(&self) -> Vec<&str> {
    self
      .events
      .iter()
      .filter_map(|e| match e {
        OutboundEvent::Text(t) => Some(t.as_str()),
        OutboundEvent::Audio { .. } => None,
      })
      .collect()
  }
}

#[async_trait]
impl Outbox for CollectingOutbox {
  async fn send_text(&mut self, text: &str) -> Result<()> {
    self.events.push(OutboundEvent::Text(text.to_string()));
    Ok(())
  }

  async fn send_audio(&mut self, audio: &RenderedAudio, title: &str) -> Result<()> {
    let bytes = tokio::fs::read(&audio.path).await?;
    self.events.push(OutboundEvent::Audio { title: title.to_string(), mime: audio.mime.to_string(), bytes });
    Ok(())
  }
}
