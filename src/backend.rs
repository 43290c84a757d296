//! Seams to the external services: chat completion, per-user knowledge base and speech.
//!
//! The pipeline only sees these traits. `openai::OpenAI` implements all three; tests use fakes.

use async_trait::async_trait;

use crate::error::{Result, TutorError};
use crate::session::ChatMessage;

#[async_trait]
pub trait ChatBackend: Send + Sync {
  /// One call with the full message list, searching the given knowledge-base stores.
  /// Returns the raw reply text.
  async fn complete(&self, messages: &[ChatMessage], store_ids: &[String]) -> Result<String>;
}

#[async_trait]
pub trait KnowledgeBase: Send + Sync {
  /// Create an empty store and return its id.
  async fn create_store(&self, name: &str) -> Result<String>;

  /// Replace the store's contents with exactly one file.
  async fn replace_contents(&self, store_id: &str, file_name: &str, bytes: Vec<u8>) -> Result<()>;
}

/// Encoded audio returned by one synthesis call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AudioEncoding {
  Mp3,
  /// Raw 16-bit little-endian mono PCM at 24 kHz.
  Pcm,
}

#[async_trait]
pub trait SpeechBackend: Send + Sync {
  async fn synthesize(&self, text: &str, voice: &str, encoding: AudioEncoding) -> Result<Vec<u8>>;
}

/// Stand-in used when no API key is configured: every call fails with a config error.
pub struct Disabled;

fn disabled() -> TutorError {
  TutorError::Config("OPENAI_API_KEY is not set; the tutor backend is disabled".into())
}

#[async_trait]
impl ChatBackend for Disabled {
  async fn complete(&self, _: &[ChatMessage], _: &[String]) -> Result<String> { Err(disabled()) }
}

#[async_trait]
impl KnowledgeBase for Disabled {
  async fn create_store(&self, _: &str) -> Result<String> { Err(disabled()) }
  async fn replace_contents(&self, _: &str, _: &str, _: Vec<u8>) -> Result<()> { Err(disabled()) }
}

#[async_trait]
impl SpeechBackend for Disabled {
  async fn synthesize(&self, _: &str, _: &str, _: AudioEncoding) -> Result<Vec<u8>> { Err(disabled()) }
}
