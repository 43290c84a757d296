//! Error taxonomy for the tutoring pipeline.
//!
//! Malformed model output is not an error here: the extractor degrades to fewer records
//! and the router shows raw text instead. Everything below is something a turn can fail on.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TutorError {
  /// Missing API key, unreadable prompt file, and similar startup problems.
  #[error("configuration error: {0}")]
  Config(String),

  /// Progress store or session registry failed to read or write.
  #[error("storage error: {0}")]
  Storage(String),

  /// Chat backend call failed (network, auth, quota, bad status).
  #[error("backend error: {0}")]
  Backend(String),

  #[error("knowledge base error: {0}")]
  KnowledgeBase(String),

  #[error("speech synthesis error: {0}")]
  Speech(String),

  #[error("operation timed out after {duration:?}")]
  Timeout { duration: Duration },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TutorError>;

/// Await `fut`, mapping expiry to [`TutorError::Timeout`].
pub async fn with_timeout<T>(
  duration: Duration,
  fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
  match tokio::time::timeout(duration, fut).await {
    Ok(res) => res,
    Err(_) => Err(TutorError::Timeout { duration }),
  }
}
